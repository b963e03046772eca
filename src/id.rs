//! Stable, derivable stage identities.
//!
//! A [`StageId`] names a stage instance and carries an `incarnation` counter
//! that a supervisor bumps every time it restarts that stage. Comparing
//! incarnations is how a test (or a user callback holding a `processor_pid`)
//! observes that "the processor crashed and came back" without needing any
//! OS-level thread/task identity to be meaningful across a restart.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageId {
    pub name: String,
    pub incarnation: u64,
}

impl StageId {
    pub fn new(name: impl Into<String>, incarnation: u64) -> Self {
        Self {
            name: name.into(),
            incarnation,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.incarnation)
    }
}

/// Zero-pads `index` to the width of `pool_size`, so a single-stage pool
/// produces `_1`, never `_01`.
pub fn zero_pad(index: usize, pool_size: usize) -> String {
    let width = pool_size.max(1).to_string().len();
    format!("{index:0width$}")
}

pub fn producer_name(topology: &str, group: &str, index: usize, pool_size: usize) -> String {
    format!("{topology}.Producer_{group}_{}", zero_pad(index, pool_size))
}

pub fn processor_name(topology: &str, index: usize, pool_size: usize) -> String {
    format!("{topology}.Processor_{}", zero_pad(index, pool_size))
}

pub fn batcher_name(topology: &str, key: &str) -> String {
    format!("{topology}.Batcher_{key}")
}

pub fn consumer_name(topology: &str, key: &str, index: usize, pool_size: usize) -> String {
    format!("{topology}.Consumer_{key}_{}", zero_pad(index, pool_size))
}

pub fn producer_supervisor_name(topology: &str) -> String {
    format!("{topology}.ProducerSupervisor")
}

pub fn processor_supervisor_name(topology: &str) -> String {
    format!("{topology}.ProcessorSupervisor")
}

pub fn publisher_supervisor_name(topology: &str) -> String {
    format!("{topology}.PublisherSupervisor")
}

pub fn dest_supervisor_name(topology: &str, key: &str) -> String {
    format!("{topology}.DestSupervisor_{key}")
}

pub fn consumer_supervisor_name(topology: &str, key: &str) -> String {
    format!("{topology}.ConsumerSupervisor_{key}")
}

pub fn root_name(topology: &str) -> String {
    format!("{topology}.Root")
}
