//! Programmatic topology configuration. There is no file format here —
//! the embedding application builds these structs directly — but every
//! struct still derives `Clone + Debug` and, behind the `serde` feature,
//! `Serialize`/`Deserialize`, so an integrator with its own config file can
//! deserialize straight into these types without this crate parsing
//! anything itself.

use std::time::Duration;

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProducerOptions {
    pub stages: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self { stages: 1 }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessorOptions {
    pub stages: usize,
    pub min_demand: usize,
    pub max_demand: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            stages: cpus * 2,
            min_demand: 5,
            max_demand: 10,
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PublisherOptions {
    pub stages: usize,
    pub batch_size: usize,
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub batch_timeout: Duration,
    pub min_demand: usize,
    pub max_demand: usize,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            stages: 1,
            batch_size: 100,
            batch_timeout: Duration::from_millis(1000),
            min_demand: 5,
            max_demand: 10,
        }
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
