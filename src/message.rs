//! The data model flowing through a topology: [`Message`], its
//! [`Acknowledger`], and the [`BatchInfo`]/[`BatchAck`] pair exchanged with a
//! consumer's `handle_batch`.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::id::StageId;

pub const DEFAULT_DESTINATION: &str = "default";

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Carries the ack-handler binding a message was produced with. Immutable
/// after construction: a processor may reroute a message's destination, but
/// never its acknowledger.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Acknowledger<A> {
    pub handler_id: String,
    pub ack_state: A,
}

impl<A> Acknowledger<A> {
    pub fn new(handler_id: impl Into<String>, ack_state: A) -> Self {
        Self {
            handler_id: handler_id.into(),
            ack_state,
        }
    }
}

/// One unit of data flowing through the pipeline.
///
/// `id` is a per-process monotonic counter used internally to reassemble
/// contiguous ack runs after `handle_batch` partitions a batch into
/// successful/failed sublists; it carries no meaning outside this crate.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message<D, A> {
    pub id: u64,
    pub data: D,
    pub acknowledger: Acknowledger<A>,
    pub publisher: String,
    pub processor_pid: Option<StageId>,
}

impl<D, A> Message<D, A> {
    pub fn new(data: D, acknowledger: Acknowledger<A>) -> Self {
        Self {
            id: next_message_id(),
            data,
            acknowledger,
            publisher: DEFAULT_DESTINATION.to_string(),
            processor_pid: None,
        }
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }
}

/// Identifies the batcher and destination key a batch was flushed from.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    pub publisher_key: String,
    pub batcher: StageId,
}

/// The outcome a consumer's `handle_batch` returns: every message it was
/// given must appear in exactly one of the two lists.
#[derive(Debug)]
pub struct BatchAck<D, A> {
    pub successful: Vec<Message<D, A>>,
    pub failed: Vec<Message<D, A>>,
}

impl<D, A> BatchAck<D, A> {
    pub fn new(successful: Vec<Message<D, A>>, failed: Vec<Message<D, A>>) -> Self {
        Self { successful, failed }
    }

    pub fn all_successful(messages: Vec<Message<D, A>>) -> Self {
        Self {
            successful: messages,
            failed: Vec::new(),
        }
    }
}
