//! `conveyor` — a demand-driven, multi-stage ingestion pipeline runtime.
//!
//! A [`topology::Topology`] wires together a producer group, a fixed-size
//! pool of processors, and one batcher + consumer pool per destination key.
//! Events flow downstream from a [`traits::ProducerDriver`] through a
//! [`traits::PipelineModule`]'s `handle_message`/`handle_batch`, and demand
//! flows upstream as bounded-channel capacity rather than an explicit
//! credit message — see DESIGN.md for why.

pub mod ack;
mod batcher;
pub mod config;
mod consumer;
pub mod core;
pub mod error;
pub mod id;
pub mod logging;
pub mod message;
mod processor;
mod producer;
pub mod topology;
pub mod traits;

pub use ack::AckHandler;
pub use config::{ProcessorOptions, ProducerOptions, PublisherOptions};
pub use error::{ConfigError, TopologyError};
pub use id::StageId;
pub use message::{Acknowledger, BatchAck, BatchInfo, Message};
pub use producer::ProducerHandle;
pub use topology::{DriverFactory, Topology, TopologyBuilder, TopologyHandle, TopologyHandles};
pub use traits::{PipelineModule, ProducerDriver};
