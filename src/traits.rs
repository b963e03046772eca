//! The two contracts a topology's owner implements: [`ProducerDriver`]
//! supplies events on demand, [`PipelineModule`] transforms and batches
//! them.

use async_trait::async_trait;

use crate::message::{BatchAck, BatchInfo, Message};

/// Drives a single producer stage instance. `handle_demand` is called
/// whenever the stage's outbound channel has spare capacity, with `n` set
/// to exactly that amount — this crate's realization of GenStage's
/// `handle_demand(n, state)`, expressed as `&mut self` rather than threaded
/// through a return value because a Rust stage owns its driver directly.
#[async_trait]
pub trait ProducerDriver: Send + 'static {
    type Data: Clone + Send + 'static;
    type AckState: Clone + Send + 'static;

    /// Called once before the stage starts pulling demand.
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_demand(
        &mut self,
        n: usize,
    ) -> anyhow::Result<Vec<Message<Self::Data, Self::AckState>>>;
}

/// The module a topology is built around: transforms one message at a time
/// (`handle_message`, run by the processor pool) and acknowledges a flushed
/// batch at a time (`handle_batch`, run by a destination's consumer pool).
#[async_trait]
pub trait PipelineModule: Send + Sync + 'static {
    type Data: Clone + Send + Sync + 'static;
    type AckState: Clone + Send + Sync + 'static;
    type Context: Clone + Send + Sync + 'static;

    /// Any outcome other than `Ok` is a user-contract violation: the
    /// processor worker that called this propagates the error and is
    /// restarted by its supervisor.
    async fn handle_message(
        &self,
        message: Message<Self::Data, Self::AckState>,
        context: &Self::Context,
    ) -> anyhow::Result<Message<Self::Data, Self::AckState>>;

    async fn handle_batch(
        &self,
        publisher_key: &str,
        messages: Vec<Message<Self::Data, Self::AckState>>,
        info: &BatchInfo,
        context: &Self::Context,
    ) -> anyhow::Result<BatchAck<Self::Data, Self::AckState>>;
}
