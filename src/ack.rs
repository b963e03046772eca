//! The acknowledger contract: one implementation per `handler_id` a
//! topology's messages reference, invoked once per contiguous run of
//! same-handler messages inside a flushed batch.

use async_trait::async_trait;

use crate::message::Message;

#[async_trait]
pub trait AckHandler<D, A>: Send + Sync + 'static {
    async fn ack(&self, successful: Vec<Message<D, A>>, failed: Vec<Message<D, A>>);
}
