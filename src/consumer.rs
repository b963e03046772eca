//! Per-destination consumer pool: each worker takes one flushed batch,
//! calls `handle_batch`, then acknowledges it one contiguous same-handler
//! run at a time so every message reaches exactly one `AckHandler::ack`
//! invocation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ack::AckHandler;
use crate::core::link::FanoutLink;
use crate::core::supervisor::Shutdown;
use crate::id::StageId;
use crate::message::{BatchAck, BatchInfo, Message};
use crate::traits::PipelineModule;

pub(crate) async fn run<M: PipelineModule>(
    id: StageId,
    publisher_key: String,
    module: Arc<M>,
    context: M::Context,
    input: Arc<FanoutLink<(Vec<Message<M::Data, M::AckState>>, BatchInfo)>>,
    ack_handlers: Arc<HashMap<String, Arc<dyn AckHandler<M::Data, M::AckState>>>>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tracing::info!(stage = %id, publisher_key, "consumer worker started");

    loop {
        let receiver = input.receiver().await;
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            received = receiver.recv_async() => {
                match received {
                    Ok((batch, info)) => {
                        let order: Vec<(u64, String)> = batch
                            .iter()
                            .map(|m| (m.id, m.acknowledger.handler_id.clone()))
                            .collect();

                        let outcome = module
                            .handle_batch(&publisher_key, batch, &info, &context)
                            .await;

                        match outcome {
                            Ok(ack) => acknowledge(&ack_handlers, order, ack).await?,
                            Err(e) => {
                                tracing::error!(stage = %id, publisher_key, error = %e, "handle_batch crashed");
                                return Err(e);
                            }
                        }
                    }
                    Err(_disconnected) => {
                        tracing::warn!(stage = %id, "batcher gone, consumer shutting down");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!(stage = %id, publisher_key, "consumer worker stopped");
    Ok(())
}

async fn acknowledge<D: Send + 'static, A: Send + 'static>(
    ack_handlers: &HashMap<String, Arc<dyn AckHandler<D, A>>>,
    order: Vec<(u64, String)>,
    ack: BatchAck<D, A>,
) -> anyhow::Result<()> {
    let mut by_id: HashMap<u64, (bool, Message<D, A>)> = HashMap::with_capacity(order.len());
    for m in ack.successful {
        by_id.insert(m.id, (true, m));
    }
    for m in ack.failed {
        by_id.insert(m.id, (false, m));
    }

    let mut idx = 0;
    while idx < order.len() {
        let handler_id = order[idx].1.clone();
        let mut end = idx + 1;
        while end < order.len() && order[end].1 == handler_id {
            end += 1;
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for (msg_id, _) in &order[idx..end] {
            if let Some((ok, msg)) = by_id.remove(msg_id) {
                if ok {
                    successful.push(msg);
                } else {
                    failed.push(msg);
                }
            }
        }

        let handler = ack_handlers
            .get(&handler_id)
            .ok_or_else(|| anyhow::anyhow!("no ack handler registered for id '{handler_id}'"))?;
        handler.ack(successful, failed).await;

        idx = end;
    }

    Ok(())
}
