//! Per-destination-key batcher: accumulates messages until `batch_size` is
//! reached or `batch_timeout` elapses since the last flush, whichever
//! comes first, then publishes the batch to its destination's consumer
//! pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::core::link::{FanInLink, FanoutLink};
use crate::core::supervisor::Shutdown;
use crate::id::StageId;
use crate::message::{BatchInfo, Message};

pub(crate) async fn run<D: Send + 'static, A: Send + 'static>(
    id: StageId,
    publisher_key: String,
    batch_size: usize,
    batch_timeout: Duration,
    input: Arc<FanInLink<Message<D, A>>>,
    output: Arc<FanoutLink<(Vec<Message<D, A>>, BatchInfo)>>,
    incarnation: u64,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    if incarnation > 1 {
        input.reset().await;
    }
    let mut receiver = input.take_receiver().await;

    let mut ticker = tokio::time::interval(batch_timeout.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; consume it

    let mut pending: Vec<Message<D, A>> = Vec::new();
    tracing::info!(stage = %id, publisher_key, "batcher started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            maybe = receiver.recv() => {
                match maybe {
                    Some(message) => {
                        pending.push(message);
                        while pending.len() >= batch_size {
                            let batch: Vec<_> = pending.drain(0..batch_size).collect();
                            emit(&id, &publisher_key, &output, batch).await?;
                        }
                    }
                    None => {
                        tracing::warn!(stage = %id, "inbound channel closed, batcher shutting down");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    let batch: Vec<_> = pending.drain(..).collect();
                    emit(&id, &publisher_key, &output, batch).await?;
                }
            }
        }
    }

    tracing::info!(stage = %id, publisher_key, "batcher stopped");
    Ok(())
}

async fn emit<D: Send + 'static, A: Send + 'static>(
    id: &StageId,
    publisher_key: &str,
    output: &Arc<FanoutLink<(Vec<Message<D, A>>, BatchInfo)>>,
    batch: Vec<Message<D, A>>,
) -> anyhow::Result<()> {
    let info = BatchInfo {
        publisher_key: publisher_key.to_string(),
        batcher: id.clone(),
    };
    let sender = output.sender().await;
    sender
        .send_async((batch, info))
        .await
        .map_err(|_| anyhow::anyhow!("consumer pool for '{publisher_key}' is not running"))
}
