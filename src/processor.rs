//! The processor pool: each worker pulls one message from whichever
//! producer has one ready, runs `handle_message`, and routes the result to
//! its destination's batcher. A worker crashes on anything other than
//! `Ok` from `handle_message`, or when `message.publisher` names a key
//! this topology never declared — both are programmer errors, not
//! recoverable conditions, so they propagate rather than being swallowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::link::{select_recv, FanInLink, FanoutLink};
use crate::core::supervisor::Shutdown;
use crate::id::StageId;
use crate::message::Message;
use crate::traits::PipelineModule;

pub(crate) async fn run<M: PipelineModule>(
    id: StageId,
    module: Arc<M>,
    context: M::Context,
    inputs: Vec<Arc<FanoutLink<Message<M::Data, M::AckState>>>>,
    routes: Arc<HashMap<String, Arc<FanInLink<Message<M::Data, M::AckState>>>>>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tracing::info!(stage = %id, "processor worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let mut receivers = Vec::with_capacity(inputs.len());
        for link in &inputs {
            receivers.push(link.receiver().await);
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            received = select_recv(&receivers) => {
                match received {
                    Some(mut message) => {
                        message.processor_pid = Some(id.clone());
                        let publisher = message.publisher.clone();
                        let outcome = module.handle_message(message, &context).await;
                        match outcome {
                            Ok(routed) => dispatch(&id, &routes, routed).await?,
                            Err(e) => {
                                tracing::error!(stage = %id, publisher, error = %e, "handle_message crashed");
                                return Err(e);
                            }
                        }
                    }
                    None => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    tracing::info!(stage = %id, "processor worker stopped");
    Ok(())
}

async fn dispatch<D: Send + 'static, A: Send + 'static>(
    id: &StageId,
    routes: &HashMap<String, Arc<FanInLink<Message<D, A>>>>,
    message: Message<D, A>,
) -> anyhow::Result<()> {
    let link = routes.get(&message.publisher).ok_or_else(|| {
        anyhow::anyhow!(
            "processor {id} routed a message to unknown destination '{}'",
            message.publisher
        )
    })?;
    let sender = link.sender().await;
    sender
        .send(message)
        .await
        .map_err(|_| anyhow::anyhow!("batcher for this destination is not running"))
}
