//! The producer stage: pulls events from a [`ProducerDriver`] on demand and
//! accepts synchronous external injection via [`ProducerHandle::push_messages`].
//! Injected and driver-produced events share one buffer so neither is
//! dropped while the downstream channel is full.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::link::{FanInLink, FanoutLink};
use crate::core::supervisor::Shutdown;
use crate::id::StageId;
use crate::message::Message;
use crate::traits::ProducerDriver;

pub(crate) struct PushRequest<D, A> {
    messages: Vec<Message<D, A>>,
    ack: oneshot::Sender<()>,
}

/// A handle an integrator holds to inject messages into a specific producer
/// stage instance, independent of whichever incarnation is currently
/// running it.
#[derive(Clone)]
pub struct ProducerHandle<D, A> {
    link: Arc<FanInLink<PushRequest<D, A>>>,
}

impl<D: Send + 'static, A: Send + 'static> ProducerHandle<D, A> {
    /// Queues `messages` for the producer and waits until the producer
    /// stage has accepted them into its internal buffer.
    pub async fn push_messages(&self, messages: Vec<Message<D, A>>) -> anyhow::Result<()> {
        let (ack, done) = oneshot::channel();
        let sender = self.link.sender().await;
        sender
            .send(PushRequest { messages, ack })
            .await
            .map_err(|_| anyhow::anyhow!("producer stage is not running"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("producer stage dropped the injection request"))?;
        Ok(())
    }
}

pub(crate) const INJECTION_QUEUE_CAPACITY: usize = 1024;

pub(crate) fn new_injection_link<D: Send + 'static, A: Send + 'static>(
) -> Arc<FanInLink<PushRequest<D, A>>> {
    Arc::new(FanInLink::new(INJECTION_QUEUE_CAPACITY))
}

pub(crate) fn handle_for<D: Send + 'static, A: Send + 'static>(
    link: &Arc<FanInLink<PushRequest<D, A>>>,
) -> ProducerHandle<D, A> {
    ProducerHandle { link: link.clone() }
}

pub(crate) async fn run<D, A>(
    id: StageId,
    mut driver: Box<dyn ProducerDriver<Data = D, AckState = A>>,
    output: Arc<FanoutLink<Message<D, A>>>,
    injection: Arc<FanInLink<PushRequest<D, A>>>,
    incarnation: u64,
    shutdown: Shutdown,
) -> anyhow::Result<()>
where
    D: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    let mut shutdown_rx = shutdown.subscribe();
    if incarnation > 1 {
        injection.reset().await;
    }
    let mut push_rx = injection.take_receiver().await;

    driver.init().await?;
    tracing::info!(stage = %id, "producer started");

    let mut buffer: VecDeque<Message<D, A>> = VecDeque::new();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        while let Ok(req) = push_rx.try_recv() {
            buffer.extend(req.messages);
            let _ = req.ack.send(());
        }

        let sender = output.sender().await;
        let available = output.capacity().saturating_sub(sender.len());

        if buffer.is_empty() && available > 0 {
            match driver.handle_demand(available).await {
                Ok(events) => buffer.extend(events),
                Err(e) => {
                    tracing::error!(stage = %id, error = %e, "producer driver crashed");
                    return Err(e);
                }
            }
        }

        if let Some(msg) = buffer.pop_front() {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = sender.send_async(msg) => {
                    if result.is_err() {
                        tracing::warn!(stage = %id, "processor pool gone, shutting producer down");
                        break;
                    }
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    tracing::info!(stage = %id, "producer stopped");
    Ok(())
}
