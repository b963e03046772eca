//! Channel-capacity realizations of the two edge shapes a topology needs.
//!
//! [`FanoutLink`] is a one-to-many pull edge (producer → processor pool,
//! batcher → consumer pool): a `flume::Receiver` is cheap to clone, so a
//! pool of workers races over one upstream, which gives both load-balancing
//! and backpressure for free — a worker that stops draining simply leaves
//! the bounded channel full, and the upstream's next `send` suspends. This
//! is the channel-capacity stand-in for GenStage's explicit `GrantDemand(n)`
//! credit messages (see DESIGN.md).
//!
//! [`FanInLink`] is a many-to-one fan-in edge (processor pool → batcher,
//! and caller → producer injection queue): many cloned `Sender`s feed one
//! exclusive `Receiver`. Because the receiver is *taken* by the one task
//! that owns it, a restart of that task needs a fresh channel — `reset`
//! mints one and every peer picks it up on its next `sender()`/`receiver()`
//! call, since they never hold a receiver/sender across an await point.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, Mutex, RwLock};

/// One-to-many, credit-gated pull edge backed by a bounded `flume` channel.
pub struct FanoutLink<T> {
    capacity: usize,
    sender: RwLock<flume::Sender<T>>,
    receiver: RwLock<flume::Receiver<T>>,
}

impl<T: Send + 'static> FanoutLink<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            capacity: capacity.max(1),
            sender: RwLock::new(tx),
            receiver: RwLock::new(rx),
        }
    }

    pub async fn sender(&self) -> flume::Sender<T> {
        self.sender.read().await.clone()
    }

    pub async fn receiver(&self) -> flume::Receiver<T> {
        self.receiver.read().await.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Races a message off whichever of several `FanoutLink` receivers has one
/// ready first. Used by processor workers, which may subscribe to more than
/// one producer.
pub async fn select_recv<T: Send + 'static>(receivers: &[flume::Receiver<T>]) -> Option<T> {
    if receivers.is_empty() {
        futures::future::pending::<()>().await;
        unreachable!("a pending future never resolves");
    }
    let futs: Vec<Pin<Box<dyn Future<Output = Result<T, flume::RecvError>> + Send + '_>>> =
        receivers.iter().map(|r| Box::pin(r.recv_async()) as _).collect();
    match futures::future::select_all(futs).await {
        (Ok(value), ..) => Some(value),
        (Err(_disconnected), ..) => None,
    }
}

/// Many-to-one fan-in edge backed by a bounded `tokio::mpsc` channel whose
/// receiver is exclusively owned by the one downstream task.
pub struct FanInLink<T> {
    capacity: usize,
    sender: RwLock<mpsc::Sender<T>>,
    receiver: Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T: Send + 'static> FanInLink<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            capacity: capacity.max(1),
            sender: RwLock::new(tx),
            receiver: Mutex::new(Some(rx)),
        }
    }

    pub async fn sender(&self) -> mpsc::Sender<T> {
        self.sender.read().await.clone()
    }

    /// Takes the current receiver. Panics if called twice without an
    /// intervening `reset` — the one downstream task per incarnation owns
    /// this exactly once.
    pub async fn take_receiver(&self) -> mpsc::Receiver<T> {
        self.receiver
            .lock()
            .await
            .take()
            .expect("FanInLink receiver already taken for this incarnation")
    }

    /// Mints a fresh channel. Call before spawning a replacement for the
    /// task that owns the receiver side, so the new incarnation can
    /// `take_receiver` again and every sender picks up the new channel on
    /// its next `sender()` call.
    pub async fn reset(&self) {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.sender.write().await = tx;
        *self.receiver.lock().await = Some(rx);
    }
}
