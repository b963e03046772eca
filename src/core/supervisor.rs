//! A small, generic supervisor: a named list of children, a restart policy,
//! and a shutdown signal. A "crash" is simply a spawned task's
//! `JoinHandle` resolving — whether by panic, by explicit abort (the kill
//! switch in [`super::registry`]), or by returning `Err`. `JoinHandle`
//! already turns a panic into a value (`JoinError`) instead of unwinding
//! through us, so there is no need for `catch_unwind` anywhere in this
//! crate.
//!
//! Supervisors nest by supervising each other: a child factory can itself
//! be "run this other `Supervisor`", since `Supervisor::run` has exactly
//! the `Future<Output = anyhow::Result<()>>` shape every other child has.
//! This is how the three-level tree in the design notes (root → per-kind
//! supervisors → per-destination subtrees) is built without a bespoke type
//! per level.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::registry::StageRegistry;

pub type StageFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type StageFactory = Box<dyn Fn(u64) -> StageFuture + Send + Sync>;

/// Broadcasts a one-shot shutdown signal, with a latched flag so stages
/// and supervisors spawned *after* the signal already fired still see it
/// (a plain `broadcast::Receiver` made after `send` would otherwise miss
/// a signal that already happened, which matters during a shutdown race
/// with an in-flight restart).
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn signal(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Restart only the child that exited.
    OneForOne,
    /// Restart every child whenever any one of them exits.
    OneForAll,
    /// Restart the exited child and every child declared after it.
    RestForOne,
}

struct Child {
    name: String,
    incarnation: u64,
    factory: StageFactory,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub struct Supervisor {
    name: String,
    policy: RestartStrategy,
    children: Vec<Child>,
    registry: StageRegistry,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(
        name: impl Into<String>,
        policy: RestartStrategy,
        registry: StageRegistry,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            children: Vec::new(),
            registry,
            shutdown,
        }
    }

    /// Registers and spawns a child. `factory` is called once per
    /// incarnation with the new incarnation number.
    pub fn add_child(&mut self, name: impl Into<String>, factory: StageFactory) {
        let name = name.into();
        let handle = Self::spawn(&self.registry, &name, 1, &factory);
        self.children.push(Child {
            name,
            incarnation: 1,
            factory,
            handle,
        });
    }

    fn spawn(
        registry: &StageRegistry,
        name: &str,
        incarnation: u64,
        factory: &StageFactory,
    ) -> JoinHandle<anyhow::Result<()>> {
        let fut = factory(incarnation);
        let handle = tokio::spawn(fut);
        registry.register(name, handle.abort_handle());
        handle
    }

    /// Drives the supervisor until shutdown: watches children, applies the
    /// restart policy to unexpected exits, and on shutdown aborts and
    /// drains every remaining child before returning.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if self.children.is_empty() {
                let _ = shutdown_rx.recv().await;
                break;
            }

            let exited = {
                let futs = self.children.iter_mut().map(|c| &mut c.handle);
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => None,
                    (result, index, _) = futures::future::select_all(futs) => Some((index, result)),
                }
            };

            match exited {
                None => {
                    for child in &self.children {
                        child.handle.abort();
                    }
                    for child in self.children.drain(..) {
                        let _ = child.handle.await;
                    }
                    break;
                }
                Some((index, _join_result)) => {
                    if self.shutdown.is_stopped() {
                        continue;
                    }
                    tracing::warn!(
                        supervisor = %self.name,
                        child = %self.children[index].name,
                        policy = ?self.policy,
                        "child stage exited, applying restart policy"
                    );
                    self.restart_from(index).await;
                }
            }
        }
        Ok(())
    }

    async fn restart_from(&mut self, index: usize) {
        match self.policy {
            RestartStrategy::OneForOne => self.respawn(index).await,
            RestartStrategy::OneForAll => {
                for i in 0..self.children.len() {
                    if i != index {
                        self.children[i].handle.abort();
                    }
                }
                for i in 0..self.children.len() {
                    self.respawn(i).await;
                }
            }
            RestartStrategy::RestForOne => {
                for i in (index + 1)..self.children.len() {
                    self.children[i].handle.abort();
                }
                for i in index..self.children.len() {
                    self.respawn(i).await;
                }
            }
        }
    }

    async fn respawn(&mut self, index: usize) {
        let child = &mut self.children[index];
        child.incarnation += 1;
        let handle = Self::spawn(&self.registry, &child.name, child.incarnation, &child.factory);
        child.handle = handle;
    }
}
