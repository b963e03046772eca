//! Assembles a [`PipelineModule`], a producer group, and a set of
//! destinations into a running topology: builds every link and supervisor
//! the design notes describe, and hands back a [`TopologyHandle`] plus one
//! [`ProducerHandle`] per producer stage instance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::ack::AckHandler;
use crate::batcher;
use crate::config::{ProcessorOptions, ProducerOptions, PublisherOptions};
use crate::consumer;
use crate::core::link::{FanInLink, FanoutLink};
use crate::core::registry::StageRegistry;
use crate::core::supervisor::{RestartStrategy, Shutdown, StageFactory, Supervisor};
use crate::error::{ConfigError, TopologyError};
use crate::id;
use crate::message::{BatchInfo, Message};
use crate::processor;
use crate::producer::{self, ProducerHandle};
use crate::traits::{PipelineModule, ProducerDriver};

pub type DriverFactory<D, A> =
    Arc<dyn Fn() -> Box<dyn ProducerDriver<Data = D, AckState = A>> + Send + Sync>;

pub struct TopologyBuilder<M: PipelineModule> {
    name: String,
    module: Arc<M>,
    context: M::Context,
    producer: Option<(String, DriverFactory<M::Data, M::AckState>, ProducerOptions)>,
    producer_group_calls: usize,
    destinations: Vec<(String, PublisherOptions)>,
    processor_options: ProcessorOptions,
    ack_handlers: HashMap<String, Arc<dyn AckHandler<M::Data, M::AckState>>>,
    registry: StageRegistry,
}

impl<M: PipelineModule> TopologyBuilder<M> {
    pub fn new(name: impl Into<String>, module: M, context: M::Context) -> Self {
        Self {
            name: name.into(),
            module: Arc::new(module),
            context,
            producer: None,
            producer_group_calls: 0,
            destinations: Vec::new(),
            processor_options: ProcessorOptions::default(),
            ack_handlers: HashMap::new(),
            registry: StageRegistry::new(),
        }
    }

    pub fn producer_group(
        mut self,
        name: impl Into<String>,
        factory: DriverFactory<M::Data, M::AckState>,
        options: ProducerOptions,
    ) -> Self {
        self.producer_group_calls += 1;
        self.producer = Some((name.into(), factory, options));
        self
    }

    pub fn processors(mut self, options: ProcessorOptions) -> Self {
        self.processor_options = options;
        self
    }

    pub fn destination(mut self, key: impl Into<String>, options: PublisherOptions) -> Self {
        self.destinations.push((key.into(), options));
        self
    }

    pub fn ack_handler(
        mut self,
        handler_id: impl Into<String>,
        handler: Arc<dyn AckHandler<M::Data, M::AckState>>,
    ) -> Self {
        self.ack_handlers.insert(handler_id.into(), handler);
        self
    }

    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Result<Topology<M>, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.producer_group_calls > 1 {
            return Err(ConfigError::MultipleProducerGroups(self.producer_group_calls));
        }
        let (producer_name, producer_factory, producer_options) =
            self.producer.ok_or(ConfigError::MissingProducerGroup)?;
        if producer_options.stages == 0 {
            return Err(ConfigError::MissingRequiredOption {
                topology: self.name.clone(),
                stage: producer_name,
                option: "stages",
            });
        }
        if self.processor_options.stages == 0 {
            return Err(ConfigError::MissingRequiredOption {
                topology: self.name.clone(),
                stage: "processor".to_string(),
                option: "stages",
            });
        }

        let mut destinations = self.destinations;
        if destinations.is_empty() {
            destinations.push((
                crate::message::DEFAULT_DESTINATION.to_string(),
                PublisherOptions::default(),
            ));
        }
        if destinations.is_empty() {
            return Err(ConfigError::EmptyDestinationKeySet);
        }
        let mut seen = std::collections::HashSet::new();
        for (key, opts) in &destinations {
            if !seen.insert(key.clone()) {
                return Err(ConfigError::DuplicateDestinationKey(key.clone()));
            }
            if opts.stages == 0 {
                return Err(ConfigError::MissingRequiredOption {
                    topology: self.name.clone(),
                    stage: key.clone(),
                    option: "stages",
                });
            }
            if opts.batch_size == 0 {
                return Err(ConfigError::MissingRequiredOption {
                    topology: self.name.clone(),
                    stage: key.clone(),
                    option: "batch_size",
                });
            }
        }

        Ok(Topology {
            name: self.name,
            module: self.module,
            context: self.context,
            producer_name,
            producer_factory,
            producer_options,
            processor_options: self.processor_options,
            destinations,
            ack_handlers: Arc::new(self.ack_handlers),
            registry: self.registry,
        })
    }
}

pub struct Topology<M: PipelineModule> {
    name: String,
    module: Arc<M>,
    context: M::Context,
    producer_name: String,
    producer_factory: DriverFactory<M::Data, M::AckState>,
    producer_options: ProducerOptions,
    processor_options: ProcessorOptions,
    destinations: Vec<(String, PublisherOptions)>,
    ack_handlers: Arc<HashMap<String, Arc<dyn AckHandler<M::Data, M::AckState>>>>,
    registry: StageRegistry,
}

pub struct TopologyHandles<D, A> {
    pub handle: TopologyHandle,
    pub producers: Vec<ProducerHandle<D, A>>,
}

pub struct TopologyHandle {
    name: String,
    shutdown: Shutdown,
    root: JoinHandle<anyhow::Result<()>>,
    registry: StageRegistry,
}

impl TopologyHandle {
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Signals every stage to stop, waits for the whole tree to drain, and
    /// returns once the root supervisor itself has exited.
    pub async fn shutdown(self) -> Result<(), TopologyError> {
        self.shutdown.signal();
        self.join().await
    }

    /// Waits for the root supervisor without requesting shutdown — used to
    /// detect the root dying unexpectedly.
    pub async fn join(self) -> Result<(), TopologyError> {
        let name = self.name.clone();
        match self.root.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(TopologyError::SupervisorDied {
                supervisor: name,
                source,
            }),
            Err(join_error) => Err(TopologyError::SupervisorDied {
                supervisor: name,
                source: anyhow::anyhow!(join_error),
            }),
        }
    }
}

impl<M: PipelineModule> Topology<M> {
    pub fn stage_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for i in 1..=self.producer_options.stages {
            names.push(id::producer_name(
                &self.name,
                &self.producer_name,
                i,
                self.producer_options.stages,
            ));
        }
        for i in 1..=self.processor_options.stages {
            names.push(id::processor_name(&self.name, i, self.processor_options.stages));
        }
        for (key, opts) in &self.destinations {
            names.push(id::batcher_name(&self.name, key));
            for i in 1..=opts.stages {
                names.push(id::consumer_name(&self.name, key, i, opts.stages));
            }
        }
        names
    }

    pub fn start(self) -> TopologyHandles<M::Data, M::AckState> {
        let shutdown = Shutdown::new();
        let registry = self.registry.clone();

        // One FanoutLink (producer -> processor pool) per producer instance.
        let producer_links: Vec<Arc<FanoutLink<Message<M::Data, M::AckState>>>> = (0..self
            .producer_options
            .stages)
            .map(|_| Arc::new(FanoutLink::new(self.processor_options.max_demand)))
            .collect();

        let injection_links: Vec<_> = (0..self.producer_options.stages)
            .map(|_| producer::new_injection_link::<M::Data, M::AckState>())
            .collect();
        let producer_handles: Vec<ProducerHandle<M::Data, M::AckState>> = injection_links
            .iter()
            .map(producer::handle_for)
            .collect();

        // One FanInLink (processors -> batcher) and one FanoutLink
        // (batcher -> consumer pool) per destination key.
        struct DestLinks<D, A> {
            key: String,
            options: PublisherOptions,
            inbound: Arc<FanInLink<Message<D, A>>>,
            outbound: Arc<FanoutLink<(Vec<Message<D, A>>, BatchInfo)>>,
        }

        let dest_links: Vec<DestLinks<M::Data, M::AckState>> = self
            .destinations
            .iter()
            .map(|(key, opts)| DestLinks {
                key: key.clone(),
                options: opts.clone(),
                inbound: Arc::new(FanInLink::new(opts.max_demand)),
                outbound: Arc::new(FanoutLink::new(opts.max_demand)),
            })
            .collect();

        let routes: Arc<HashMap<String, Arc<FanInLink<Message<M::Data, M::AckState>>>>> =
            Arc::new(
                dest_links
                    .iter()
                    .map(|d| (d.key.clone(), d.inbound.clone()))
                    .collect(),
            );

        // --- ProducerSupervisor ---
        let mut producer_supervisor = Supervisor::new(
            id::producer_supervisor_name(&self.name),
            RestartStrategy::OneForOne,
            registry.clone(),
            shutdown.clone(),
        );
        for (i, (link, injection)) in producer_links.iter().zip(injection_links.iter()).enumerate()
        {
            let stage_name =
                id::producer_name(&self.name, &self.producer_name, i + 1, self.producer_options.stages);
            let factory = make_producer_factory(
                stage_name.clone(),
                self.producer_factory.clone(),
                link.clone(),
                injection.clone(),
                shutdown.clone(),
            );
            producer_supervisor.add_child(stage_name, factory);
        }

        // --- ProcessorSupervisor ---
        let mut processor_supervisor = Supervisor::new(
            id::processor_supervisor_name(&self.name),
            RestartStrategy::OneForAll,
            registry.clone(),
            shutdown.clone(),
        );
        for i in 1..=self.processor_options.stages {
            let stage_name = id::processor_name(&self.name, i, self.processor_options.stages);
            let factory = make_processor_factory(
                stage_name.clone(),
                self.module.clone(),
                self.context.clone(),
                producer_links.clone(),
                routes.clone(),
                shutdown.clone(),
            );
            processor_supervisor.add_child(stage_name, factory);
        }

        // --- PublisherSupervisor: one DestSupervisor per destination key ---
        let mut publisher_supervisor = Supervisor::new(
            id::publisher_supervisor_name(&self.name),
            RestartStrategy::OneForOne,
            registry.clone(),
            shutdown.clone(),
        );
        for dest in &dest_links {
            let dest_supervisor_name = id::dest_supervisor_name(&self.name, &dest.key);
            let factory = make_dest_supervisor_factory(
                self.name.clone(),
                dest.key.clone(),
                dest.options.clone(),
                dest.inbound.clone(),
                dest.outbound.clone(),
                self.module.clone(),
                self.context.clone(),
                self.ack_handlers.clone(),
                registry.clone(),
                shutdown.clone(),
            );
            publisher_supervisor.add_child(dest_supervisor_name, factory);
        }

        // --- Root: one_for_one over the three named supervisors ---
        let root = build_root(
            id::root_name(&self.name),
            registry.clone(),
            shutdown.clone(),
            producer_supervisor,
            processor_supervisor,
            publisher_supervisor,
        );

        let root_handle = tokio::spawn(root.run());

        TopologyHandles {
            handle: TopologyHandle {
                name: self.name,
                shutdown,
                root: root_handle,
                registry,
            },
            producers: producer_handles,
        }
    }
}

fn build_root(
    name: String,
    registry: StageRegistry,
    shutdown: Shutdown,
    producer_supervisor: Supervisor,
    processor_supervisor: Supervisor,
    publisher_supervisor: Supervisor,
) -> Supervisor {
    let mut root = Supervisor::new(name, RestartStrategy::OneForOne, registry, shutdown);
    // Each of these already spawned its own children above; `run` merely
    // drives their restart loops. A respawn of one of these three (only
    // possible if `run` itself panics, never in ordinary operation) would
    // need to rebuild from scratch, which this topology does not attempt —
    // see DESIGN.md.
    let producer_supervisor = std::cell::RefCell::new(Some(producer_supervisor));
    let processor_supervisor = std::cell::RefCell::new(Some(processor_supervisor));
    let publisher_supervisor = std::cell::RefCell::new(Some(publisher_supervisor));

    root.add_child(
        "ProducerSupervisor",
        Box::new(move |_incarnation| {
            let sup = producer_supervisor
                .borrow_mut()
                .take()
                .expect("ProducerSupervisor respawn is not supported");
            Box::pin(sup.run())
        }),
    );
    root.add_child(
        "ProcessorSupervisor",
        Box::new(move |_incarnation| {
            let sup = processor_supervisor
                .borrow_mut()
                .take()
                .expect("ProcessorSupervisor respawn is not supported");
            Box::pin(sup.run())
        }),
    );
    root.add_child(
        "PublisherSupervisor",
        Box::new(move |_incarnation| {
            let sup = publisher_supervisor
                .borrow_mut()
                .take()
                .expect("PublisherSupervisor respawn is not supported");
            Box::pin(sup.run())
        }),
    );
    root
}

fn make_producer_factory<D, A>(
    stage_name: String,
    driver_factory: DriverFactory<D, A>,
    output: Arc<FanoutLink<Message<D, A>>>,
    injection: Arc<FanInLink<producer::PushRequest<D, A>>>,
    shutdown: Shutdown,
) -> StageFactory
where
    D: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    Box::new(move |incarnation| {
        let id = crate::id::StageId::new(stage_name.clone(), incarnation);
        let driver = driver_factory();
        let output = output.clone();
        let injection = injection.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move {
            producer::run(id, driver, output, injection, incarnation, shutdown).await
        })
    })
}

fn make_processor_factory<M: PipelineModule>(
    stage_name: String,
    module: Arc<M>,
    context: M::Context,
    inputs: Vec<Arc<FanoutLink<Message<M::Data, M::AckState>>>>,
    routes: Arc<HashMap<String, Arc<FanInLink<Message<M::Data, M::AckState>>>>>,
    shutdown: Shutdown,
) -> StageFactory {
    Box::new(move |incarnation| {
        let id = crate::id::StageId::new(stage_name.clone(), incarnation);
        let module = module.clone();
        let context = context.clone();
        let inputs = inputs.clone();
        let routes = routes.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move { processor::run(id, module, context, inputs, routes, shutdown).await })
    })
}

#[allow(clippy::too_many_arguments)]
fn make_dest_supervisor_factory<M: PipelineModule>(
    topology_name: String,
    key: String,
    options: PublisherOptions,
    inbound: Arc<FanInLink<Message<M::Data, M::AckState>>>,
    outbound: Arc<FanoutLink<(Vec<Message<M::Data, M::AckState>>, BatchInfo)>>,
    module: Arc<M>,
    context: M::Context,
    ack_handlers: Arc<HashMap<String, Arc<dyn AckHandler<M::Data, M::AckState>>>>,
    registry: StageRegistry,
    shutdown: Shutdown,
) -> StageFactory {
    Box::new(move |_incarnation| {
        let topology_name = topology_name.clone();
        let key = key.clone();
        let options = options.clone();
        let inbound = inbound.clone();
        let outbound = outbound.clone();
        let module = module.clone();
        let context = context.clone();
        let ack_handlers = ack_handlers.clone();
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move {
            let mut dest_supervisor = Supervisor::new(
                id::dest_supervisor_name(&topology_name, &key),
                RestartStrategy::RestForOne,
                registry.clone(),
                shutdown.clone(),
            );

            let batcher_name = id::batcher_name(&topology_name, &key);
            let batch_size = options.batch_size;
            let batch_timeout = options.batch_timeout;
            let batcher_inbound = inbound.clone();
            let batcher_outbound = outbound.clone();
            let batcher_key = key.clone();
            let batcher_shutdown = shutdown.clone();
            dest_supervisor.add_child(
                batcher_name.clone(),
                Box::new(move |incarnation| {
                    let id = crate::id::StageId::new(batcher_name.clone(), incarnation);
                    let inbound = batcher_inbound.clone();
                    let outbound = batcher_outbound.clone();
                    let key = batcher_key.clone();
                    let shutdown = batcher_shutdown.clone();
                    Box::pin(async move {
                        batcher::run(id, key, batch_size, batch_timeout, inbound, outbound, incarnation, shutdown)
                            .await
                    })
                }),
            );

            // Nested one_for_one over the consumer pool: a RestForOne over a
            // flat [Batcher, Consumer_1, .., Consumer_P] list would have a
            // killed Consumer_i also restart every Consumer_j with j>i, which
            // is not the "a consumer crash restarts only that consumer"
            // contract. Nesting keeps the batcher's RestForOne (a batcher
            // crash must restart its whole consumer pool, since every
            // consumer's inbound link is tied to that batcher incarnation)
            // while isolating consumer-to-consumer crashes from each other.
            let consumer_supervisor_name = id::consumer_supervisor_name(&topology_name, &key);
            let consumer_registry = registry.clone();
            let consumer_supervisor_shutdown = shutdown.clone();
            let consumer_outbound = outbound.clone();
            let consumer_module = module.clone();
            let consumer_context = context.clone();
            let consumer_ack_handlers = ack_handlers.clone();
            let consumer_stages = options.stages;
            dest_supervisor.add_child(
                consumer_supervisor_name.clone(),
                Box::new(move |_incarnation| {
                    let mut consumer_supervisor = Supervisor::new(
                        consumer_supervisor_name.clone(),
                        RestartStrategy::OneForOne,
                        consumer_registry.clone(),
                        consumer_supervisor_shutdown.clone(),
                    );
                    for i in 1..=consumer_stages {
                        let consumer_name = id::consumer_name(&topology_name, &key, i, consumer_stages);
                        let outbound = consumer_outbound.clone();
                        let module = consumer_module.clone();
                        let context = consumer_context.clone();
                        let ack_handlers = consumer_ack_handlers.clone();
                        let key = key.clone();
                        let shutdown = consumer_supervisor_shutdown.clone();
                        consumer_supervisor.add_child(
                            consumer_name.clone(),
                            Box::new(move |incarnation| {
                                let id = crate::id::StageId::new(consumer_name.clone(), incarnation);
                                let outbound = outbound.clone();
                                let module = module.clone();
                                let context = context.clone();
                                let ack_handlers = ack_handlers.clone();
                                let key = key.clone();
                                let shutdown = shutdown.clone();
                                Box::pin(async move {
                                    consumer::run(id, key, module, context, outbound, ack_handlers, shutdown)
                                        .await
                                })
                            }),
                        );
                    }
                    Box::pin(consumer_supervisor.run())
                }),
            );

            dest_supervisor.run().await
        })
    })
}
