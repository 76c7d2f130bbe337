/*!
The agent event loop.

Owns the process-wide state (node identity, outgoing creation-sequence
counter) and multiplexes events between storage, routing, delivery and
the convergence layer. Everything a service or subsystem wants done
arrives here as a typed message; the loop runs until the process ends,
as firmware does.
*/

use super::*;
use std::sync::Mutex;
use tundra_bpv6::bundle::Bundle as WireBundle;

/// Who handed a bundle to the send path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BundleSource {
    /// The agent itself (status reports).
    Agent,
    /// A registered service.
    Service(registration::ServiceToken),
}

/// Events processed by the agent loop.
#[derive(Debug)]
pub enum Event {
    /// A locally created bundle to store and route.
    SendBundle {
        source: BundleSource,
        handle: slot::Handle,
    },
    /// A bundle entered storage and wants routing.
    BundleInStorage { bundle_number: u32 },
    /// Discovery found a new neighbour.
    Beacon { peer: cla::Address },
    /// A service finished processing a delivered bundle.
    ProcessingFinished { handle: slot::Handle },
    /// Storage removed a bundle; purge dependent state.
    BundleDeleted {
        bundle_number: u32,
        reason: store::DeleteReason,
        /// Primary fields of the deleted bundle, present when a
        /// deletion report is owed.
        report_subject: Option<Box<WireBundle>>,
    },
}

pub struct Agent {
    node: node_ids::NodeId,
    clock: Arc<dyn clock::Clock>,
    pool: Arc<slot::Pool>,
    store: Arc<store::Store>,
    registry: Arc<registration::ServiceRegistry>,
    reporter: Arc<report::Reporter>,
    dispatcher: Arc<dispatcher::Dispatcher>,
    router: Arc<routing::Router>,
    dgram: Arc<cla::dgram::Dgram>,
    discovery: Arc<discovery::Discovery>,

    events_tx: flume::Sender<Event>,
    events_rx: Mutex<Option<flume::Receiver<Event>>>,
    sequence: Mutex<u32>,
}

impl Agent {
    /// Builds the whole processing pipeline over a storage backend and
    /// a clock. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: config::Config,
        node: node_ids::NodeId,
        clock: Arc<dyn clock::Clock>,
        backend: Arc<dyn storage::Storage>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = flume::unbounded();

        let pool = slot::Pool::new(config.slots());
        let redundancy = Arc::new(redundancy::RedundancyFilter::new(config.redundancy_size));
        let store = store::Store::new(
            config.storage.clone(),
            backend,
            pool.clone(),
            clock.clone(),
            node,
        );
        let registry = Arc::new(registration::ServiceRegistry::new(node));
        let reporter = Arc::new(report::Reporter::new(
            node,
            clock.clone(),
            pool.clone(),
            config.report_lifetime,
            events_tx.clone(),
        ));
        let dispatcher = Arc::new(dispatcher::Dispatcher::new(
            node,
            store.clone(),
            redundancy.clone(),
            reporter.clone(),
            events_tx.clone(),
        ));
        let router = routing::Router::new(
            config.routing.clone(),
            node,
            clock.clone(),
            store.clone(),
            registry.clone(),
            redundancy,
        );
        let dgram = cla::dgram::Dgram::new(config.cl.clone(), clock.clone(), pool.clone());
        let discovery = discovery::Discovery::new(
            config.discovery.clone(),
            node,
            clock.clone(),
            events_tx.clone(),
        );

        Arc::new(Self {
            node,
            clock,
            pool,
            store,
            registry,
            reporter,
            dispatcher,
            router,
            dgram,
            discovery,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sequence: Mutex::new(0),
        })
    }

    /// Recovers storage, wires the subsystems together and starts
    /// every task. Call once.
    pub fn start(self: &Arc<Self>) {
        info!("Starting DTN bundle protocol agent with EID {}", self.node);

        self.store.restore();
        self.store.start(self.events_tx.clone());
        self.dgram.start(
            self.store.clone(),
            self.dispatcher.clone(),
            self.router.clone(),
            self.discovery.clone(),
            self.reporter.clone(),
        );
        self.router.start(self.dgram.clone(), self.discovery.clone());
        self.discovery.start(self.dgram.clone());

        let agent = self.clone();
        let events_rx = self
            .events_rx
            .lock()
            .trace_expect("agent poisoned")
            .take()
            .expect("agent started twice");
        tokio::spawn(async move {
            while let Ok(event) = events_rx.recv_async().await {
                agent.handle_event(event).await;
            }
        });

        // Announce every bundle that survived the reset.
        for info in self.store.list() {
            let _ = self.events_tx.send(Event::BundleInStorage {
                bundle_number: info.bundle_number,
            });
        }
    }

    /// This node's identity.
    pub fn node_id(&self) -> node_ids::NodeId {
        self.node
    }

    /// The convergence layer, for link adapters to hook into.
    pub fn dgram(&self) -> &Arc<cla::dgram::Dgram> {
        &self.dgram
    }

    /// The discovery module, for service-block hooks and duty cycling.
    pub fn discovery(&self) -> &Arc<discovery::Discovery> {
        &self.discovery
    }

    /// Registers a link adapter with the convergence layer.
    pub fn register_link(&self, link: Arc<dyn cla::Link>) -> cla::Result<()> {
        self.dgram.register_link(link)
    }

    /// Registers a service endpoint; bundles for it arrive on the
    /// returned channel.
    pub fn register_service(
        &self,
        app_id: u32,
    ) -> core::result::Result<
        (
            registration::ServiceToken,
            flume::Receiver<registration::ServiceEvent>,
        ),
        registration::Error,
    > {
        let (tx, rx) = flume::unbounded();
        let token = self.registry.register(app_id, None, tx)?;
        Ok((token, rx))
    }

    pub fn unregister_service(&self, token: registration::ServiceToken) {
        self.registry.unregister(token);
    }

    pub fn set_service_status(
        &self,
        token: registration::ServiceToken,
        status: registration::ServiceStatus,
    ) {
        self.registry.set_status(token, status);
    }

    /// Submits a locally built bundle for storage and routing.
    pub fn submit(
        &self,
        token: registration::ServiceToken,
        bundle: WireBundle,
    ) -> core::result::Result<(), slot::Error> {
        let handle = self
            .pool
            .create(bundle::Bundle::new(bundle, self.clock.ticks_ms()))?;
        let _ = self.events_tx.send(Event::SendBundle {
            source: BundleSource::Service(token),
            handle,
        });
        Ok(())
    }

    /// A service is done with a delivered bundle; unblocks the
    /// registration and lets routing settle the bundle.
    pub fn processing_finished(&self, handle: slot::Handle) {
        let _ = self.events_tx.send(Event::ProcessingFinished { handle });
    }

    /// Stored-bundle inventory (diagnostics).
    pub fn stored_bundles(&self) -> Vec<store::StoredInfo> {
        self.store.list()
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::SendBundle { source, handle } => self.send_bundle(source, handle).await,
            Event::BundleInStorage { bundle_number } => {
                trace!("Bundle {bundle_number} in storage");
                if self.router.new_bundle(bundle_number).is_err() {
                    debug!("Routing refused bundle {bundle_number}");
                }
            }
            Event::Beacon { peer } => {
                trace!("Beacon event for {peer}");
                self.router.new_neighbour(peer);
            }
            Event::ProcessingFinished { handle } => {
                self.router.locally_delivered(&handle);
            }
            Event::BundleDeleted {
                bundle_number,
                reason,
                report_subject,
            } => {
                self.dgram.delete_bundle(bundle_number);
                self.router.delete_bundle(bundle_number);
                if let Some(subject) = report_subject {
                    self.reporter.send(
                        &subject,
                        tundra_bpv6::status_report::StatusFlags::DELETED,
                        reason.reason_code(),
                    );
                }
            }
        }
    }

    async fn send_bundle(self: &Arc<Self>, source: BundleSource, handle: slot::Handle) {
        // Resolve the sender's registration; unregistered tasks may
        // not source bundles.
        let app_id = match source {
            BundleSource::Agent => None,
            BundleSource::Service(token) => {
                let app_id = self.registry.app_id_of(token);
                if app_id == registration::APP_ID_NONE {
                    error!("Unregistered service tried to send a bundle");
                    self.registry
                        .notify(token, registration::ServiceEvent::StoreFailed);
                    return;
                }
                Some((token, app_id))
            }
        };

        {
            let mut guard = handle.lock();

            if let Some((_, app_id)) = app_id {
                if guard.bundle.source.service == 0 {
                    guard.bundle.source.service = app_id;
                }
            }
            guard.bundle.source.node = self.node.node_number();

            // Report-to defaults to the sending endpoint.
            if guard.bundle.flags.any_report_requested() {
                if guard.bundle.report_to.node == 0 {
                    guard.bundle.report_to.node = self.node.node_number();
                }
                if guard.bundle.report_to.service == 0 {
                    if let Some((_, app_id)) = app_id {
                        guard.bundle.report_to.service = app_id;
                    }
                }
            }

            let mut sequence = self.sequence.lock().trace_expect("agent poisoned");
            guard.bundle.creation_sequence = *sequence;
            *sequence += 1;
        }

        match self.store.save(&handle).await {
            Ok(bundle_number) => {
                debug!("Locally sourced bundle {bundle_number} stored");
                if let Some((token, _)) = app_id {
                    self.registry
                        .notify(token, registration::ServiceEvent::Stored { bundle_number });
                }
                if self.router.new_bundle(bundle_number).is_err() {
                    debug!("Routing refused bundle {bundle_number}");
                }
            }
            Err(e) => {
                warn!("Cannot store locally sourced bundle: {e}");
                // Give the sequence number back.
                *self.sequence.lock().trace_expect("agent poisoned") -= 1;
                if let Some((token, _)) = app_id {
                    self.registry
                        .notify(token, registration::ServiceEvent::StoreFailed);
                }
            }
        }
    }
}
