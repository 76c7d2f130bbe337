use super::*;
use tundra_bpv6::status_report::{ReasonCode, StatusFlags, StatusReport};

/// Classifies incoming bundles.
///
/// Admin records addressed to this node are consumed here; everything
/// else is checked against the redundancy filter, saved to storage,
/// and announced to the agent so routing picks it up.
pub(crate) struct Dispatcher {
    node: node_ids::NodeId,
    store: Arc<store::Store>,
    redundancy: Arc<redundancy::RedundancyFilter>,
    reporter: Arc<report::Reporter>,
    events: flume::Sender<agent::Event>,
}

impl Dispatcher {
    pub fn new(
        node: node_ids::NodeId,
        store: Arc<store::Store>,
        redundancy: Arc<redundancy::RedundancyFilter>,
        reporter: Arc<report::Reporter>,
        events: flume::Sender<agent::Event>,
    ) -> Self {
        Self {
            node,
            store,
            redundancy,
            reporter,
            events,
        }
    }

    /// Dispatches a decoded bundle.
    ///
    /// `Ok` means the sender may be ACKed, including the silent-success
    /// cases (duplicates, consumed admin records). `Err` is a resource
    /// problem the sender may retry later.
    pub async fn dispatch(&self, handle: slot::Handle) -> store::Result<()> {
        let (flags, destination, bundle_number) = {
            let guard = handle.read();
            (
                guard.bundle.flags,
                guard.bundle.destination,
                guard.bundle_number(),
            )
        };

        if flags.is_admin_record {
            self.check_delivery_report(&handle);

            if destination.node == self.node.node_number() {
                // Addressed to us; consumed without entering storage.
                return Ok(());
            }
        }

        // Custody transfer is not implemented; custody-requested
        // bundles take the normal path.

        if self.redundancy.check(bundle_number) {
            // Report success so the convergence layer still ACKs and
            // the sender stops retransmitting.
            trace!("Bundle {bundle_number} is redundant, dropping");
            return Ok(());
        }

        self.store.save(&handle).await?;

        if flags.report_reception {
            debug!("Sending reception report for bundle {bundle_number}");
            self.reporter.send(
                &handle.read().bundle,
                StatusFlags::RECEIVED,
                ReasonCode::NoAdditionalInformation,
            );
        }

        self.redundancy.set(bundle_number);
        let _ = self
            .events
            .send(agent::Event::BundleInStorage { bundle_number });
        Ok(())
    }

    /// If the bundle is a delivery report for one of our stored
    /// bundles, the stored bundle has arrived and can go.
    fn check_delivery_report(&self, handle: &slot::Handle) {
        let guard = handle.read();
        let Some(payload) = guard.bundle.payload_block() else {
            return;
        };
        let Ok(report) = StatusReport::decode(&payload.data) else {
            return;
        };
        if !report.status.delivered {
            return;
        }

        let bundle_number = report.subject_id().number();
        info!(
            "Received delivery report for bundle {bundle_number} from {}, deleting",
            guard.bundle.source
        );
        self.store
            .delete(bundle_number, store::DeleteReason::Delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionPolicy;
    use crate::storage::mem::MemStorage;
    use tundra_bpv6::bundle::{BlockFlags, BlockType, Bundle as WireBundle};
    use tundra_bpv6::eid::Eid;

    struct Fixture {
        pool: Arc<slot::Pool>,
        store: Arc<store::Store>,
        dispatcher: Dispatcher,
        events: flume::Receiver<agent::Event>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let node = node_ids::NodeId::from_node_number(2);
        let clock: Arc<dyn clock::Clock> = Arc::new(clock::UnsyncedClock::new());
        let pool = slot::Pool::new(capacity + 10);
        let store = store::Store::new(
            config::StorageConfig {
                capacity,
                eviction: EvictionPolicy::NeverDelete,
                no_room_timeout: std::time::Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(MemStorage::new()),
            pool.clone(),
            clock.clone(),
            node,
        );
        let (tx, rx) = flume::unbounded();
        let redundancy = Arc::new(redundancy::RedundancyFilter::new(8));
        let reporter = Arc::new(report::Reporter::new(
            node,
            clock,
            pool.clone(),
            3600,
            tx.clone(),
        ));
        Fixture {
            pool: pool.clone(),
            store: store.clone(),
            dispatcher: Dispatcher::new(node, store, redundancy, reporter, tx),
            events: rx,
        }
    }

    fn incoming(fixture: &Fixture, seq: u32) -> slot::Handle {
        let mut wire = WireBundle {
            destination: Eid::new(2, 25),
            source: Eid::new(1, 25),
            creation_sequence: seq,
            lifetime: 60,
            ..Default::default()
        };
        wire.add_block(
            BlockType::Payload,
            BlockFlags::default(),
            Bytes::from_static(b"payload"),
        );
        fixture.pool.create(bundle::Bundle::new(wire, 0)).unwrap()
    }

    #[tokio::test]
    async fn fresh_bundle_is_stored_and_announced() {
        let fixture = fixture(4);
        let handle = incoming(&fixture, 1);
        let number = handle.bundle_number();

        fixture.dispatcher.dispatch(handle).await.unwrap();

        assert!(fixture.store.contains(number));
        assert!(matches!(
            fixture.events.try_recv(),
            Ok(agent::Event::BundleInStorage { bundle_number }) if bundle_number == number
        ));
    }

    #[tokio::test]
    async fn duplicate_is_dropped_but_acked() {
        let fixture = fixture(4);
        let first = incoming(&fixture, 1);
        fixture.dispatcher.dispatch(first).await.unwrap();
        let _ = fixture.events.try_recv();

        // Same identity again: success, but no second announcement.
        let again = incoming(&fixture, 1);
        fixture.dispatcher.dispatch(again).await.unwrap();
        assert!(fixture.events.try_recv().is_err());
        assert_eq!(fixture.store.count(), 1);
    }

    #[tokio::test]
    async fn reception_report_is_requested() {
        let fixture = fixture(4);
        let handle = incoming(&fixture, 1);
        handle.lock().bundle.flags.report_reception = true;
        handle.lock().bundle.report_to = Eid::new(1, 0);

        fixture.dispatcher.dispatch(handle).await.unwrap();

        let mut saw_report = false;
        while let Ok(event) = fixture.events.try_recv() {
            if let agent::Event::SendBundle { handle, .. } = event {
                let guard = handle.read();
                assert!(guard.bundle.flags.is_admin_record);
                let record =
                    StatusReport::decode(&guard.bundle.payload_block().unwrap().data).unwrap();
                assert!(record.status.received);
                saw_report = true;
            }
        }
        assert!(saw_report);
    }

    #[tokio::test]
    async fn delivery_report_deletes_subject() {
        let fixture = fixture(4);

        // A bundle we are holding for forwarding.
        let held = incoming(&fixture, 9);
        let held_number = held.bundle_number();
        fixture.dispatcher.dispatch(held).await.unwrap();
        assert!(fixture.store.contains(held_number));

        // A delivery report for it arrives from downstream.
        let subject = incoming(&fixture, 9);
        let record = StatusReport::for_bundle(
            &subject.read().bundle,
            StatusFlags::DELIVERED,
            ReasonCode::NoAdditionalInformation,
            None,
        );
        let mut admin = WireBundle {
            destination: Eid::new(2, 0),
            source: Eid::new(3, 0),
            creation_sequence: 77,
            lifetime: 60,
            ..Default::default()
        };
        admin.flags.is_admin_record = true;
        admin.add_block(
            BlockType::Payload,
            BlockFlags::default(),
            Bytes::from(record.encode()),
        );
        let admin = fixture
            .pool
            .create(bundle::Bundle::new(admin, 0))
            .unwrap();

        fixture.dispatcher.dispatch(admin).await.unwrap();
        assert!(!fixture.store.contains(held_number));
    }

    #[tokio::test]
    async fn storage_full_is_an_error() {
        let fixture = fixture(1);
        fixture.dispatcher.dispatch(incoming(&fixture, 1)).await.unwrap();

        let overflow = incoming(&fixture, 2);
        assert!(fixture.dispatcher.dispatch(overflow).await.is_err());
    }
}
