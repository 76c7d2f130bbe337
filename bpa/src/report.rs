use super::*;
use tundra_bpv6::{
    bundle::{BlockFlags, BlockType, Bundle as WireBundle},
    status_report::{ReasonCode, StatusFlags, StatusReport},
};

/// Emits bundle-status administrative records.
///
/// Reports are ordinary bundles addressed to the subject bundle's
/// report-to endpoint (or its custodian, for custody statuses) and go
/// out through the agent's normal send path.
pub(crate) struct Reporter {
    node: node_ids::NodeId,
    clock: Arc<dyn clock::Clock>,
    pool: Arc<slot::Pool>,
    lifetime: u32,
    events: flume::Sender<agent::Event>,
}

impl Reporter {
    pub fn new(
        node: node_ids::NodeId,
        clock: Arc<dyn clock::Clock>,
        pool: Arc<slot::Pool>,
        lifetime: u32,
        events: flume::Sender<agent::Event>,
    ) -> Self {
        Self {
            node,
            clock,
            pool,
            lifetime,
            events,
        }
    }

    /// Builds and enqueues a status report about `subject`.
    ///
    /// Does nothing when the subject never asked to be reported on, or
    /// when the report would go to the null endpoint.
    pub fn send(&self, subject: &WireBundle, status: StatusFlags, reason: ReasonCode) {
        let destination = if status.custody_accepted {
            subject.custodian
        } else {
            subject.report_to
        };
        if destination.is_null() {
            trace!("Suppressing status report to the null endpoint");
            return;
        }

        let dtn_time = self.clock.dtn_time();
        let record = StatusReport::for_bundle(subject, status, reason, dtn_time);

        let mut report = WireBundle {
            destination,
            source: self.node.endpoint(0),
            creation_timestamp: dtn_time.map(|t| t.secs).unwrap_or(0),
            lifetime: self.lifetime,
            ..Default::default()
        };
        report.flags.is_admin_record = true;
        report.flags.is_singleton = true;
        report.add_block(
            BlockType::Payload,
            BlockFlags::default(),
            Bytes::from(record.encode()),
        );

        let handle = match self.pool.create(bundle::Bundle::new(
            report,
            self.clock.ticks_ms(),
        )) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot allocate slot for status report: {e}");
                return;
            }
        };

        debug!(
            "Status report {status:?}/{reason:?} for bundle from {} to {destination}",
            subject.source
        );
        let _ = self.events.send(agent::Event::SendBundle {
            source: agent::BundleSource::Agent,
            handle,
        });
    }
}
