/*!
Flooding and chain routing.

Every bundle accepted into storage gets a routing entry recording what
is still owed: local delivery, forwarding, or both. A work cycle walks
the entries whenever something changes (new bundle, new neighbour, a
transmission outcome) and schedules at most one new transmission per
bundle per cycle. Peers that keep failing are struck onto a small
blacklist and eventually reported dead to discovery.

The chain variant restricts forwarding to neighbours on the correct
side of a linear topology: ids above ours when the destination id is
above the source id, ids below ours when it is below.
*/

use super::*;
use crate::cla::TicketView;
use std::sync::{Mutex, OnceLock};

/// Neighbour-selection strategy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Strategy {
    #[default]
    Flooding,
    Chain,
}

/// Transmission outcome reported by the convergence layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SentStatus {
    /// The peer acknowledged the bundle.
    Ok,
    /// The peer rejected the bundle permanently.
    Nack,
    /// The peer rejected the bundle temporarily; retry later.
    TempNack,
    /// Retries exhausted or the link gave up.
    Fail,
    /// Unrecoverable; the bundle cannot be sent at all.
    Error,
}

const BLACKLIST_SIZE: usize = 3;

#[derive(Debug)]
struct Entry {
    bundle_number: u32,
    local: bool,
    forward: bool,
    in_delivery: bool,
    in_transit: bool,
    /// Peers this bundle has been handed to.
    sent_to: Vec<cla::Address>,
    /// Local delivery counts toward the recipient limit too.
    delivered_here: bool,
    destination_node: u32,
    source_node: u32,
    received_from: Option<cla::Address>,
}

impl Entry {
    fn recipients(&self) -> usize {
        self.sent_to.len() + usize::from(self.delivered_here)
    }
}

#[derive(Debug)]
struct BlacklistEntry {
    peer: cla::Address,
    strikes: u8,
    timestamp_ms: u64,
}

pub(crate) struct Router {
    config: config::RoutingConfig,
    node: node_ids::NodeId,
    clock: Arc<dyn clock::Clock>,
    store: Arc<store::Store>,
    registry: Arc<registration::ServiceRegistry>,
    redundancy: Arc<redundancy::RedundancyFilter>,

    dgram: OnceLock<Arc<cla::dgram::Dgram>>,
    discovery: OnceLock<Arc<discovery::Discovery>>,

    entries: Mutex<Vec<Entry>>,
    blacklist: Mutex<Vec<BlacklistEntry>>,
    wakeup: tokio::sync::Notify,
}

impl Router {
    pub fn new(
        config: config::RoutingConfig,
        node: node_ids::NodeId,
        clock: Arc<dyn clock::Clock>,
        store: Arc<store::Store>,
        registry: Arc<registration::ServiceRegistry>,
        redundancy: Arc<redundancy::RedundancyFilter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            node,
            clock,
            store,
            registry,
            redundancy,
            dgram: OnceLock::new(),
            discovery: OnceLock::new(),
            entries: Mutex::new(Vec::new()),
            blacklist: Mutex::new(Vec::new()),
            wakeup: tokio::sync::Notify::new(),
        })
    }

    /// Wires the peers and starts the work-cycle task.
    pub fn start(
        self: &Arc<Self>,
        dgram: Arc<cla::dgram::Dgram>,
        discovery: Arc<discovery::Discovery>,
    ) {
        let _ = self.dgram.set(dgram);
        let _ = self.discovery.set(discovery);

        let router = self.clone();
        tokio::spawn(async move {
            loop {
                router.wakeup.notified().await;
                router.work_cycle().await;
            }
        });
    }

    /// Schedules another work cycle.
    pub fn schedule(&self) {
        self.wakeup.notify_one();
    }

    /// A neighbour appeared; there may be bundles for it.
    pub fn new_neighbour(&self, _peer: cla::Address) {
        self.schedule();
    }

    /// Tracks a bundle that just entered storage.
    pub fn new_bundle(&self, bundle_number: u32) -> core::result::Result<(), ()> {
        {
            let entries = self.entries.lock().trace_expect("router poisoned");
            if entries.iter().any(|e| e.bundle_number == bundle_number) {
                warn!("Bundle {bundle_number} announced but already known");
                return Err(());
            }
        }

        let Ok(Some(handle)) = self.store.read(bundle_number) else {
            error!("Cannot read announced bundle {bundle_number}");
            return Err(());
        };

        let guard = handle.read();
        let mut entry = Entry {
            bundle_number,
            local: false,
            forward: false,
            in_delivery: false,
            in_transit: false,
            sent_to: Vec::new(),
            delivered_here: false,
            destination_node: guard.bundle.destination.node,
            source_node: guard.bundle.source.node,
            received_from: guard.metadata.received_from,
        };

        if guard.bundle.destination.node == self.node.node_number() {
            entry.local = true;
        } else {
            entry.forward = true;
        }
        if !guard.bundle.flags.is_singleton {
            // Non-singleton destinations are forwarded in any case.
            entry.forward = true;
        }
        if self
            .registry
            .is_local(guard.bundle.destination.service, guard.bundle.destination.node)
            && guard.bundle.destination.node != self.node.node_number()
        {
            entry.local = true;
            entry.forward = true;
        }
        drop(guard);

        debug!(
            "Routing bundle {bundle_number}: local={} forward={}",
            entry.local, entry.forward
        );
        self.entries.lock().trace_expect("router poisoned").push(entry);
        self.schedule();
        Ok(())
    }

    /// Drops the routing entry for a deleted bundle.
    pub fn delete_bundle(&self, bundle_number: u32) {
        self.entries
            .lock()
            .trace_expect("router poisoned")
            .retain(|e| e.bundle_number != bundle_number);
    }

    async fn work_cycle(&self) {
        let numbers: Vec<u32> = {
            let entries = self.entries.lock().trace_expect("router poisoned");
            entries.iter().map(|e| e.bundle_number).collect()
        };

        let mut try_to_forward = true;
        for bundle_number in numbers {
            self.try_local(bundle_number);

            if !try_to_forward {
                continue;
            }
            if let ForwardOutcome::QueueFull = self.try_forward(bundle_number).await {
                // The ticket queue is full; everything else would be
                // refused too.
                try_to_forward = false;
            }
        }
    }

    fn try_local(&self, bundle_number: u32) {
        {
            let entries = self.entries.lock().trace_expect("router poisoned");
            let Some(entry) = entries.iter().find(|e| e.bundle_number == bundle_number) else {
                return;
            };
            if !entry.local || entry.in_delivery {
                return;
            }
        }

        let handle = match self.store.read(bundle_number) {
            Ok(Some(handle)) => handle,
            _ => {
                error!("Cannot read bundle {bundle_number} for delivery");
                return;
            }
        };

        let outcome = self.registry.deliver(&handle, &self.redundancy);
        let mut entries = self.entries.lock().trace_expect("router poisoned");
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.bundle_number == bundle_number)
        else {
            return;
        };
        match outcome {
            registration::DeliveryOutcome::Delivered => entry.in_delivery = true,
            registration::DeliveryOutcome::Busy | registration::DeliveryOutcome::NoService => {}
        }
    }

    async fn try_forward(&self, bundle_number: u32) -> ForwardOutcome {
        let snapshot = {
            let entries = self.entries.lock().trace_expect("router poisoned");
            let Some(entry) = entries.iter().find(|e| e.bundle_number == bundle_number) else {
                return ForwardOutcome::Nothing;
            };
            if !entry.forward || entry.in_transit {
                return ForwardOutcome::Nothing;
            }
            (
                entry.destination_node,
                entry.source_node,
                entry.received_from,
                entry.sent_to.clone(),
            )
        };
        let (destination_node, source_node, received_from, sent_to) = snapshot;

        let Some(discovery) = self.discovery.get() else {
            return ForwardOutcome::Nothing;
        };
        let neighbours = discovery.neighbours();

        // Destination in range: send straight to it.
        let direct = neighbours
            .iter()
            .find(|n| n.node_id() == Some(destination_node));
        if let Some(direct) = direct {
            debug!(
                "Sending bundle {bundle_number} to {} directly",
                direct.address
            );
            return self.queue_transmission(bundle_number, direct.address).await;
        }

        for neighbour in &neighbours {
            if neighbour.node_id() == Some(source_node) {
                trace!("Not sending bundle back to its originator");
                continue;
            }
            if Some(neighbour.address) == received_from {
                trace!("Not sending bundle back to its sender");
                continue;
            }
            if sent_to.contains(&neighbour.address) {
                trace!(
                    "Bundle {bundle_number} already sent to {}",
                    neighbour.address
                );
                continue;
            }
            if !self.chain_allows(destination_node, source_node, neighbour.node_id()) {
                continue;
            }

            return self.queue_transmission(bundle_number, neighbour.address).await;
        }

        ForwardOutcome::Nothing
    }

    /// Chain eligibility: only pass bundles onward along the chain.
    fn chain_allows(
        &self,
        destination_node: u32,
        source_node: u32,
        neighbour_node: Option<u32>,
    ) -> bool {
        if self.config.strategy != Strategy::Chain {
            return true;
        }
        let Some(neighbour_node) = neighbour_node else {
            return false;
        };
        let own = self.node.node_number();

        if destination_node > source_node {
            neighbour_node > own
        } else if destination_node < source_node {
            neighbour_node < own
        } else {
            // Destination equals source; there is no "up" or "down".
            false
        }
    }

    async fn queue_transmission(
        &self,
        bundle_number: u32,
        neighbour: cla::Address,
    ) -> ForwardOutcome {
        let Some(dgram) = self.dgram.get() else {
            return ForwardOutcome::Nothing;
        };

        {
            let mut entries = self.entries.lock().trace_expect("router poisoned");
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.bundle_number == bundle_number)
            {
                entry.in_transit = true;
            }
        }

        match dgram.send_bundle(neighbour, bundle_number) {
            Ok(()) => {
                info!("Queued bundle {bundle_number} for {neighbour}");
                ForwardOutcome::Queued
            }
            Err(e) => {
                warn!("Cannot queue bundle {bundle_number}: {e}");
                let mut entries = self.entries.lock().trace_expect("router poisoned");
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.bundle_number == bundle_number)
                {
                    entry.in_transit = false;
                }
                ForwardOutcome::QueueFull
            }
        }
    }

    /// Outcome callback from the convergence layer.
    pub fn sent(&self, ticket: TicketView, status: SentStatus) {
        self.schedule();

        let destination_node = {
            let mut entries = self.entries.lock().trace_expect("router poisoned");
            let Some(entry) = entries
                .iter_mut()
                .find(|e| e.bundle_number == ticket.bundle_number)
            else {
                warn!("Sent callback for unknown bundle {}", ticket.bundle_number);
                return;
            };
            entry.in_transit = false;
            entry.destination_node
        };

        match status {
            SentStatus::Nack | SentStatus::Fail => {
                if self.blacklist_strike(ticket.neighbour) {
                    // Struck out; let discovery tear the peer down.
                    if let Some(discovery) = self.discovery.get() {
                        discovery.dead(ticket.neighbour);
                    }
                    self.blacklist_remove(ticket.neighbour);
                }
            }
            SentStatus::TempNack => {
                trace!(
                    "Bundle {} temporarily refused by {}",
                    ticket.bundle_number,
                    ticket.neighbour
                );
            }
            SentStatus::Error => {
                error!(
                    "Bundle {} has fatal error, deleting",
                    ticket.bundle_number
                );
                let mut entries = self.entries.lock().trace_expect("router poisoned");
                if let Some(entry) = entries
                    .iter_mut()
                    .find(|e| e.bundle_number == ticket.bundle_number)
                {
                    entry.local = false;
                    entry.forward = false;
                    entry.in_delivery = false;
                }
                drop(entries);
                self.check_keep_bundle(ticket.bundle_number);
            }
            SentStatus::Ok => {
                self.blacklist_remove(ticket.neighbour);
                self.sent_ok(ticket, destination_node);
            }
        }
    }

    fn sent_ok(&self, ticket: TicketView, destination_node: u32) {
        let delivered_to_destination = self.config.delete_on_direct_delivery
            && self
                .discovery
                .get()
                .and_then(|d| d.node_of(ticket.neighbour))
                .or(ticket.neighbour.implied_node())
                == Some(destination_node);

        let mut entries = self.entries.lock().trace_expect("router poisoned");
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.bundle_number == ticket.bundle_number)
        else {
            return;
        };

        if delivered_to_destination {
            debug!("Bundle {} reached its destination", ticket.bundle_number);
            entry.forward = false;
        } else if entry.recipients() < self.config.neighbour_slots {
            entry.sent_to.push(ticket.neighbour);
            debug!(
                "Bundle {} sent to {} node(s)",
                ticket.bundle_number,
                entry.recipients()
            );
            if entry.recipients() >= self.config.neighbour_slots {
                entry.forward = false;
            }
        } else {
            entry.forward = false;
        }
        drop(entries);
        self.check_keep_bundle(ticket.bundle_number);
    }

    /// A service finished processing a delivered bundle.
    pub fn locally_delivered(&self, handle: &slot::Handle) {
        self.schedule();

        let (bundle_number, dst_srv) = {
            let guard = handle.read();
            (guard.bundle_number(), guard.bundle.destination.service)
        };

        self.registry.unblock(dst_srv);

        let mut entries = self.entries.lock().trace_expect("router poisoned");
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.bundle_number == bundle_number)
        else {
            warn!("Local delivery finished for unknown bundle {bundle_number}");
            return;
        };
        entry.in_delivery = false;
        entry.local = false;
        entry.delivered_here = true;
        if entry.recipients() >= self.config.neighbour_slots {
            entry.forward = false;
        }
        drop(entries);

        self.check_keep_bundle(bundle_number);
    }

    /// Deletes the bundle once nothing is owed on it anymore.
    fn check_keep_bundle(&self, bundle_number: u32) {
        {
            let entries = self.entries.lock().trace_expect("router poisoned");
            let Some(entry) = entries.iter().find(|e| e.bundle_number == bundle_number) else {
                return;
            };
            if entry.local || entry.forward {
                return;
            }
        }

        info!("Bundle {bundle_number} fully handled, deleting");
        self.store
            .delete(bundle_number, store::DeleteReason::Delivered);
    }

    /// Registers a failure strike; true once the peer passes the
    /// threshold.
    fn blacklist_strike(&self, peer: cla::Address) -> bool {
        let now = self.clock.ticks_ms();
        let mut blacklist = self.blacklist.lock().trace_expect("router poisoned");

        if let Some(entry) = blacklist.iter_mut().find(|e| e.peer == peer) {
            if now.saturating_sub(entry.timestamp_ms) > self.config.blacklist_timeout.as_millis() as u64
            {
                // Stale entry; start the count over.
                entry.strikes = 0;
            }
            entry.strikes += 1;
            entry.timestamp_ms = now;

            if entry.strikes >= self.config.blacklist_threshold {
                info!("{peer} blacklisted");
                return true;
            }
            return false;
        }

        if blacklist.len() >= BLACKLIST_SIZE {
            warn!("Blacklist full, cannot track {peer}");
            return false;
        }
        blacklist.push(BlacklistEntry {
            peer,
            strikes: 1,
            timestamp_ms: now,
        });
        false
    }

    fn blacklist_remove(&self, peer: cla::Address) {
        self.blacklist
            .lock()
            .trace_expect("router poisoned")
            .retain(|e| e.peer != peer);
    }
}

enum ForwardOutcome {
    Queued,
    Nothing,
    QueueFull,
}
