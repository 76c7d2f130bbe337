/*!
Neighbour discovery.

Tracks the peers this node can currently talk to. Any received frame
refreshes a peer; IP-ND beacons additionally teach us the peer's EID
and its announced services. Idle peers time out, and routing can
declare a peer dead after repeated transmission failures; both paths
drain the peer's state from the convergence layer.
*/

use super::*;
use std::sync::{Mutex, OnceLock};

pub mod ipnd;

mod scheduler;

pub use scheduler::{NullDutyCycle, RadioDutyCycle, Schedule};

/// Receives the payload of announced services and contributes entries
/// to outgoing beacons.
pub trait ServiceBlockHook: Send + Sync {
    /// Called for every service entry of every received beacon.
    fn on_service(&self, peer_eid: Option<tundra_bpv6::eid::Eid>, tag: &[u8], data: &[u8]);

    /// The entry to announce in outgoing beacons, if any.
    fn announce(&self) -> Option<ipnd::ServiceEntry> {
        None
    }
}

/// A currently known neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighbourInfo {
    pub address: cla::Address,
    /// Node id learned from the peer's beacon EID.
    pub eid_node: Option<u32>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl NeighbourInfo {
    /// The peer's node id: from its beacon, or implied by its link
    /// address.
    pub fn node_id(&self) -> Option<u32> {
        self.eid_node.or(self.address.implied_node())
    }
}

pub struct Discovery {
    config: config::DiscoveryConfig,
    node: node_ids::NodeId,
    clock: Arc<dyn clock::Clock>,
    events: flume::Sender<agent::Event>,

    dgram: OnceLock<Arc<cla::dgram::Dgram>>,

    neighbours: Mutex<Vec<NeighbourInfo>>,
    sequence: Mutex<u16>,
    hooks: Mutex<Vec<Arc<dyn ServiceBlockHook>>>,
}

impl Discovery {
    pub fn new(
        config: config::DiscoveryConfig,
        node: node_ids::NodeId,
        clock: Arc<dyn clock::Clock>,
        events: flume::Sender<agent::Event>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            node,
            clock,
            events,
            dgram: OnceLock::new(),
            neighbours: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Wires the convergence layer, starts the stale-peer sweeper and
    /// the discovery schedule.
    pub fn start(self: &Arc<Self>, dgram: Arc<cla::dgram::Dgram>) {
        self.start_with_rdc(dgram, Arc::new(NullDutyCycle))
    }

    /// As [`start`](Self::start), with duty-cycling hooks for radios
    /// that idle off outside discovery windows.
    pub fn start_with_rdc(
        self: &Arc<Self>,
        dgram: Arc<cla::dgram::Dgram>,
        rdc: Arc<dyn RadioDutyCycle>,
    ) {
        let _ = self.dgram.set(dgram);

        let discovery = self.clone();
        tokio::spawn(async move {
            let sweep = (discovery.config.neighbour_timeout / 5)
                .max(std::time::Duration::from_secs(1));
            let mut interval = tokio::time::interval(sweep);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                discovery.remove_stale_neighbours();
            }
        });

        scheduler::start_with_rdc(self.clone(), self.config.schedule.clone(), rdc);
    }

    /// Registers a service-block hook.
    pub fn add_hook(&self, hook: Arc<dyn ServiceBlockHook>) {
        self.hooks.lock().trace_expect("discovery poisoned").push(hook);
    }

    /// Any frame from a peer proves it is alive.
    pub fn alive(&self, peer: cla::Address) {
        self.refresh_neighbour(peer, None);
    }

    /// Handles a received beacon payload.
    pub fn receive(&self, peer: cla::Address, payload: &[u8]) {
        let beacon = match ipnd::Beacon::parse(payload) {
            Ok(beacon) => beacon,
            Err(e) => {
                debug!("Dropping malformed beacon from {peer}: {e}");
                return;
            }
        };

        trace!(
            "Discovery from {peer} ({:?}) with seqNo {}",
            beacon.eid,
            beacon.sequence
        );
        self.refresh_neighbour(peer, beacon.eid.map(|e| e.node));

        let hooks = self.hooks.lock().trace_expect("discovery poisoned").clone();
        for service in &beacon.services {
            for hook in &hooks {
                hook.on_service(beacon.eid, &service.tag, &service.data);
            }
        }
    }

    fn refresh_neighbour(&self, peer: cla::Address, eid_node: Option<u32>) {
        let now = self.clock.ticks_ms();
        let is_new = {
            let mut neighbours = self.neighbours.lock().trace_expect("discovery poisoned");
            if let Some(entry) = neighbours.iter_mut().find(|n| n.address == peer) {
                entry.last_seen_ms = now;
                if eid_node.is_some() {
                    entry.eid_node = eid_node;
                }
                false
            } else if neighbours.len() >= self.config.neighbour_cache {
                warn!("No more space for neighbours, ignoring {peer}");
                return;
            } else {
                info!("Found new neighbour {peer}");
                neighbours.push(NeighbourInfo {
                    address: peer,
                    eid_node,
                    first_seen_ms: now,
                    last_seen_ms: now,
                });
                true
            }
        };

        if is_new {
            let _ = self.events.send(agent::Event::Beacon { peer });
        }
    }

    /// Declares a peer dead (after repeated transmission failures).
    pub fn dead(&self, peer: cla::Address) {
        info!("Neighbour {peer} declared dead");
        self.remove_neighbour(peer);
    }

    fn remove_neighbour(&self, peer: cla::Address) {
        let removed = {
            let mut neighbours = self.neighbours.lock().trace_expect("discovery poisoned");
            let before = neighbours.len();
            neighbours.retain(|n| n.address != peer);
            neighbours.len() != before
        };

        if removed {
            if let Some(dgram) = self.dgram.get() {
                dgram.neighbour_down(peer);
            }
        }
    }

    fn remove_stale_neighbours(&self) {
        let now = self.clock.ticks_ms();
        let timeout = self.config.neighbour_timeout.as_millis() as u64;
        let stale: Vec<cla::Address> = {
            let neighbours = self.neighbours.lock().trace_expect("discovery poisoned");
            neighbours
                .iter()
                .filter(|n| now.saturating_sub(n.last_seen_ms) > timeout)
                .map(|n| n.address)
                .collect()
        };

        for peer in stale {
            info!("Neighbour {peer} timed out");
            self.remove_neighbour(peer);
        }
    }

    /// Clears the whole neighbour list (radio going dark).
    pub fn clear(&self) {
        let peers: Vec<cla::Address> = {
            let neighbours = self.neighbours.lock().trace_expect("discovery poisoned");
            neighbours.iter().map(|n| n.address).collect()
        };
        info!("Clearing neighbour list");
        for peer in peers {
            self.remove_neighbour(peer);
        }
    }

    /// Whether a peer is currently listed.
    pub fn is_neighbour(&self, peer: cla::Address) -> bool {
        self.neighbours
            .lock()
            .trace_expect("discovery poisoned")
            .iter()
            .any(|n| n.address == peer)
    }

    /// The node id a listed peer announced, if any.
    pub fn node_of(&self, peer: cla::Address) -> Option<u32> {
        self.neighbours
            .lock()
            .trace_expect("discovery poisoned")
            .iter()
            .find(|n| n.address == peer)
            .and_then(|n| n.node_id())
    }

    /// Snapshot of the neighbour list.
    pub fn neighbours(&self) -> Vec<NeighbourInfo> {
        self.neighbours.lock().trace_expect("discovery poisoned").clone()
    }

    /// Broadcasts one beacon on every registered link.
    pub async fn send_beacon(&self) {
        let beacon = {
            let mut sequence = self.sequence.lock().trace_expect("discovery poisoned");
            let beacon = ipnd::Beacon {
                sequence: *sequence,
                eid: Some(self.node.endpoint(0)),
                services: self
                    .hooks
                    .lock()
                    .trace_expect("discovery poisoned")
                    .iter()
                    .filter_map(|h| h.announce())
                    .collect(),
            };
            *sequence = sequence.wrapping_add(1);
            beacon
        };

        if let Some(dgram) = self.dgram.get() {
            dgram.send_discovery(&beacon.encode()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::TestClock;

    fn make_discovery() -> (Arc<Discovery>, Arc<TestClock>, flume::Receiver<agent::Event>) {
        let clock = TestClock::new();
        let (tx, rx) = flume::unbounded();
        let discovery = Discovery::new(
            config::DiscoveryConfig::default(),
            node_ids::NodeId::from_node_number(1),
            clock.clone(),
            tx,
        );
        (discovery, clock, rx)
    }

    #[test]
    fn new_neighbour_posts_beacon_event() {
        let (discovery, _clock, rx) = make_discovery();
        let peer = cla::Address::Lowpan(7);

        discovery.alive(peer);
        assert!(discovery.is_neighbour(peer));
        assert!(matches!(
            rx.try_recv(),
            Ok(agent::Event::Beacon { peer: p }) if p == peer
        ));

        // A refresh is not a new neighbour.
        discovery.alive(peer);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn beacon_teaches_peer_eid() {
        let (discovery, _clock, _rx) = make_discovery();
        let peer = cla::Address::Udp("10.0.0.9:4551".parse().unwrap());

        let beacon = ipnd::Beacon {
            sequence: 1,
            eid: Some(tundra_bpv6::eid::Eid::new(9, 0)),
            services: Vec::new(),
        };
        discovery.receive(peer, &beacon.encode());

        assert_eq!(discovery.node_of(peer), Some(9));
    }

    #[test]
    fn stale_neighbours_are_removed() {
        let (discovery, clock, _rx) = make_discovery();
        let peer = cla::Address::Lowpan(7);
        discovery.alive(peer);

        clock.advance_ms(26_000);
        discovery.remove_stale_neighbours();
        assert!(!discovery.is_neighbour(peer));
    }

    #[test]
    fn refresh_defers_timeout() {
        let (discovery, clock, _rx) = make_discovery();
        let peer = cla::Address::Lowpan(7);
        discovery.alive(peer);

        clock.advance_ms(20_000);
        discovery.alive(peer);
        clock.advance_ms(20_000);
        discovery.remove_stale_neighbours();
        assert!(discovery.is_neighbour(peer));
    }
}
