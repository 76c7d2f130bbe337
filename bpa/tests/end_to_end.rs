//! End-to-end scenarios: two agents wired back to back through an
//! in-memory short-frame link.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tundra_bpa::{
    agent::Agent,
    cla::{AckKind, Address, AddressFamily, FrameKind, Link, SegmentFlags, SendOutcome},
    clock::SystemClock,
    config::Config,
    node_ids::NodeId,
    registration::ServiceEvent,
    storage::mem::MemStorage,
    Bytes,
};
use tundra_bpv6::{
    bundle::{BlockFlags, BlockType, Bundle as WireBundle},
    eid::Eid,
};

const MTU: usize = 115;
const SEQNO_SPACE: u8 = 4;

/// Everything one side put on the air.
#[derive(Debug, Clone)]
struct LoggedFrame {
    from: u16,
    kind: FrameKind,
    payload: Vec<u8>,
}

#[derive(Default)]
struct WireLog {
    frames: Mutex<Vec<LoggedFrame>>,
}

impl WireLog {
    fn record(&self, from: u16, kind: FrameKind, payload: &[u8]) {
        self.frames.lock().unwrap().push(LoggedFrame {
            from,
            kind,
            payload: payload.to_vec(),
        });
    }

    fn snapshot(&self) -> Vec<LoggedFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn data_frames_from(&self, addr: u16) -> Vec<(u8, SegmentFlags)> {
        self.snapshot()
            .into_iter()
            .filter(|f| f.from == addr)
            .filter_map(|f| match f.kind {
                FrameKind::Data { seqno, flags } => Some((seqno, flags)),
                _ => None,
            })
            .collect()
    }

    fn acks_from(&self, addr: u16) -> Vec<u8> {
        self.snapshot()
            .into_iter()
            .filter(|f| f.from == addr)
            .filter_map(|f| match f.kind {
                FrameKind::Ack { seqno } => Some(seqno),
                _ => None,
            })
            .collect()
    }

    fn nacks_from(&self, addr: u16) -> Vec<(u8, bool)> {
        self.snapshot()
            .into_iter()
            .filter(|f| f.from == addr)
            .filter_map(|f| match f.kind {
                FrameKind::Nack { seqno, temporary } => Some((seqno, temporary)),
                _ => None,
            })
            .collect()
    }
}

/// One direction of the loopback pair: frames go into a channel and a
/// pump task replays them into the peer agent, preserving order and
/// decoupling the send path from the receive path.
///
/// Unicast frames reach the peer agent only when addressed to it;
/// sends to anyone else come back as link-layer NoAck, like a real
/// 802.15.4 unicast into the void. A "phantom" address accepts frames
/// silently, for tests that script the far side by hand.
struct TestLink {
    addr: u16,
    peer_addr: u16,
    tx: flume::Sender<(FrameKind, Vec<u8>)>,
    log: Arc<WireLog>,
    acks_sent: AtomicU32,
    /// ACK ordinals (1-based) this side must lose.
    drop_acks: Mutex<Vec<u32>>,
    phantoms: Mutex<Vec<u16>>,
}

impl TestLink {
    fn new(
        addr: u16,
        peer_addr: u16,
        log: Arc<WireLog>,
    ) -> (Arc<Self>, flume::Receiver<(FrameKind, Vec<u8>)>) {
        let (tx, rx) = flume::unbounded();
        (
            Arc::new(Self {
                addr,
                peer_addr,
                tx,
                log,
                acks_sent: AtomicU32::new(0),
                drop_acks: Mutex::new(Vec::new()),
                phantoms: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Loses the n-th ACK (1-based) this side would send.
    fn drop_ack(&self, ordinal: u32) {
        self.drop_acks.lock().unwrap().push(ordinal);
    }

    /// Marks an address that swallows frames without a peer agent.
    fn phantom(&self, addr: u16) {
        self.phantoms.lock().unwrap().push(addr);
    }

    fn route(&self, dest: Address) -> Option<bool> {
        match dest {
            Address::Lowpan(d) if d == self.peer_addr => Some(true),
            Address::Lowpan(d) if self.phantoms.lock().unwrap().contains(&d) => Some(false),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl Link for TestLink {
    fn name(&self) -> &str {
        "dgram:test"
    }

    fn family(&self) -> AddressFamily {
        AddressFamily::Lowpan
    }

    fn max_payload_length(&self) -> usize {
        MTU
    }

    fn next_seqno(&self, last: u8) -> u8 {
        (last + 1) % SEQNO_SPACE
    }

    async fn send_discovery(&self, payload: &[u8]) -> SendOutcome {
        let kind = FrameKind::Discovery;
        self.log.record(self.addr, kind.clone(), payload);
        let _ = self.tx.send((kind, payload.to_vec()));
        SendOutcome::Sent
    }

    async fn send_bundle(
        &self,
        dest: Address,
        seqno: u8,
        flags: SegmentFlags,
        payload: &[u8],
    ) -> SendOutcome {
        let kind = FrameKind::Data { seqno, flags };
        self.log.record(self.addr, kind.clone(), payload);
        match self.route(dest) {
            Some(true) => {
                let _ = self.tx.send((kind, payload.to_vec()));
                SendOutcome::Sent
            }
            Some(false) => SendOutcome::Sent,
            None => SendOutcome::NoAck,
        }
    }

    async fn send_ack(&self, dest: Address, seqno: u8, kind: AckKind) -> SendOutcome {
        let frame = match kind {
            AckKind::Ack => FrameKind::Ack { seqno },
            AckKind::Nack => FrameKind::Nack {
                seqno,
                temporary: false,
            },
            AckKind::TempNack => FrameKind::Nack {
                seqno,
                temporary: true,
            },
        };
        self.log.record(self.addr, frame.clone(), &[]);

        if matches!(kind, AckKind::Ack) {
            let ordinal = self.acks_sent.fetch_add(1, Ordering::SeqCst) + 1;
            if self.drop_acks.lock().unwrap().contains(&ordinal) {
                // The frame evaporates mid-air.
                return SendOutcome::Sent;
            }
        }

        match self.route(dest) {
            Some(true) => {
                let _ = self.tx.send((frame, Vec::new()));
                SendOutcome::Sent
            }
            Some(false) => SendOutcome::Sent,
            None => SendOutcome::NoAck,
        }
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.cl.peer_timeout = Duration::from_millis(200);
    config.cl.multipart_timeout = Duration::from_millis(500);
    config.cl.retransmit_timeout = Duration::from_millis(50);
    config.cl.sweep_interval = Duration::from_millis(20);
    config.discovery.schedule = tundra_bpa::discovery::Schedule::Periodic {
        cycle: Duration::from_millis(100),
    };
    config.discovery.neighbour_timeout = Duration::from_millis(600);
    config
}

struct TestNode {
    agent: Arc<Agent>,
    link: Arc<TestLink>,
    addr: u16,
}

/// Builds two agents joined by a loopback link pair.
async fn make_pair(config_a: Config, config_b: Config) -> (TestNode, TestNode, Arc<WireLog>) {
    let log = Arc::new(WireLog::default());

    let node_a = Agent::new(
        config_a,
        NodeId::from_link_address([1, 0]),
        Arc::new(SystemClock::new()),
        Arc::new(MemStorage::new()),
    );
    let node_b = Agent::new(
        config_b,
        NodeId::from_link_address([2, 0]),
        Arc::new(SystemClock::new()),
        Arc::new(MemStorage::new()),
    );

    let (link_a, rx_a) = TestLink::new(1, 2, log.clone());
    let (link_b, rx_b) = TestLink::new(2, 1, log.clone());
    node_a.register_link(link_a.clone()).unwrap();
    node_b.register_link(link_b.clone()).unwrap();

    // Pump frames from each side into the other agent.
    for (rx, source, dest) in [(rx_a, 1u16, node_b.clone()), (rx_b, 2u16, node_a.clone())] {
        tokio::spawn(async move {
            while let Ok((kind, payload)) = rx.recv_async().await {
                dest.dgram()
                    .incoming_frame(Address::Lowpan(source), kind, &payload, None)
                    .await;
            }
        });
    }

    node_a.start();
    node_b.start();

    (
        TestNode {
            agent: node_a,
            link: link_a,
            addr: 1,
        },
        TestNode {
            agent: node_b,
            link: link_b,
            addr: 2,
        },
        log,
    )
}

fn payload_bundle(destination: Eid, payload: &[u8]) -> WireBundle {
    let mut bundle = WireBundle {
        destination,
        lifetime: 60,
        ..Default::default()
    };
    bundle.flags.is_singleton = true;
    bundle.add_block(
        BlockType::Payload,
        BlockFlags::default(),
        Bytes::copy_from_slice(payload),
    );
    bundle
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn single_segment_round_trip() {
    let (a, b, log) = make_pair(test_config(), test_config()).await;

    let (_token_b, rx_b) = b.agent.register_service(25).unwrap();
    let (token_a, _rx_a) = a.agent.register_service(25).unwrap();

    let payload = vec![0x42u8; 40];
    a.agent
        .submit(token_a, payload_bundle(Eid::new(2, 25), &payload))
        .unwrap();

    // B's service receives the bundle.
    let delivered = rx_b.recv_async().await.unwrap();
    let ServiceEvent::Deliver(handle) = delivered else {
        panic!("expected delivery, got {delivered:?}");
    };
    {
        let guard = handle.read();
        assert_eq!(guard.bundle.payload_block().unwrap().data.as_ref(), &payload[..]);
        assert_eq!(guard.bundle.source, Eid::new(1, 25));
    }
    assert_eq!(b.agent.stored_bundles().len(), 1);

    b.agent.processing_finished(handle);

    // Both sides settle: delivered at B, forwarded-and-done at A.
    wait_for(|| b.agent.stored_bundles().is_empty(), "B storage to drain").await;
    wait_for(|| a.agent.stored_bundles().is_empty(), "A storage to drain").await;

    // One whole-bundle data frame with seq 0, one ACK with seq 1.
    assert_eq!(
        log.data_frames_from(a.addr),
        vec![(0, SegmentFlags::WHOLE)]
    );
    assert_eq!(log.acks_from(b.addr), vec![1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn three_segment_multipart() {
    let (a, b, log) = make_pair(test_config(), test_config()).await;

    let (_token_b, rx_b) = b.agent.register_service(25).unwrap();
    let (token_a, _rx_a) = a.agent.register_service(25).unwrap();

    // Encoded size lands between 2*MTU and 3*MTU.
    let payload: Vec<u8> = (0..260u16).map(|i| i as u8).collect();
    a.agent
        .submit(token_a, payload_bundle(Eid::new(2, 25), &payload))
        .unwrap();

    let ServiceEvent::Deliver(handle) = rx_b.recv_async().await.unwrap() else {
        panic!("expected delivery");
    };
    assert_eq!(
        handle.read().bundle.payload_block().unwrap().data.as_ref(),
        &payload[..]
    );
    wait_for(|| log.acks_from(b.addr).len() == 3, "all ACKs on the air").await;

    // Three segments, consecutive seqnos, first/middle/last flags.
    assert_eq!(
        log.data_frames_from(a.addr),
        vec![
            (
                0,
                SegmentFlags {
                    first: true,
                    last: false
                }
            ),
            (
                1,
                SegmentFlags {
                    first: false,
                    last: false
                }
            ),
            (
                2,
                SegmentFlags {
                    first: false,
                    last: true
                }
            ),
        ]
    );
    assert_eq!(log.acks_from(b.addr), vec![1, 2, 3]);

    // Full segments except the tail.
    let sizes: Vec<usize> = log
        .snapshot()
        .into_iter()
        .filter(|f| f.from == a.addr && matches!(f.kind, FrameKind::Data { .. }))
        .map(|f| f.payload.len())
        .collect();
    assert_eq!(sizes[0], MTU);
    assert_eq!(sizes[1], MTU);
    assert!(sizes[2] > 0 && sizes[2] < MTU);
}

#[tokio::test(flavor = "multi_thread")]
async fn multipart_survives_a_lost_ack() {
    let (a, b, log) = make_pair(test_config(), test_config()).await;

    let (_token_b, rx_b) = b.agent.register_service(25).unwrap();
    let (token_a, _rx_a) = a.agent.register_service(25).unwrap();

    // Lose the ACK for the middle segment.
    b.link.drop_ack(2);

    let payload: Vec<u8> = (0..260u16).map(|i| (i ^ 0x5A) as u8).collect();
    a.agent
        .submit(token_a, payload_bundle(Eid::new(2, 25), &payload))
        .unwrap();

    let ServiceEvent::Deliver(handle) = rx_b.recv_async().await.unwrap() else {
        panic!("expected delivery");
    };
    assert_eq!(
        handle.read().bundle.payload_block().unwrap().data.as_ref(),
        &payload[..]
    );
    wait_for(|| log.acks_from(b.addr).len() == 4, "all ACKs on the air").await;

    // The middle segment went out twice with the same seqno, and B
    // acknowledged it twice.
    let middles: Vec<u8> = log
        .data_frames_from(a.addr)
        .into_iter()
        .filter(|(_, flags)| !flags.first && !flags.last)
        .map(|(seqno, _)| seqno)
        .collect();
    assert_eq!(middles, vec![1, 1]);
    assert_eq!(log.acks_from(b.addr), vec![1, 2, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_bundle_is_rejected_with_permanent_nack() {
    let (_a, b, log) = make_pair(test_config(), test_config()).await;

    // A bundle with no source timestamp, two seconds of accumulated
    // age and a zero lifetime: expired on arrival.
    let mut bundle = payload_bundle(Eid::new(2, 25), b"stale");
    bundle.source = Eid::new(1, 25);
    bundle.lifetime = 0;
    let image = bundle.encode(2_000);

    b.agent
        .dgram()
        .incoming_frame(
            Address::Lowpan(1),
            FrameKind::Data {
                seqno: 0,
                flags: SegmentFlags::WHOLE,
            },
            &image,
            None,
        )
        .await;

    wait_for(
        || log.nacks_from(b.addr) == vec![(1, false)],
        "permanent NACK from B",
    )
    .await;
    assert!(b.agent.stored_bundles().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_bundle_is_suppressed_but_acked() {
    let (_a, b, log) = make_pair(test_config(), test_config()).await;

    let (_token_b, rx_b) = b.agent.register_service(25).unwrap();

    let mut bundle = payload_bundle(Eid::new(2, 25), b"only once");
    bundle.source = Eid::new(1, 25);
    bundle.creation_sequence = 33;
    let image = bundle.encode(0);

    let deliver = |seqno| {
        let image = image.clone();
        let agent = b.agent.clone();
        async move {
            agent
                .dgram()
                .incoming_frame(
                    Address::Lowpan(1),
                    FrameKind::Data {
                        seqno,
                        flags: SegmentFlags::WHOLE,
                    },
                    &image,
                    None,
                )
                .await;
        }
    };

    deliver(0).await;
    assert!(matches!(
        rx_b.recv_async().await.unwrap(),
        ServiceEvent::Deliver(_)
    ));

    // The sender never saw the ACK and retransmits.
    deliver(1).await;

    wait_for(|| log.acks_from(b.addr).len() == 2, "both ACKs").await;
    assert_eq!(log.acks_from(b.addr), vec![1, 2]);
    assert_eq!(b.agent.stored_bundles().len(), 1);

    // No second delivery happened.
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_neighbour_times_out_and_tickets_drain() {
    // Keep the blacklist out of the way so the teardown is driven by
    // the discovery timeout alone.
    let mut config_a = test_config();
    config_a.routing.blacklist_threshold = 100;
    let (a, _b, _log) = make_pair(config_a, test_config()).await;

    // A third node that beacons once and then goes silent.
    let beacon = tundra_bpa::discovery::ipnd::Beacon {
        sequence: 1,
        eid: Some(Eid::new(9, 0)),
        services: Vec::new(),
    };
    a.agent
        .dgram()
        .incoming_frame(
            Address::Lowpan(9),
            FrameKind::Discovery,
            &beacon.encode(),
            None,
        )
        .await;
    assert!(a.agent.discovery().is_neighbour(Address::Lowpan(9)));

    // Two bundles for the silent peer; every unicast to it dies with
    // a link-layer NoAck.
    let (token_a, _rx_a) = a.agent.register_service(25).unwrap();
    a.agent
        .submit(token_a, payload_bundle(Eid::new(9, 25), b"first"))
        .unwrap();
    a.agent
        .submit(token_a, payload_bundle(Eid::new(9, 25), b"second"))
        .unwrap();

    wait_for(|| a.agent.stored_bundles().len() == 2, "bundles stored").await;

    // No beacons, no ACKs: retries exhaust, the peer ages out, and its
    // CL state drains.
    wait_for(
        || !a.agent.discovery().is_neighbour(Address::Lowpan(9)),
        "neighbour timeout",
    )
    .await;
    wait_for(
        || a.agent.dgram().ticket_count() == 0,
        "tickets to drain",
    )
    .await;

    // The bundles stay stored for a future contact.
    assert_eq!(a.agent.stored_bundles().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_nacks_blacklist_the_peer() {
    let (a, _b, log) = make_pair(test_config(), test_config()).await;

    let beacon = tundra_bpa::discovery::ipnd::Beacon {
        sequence: 1,
        eid: Some(Eid::new(9, 0)),
        services: Vec::new(),
    };
    a.agent
        .dgram()
        .incoming_frame(
            Address::Lowpan(9),
            FrameKind::Discovery,
            &beacon.encode(),
            None,
        )
        .await;

    // Node 9 exists on the air but is scripted by this test.
    a.link.phantom(9);

    // Answer every data frame for node 9 with a permanent NACK.
    {
        let agent = a.agent.clone();
        let log = log.clone();
        tokio::spawn(async move {
            let mut answered = 0;
            loop {
                let frames = log.data_frames_from(1);
                while answered < frames.len() {
                    let (seqno, _) = frames[answered];
                    answered += 1;
                    agent
                        .dgram()
                        .incoming_frame(
                            Address::Lowpan(9),
                            FrameKind::Nack {
                                seqno: (seqno + 1) % SEQNO_SPACE,
                                temporary: false,
                            },
                            &[],
                            None,
                        )
                        .await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    let (token_a, _rx_a) = a.agent.register_service(25).unwrap();
    a.agent
        .submit(token_a, payload_bundle(Eid::new(9, 25), b"doomed"))
        .unwrap();

    // Strikes accumulate until discovery is told the peer is dead.
    wait_for(
        || !a.agent.discovery().is_neighbour(Address::Lowpan(9)),
        "peer to be blacklisted",
    )
    .await;

    // A fresh beacon starts over with a clean slate.
    let beacon = tundra_bpa::discovery::ipnd::Beacon {
        sequence: 2,
        eid: Some(Eid::new(9, 0)),
        services: Vec::new(),
    };
    a.agent
        .dgram()
        .incoming_frame(
            Address::Lowpan(9),
            FrameKind::Discovery,
            &beacon.encode(),
            None,
        )
        .await;
    assert!(a.agent.discovery().is_neighbour(Address::Lowpan(9)));
}
