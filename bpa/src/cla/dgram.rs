/*!
The datagram convergence-layer core.

Owns the transmit ticket queue and the retransmission state machine
shared by every datagram link: outgoing segmentation with consecutive
sequence numbers, the per-segment application-layer ACK handshake,
incoming reassembly, per-peer blocking while an ACK is outstanding, and
the stale-state sweepers. Link adapters only move frames; everything
stateful happens here.
*/

use super::*;
use crate::cla::ticket::{Ticket, TicketFlags, TicketPriority};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, OnceLock,
};

/// Outcome of processing one received data segment.
enum DataOutcome {
    /// Accepted (or silently dropped); acknowledge.
    Success,
    /// Resource problem; the sender may retry.
    Temporary,
    /// The segment or bundle is unusable; the sender must give up.
    Permanent,
}

enum SendResult {
    Sent,
    Busy,
    Error,
}

pub struct Dgram {
    config: config::ClConfig,
    clock: Arc<dyn clock::Clock>,
    pool: Arc<slot::Pool>,

    store: OnceLock<Arc<store::Store>>,
    dispatcher: OnceLock<Arc<dispatcher::Dispatcher>>,
    router: OnceLock<Arc<routing::Router>>,
    discovery: OnceLock<Arc<discovery::Discovery>>,
    reporter: OnceLock<Arc<report::Reporter>>,

    links: Mutex<Vec<Arc<dyn Link>>>,
    tickets: Mutex<Vec<Ticket>>,
    blocked: Mutex<Vec<(Address, u64)>>,

    /// One outgoing segment sequence counter, shared by all links.
    seqno: Mutex<u8>,
    next_ticket_id: AtomicU64,
    backoff_pending: AtomicBool,
    tx_wakeup: tokio::sync::Notify,

    /// Last accepted multipart seqno, to re-ACK a resent final segment
    /// whose ticket is already gone.
    last_multipart_seqno: Mutex<Option<u8>>,
}

impl Dgram {
    pub fn new(
        config: config::ClConfig,
        clock: Arc<dyn clock::Clock>,
        pool: Arc<slot::Pool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            pool,
            store: OnceLock::new(),
            dispatcher: OnceLock::new(),
            router: OnceLock::new(),
            discovery: OnceLock::new(),
            reporter: OnceLock::new(),
            links: Mutex::new(Vec::new()),
            tickets: Mutex::new(Vec::new()),
            blocked: Mutex::new(Vec::new()),
            seqno: Mutex::new(0),
            next_ticket_id: AtomicU64::new(1),
            backoff_pending: AtomicBool::new(false),
            tx_wakeup: tokio::sync::Notify::new(),
            last_multipart_seqno: Mutex::new(None),
        })
    }

    /// Wires the peers and starts the sender and timeout tasks.
    pub(crate) fn start(
        self: &Arc<Self>,
        store: Arc<store::Store>,
        dispatcher: Arc<dispatcher::Dispatcher>,
        router: Arc<routing::Router>,
        discovery: Arc<discovery::Discovery>,
        reporter: Arc<report::Reporter>,
    ) {
        let _ = self.store.set(store);
        let _ = self.dispatcher.set(dispatcher);
        let _ = self.router.set(router);
        let _ = self.discovery.set(discovery);
        let _ = self.reporter.set(reporter);

        let dgram = self.clone();
        tokio::spawn(async move {
            loop {
                dgram.tx_wakeup.notified().await;
                if dgram.backoff_pending.swap(false, Ordering::Relaxed) {
                    // Mind collisions after a busy radio.
                    tokio::time::sleep(dgram.config.busy_backoff).await;
                }
                dgram.service_queue().await;
            }
        });

        let dgram = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dgram.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                dgram.check_timeouts();
            }
        });
    }

    /// Registers a link adapter; one per address family.
    pub fn register_link(&self, link: Arc<dyn Link>) -> Result<()> {
        let mut links = self.links.lock().trace_expect("cl poisoned");
        if links.iter().any(|l| l.family() == link.family()) {
            return Err(Error::AlreadyRegistered(link.family()));
        }
        info!("Registered link adapter {}", link.name());
        links.push(link);
        Ok(())
    }

    fn link_for(&self, family: AddressFamily) -> Result<Arc<dyn Link>> {
        self.links
            .lock()
            .trace_expect("cl poisoned")
            .iter()
            .find(|l| l.family() == family)
            .cloned()
            .ok_or(Error::NoLink(family))
    }

    /// Queues a bundle transmission to a neighbour (routing entry
    /// point).
    pub fn send_bundle(&self, neighbour: Address, bundle_number: u32) -> Result<()> {
        let id = self.alloc_ticket(TicketPriority::Normal, neighbour, |ticket| {
            ticket.bundle_number = Some(bundle_number);
            ticket.flags.active = true;
        })?;
        trace!("Enqueued bundle {bundle_number} for {neighbour} as ticket {id}");
        self.tx_wakeup.notify_one();
        Ok(())
    }

    /// Broadcasts a discovery payload over every link.
    pub async fn send_discovery(&self, payload: &[u8]) {
        let links: Vec<Arc<dyn Link>> = self.links.lock().trace_expect("cl poisoned").clone();
        for link in links {
            if let SendOutcome::Busy = link.send_discovery(payload).await {
                debug!("Link {} busy, discovery beacon dropped", link.name());
            }
        }
        self.tx_wakeup.notify_one();
    }

    fn alloc_ticket(
        &self,
        priority: TicketPriority,
        neighbour: Address,
        init: impl FnOnce(&mut Ticket),
    ) -> Result<u64> {
        let mut tickets = self.tickets.lock().trace_expect("cl poisoned");

        let free = self.config.queue_size.saturating_sub(tickets.len());
        match priority {
            TicketPriority::Normal if free <= self.config.queue_reserve => {
                warn!("Cannot allocate ticket with normal priority");
                return Err(Error::QueueFull);
            }
            _ if free == 0 => {
                warn!("Cannot allocate ticket");
                return Err(Error::QueueFull);
            }
            _ => {}
        }

        let id = self.next_ticket_id.fetch_add(1, Ordering::Relaxed);
        let mut ticket = Ticket::new(id, neighbour, self.clock.ticks_ms());
        init(&mut ticket);
        match priority {
            TicketPriority::Normal => tickets.push(ticket),
            TicketPriority::High => tickets.insert(0, ticket),
        }
        Ok(id)
    }

    fn free_ticket(&self, id: u64) {
        self.tickets
            .lock()
            .trace_expect("cl poisoned")
            .retain(|t| t.id != id);
    }

    /// Entry point for link adapters: one decoded frame.
    pub async fn incoming_frame(
        &self,
        source: Address,
        kind: FrameKind,
        payload: &[u8],
        rssi: Option<i16>,
    ) {
        if let Some(discovery) = self.discovery.get() {
            discovery.alive(source);
        }

        match kind {
            FrameKind::Data { seqno, flags } => {
                trace!("Incoming data frame from {source} with SeqNo {seqno}");
                let outcome = self.parse_dataframe(source, seqno, flags, payload, rssi).await;

                let Ok(link) = self.link_for(source.family()) else {
                    return;
                };
                let ack_seqno = link.next_seqno(seqno);
                let ack = match outcome {
                    DataOutcome::Success => AckKind::Ack,
                    DataOutcome::Temporary => AckKind::TempNack,
                    DataOutcome::Permanent => AckKind::Nack,
                };
                self.create_send_ack(source, ack_seqno, ack).await;
            }
            FrameKind::Ack { seqno } => {
                trace!("Incoming ACK from {source} with SeqNo {seqno}");
                self.parse_ackframe(source, seqno, AckKind::Ack).await;
            }
            FrameKind::Nack { seqno, temporary } => {
                trace!("Incoming NACK from {source} with SeqNo {seqno}");
                let kind = if temporary {
                    AckKind::TempNack
                } else {
                    AckKind::Nack
                };
                self.parse_ackframe(source, seqno, kind).await;
            }
            FrameKind::Discovery => {
                if let Some(discovery) = self.discovery.get() {
                    discovery.receive(source, payload);
                }
            }
        }
    }

    async fn parse_dataframe(
        &self,
        source: Address,
        seqno: u8,
        flags: SegmentFlags,
        payload: &[u8],
        rssi: Option<i16>,
    ) -> DataOutcome {
        let mut assembled: Option<Vec<u8>> = None;

        if flags != SegmentFlags::WHOLE {
            let Ok(link) = self.link_for(source.family()) else {
                return DataOutcome::Temporary;
            };

            if flags.first {
                // Start of a new bundle; drop any unfinished one from
                // this peer.
                let stale = {
                    let tickets = self.tickets.lock().trace_expect("cl poisoned");
                    tickets
                        .iter()
                        .find(|t| t.neighbour == source && t.flags.multipart_recv)
                        .map(|t| t.id)
                };
                if let Some(stale) = stale {
                    warn!("Resynced to peer {source}, throwing away old buffer");
                    self.free_ticket(stale);
                }

                let now = self.clock.ticks_ms();
                let payload = payload.to_vec();
                let alloc = self.alloc_ticket(TicketPriority::High, source, |ticket| {
                    ticket.flags.multipart_recv = true;
                    ticket.sequence_number = seqno;
                    ticket.timestamp_ms = now;
                    ticket.buffer = payload;
                });
                if alloc.is_err() {
                    error!("Unable to allocate multipart receive ticket");
                    return DataOutcome::Temporary;
                }
                *self.last_multipart_seqno.lock().trace_expect("cl poisoned") = Some(seqno);

                // Waiting for more segments.
                return DataOutcome::Success;
            }

            // Middle or final segment; find the reassembly in progress.
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            let Some(ticket) = tickets
                .iter_mut()
                .find(|t| t.neighbour == source && t.flags.multipart_recv)
            else {
                drop(tickets);
                if *self.last_multipart_seqno.lock().trace_expect("cl poisoned") == Some(seqno) {
                    // The final ACK was lost and the peer resent its
                    // last segment; just ACK it again.
                    return DataOutcome::Success;
                }
                warn!("Segment from {source} matches no bundle in progress, discarding");
                return DataOutcome::Temporary;
            };

            let expected = link.next_seqno(ticket.sequence_number);
            if seqno != expected {
                warn!("Segment from {source} out of sequence: recv {seqno}, exp {expected}");
                // Duplicate of an already-accepted segment; ACK anew.
                return DataOutcome::Success;
            }

            ticket.sequence_number = seqno;
            ticket.timestamp_ms = self.clock.ticks_ms();
            ticket.buffer.extend_from_slice(payload);
            let id = ticket.id;
            *self.last_multipart_seqno.lock().trace_expect("cl poisoned") = Some(seqno);

            if !flags.last {
                // Waiting for more segments.
                return DataOutcome::Success;
            }

            let buffer = core::mem::take(&mut ticket.buffer);
            drop(tickets);
            self.free_ticket(id);
            debug!("{} octet multipart bundle received from {source}", buffer.len());
            assembled = Some(buffer);
        }

        let image = assembled.as_deref().unwrap_or(payload);

        let wire = match tundra_bpv6::bundle::Bundle::parse(image) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Error recovering bundle from {source}: {e}");
                return DataOutcome::Permanent;
            }
        };

        let mut incoming = bundle::Bundle::new(wire, self.clock.ticks_ms());
        incoming.metadata.received_from = Some(source);
        incoming.metadata.rssi = rssi;

        if incoming.has_expired(&self.clock.now()) {
            warn!("Bundle received from {source} with SeqNo {seqno} is expired");
            return DataOutcome::Permanent;
        }

        debug!(
            "Bundle from {} (to {}) received from {source} with SeqNo {seqno}",
            incoming.bundle.source, incoming.bundle.destination
        );

        let handle = match self.pool.create(incoming) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot accept bundle from {source}: {e}");
                return DataOutcome::Temporary;
            }
        };

        let Some(dispatcher) = self.dispatcher.get() else {
            return DataOutcome::Temporary;
        };
        match dispatcher.dispatch(handle).await {
            Ok(()) => DataOutcome::Success,
            Err(e) => {
                warn!("Dispatch failed for bundle from {source}: {e}");
                DataOutcome::Temporary
            }
        }
    }

    /// Sends an ACK/NACK, keeping a high-priority ticket so it can be
    /// retransmitted while the radio is busy.
    async fn create_send_ack(&self, dest: Address, seqno: u8, kind: AckKind) {
        let now = self.clock.ticks_ms();
        let id = self
            .alloc_ticket(TicketPriority::High, dest, |ticket| {
                ticket.sequence_number = seqno;
                ticket.flags.in_transit = true;
                match kind {
                    AckKind::Ack => ticket.flags.ack = true,
                    AckKind::Nack => ticket.flags.nack = true,
                    AckKind::TempNack => ticket.flags.temp_nack = true,
                }
                ticket.timestamp_ms = now;
            })
            .ok();
        if id.is_none() {
            warn!("Unable to allocate ticket to potentially retransmit ACK/NACK");
        }

        let outcome = match self.link_for(dest.family()) {
            Ok(link) => link.send_ack(dest, seqno, kind).await,
            Err(_) => SendOutcome::Fatal,
        };

        if let Some(id) = id {
            self.control_send_status(id, outcome);
        }
        self.tx_wakeup.notify_one();
    }

    /// Post-send processing for a control (ACK/NACK) ticket.
    fn control_send_status(&self, id: u64, outcome: SendOutcome) {
        let give_up_tries = self.retransmit_tries();
        let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
        let Some(ticket) = tickets.iter_mut().find(|t| t.id == id) else {
            return;
        };
        ticket.flags.in_transit = false;

        match outcome {
            SendOutcome::Sent | SendOutcome::Fatal => {
                tickets.retain(|t| t.id != id);
                return;
            }
            SendOutcome::Busy => {
                // Not transmitted at all; retry as soon as possible.
                ticket.timestamp_ms = 0;
                ticket.failed_tries += 1;
                self.backoff_pending.store(true, Ordering::Relaxed);
            }
            SendOutcome::NoAck => {}
        }

        ticket.tries += 1;
        if ticket.tries >= give_up_tries || ticket.failed_tries >= self.config.failed_retries {
            warn!("Giving up on control ticket {id} after {} tries", ticket.tries);
            tickets.retain(|t| t.id != id);
        }
    }

    fn retransmit_tries(&self) -> u8 {
        (self.config.peer_timeout.as_millis() / self.config.retransmit_timeout.as_millis().max(1))
            .max(1) as u8
    }

    /// The sender task body: one pass over the queue, transmitting the
    /// first actionable ticket.
    async fn service_queue(&self) {
        let ids: Vec<u64> = {
            let tickets = self.tickets.lock().trace_expect("cl poisoned");
            tickets.iter().map(|t| t.id).collect()
        };

        for id in ids {
            enum Action {
                ResendControl(Address, u8, AckKind),
                SendData,
                Skip,
            }

            let action = {
                let tickets = self.tickets.lock().trace_expect("cl poisoned");
                let Some(ticket) = tickets.iter().find(|t| t.id == id) else {
                    continue;
                };

                if ticket.flags.is_control() && !ticket.flags.in_transit {
                    let due = ticket.timestamp_ms == 0
                        || self.clock.ticks_ms().saturating_sub(ticket.timestamp_ms)
                            >= self.config.retransmit_timeout.as_millis() as u64;
                    if due {
                        Action::ResendControl(
                            ticket.neighbour,
                            ticket.sequence_number,
                            ticket.flags.control_kind().expect("control ticket"),
                        )
                    } else {
                        Action::Skip
                    }
                } else if ticket.flags.in_transit
                    || !ticket.flags.active
                    || ticket.flags.multipart_recv
                    || self.is_blocked(ticket.neighbour)
                {
                    Action::Skip
                } else {
                    Action::SendData
                }
            };

            match action {
                Action::Skip => continue,
                Action::ResendControl(dest, seqno, kind) => {
                    {
                        let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
                        if let Some(ticket) = tickets.iter_mut().find(|t| t.id == id) {
                            ticket.flags.in_transit = true;
                            ticket.timestamp_ms = self.clock.ticks_ms();
                        }
                    }
                    let outcome = match self.link_for(dest.family()) {
                        Ok(link) => link.send_ack(dest, seqno, kind).await,
                        Err(_) => SendOutcome::Fatal,
                    };
                    self.control_send_status(id, outcome);
                    // One transmission per pass.
                    break;
                }
                Action::SendData => match self.prepare_segmentation(id).await {
                    SendResult::Sent => break,
                    SendResult::Busy => {
                        self.backoff_pending.store(true, Ordering::Relaxed);
                        self.tx_wakeup.notify_one();
                    }
                    SendResult::Error => continue,
                },
            }
        }
    }

    /// Encodes (first time round), segments and transmits the next
    /// frame of an outgoing bundle ticket.
    async fn prepare_segmentation(&self, id: u64) -> SendResult {
        let store = self.store.get().expect("cl not started");

        // First attempt for this ticket: fetch and encode the bundle.
        let needs_encode = {
            let tickets = self.tickets.lock().trace_expect("cl poisoned");
            match tickets.iter().find(|t| t.id == id) {
                Some(ticket) => !ticket.flags.multipart,
                None => return SendResult::Error,
            }
        };

        if needs_encode {
            let (bundle_number, neighbour) = {
                let tickets = self.tickets.lock().trace_expect("cl poisoned");
                let Some(ticket) = tickets.iter().find(|t| t.id == id) else {
                    return SendResult::Error;
                };
                (ticket.bundle_number, ticket.neighbour)
            };
            let Some(bundle_number) = bundle_number else {
                return SendResult::Error;
            };

            let handle = match store.read(bundle_number) {
                Ok(Some(handle)) => handle,
                _ => {
                    error!("Unable to read bundle {bundle_number}");
                    self.fail_ticket(id);
                    return SendResult::Error;
                }
            };

            let now = self.clock.now();
            if handle.read().has_expired(&now) {
                info!("Bundle {bundle_number} has expired, not sending it");
                // Storage handles reports and purges our tickets.
                self.free_ticket(id);
                store.delete(bundle_number, store::DeleteReason::LifetimeExpired);
                return SendResult::Error;
            }

            // The ageing block changes between attempts, so encode
            // fresh each time until the first segment is out.
            let encoded = handle.read().encode(&now);
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            let Some(ticket) = tickets.iter_mut().find(|t| t.id == id) else {
                return SendResult::Error;
            };
            ticket.buffer = encoded;
            ticket.offset_sent = 0;
            ticket.offset_acked = 0;
            ticket.bundle = Some(handle);
            trace!(
                "Encoded bundle {bundle_number} for {neighbour}: {} octets",
                ticket.buffer.len()
            );
        }

        // Decide what to put on the air.
        let (dest, seqno, flags, chunk) = {
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            let Some(ticket) = tickets.iter_mut().find(|t| t.id == id) else {
                return SendResult::Error;
            };
            let Ok(link) = self.link_for(ticket.neighbour.family()) else {
                return SendResult::Error;
            };
            let mtu = link.max_payload_length();

            if ticket.buffer.len() > mtu && !ticket.flags.multipart {
                debug!(
                    "Sending bundle {:?} as multipart ({} octets)",
                    ticket.bundle_number,
                    ticket.buffer.len()
                );
                // The encoded image is authoritative now.
                ticket.bundle = None;
                ticket.flags.multipart = true;

                // Reserve a consecutive seqno run for every segment.
                let segments = ticket.buffer.len().div_ceil(mtu);
                let mut seq = self.seqno.lock().trace_expect("cl poisoned");
                ticket.sequence_number = *seq;
                for _ in 0..segments {
                    *seq = link.next_seqno(*seq);
                }
            }

            if ticket.flags.multipart {
                let remaining = ticket.buffer.len() - ticket.offset_acked;
                let flags = SegmentFlags {
                    first: ticket.offset_acked == 0,
                    last: remaining <= mtu,
                };
                let chunk_len = remaining.min(mtu);

                // Advance the seqno only once the previous segment has
                // been acknowledged; a retransmission reuses it.
                if ticket.offset_sent == ticket.offset_acked {
                    if ticket.offset_sent > 0 {
                        ticket.sequence_number = link.next_seqno(ticket.sequence_number);
                    }
                    ticket.offset_sent += chunk_len;
                }

                let start = ticket.offset_acked;
                let chunk = ticket.buffer[start..start + chunk_len].to_vec();
                ticket.flags.in_transit = true;
                (ticket.neighbour, ticket.sequence_number, flags, chunk)
            } else {
                let mut seq = self.seqno.lock().trace_expect("cl poisoned");
                ticket.sequence_number = *seq;
                *seq = link.next_seqno(*seq);
                drop(seq);

                ticket.flags.in_transit = true;
                (
                    ticket.neighbour,
                    ticket.sequence_number,
                    SegmentFlags::WHOLE,
                    ticket.buffer.clone(),
                )
            }
        };

        // A blocked peer will not take anything else until it ACKs.
        self.set_blocked(dest);

        let outcome = match self.link_for(dest.family()) {
            Ok(link) => link.send_bundle(dest, seqno, flags, &chunk).await,
            Err(_) => SendOutcome::Fatal,
        };
        self.data_send_status(id, outcome)
    }

    /// Post-send processing for a data ticket.
    fn data_send_status(&self, id: u64, outcome: SendOutcome) -> SendResult {
        enum Notify {
            None,
            Fail(TicketView),
            Error(TicketView),
        }

        let (result, notify) = {
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            let Some(ticket) = tickets.iter_mut().find(|t| t.id == id) else {
                return SendResult::Error;
            };
            ticket.flags.in_transit = false;

            match outcome {
                SendOutcome::Sent => {
                    // Sent; now waiting for the app-layer ACK.
                    ticket.flags.active = true;
                    ticket.flags.ack_pend = true;
                    // Retransmissions resend the encoded image.
                    ticket.bundle = None;
                    trace!(
                        "Segment out, waiting for app-layer ACK with SeqNo {}",
                        ticket.sequence_number
                    );
                    (SendResult::Sent, Notify::None)
                }
                SendOutcome::Fatal => {
                    let view = ticket.view();
                    tickets.retain(|t| t.id != id);
                    (SendResult::Error, Notify::Error(view))
                }
                SendOutcome::NoAck | SendOutcome::Busy => {
                    if let SendOutcome::NoAck = outcome {
                        ticket.tries += 1;
                    } else {
                        ticket.failed_tries += 1;
                    }

                    if ticket.tries >= self.config.retries
                        || ticket.failed_tries >= self.config.failed_retries
                    {
                        warn!(
                            "Giving up on ticket {id} after {} (or {}) tries",
                            ticket.tries, ticket.failed_tries
                        );
                        let view = ticket.view();
                        tickets.retain(|t| t.id != id);
                        (SendResult::Error, Notify::Fail(view))
                    } else {
                        ticket.flags.active = true;
                        let result = if matches!(outcome, SendOutcome::Busy) {
                            SendResult::Busy
                        } else {
                            SendResult::Error
                        };
                        (result, Notify::None)
                    }
                }
            }
        };

        match notify {
            Notify::None => {
                if !matches!(result, SendResult::Sent) {
                    self.set_unblocked(self.ticket_neighbour(id));
                }
            }
            Notify::Fail(view) => {
                self.set_unblocked(Some(view.neighbour));
                if let Some(router) = self.router.get() {
                    router.sent(view, routing::SentStatus::Fail);
                }
            }
            Notify::Error(view) => {
                self.set_unblocked(Some(view.neighbour));
                if let Some(router) = self.router.get() {
                    router.sent(view, routing::SentStatus::Error);
                }
            }
        }

        result
    }

    fn ticket_neighbour(&self, id: u64) -> Option<Address> {
        self.tickets
            .lock()
            .trace_expect("cl poisoned")
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.neighbour)
    }

    /// Handles a received ACK or NACK.
    async fn parse_ackframe(&self, source: Address, seqno: u8, kind: AckKind) {
        // Whatever this says, the peer has answered.
        self.set_unblocked(Some(source));
        self.tx_wakeup.notify_one();

        let Ok(link) = self.link_for(source.family()) else {
            return;
        };

        enum Resolution {
            Done(TicketView, routing::SentStatus, u64),
            Continue,
            Ignore,
        }

        let resolution = {
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            let Some(ticket) = tickets
                .iter_mut()
                .find(|t| t.neighbour == source && t.flags.ack_pend)
            else {
                return;
            };

            match kind {
                AckKind::Ack => {
                    if ticket.flags.multipart {
                        let expected = link.next_seqno(ticket.sequence_number);
                        if seqno == expected {
                            ticket.offset_acked = ticket.offset_sent;
                            if ticket.offset_acked >= ticket.buffer.len() {
                                trace!(
                                    "Last segment of bundle {:?} acked, done",
                                    ticket.bundle_number
                                );
                                Resolution::Done(
                                    ticket.view(),
                                    routing::SentStatus::Ok,
                                    ticket.id,
                                )
                            } else {
                                trace!(
                                    "Segment of bundle {:?} acked, more to come",
                                    ticket.bundle_number
                                );
                                Resolution::Continue
                            }
                        } else {
                            trace!("Duplicate ACK (seqno {seqno}, expected {expected})");
                            Resolution::Ignore
                        }
                    } else {
                        Resolution::Done(ticket.view(), routing::SentStatus::Ok, ticket.id)
                    }
                }
                AckKind::Nack => {
                    Resolution::Done(ticket.view(), routing::SentStatus::Nack, ticket.id)
                }
                AckKind::TempNack => {
                    Resolution::Done(ticket.view(), routing::SentStatus::TempNack, ticket.id)
                }
            }
        };

        match resolution {
            Resolution::Ignore | Resolution::Continue => {}
            Resolution::Done(view, status, id) => {
                if matches!(status, routing::SentStatus::Ok) {
                    self.report_forwarded(view.bundle_number);
                }
                self.free_ticket(id);
                if let Some(router) = self.router.get() {
                    router.sent(view, status);
                }
            }
        }
    }

    /// Emits a forwarding report if the bundle asked for one.
    fn report_forwarded(&self, bundle_number: u32) {
        let (Some(store), Some(reporter)) = (self.store.get(), self.reporter.get()) else {
            return;
        };
        let Ok(Some(handle)) = store.read(bundle_number) else {
            return;
        };
        let guard = handle.read();
        if guard.bundle.flags.report_forwarding {
            reporter.send(
                &guard.bundle,
                tundra_bpv6::status_report::StatusFlags::FORWARDED,
                tundra_bpv6::status_report::ReasonCode::NoAdditionalInformation,
            );
        }
    }

    /// Marks a ticket failed and tells routing.
    fn fail_ticket(&self, id: u64) {
        let view = {
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            let Some(index) = tickets.iter().position(|t| t.id == id) else {
                return;
            };
            let view = tickets[index].view();
            tickets.remove(index);
            view
        };
        if let Some(router) = self.router.get() {
            router.sent(view, routing::SentStatus::Fail);
        }
    }

    fn is_blocked(&self, peer: Address) -> bool {
        self.blocked
            .lock()
            .trace_expect("cl poisoned")
            .iter()
            .any(|(p, _)| *p == peer)
    }

    fn set_blocked(&self, peer: Address) {
        let mut blocked = self.blocked.lock().trace_expect("cl poisoned");
        if !blocked.iter().any(|(p, _)| *p == peer) {
            trace!("Block neighbour {peer}");
            blocked.push((peer, self.clock.ticks_ms()));
        }
    }

    fn set_unblocked(&self, peer: Option<Address>) {
        let Some(peer) = peer else {
            return;
        };
        let mut blocked = self.blocked.lock().trace_expect("cl poisoned");
        let before = blocked.len();
        blocked.retain(|(p, _)| *p != peer);
        if blocked.len() != before {
            trace!("Unblock neighbour {peer}");
        }
    }

    /// Periodic sweep: stale peer blocks and abandoned reassemblies.
    fn check_timeouts(&self) {
        let now = self.clock.ticks_ms();

        // Peers that never answered: unblock and let their pending
        // ticket retransmit.
        let stale_peers: Vec<Address> = {
            let blocked = self.blocked.lock().trace_expect("cl poisoned");
            blocked
                .iter()
                .filter(|(_, since)| {
                    now.saturating_sub(*since) >= self.config.peer_timeout.as_millis() as u64
                })
                .map(|(p, _)| *p)
                .collect()
        };
        for peer in stale_peers {
            warn!("Neighbour {peer} stale, removing lock");
            self.set_unblocked(Some(peer));
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            if let Some(ticket) = tickets
                .iter_mut()
                .find(|t| t.neighbour == peer && t.flags.ack_pend)
            {
                ticket.flags.active = true;
            }
        }

        // Reassemblies that stopped making progress.
        let abandoned: Vec<u64> = {
            let tickets = self.tickets.lock().trace_expect("cl poisoned");
            tickets
                .iter()
                .filter(|t| {
                    t.flags.multipart_recv
                        && now.saturating_sub(t.timestamp_ms)
                            > self.config.multipart_timeout.as_millis() as u64
                })
                .map(|t| t.id)
                .collect()
        };
        for id in abandoned {
            warn!("Multipart receiving ticket {id} timed out, removing");
            self.free_ticket(id);
        }

        if !self.tickets.lock().trace_expect("cl poisoned").is_empty() {
            self.tx_wakeup.notify_one();
        }
    }

    /// A neighbour disappeared: drain its tickets and state.
    ///
    /// Tickets awaiting an application-layer ACK are kept; the peer
    /// block sweeper deals with those.
    pub(crate) fn neighbour_down(&self, peer: Address) {
        let mut failed: Vec<TicketView> = Vec::new();
        {
            let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
            tickets.retain(|t| {
                if t.neighbour != peer || t.flags.ack_pend {
                    return true;
                }
                if !t.flags.multipart_recv && !t.flags.is_control() && t.bundle_number.is_some() {
                    failed.push(t.view());
                }
                false
            });
        }

        if let Some(router) = self.router.get() {
            for view in failed {
                router.sent(view, routing::SentStatus::Fail);
            }
        }

        self.set_unblocked(Some(peer));
    }

    /// Drops every ticket that references a deleted bundle.
    pub(crate) fn delete_bundle(&self, bundle_number: u32) {
        let mut tickets = self.tickets.lock().trace_expect("cl poisoned");
        let before = tickets.len();
        tickets.retain(|t| t.bundle_number != Some(bundle_number));
        if tickets.len() != before {
            debug!("Deleted tickets for bundle {bundle_number}");
        }
    }

    /// Number of allocated tickets (diagnostics).
    pub fn ticket_count(&self) -> usize {
        self.tickets.lock().trace_expect("cl poisoned").len()
    }
}
