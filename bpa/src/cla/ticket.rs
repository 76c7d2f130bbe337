use super::*;

/// State bits of a transmit ticket.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TicketFlags {
    /// Ready for (re)transmission.
    pub active: bool,
    /// A frame for this ticket is at the link driver right now.
    pub in_transit: bool,
    /// Sent and waiting for the peer's application-layer ACK.
    pub ack_pend: bool,
    /// An ACK we owe (or owed) the peer.
    pub ack: bool,
    /// A permanent NACK we owe the peer.
    pub nack: bool,
    /// A temporary NACK we owe the peer.
    pub temp_nack: bool,
    /// Outgoing bundle split across segments.
    pub multipart: bool,
    /// Incoming bundle being reassembled from segments.
    pub multipart_recv: bool,
}

impl TicketFlags {
    /// Whether this ticket is an ACK/NACK control transmission.
    pub fn is_control(&self) -> bool {
        self.ack || self.nack || self.temp_nack
    }

    pub fn control_kind(&self) -> Option<AckKind> {
        if self.ack {
            Some(AckKind::Ack)
        } else if self.nack {
            Some(AckKind::Nack)
        } else if self.temp_nack {
            Some(AckKind::TempNack)
        } else {
            None
        }
    }
}

/// Allocation priority. High-priority tickets (control frames and
/// multipart receive state) are queued at the front and may use the
/// reserved slack of the pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TicketPriority {
    Normal,
    High,
}

/// Bookkeeping for one outgoing transfer, one owed acknowledgement, or
/// one incoming multipart reassembly.
#[derive(Debug)]
pub(crate) struct Ticket {
    /// Stable identifier; list positions shift as tickets are freed.
    pub id: u64,
    pub flags: TicketFlags,
    pub neighbour: Address,
    /// Subject bundle, for bundle transfers.
    pub bundle_number: Option<u32>,
    /// Last sequence number sent (outgoing) or accepted (incoming).
    pub sequence_number: u8,
    pub tries: u8,
    pub failed_tries: u8,
    /// Tick of the last activity, driving retransmit pacing and
    /// reassembly timeouts. Zero forces immediate service.
    pub timestamp_ms: u64,

    /// Encoded bundle (outgoing) or accumulated segments (incoming).
    pub buffer: Vec<u8>,
    pub offset_sent: usize,
    pub offset_acked: usize,

    /// Kept until the first transmission succeeds, so retries can
    /// re-encode after the age block moves on.
    pub bundle: Option<slot::Handle>,
}

impl Ticket {
    pub fn new(id: u64, neighbour: Address, timestamp_ms: u64) -> Self {
        Self {
            id,
            flags: TicketFlags::default(),
            neighbour,
            bundle_number: None,
            sequence_number: 0,
            tries: 0,
            failed_tries: 0,
            timestamp_ms,
            buffer: Vec::new(),
            offset_sent: 0,
            offset_acked: 0,
            bundle: None,
        }
    }

    /// The view of this ticket shown to routing.
    pub fn view(&self) -> TicketView {
        TicketView {
            neighbour: self.neighbour,
            bundle_number: self.bundle_number.unwrap_or(0),
        }
    }
}

/// What routing learns about a ticket when the CL reports an outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TicketView {
    pub neighbour: Address,
    pub bundle_number: u32,
}
