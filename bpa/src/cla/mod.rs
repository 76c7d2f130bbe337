/*!
Convergence layer.

The datagram CL core ([`dgram`]) owns segmentation, sequence numbers,
the application-level ACK/NACK handshake, retransmission and per-peer
blocking. Concrete links plug in underneath through the [`Link`] trait:
an adapter turns its wire header into a [`FrameKind`] on receive and
builds the header back on send, nothing more.
*/

use super::*;
use thiserror::Error;

pub mod dgram;

mod ticket;

pub use ticket::TicketView;

/// A specialized `Result` type for CL operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur during CL operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The transmit ticket pool is at (or reserved beyond) capacity.
    #[error("Transmit ticket queue is full")]
    QueueFull,

    /// No link adapter is registered for the address family.
    #[error("No link adapter for {0:?}")]
    NoLink(AddressFamily),

    /// An attempt to register a second adapter for one address family.
    #[error("Link adapter for {0:?} already registered")]
    AlreadyRegistered(AddressFamily),
}

/// The link family an address belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Lowpan,
    Udp,
}

/// A peer address on some link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// 16-bit 802.15.4 short address.
    Lowpan(u16),
    /// IPv4 address and port.
    Udp(core::net::SocketAddrV4),
}

impl Address {
    pub fn family(&self) -> AddressFamily {
        match self {
            Address::Lowpan(_) => AddressFamily::Lowpan,
            Address::Udp(_) => AddressFamily::Udp,
        }
    }

    /// The node id this address implies, where the link address space
    /// maps directly onto node ids.
    pub fn implied_node(&self) -> Option<u32> {
        match self {
            Address::Lowpan(addr) => Some(*addr as u32),
            Address::Udp(_) => None,
        }
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Address::Lowpan(addr) => {
                write!(f, "lowpan:{}.{}", addr & 0xFF, (addr >> 8) & 0xFF)
            }
            Address::Udp(addr) => write!(f, "udp:{addr}"),
        }
    }
}

/// Data-segment flags. A segment that is both first and last carries a
/// whole bundle.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SegmentFlags {
    pub first: bool,
    pub last: bool,
}

impl SegmentFlags {
    pub const WHOLE: SegmentFlags = SegmentFlags {
        first: true,
        last: true,
    };
}

/// An incoming frame, as decoded by a link adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Data { seqno: u8, flags: SegmentFlags },
    Ack { seqno: u8 },
    Nack { seqno: u8, temporary: bool },
    Discovery,
}

/// The kind of acknowledgement to transmit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack,
    TempNack,
}

/// The result of handing a frame to the link driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent (and link-layer acknowledged where the MAC does that).
    Sent,
    /// Sent but never acknowledged by the peer's MAC.
    NoAck,
    /// Not sent; the radio or driver was busy. Retry shortly.
    Busy,
    /// The driver failed permanently.
    Fatal,
}

/// One registered link below the datagram CL core.
///
/// Implementations encode the CL header of their medium and move raw
/// frames; received frames come back into the core through
/// [`dgram::Dgram::incoming_frame`].
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    fn name(&self) -> &str;

    fn family(&self) -> AddressFamily;

    /// Largest CL payload one frame can carry.
    fn max_payload_length(&self) -> usize;

    /// The sequence number following `last` in this link's seqno space.
    fn next_seqno(&self, last: u8) -> u8;

    /// Broadcasts a discovery payload.
    async fn send_discovery(&self, payload: &[u8]) -> SendOutcome;

    /// Sends one data segment.
    async fn send_bundle(
        &self,
        dest: Address,
        seqno: u8,
        flags: SegmentFlags,
        payload: &[u8],
    ) -> SendOutcome;

    /// Sends an ACK or NACK for `seqno`.
    async fn send_ack(&self, dest: Address, seqno: u8, kind: AckKind) -> SendOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        assert_eq!(Address::Lowpan(0x0201).to_string(), "lowpan:1.2");
        assert_eq!(
            Address::Udp("10.0.0.1:4565".parse().unwrap()).to_string(),
            "udp:10.0.0.1:4565"
        );
    }

    #[test]
    fn implied_node() {
        assert_eq!(Address::Lowpan(7).implied_node(), Some(7));
        assert_eq!(
            Address::Udp("10.0.0.1:4565".parse().unwrap()).implied_node(),
            None
        );
    }
}
