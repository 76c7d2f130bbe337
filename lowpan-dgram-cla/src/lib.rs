/*!
IEEE 802.15.4 short-frame link adapter.

One header octet rides in front of every CL payload:

```text
bits 7..6  compat  (must be 00)
bits 5..4  type    (data 01, discovery 10, ack 11, nack 00)
bits 3..2  seqno   (0..3)
bits 1..0  flags   (first 0x02, last 0x01; first on a NACK = temporary)
```

A 127-octet MAC frame loses 11 octets to MAC overhead with PAN
compression and one to this header, leaving 115 octets of payload per
segment. The radio itself is injected through [`RadioDriver`]; the
platform feeds received frames into [`LowpanLink::frame_received`].
*/

use std::sync::Arc;
use tracing::{debug, trace};
use tundra_bpa::cla::{
    Address, AddressFamily, AckKind, FrameKind, Link, SegmentFlags, SendOutcome,
};

const MASK_COMPAT: u8 = 0xC0;
const MASK_TYPE: u8 = 0x30;
const MASK_SEQNO: u8 = 0x0C;
const MASK_FLAGS: u8 = 0x03;

const TYPE_DATA: u8 = 0x10;
const TYPE_DISCOVERY: u8 = 0x20;
const TYPE_ACK: u8 = 0x30;
const TYPE_NACK: u8 = 0x00;

const FLAG_FIRST: u8 = 0x02;
const FLAG_LAST: u8 = 0x01;

/// Usable MAC payload: 127 octets minus 11 octets of MAC framing with
/// PAN compression.
pub const MAC_PAYLOAD_LENGTH: usize = 116;

/// The 802.15.4 broadcast short address.
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// Sequence number space of this link.
const SEQNO_SPACE: u8 = 4;

/// The radio beneath the adapter.
///
/// `send` hands one complete MAC payload to the driver and reports
/// whether the frame went out (and was link-layer acknowledged, for
/// unicast). The driver must copy the frame before returning from its
/// receive path and must never call back into the adapter from an
/// interrupt context.
#[async_trait::async_trait]
pub trait RadioDriver: Send + Sync {
    async fn send(&self, dest: u16, frame: &[u8]) -> SendOutcome;
}

/// The 802.15.4 link adapter.
pub struct LowpanLink {
    driver: Arc<dyn RadioDriver>,
    dgram: Arc<tundra_bpa::cla::dgram::Dgram>,
}

impl LowpanLink {
    pub fn new(
        driver: Arc<dyn RadioDriver>,
        dgram: Arc<tundra_bpa::cla::dgram::Dgram>,
    ) -> Arc<Self> {
        Arc::new(Self { driver, dgram })
    }

    /// RX entry point: the platform calls this for every received MAC
    /// payload.
    pub async fn frame_received(&self, source: u16, frame: &[u8], rssi: Option<i16>) {
        let Some((header, payload)) = frame.split_first() else {
            return;
        };
        let source = Address::Lowpan(source);
        trace!("Incoming frame from {source} (header {header:#04x})");

        if header & MASK_COMPAT != 0 {
            debug!("Ignoring incoming frame from {source}");
            return;
        }

        let seqno = (header & MASK_SEQNO) >> 2;
        let flags = header & MASK_FLAGS;
        let kind = match header & MASK_TYPE {
            TYPE_DATA => FrameKind::Data {
                seqno,
                flags: SegmentFlags {
                    first: flags & FLAG_FIRST != 0,
                    last: flags & FLAG_LAST != 0,
                },
            },
            TYPE_DISCOVERY => FrameKind::Discovery,
            TYPE_ACK => FrameKind::Ack { seqno },
            TYPE_NACK => FrameKind::Nack {
                seqno,
                temporary: flags & FLAG_FIRST != 0,
            },
            _ => unreachable!("two-bit field"),
        };

        self.dgram.incoming_frame(source, kind, payload, rssi).await;
    }

    async fn transmit(&self, dest: Address, header: u8, payload: &[u8]) -> SendOutcome {
        let Address::Lowpan(dest) = dest else {
            return SendOutcome::Fatal;
        };
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(header);
        frame.extend_from_slice(payload);
        self.driver.send(dest, &frame).await
    }
}

#[async_trait::async_trait]
impl Link for LowpanLink {
    fn name(&self) -> &str {
        "dgram:lowpan"
    }

    fn family(&self) -> AddressFamily {
        AddressFamily::Lowpan
    }

    fn max_payload_length(&self) -> usize {
        MAC_PAYLOAD_LENGTH - 1
    }

    fn next_seqno(&self, last: u8) -> u8 {
        (last + 1) % SEQNO_SPACE
    }

    async fn send_discovery(&self, payload: &[u8]) -> SendOutcome {
        trace!("Sending broadcast discovery");
        self.transmit(Address::Lowpan(BROADCAST_ADDRESS), TYPE_DISCOVERY, payload)
            .await
    }

    async fn send_bundle(
        &self,
        dest: Address,
        seqno: u8,
        flags: SegmentFlags,
        payload: &[u8],
    ) -> SendOutcome {
        if payload.len() > self.max_payload_length() {
            return SendOutcome::Fatal;
        }
        let mut header = TYPE_DATA | ((seqno << 2) & MASK_SEQNO);
        if flags.first {
            header |= FLAG_FIRST;
        }
        if flags.last {
            header |= FLAG_LAST;
        }
        self.transmit(dest, header, payload).await
    }

    async fn send_ack(&self, dest: Address, seqno: u8, kind: AckKind) -> SendOutcome {
        let mut header = match kind {
            AckKind::Ack => TYPE_ACK,
            AckKind::Nack => TYPE_NACK,
            // The first-segment flag on a NACK marks it temporary.
            AckKind::TempNack => TYPE_NACK | FLAG_FIRST,
        };
        header |= (seqno << 2) & MASK_SEQNO;
        self.transmit(dest, header, &[]).await
    }
}
