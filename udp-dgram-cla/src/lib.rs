/*!
UDP/Ethernet link adapter.

Two header octets ride in front of every CL payload:

```text
octet 0  frame type   (unknown 0, broadcast 1, segment 2, ack 4, nack 8)
octet 1  (flags << 4) | (seqno & 0x0F)
         flags: segment-first 2, segment-last 1, middle 0,
                nack-temporary 4
```

Data goes unicast on the data port (default 4565); discovery beacons go
to a multicast group (default 224.0.0.142 on port 4551). Peer addresses
are normalised onto the data port, whichever socket a frame arrived on.
*/

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use tundra_bpa::cla::{
    Address, AddressFamily, AckKind, FrameKind, Link, SegmentFlags, SendOutcome,
};

const TYPE_BROADCAST: u8 = 1;
const TYPE_SEGMENT: u8 = 2;
const TYPE_ACK: u8 = 4;
const TYPE_NACK: u8 = 8;

const FLAG_SEGMENT_FIRST: u8 = 0x02;
const FLAG_SEGMENT_LAST: u8 = 0x01;
const FLAG_NACK_TEMPORARY: u8 = 0x04;

/// Sequence number space of this link.
const SEQNO_SPACE: u8 = 16;

/// Ethernet payload less IPv4 and UDP headers.
const UDP_PAYLOAD_LENGTH: usize = 1500 - 20 - 8;

/// Adapter configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Local interface address to bind.
    pub bind_addr: Ipv4Addr,
    /// Unicast bundle traffic port.
    pub data_port: u16,
    /// Discovery beacon port.
    pub discovery_port: u16,
    /// Discovery multicast group.
    pub multicast_group: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            data_port: 4565,
            discovery_port: 4551,
            multicast_group: Ipv4Addr::new(224, 0, 0, 142),
        }
    }
}

/// The UDP link adapter.
pub struct UdpLink {
    config: Config,
    data_socket: UdpSocket,
    discovery_socket: UdpSocket,
}

impl UdpLink {
    /// Binds both sockets and joins the discovery multicast group.
    pub async fn bind(config: Config) -> std::io::Result<Arc<Self>> {
        let data_socket =
            UdpSocket::bind(SocketAddrV4::new(config.bind_addr, config.data_port)).await?;
        let discovery_socket = UdpSocket::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            config.discovery_port,
        ))
        .await?;
        discovery_socket.join_multicast_v4(config.multicast_group, config.bind_addr)?;

        Ok(Arc::new(Self {
            config,
            data_socket,
            discovery_socket,
        }))
    }

    /// Starts the receive pumps feeding the CL core.
    pub fn start(self: &Arc<Self>, dgram: Arc<tundra_bpa::cla::dgram::Dgram>) {
        for data in [true, false] {
            let link = self.clone();
            let dgram = dgram.clone();
            tokio::spawn(async move {
                let mut buffer = vec![0u8; UDP_PAYLOAD_LENGTH];
                loop {
                    let socket = if data {
                        &link.data_socket
                    } else {
                        &link.discovery_socket
                    };
                    match socket.recv_from(&mut buffer).await {
                        Ok((len, source)) => {
                            link.frame_received(&dgram, source, &buffer[..len]).await;
                        }
                        Err(e) => {
                            warn!("UDP receive error: {e}");
                        }
                    }
                }
            });
        }
    }

    async fn frame_received(
        &self,
        dgram: &tundra_bpa::cla::dgram::Dgram,
        source: SocketAddr,
        frame: &[u8],
    ) {
        let SocketAddr::V4(source) = source else {
            return;
        };
        if frame.len() < 2 {
            return;
        }

        // Peers are identified by their data endpoint, no matter which
        // socket the frame came in on.
        let peer = Address::Udp(SocketAddrV4::new(*source.ip(), self.config.data_port));
        let frame_type = frame[0];
        let flags = (frame[1] & 0xF0) >> 4;
        let seqno = frame[1] & 0x0F;
        trace!(
            "Incoming frame from {peer} (header {:#04x} {:#04x})",
            frame[0],
            frame[1]
        );

        let kind = match frame_type {
            TYPE_SEGMENT => FrameKind::Data {
                seqno,
                flags: SegmentFlags {
                    first: flags & FLAG_SEGMENT_FIRST != 0,
                    last: flags & FLAG_SEGMENT_LAST != 0,
                },
            },
            TYPE_BROADCAST => FrameKind::Discovery,
            TYPE_ACK => FrameKind::Ack { seqno },
            TYPE_NACK => FrameKind::Nack {
                seqno,
                temporary: flags & FLAG_NACK_TEMPORARY != 0,
            },
            _ => {
                debug!("Unknown frame type {frame_type} from {peer}");
                return;
            }
        };

        dgram.incoming_frame(peer, kind, &frame[2..], None).await;
    }

    async fn transmit(
        &self,
        dest: SocketAddrV4,
        frame_type: u8,
        flags: u8,
        seqno: u8,
        payload: &[u8],
    ) -> SendOutcome {
        // The datagram owns its bytes; nothing here borrows the
        // caller's buffer past this call.
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.push(frame_type);
        frame.push(((flags << 4) & 0xF0) | (seqno & 0x0F));
        frame.extend_from_slice(payload);

        match self.data_socket.send_to(&frame, dest).await {
            Ok(_) => SendOutcome::Sent,
            Err(e) => {
                debug!("UDP send to {dest} failed: {e}");
                SendOutcome::Busy
            }
        }
    }
}

#[async_trait::async_trait]
impl Link for UdpLink {
    fn name(&self) -> &str {
        "dgram:udp"
    }

    fn family(&self) -> AddressFamily {
        AddressFamily::Udp
    }

    fn max_payload_length(&self) -> usize {
        UDP_PAYLOAD_LENGTH - 2
    }

    fn next_seqno(&self, last: u8) -> u8 {
        (last + 1) % SEQNO_SPACE
    }

    async fn send_discovery(&self, payload: &[u8]) -> SendOutcome {
        let dest = SocketAddrV4::new(self.config.multicast_group, self.config.discovery_port);
        trace!("Sending discovery to {dest}");
        self.transmit(dest, TYPE_BROADCAST, 0, 0, payload).await
    }

    async fn send_bundle(
        &self,
        dest: Address,
        seqno: u8,
        flags: SegmentFlags,
        payload: &[u8],
    ) -> SendOutcome {
        let Address::Udp(dest) = dest else {
            return SendOutcome::Fatal;
        };
        let mut header_flags = 0;
        if flags.first {
            header_flags |= FLAG_SEGMENT_FIRST;
        }
        if flags.last {
            header_flags |= FLAG_SEGMENT_LAST;
        }
        self.transmit(dest, TYPE_SEGMENT, header_flags, seqno, payload)
            .await
    }

    async fn send_ack(&self, dest: Address, seqno: u8, kind: AckKind) -> SendOutcome {
        let Address::Udp(dest) = dest else {
            return SendOutcome::Fatal;
        };
        let (frame_type, flags) = match kind {
            AckKind::Ack => (TYPE_ACK, 0),
            AckKind::Nack => (TYPE_NACK, 0),
            AckKind::TempNack => (TYPE_NACK, FLAG_NACK_TEMPORARY),
        };
        self.transmit(dest, frame_type, flags, seqno, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        // flags << 4 | seq, 4-bit each.
        let octet = ((FLAG_SEGMENT_FIRST << 4) & 0xF0) | (9 & 0x0F);
        assert_eq!(octet, 0x29);

        let octet = ((FLAG_NACK_TEMPORARY << 4) & 0xF0) | (15 & 0x0F);
        assert_eq!(octet, 0x4F);
    }

    #[test]
    fn seqno_wraps_at_sixteen() {
        assert_eq!((15 + 1) % SEQNO_SPACE, 0);
    }

    #[tokio::test]
    async fn sockets_bind_on_ephemeral_ports() {
        let config = Config {
            data_port: 0,
            discovery_port: 0,
            ..Default::default()
        };
        let link = UdpLink::bind(config).await.unwrap();
        assert_eq!(link.max_payload_length(), 1470);
    }
}
