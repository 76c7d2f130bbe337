/*!
IP-ND beacon codec.

The compatible subset of the IPND draft:
`[version=0x02][flags][seq_hi][seq_lo]`, optionally followed by a
length-prefixed source EID, a service block (an SDNV count of
`{tag_len, tag, data_len, data}` entries) and a bloom filter. Unknown
services are allowed; their payloads go to registered hooks. The bloom
filter is parsed over and ignored.
*/

use thiserror::Error;
use tundra_bpv6::{eid::Eid, sdnv};

pub const IPND_VERSION: u8 = 0x02;

const FLAG_SOURCE_EID: u8 = 1 << 0;
const FLAG_SERVICE_BLOCK: u8 = 1 << 1;
const FLAG_BLOOMFILTER: u8 = 1 << 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BeaconError {
    #[error("Beacon shorter than its fixed header")]
    Truncated,

    #[error("IPND version mismatch ({0:#04x})")]
    VersionMismatch(u8),

    #[error(transparent)]
    Sdnv(#[from] sdnv::SdnvError),

    #[error(transparent)]
    Eid(#[from] tundra_bpv6::eid::EidError),
}

/// One service announcement inside a beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub tag: Vec<u8>,
    pub data: Vec<u8>,
}

/// A decoded (or to-be-encoded) discovery beacon.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub sequence: u16,
    pub eid: Option<Eid>,
    pub services: Vec<ServiceEntry>,
}

impl Beacon {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);

        out.push(IPND_VERSION);

        let mut flags = 0;
        if self.eid.is_some() {
            flags |= FLAG_SOURCE_EID;
        }
        if !self.services.is_empty() {
            flags |= FLAG_SERVICE_BLOCK;
        }
        out.push(flags);

        out.push((self.sequence >> 8) as u8);
        out.push((self.sequence & 0xFF) as u8);

        if let Some(eid) = &self.eid {
            eid.write_host(&mut out);
        }

        if !self.services.is_empty() {
            push_sdnv(&mut out, self.services.len() as u32);
            for service in &self.services {
                push_sdnv(&mut out, service.tag.len() as u32);
                out.extend_from_slice(&service.tag);
                push_sdnv(&mut out, service.data.len() as u32);
                out.extend_from_slice(&service.data);
            }
        }

        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, BeaconError> {
        if payload.len() < 4 {
            return Err(BeaconError::Truncated);
        }
        if payload[0] != IPND_VERSION {
            return Err(BeaconError::VersionMismatch(payload[0]));
        }
        let flags = payload[1];
        let sequence = ((payload[2] as u16) << 8) | payload[3] as u16;

        let mut beacon = Beacon {
            sequence,
            ..Default::default()
        };
        let mut offset = 4;

        if flags & FLAG_SOURCE_EID != 0 {
            let (eid, used) = Eid::parse_prefixed(&payload[offset..])?;
            beacon.eid = Some(eid);
            offset += used;
        }

        if flags & FLAG_SERVICE_BLOCK != 0 {
            let mut reader = sdnv::Reader::new(&payload[offset..]);
            let count = reader.read_u32()?;
            for _ in 0..count {
                let tag_len = reader.read_u32()?;
                let tag = reader.read_bytes(tag_len as usize)?.to_vec();
                let data_len = reader.read_u32()?;
                let data = reader.read_bytes(data_len as usize)?.to_vec();
                beacon.services.push(ServiceEntry { tag, data });
            }
            offset += reader.position();
        }

        if flags & FLAG_BLOOMFILTER != 0 {
            // Present but unused; everything that remains is the filter.
            let _ = &payload[offset.min(payload.len())..];
        }

        Ok(beacon)
    }
}

fn push_sdnv(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; sdnv::MAX_LEN_U32];
    let len = sdnv::encode_u32(value, &mut buf).expect("buffer sized to maximum");
    out.extend_from_slice(&buf[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain() {
        let beacon = Beacon {
            sequence: 0x1234,
            eid: Some(Eid::new(42, 0)),
            services: Vec::new(),
        };
        let wire = beacon.encode();
        assert_eq!(&wire[..4], &[0x02, 0x01, 0x12, 0x34]);
        assert_eq!(Beacon::parse(&wire).unwrap(), beacon);
    }

    #[test]
    fn round_trip_with_services() {
        let beacon = Beacon {
            sequence: 7,
            eid: Some(Eid::new(3, 0)),
            services: vec![
                ServiceEntry {
                    tag: b"lowpancl".to_vec(),
                    data: vec![1, 2, 3],
                },
                ServiceEntry {
                    tag: b"clock".to_vec(),
                    data: Vec::new(),
                },
            ],
        };
        assert_eq!(Beacon::parse(&beacon.encode()).unwrap(), beacon);
    }

    #[test]
    fn anonymous_beacon() {
        let beacon = Beacon {
            sequence: 1,
            eid: None,
            services: Vec::new(),
        };
        let parsed = Beacon::parse(&beacon.encode()).unwrap();
        assert_eq!(parsed.eid, None);
    }

    #[test]
    fn rejects_wrong_version() {
        assert_eq!(
            Beacon::parse(&[0x01, 0, 0, 0]),
            Err(BeaconError::VersionMismatch(0x01))
        );
        assert_eq!(Beacon::parse(&[0x02, 0]), Err(BeaconError::Truncated));
    }
}
