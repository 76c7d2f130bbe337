/*!
`ipn:` scheme endpoint identifiers.

CBHE encodes endpoints as a numeric `(node, service)` pair. In textual
form the full EID is `ipn:<node>.<service>`; the host-only form
`ipn:<node>` appears in discovery beacons. The wire form used by IPND is
an SDNV of the text length followed by the text itself.
*/

use crate::sdnv;
use thiserror::Error;

/// Errors from EID parsing and encoding.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EidError {
    /// The EID does not start with the `ipn:` scheme.
    #[error("Unsupported EID scheme in {0:?}")]
    UnsupportedScheme(String),

    /// The scheme-specific part is not a number or a `.`-separated pair.
    #[error("Invalid ipn scheme-specific part {0:?}")]
    InvalidSsp(String),

    /// The EID text is not valid UTF-8 or is truncated on the wire.
    #[error("Malformed EID wire encoding")]
    Malformed,

    /// An error from the SDNV length prefix.
    #[error(transparent)]
    Sdnv(#[from] sdnv::SdnvError),
}

/// A CBHE endpoint identifier.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Eid {
    pub node: u32,
    pub service: u32,
}

impl Eid {
    /// The null endpoint, `ipn:0.0`. Node 0 is reserved.
    pub const NULL: Eid = Eid {
        node: 0,
        service: 0,
    };

    pub const fn new(node: u32, service: u32) -> Self {
        Self { node, service }
    }

    pub fn is_null(&self) -> bool {
        self.node == 0
    }

    /// Renders the host-only form `ipn:<node>`.
    pub fn host_string(&self) -> String {
        format!("ipn:{}", self.node)
    }

    /// Parses either `ipn:<node>` or `ipn:<node>.<service>`.
    pub fn parse(text: &str) -> Result<Self, EidError> {
        let Some(ssp) = text.strip_prefix("ipn:") else {
            return Err(EidError::UnsupportedScheme(text.to_string()));
        };

        match ssp.split_once('.') {
            None => Ok(Self {
                node: ssp
                    .parse()
                    .map_err(|_| EidError::InvalidSsp(ssp.to_string()))?,
                service: 0,
            }),
            Some((node, service)) => Ok(Self {
                node: node
                    .parse()
                    .map_err(|_| EidError::InvalidSsp(ssp.to_string()))?,
                service: service
                    .parse()
                    .map_err(|_| EidError::InvalidSsp(ssp.to_string()))?,
            }),
        }
    }

    /// Appends the length-prefixed host-only form to `out`.
    pub fn write_host(&self, out: &mut Vec<u8>) {
        write_prefixed(&self.host_string(), out)
    }

    /// Appends the length-prefixed full form to `out`.
    pub fn write_full(&self, out: &mut Vec<u8>) {
        write_prefixed(&self.to_string(), out)
    }

    /// Parses a length-prefixed EID, returning it and the octets consumed.
    pub fn parse_prefixed(buf: &[u8]) -> Result<(Self, usize), EidError> {
        let (text_len, sdnv_len) = sdnv::decode_u32(buf)?;
        let text_len = text_len as usize;
        let end = sdnv_len
            .checked_add(text_len)
            .ok_or(EidError::Malformed)?;
        if buf.len() < end {
            return Err(EidError::Malformed);
        }
        let text = core::str::from_utf8(&buf[sdnv_len..end]).map_err(|_| EidError::Malformed)?;
        Ok((Self::parse(text)?, end))
    }
}

fn write_prefixed(text: &str, out: &mut Vec<u8>) {
    let mut len_buf = [0u8; sdnv::MAX_LEN_U32];
    let len = sdnv::encode_u32(text.len() as u32, &mut len_buf)
        .expect("length SDNV always fits");
    out.extend_from_slice(&len_buf[..len]);
    out.extend_from_slice(text.as_bytes());
}

impl core::fmt::Display for Eid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

impl core::str::FromStr for Eid {
    type Err = EidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_forms() {
        assert_eq!(Eid::parse("ipn:7.42"), Ok(Eid::new(7, 42)));
        assert_eq!(Eid::parse("ipn:7"), Ok(Eid::new(7, 0)));
        assert_eq!(Eid::parse("ipn:0.0"), Ok(Eid::NULL));
        assert!(matches!(
            Eid::parse("dtn://node/app"),
            Err(EidError::UnsupportedScheme(_))
        ));
        assert!(matches!(Eid::parse("ipn:x.1"), Err(EidError::InvalidSsp(_))));
        assert!(matches!(Eid::parse("ipn:1.x"), Err(EidError::InvalidSsp(_))));
    }

    #[test]
    fn display_forms() {
        assert_eq!(Eid::new(3, 11).to_string(), "ipn:3.11");
        assert_eq!(Eid::new(3, 11).host_string(), "ipn:3");
    }

    #[test]
    fn prefixed_round_trip() {
        let eid = Eid::new(1000, 25);

        let mut wire = Vec::new();
        eid.write_full(&mut wire);
        let (parsed, used) = Eid::parse_prefixed(&wire).unwrap();
        assert_eq!(parsed, eid);
        assert_eq!(used, wire.len());

        let mut wire = Vec::new();
        eid.write_host(&mut wire);
        let (parsed, used) = Eid::parse_prefixed(&wire).unwrap();
        assert_eq!(parsed, Eid::new(1000, 0));
        assert_eq!(used, wire.len());
    }

    #[test]
    fn prefixed_rejects_truncation() {
        let mut wire = Vec::new();
        Eid::new(9, 9).write_full(&mut wire);
        wire.pop();
        assert_eq!(Eid::parse_prefixed(&wire), Err(EidError::Malformed));
    }
}
