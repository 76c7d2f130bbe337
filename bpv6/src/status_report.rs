/*!
Bundle status reports (RFC 5050 §6.1.1).

A status report is an administrative record carried as the payload of a
bundle with the admin-record flag set. Node and service of the subject
bundle's source are carried numerically, as CBHE has no dictionary to
reference.
*/

use crate::{
    ageing::DtnTime,
    bundle::Bundle,
    eid::Eid,
    sdnv, Error,
};

/// Administrative record type for a bundle status report.
pub const RECORD_TYPE_STATUS_REPORT: u8 = 0x10;

/// Administrative record type for a custody signal.
pub const RECORD_TYPE_CUSTODY_SIGNAL: u8 = 0x20;

/// Record flag marking the subject bundle as a fragment.
pub const RECORD_FLAG_FRAGMENT: u8 = 0x01;

/// Status assertion flags.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusFlags {
    pub received: bool,
    pub custody_accepted: bool,
    pub forwarded: bool,
    pub delivered: bool,
    pub deleted: bool,
}

impl From<u8> for StatusFlags {
    fn from(value: u8) -> Self {
        Self {
            received: value & 0x01 != 0,
            custody_accepted: value & 0x02 != 0,
            forwarded: value & 0x04 != 0,
            delivered: value & 0x08 != 0,
            deleted: value & 0x10 != 0,
        }
    }
}

impl From<StatusFlags> for u8 {
    fn from(value: StatusFlags) -> Self {
        let mut flags = 0;
        if value.received {
            flags |= 0x01;
        }
        if value.custody_accepted {
            flags |= 0x02;
        }
        if value.forwarded {
            flags |= 0x04;
        }
        if value.delivered {
            flags |= 0x08;
        }
        if value.deleted {
            flags |= 0x10;
        }
        flags
    }
}

impl StatusFlags {
    pub const RECEIVED: StatusFlags = StatusFlags {
        received: true,
        custody_accepted: false,
        forwarded: false,
        delivered: false,
        deleted: false,
    };
    pub const FORWARDED: StatusFlags = StatusFlags {
        received: false,
        custody_accepted: false,
        forwarded: true,
        delivered: false,
        deleted: false,
    };
    pub const DELIVERED: StatusFlags = StatusFlags {
        received: false,
        custody_accepted: false,
        forwarded: false,
        delivered: true,
        deleted: false,
    };
    pub const DELETED: StatusFlags = StatusFlags {
        received: false,
        custody_accepted: false,
        forwarded: false,
        delivered: false,
        deleted: true,
    };
}

/// Status report reason codes (RFC 5050 §6.1.1).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReasonCode {
    #[default]
    NoAdditionalInformation = 0x00,
    LifetimeExpired = 0x01,
    ForwardedOverUnidirectionalLink = 0x02,
    TransmissionCancelled = 0x03,
    DepletedStorage = 0x04,
    DestinationUnintelligible = 0x05,
    NoKnownRoute = 0x06,
    NoTimelyContact = 0x07,
    BlockUnintelligible = 0x08,
}

impl From<u8> for ReasonCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ReasonCode::LifetimeExpired,
            0x02 => ReasonCode::ForwardedOverUnidirectionalLink,
            0x03 => ReasonCode::TransmissionCancelled,
            0x04 => ReasonCode::DepletedStorage,
            0x05 => ReasonCode::DestinationUnintelligible,
            0x06 => ReasonCode::NoKnownRoute,
            0x07 => ReasonCode::NoTimelyContact,
            0x08 => ReasonCode::BlockUnintelligible,
            _ => ReasonCode::NoAdditionalInformation,
        }
    }
}

/// A decoded bundle status report.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusReport {
    pub status: StatusFlags,
    pub reason: ReasonCode,

    /// Fragment offset and payload length of the subject bundle, when
    /// the subject was a fragment.
    pub fragment: Option<(u32, u32)>,

    /// Time of the signalled event, seconds and nanoseconds in DTN time.
    pub dtn_time_secs: u32,
    pub dtn_time_nanos: u32,

    /// Creation timestamp of the subject bundle.
    pub creation_timestamp: u32,
    pub creation_sequence: u32,

    /// Source endpoint of the subject bundle.
    pub source: Eid,
}

impl StatusReport {
    /// Builds a report describing `bundle`.
    pub fn for_bundle(
        bundle: &Bundle,
        status: StatusFlags,
        reason: ReasonCode,
        now: Option<DtnTime>,
    ) -> Self {
        let now = now.unwrap_or_default();
        Self {
            status,
            reason,
            fragment: bundle.flags.is_fragment.then(|| {
                (
                    bundle.fragment_offset,
                    bundle.payload_block().map(|b| b.data.len() as u32).unwrap_or(0),
                )
            }),
            dtn_time_secs: now.secs,
            dtn_time_nanos: now.micros * 1000,
            creation_timestamp: bundle.creation_timestamp,
            creation_sequence: bundle.creation_sequence,
            source: bundle.source,
        }
    }

    /// The identity of the subject bundle, as reconstructible from the
    /// report fields.
    pub fn subject_id(&self) -> crate::bundle::Id {
        let (fragment_offset, fragment_payload_length) = self.fragment.unwrap_or((0, 0));
        crate::bundle::Id {
            source: self.source,
            creation_timestamp: self.creation_timestamp,
            creation_sequence: self.creation_sequence,
            fragment_offset,
            fragment_payload_length,
        }
    }

    /// Encodes the administrative record payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);

        let mut record_type = RECORD_TYPE_STATUS_REPORT;
        if self.fragment.is_some() {
            record_type |= RECORD_FLAG_FRAGMENT;
        }
        out.push(record_type);
        out.push(u8::from(self.status));
        out.push(self.reason as u8);

        let mut buf = [0u8; sdnv::MAX_LEN_U32];
        let mut push = |out: &mut Vec<u8>, value: u32| {
            let len = sdnv::encode_u32(value, &mut buf).expect("buffer sized to maximum");
            out.extend_from_slice(&buf[..len]);
        };

        if let Some((offset, length)) = self.fragment {
            push(&mut out, offset);
            push(&mut out, length);
        }

        push(&mut out, self.dtn_time_secs);
        push(&mut out, self.dtn_time_nanos);
        push(&mut out, self.creation_timestamp);
        push(&mut out, self.creation_sequence);
        push(&mut out, self.source.node);
        push(&mut out, self.source.service);

        out
    }

    /// Decodes an administrative record payload.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        let mut reader = sdnv::Reader::new(data);

        let record_type = reader
            .read_u8()
            .map_err(|_| Error::AdminRecord("empty record"))?;
        if record_type & 0xF0 != RECORD_TYPE_STATUS_REPORT {
            return Err(Error::AdminRecord("not a status report"));
        }

        let mut report = Self {
            status: StatusFlags::from(reader.read_u8().map_err(Error::Sdnv)?),
            reason: ReasonCode::from(reader.read_u8().map_err(Error::Sdnv)?),
            ..Default::default()
        };

        if record_type & RECORD_FLAG_FRAGMENT != 0 {
            report.fragment = Some((reader.read_u32()?, reader.read_u32()?));
        }

        report.dtn_time_secs = reader.read_u32()?;
        report.dtn_time_nanos = reader.read_u32()?;
        report.creation_timestamp = reader.read_u32()?;
        report.creation_sequence = reader.read_u32()?;
        report.source = Eid::new(reader.read_u32()?, reader.read_u32()?);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_report() -> StatusReport {
        StatusReport {
            status: StatusFlags::DELIVERED,
            reason: ReasonCode::NoAdditionalInformation,
            fragment: None,
            dtn_time_secs: 1000,
            dtn_time_nanos: 250_000_000,
            creation_timestamp: 999,
            creation_sequence: 3,
            source: Eid::new(12, 34),
        }
    }

    #[test]
    fn round_trip() {
        let report = test_report();
        assert_eq!(StatusReport::decode(&report.encode()).unwrap(), report);
    }

    #[test]
    fn round_trip_fragment() {
        let mut report = test_report();
        report.fragment = Some((512, 128));
        let wire = report.encode();
        assert_eq!(wire[0], RECORD_TYPE_STATUS_REPORT | RECORD_FLAG_FRAGMENT);
        assert_eq!(StatusReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn rejects_other_record_types() {
        let mut wire = test_report().encode();
        wire[0] = RECORD_TYPE_CUSTODY_SIGNAL;
        assert!(StatusReport::decode(&wire).is_err());
    }

    #[test]
    fn subject_id_matches_bundle() {
        use crate::bundle::{BlockFlags, BlockType};
        use bytes::Bytes;

        let mut bundle = Bundle {
            source: Eid::new(12, 34),
            creation_timestamp: 999,
            creation_sequence: 3,
            ..Default::default()
        };
        bundle.add_block(
            BlockType::Payload,
            BlockFlags::default(),
            Bytes::from_static(b"data"),
        );

        let report =
            StatusReport::for_bundle(&bundle, StatusFlags::DELIVERED, ReasonCode::default(), None);
        assert_eq!(report.subject_id().number(), bundle.bundle_number());
    }
}
