use super::Bundle;
use crate::eid::Eid;

/// The identity of a bundle.
///
/// Two bundles are the same bundle iff these fields match; the derived
/// [`number`](Id::number) is the canonical key for deduplication,
/// storage and routing and must be stable across the whole fleet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Id {
    pub source: Eid,
    pub creation_timestamp: u32,
    pub creation_sequence: u32,
    pub fragment_offset: u32,
    /// Size of the payload block, for fragments only; 0 otherwise.
    pub fragment_payload_length: u32,
}

const FNV_OFFSET: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

impl Id {
    /// Extracts the identity tuple of `bundle`.
    pub fn of(bundle: &Bundle) -> Self {
        let fragment_payload_length = if bundle.flags.is_fragment {
            bundle
                .payload_block()
                .map(|b| b.data.len() as u32)
                .unwrap_or(0)
        } else {
            0
        };

        Self {
            source: bundle.source,
            creation_timestamp: bundle.creation_timestamp,
            creation_sequence: bundle.creation_sequence,
            fragment_offset: bundle.fragment_offset,
            fragment_payload_length,
        }
    }

    /// The 32-bit bundle number: FNV-1a over the identity fields in
    /// little-endian order.
    pub fn number(&self) -> u32 {
        let mut hash = FNV_OFFSET;
        for word in [
            self.creation_sequence,
            self.creation_timestamp,
            self.source.node,
            self.source.service,
            self.fragment_offset,
            self.fragment_payload_length,
        ] {
            for octet in word.to_le_bytes() {
                hash ^= octet as u32;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BlockFlags, BlockType};
    use bytes::Bytes;

    fn test_bundle() -> Bundle {
        let mut bundle = Bundle {
            source: Eid::new(5, 7),
            creation_timestamp: 1234,
            creation_sequence: 42,
            ..Default::default()
        };
        bundle.add_block(
            BlockType::Payload,
            BlockFlags::default(),
            Bytes::from_static(b"hello"),
        );
        bundle
    }

    #[test]
    fn number_is_stable() {
        let a = test_bundle();
        let b = test_bundle();
        assert_eq!(a.bundle_number(), b.bundle_number());
    }

    #[test]
    fn number_depends_on_identity_fields() {
        let base = test_bundle().bundle_number();

        let mut other = test_bundle();
        other.creation_sequence += 1;
        assert_ne!(other.bundle_number(), base);

        let mut other = test_bundle();
        other.source.service += 1;
        assert_ne!(other.bundle_number(), base);

        let mut other = test_bundle();
        other.source.node += 1;
        assert_ne!(other.bundle_number(), base);
    }

    #[test]
    fn payload_length_counts_only_for_fragments() {
        let mut fragment = test_bundle();
        fragment.flags.is_fragment = true;
        assert_eq!(fragment.id().fragment_payload_length, 5);

        let whole = test_bundle();
        assert_eq!(whole.id().fragment_payload_length, 0);
    }

    #[test]
    fn number_ignores_mutable_fields() {
        let mut other = test_bundle();
        other.lifetime = 3600;
        other.destination = Eid::new(9, 9);
        assert_eq!(other.bundle_number(), test_bundle().bundle_number());
    }
}
