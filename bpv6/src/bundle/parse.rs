use super::*;
use crate::{sdnv, Error, PROTOCOL_VERSION};

impl Bundle {
    /// Decodes a bundle from its RFC 5050 wire image.
    ///
    /// Age extension blocks are not stored: their value is folded into
    /// [`Bundle::age_value_ms`] and the block is dropped.
    pub fn parse(data: &[u8]) -> crate::Result<Bundle> {
        let mut reader = sdnv::Reader::new(data);

        let version = reader.read_u8().map_err(|_| Error::UnsupportedVersion(0))?;
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut bundle = Bundle {
            flags: BundleFlags::from(reader.read_u32()?),
            ..Default::default()
        };

        // Number of primary-block octets following the length field.
        let block_length = reader.read_u32()? as usize;
        let primary_end = reader.position() + block_length;

        bundle.destination = Eid::new(reader.read_u32()?, reader.read_u32()?);
        bundle.source = Eid::new(reader.read_u32()?, reader.read_u32()?);
        bundle.report_to = Eid::new(reader.read_u32()?, reader.read_u32()?);
        bundle.custodian = Eid::new(reader.read_u32()?, reader.read_u32()?);

        bundle.creation_timestamp = reader.read_u32()?;
        bundle.creation_sequence = reader.read_u32()?;
        bundle.lifetime = reader.read_u32()?;

        let dictionary_length = reader.read_u32()?;
        if dictionary_length != 0 {
            return Err(Error::NonCbheDictionary(dictionary_length));
        }

        if bundle.flags.is_fragment {
            bundle.fragment_offset = reader.read_u32()?;
            bundle.total_adu_length = reader.read_u32()?;
        }

        if reader.position() != primary_end {
            return Err(Error::PrimaryLengthMismatch {
                declared: primary_end,
                decoded: reader.position(),
            });
        }

        while reader.remaining() > 1 {
            Self::parse_block(&mut bundle, &mut reader)?;
        }

        if bundle.payload_block().is_none() {
            return Err(Error::MissingPayload);
        }

        Ok(bundle)
    }

    fn parse_block(bundle: &mut Bundle, reader: &mut sdnv::Reader) -> crate::Result<()> {
        let block_type = BlockType::from(reader.read_u8()?);
        let flags = BlockFlags::from(reader.read_u32()?);
        let size = reader.read_u32()?;

        if size as usize > reader.remaining() {
            return Err(Error::BlockTooLong(size));
        }
        let data = reader.read_bytes(size as usize)?;

        if block_type == BlockType::AgeExtension {
            // Value is elapsed microseconds; keep milliseconds.
            let (age_us, _) = sdnv::decode_u64(data)?;
            bundle.age_value_ms = (age_us / 1000).min(u32::MAX as u64) as u32;
            return Ok(());
        }

        bundle.blocks.push(Block {
            block_type,
            flags,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }
}
