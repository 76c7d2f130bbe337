use thiserror::Error;

/// The primary error type for the `bpv6` crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The first byte of the primary block is not the supported protocol version.
    #[error("Unsupported bundle protocol version {0:#04x}")]
    UnsupportedVersion(u8),

    /// The primary block declares a non-zero dictionary, which CBHE forbids.
    #[error("Bundle does not use CBHE, dictionary length is {0}")]
    NonCbheDictionary(u32),

    /// The declared primary block length does not match the decoded fields.
    #[error("Primary block length mismatch: declared {declared}, decoded {decoded}")]
    PrimaryLengthMismatch {
        /// Block length as declared on the wire.
        declared: usize,
        /// Bytes actually consumed by the primary fields.
        decoded: usize,
    },

    /// An extension block declares more payload than the buffer holds.
    #[error("Block payload of {0} bytes exceeds remaining buffer")]
    BlockTooLong(u32),

    /// The bundle has no payload block.
    #[error("Bundle has no payload block")]
    MissingPayload,

    /// An error from the SDNV layer.
    #[error(transparent)]
    Sdnv(#[from] crate::sdnv::SdnvError),

    /// An error from the EID layer.
    #[error(transparent)]
    Eid(#[from] crate::eid::EidError),

    /// An administrative record could not be decoded.
    #[error("Malformed administrative record: {0}")]
    AdminRecord(&'static str),
}
