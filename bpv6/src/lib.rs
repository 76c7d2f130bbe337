/*!
BPv6 bundle format library.

Implements the RFC 5050 wire format in the Compressed Bundle Header
Encoding (CBHE) profile used by constrained nodes: `ipn:` endpoint
identifiers with numeric node and service parts and an empty dictionary,
SDNV-encoded primary fields, extension blocks, and the age extension
block that carries elapsed time when node clocks cannot be trusted.

This crate is purely about representation and codec; storage, routing
and convergence layers live in `tundra-bpa`.
*/

pub mod ageing;
pub mod bundle;
pub mod eid;
pub mod sdnv;
pub mod status_report;

mod error;

pub use error::Error;

/// A specialized `Result` type for bundle codec operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The bundle protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u8 = 0x06;
