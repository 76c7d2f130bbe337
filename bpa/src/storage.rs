/*!
Bundle storage backends.

A backend persists raw bundle images keyed by the 32-bit bundle number.
All policy — duplicate rejection, pruning, eviction, lock handling,
deletion side effects — lives in the store front-end; a backend only
has to keep bytes and give them back, including across an unexpected
reset (see `tundra-localdisk-storage`).
*/

pub mod mem;

use bytes::Bytes;

pub type Error = Box<dyn core::error::Error + Send + Sync>;
pub type Result<T> = core::result::Result<T, Error>;

/// A persisted bundle as found during startup recovery.
pub struct RecoveredBundle {
    pub bundle_number: u32,
    pub data: Bytes,
}

/// The storage backend interface.
pub trait Storage: Send + Sync {
    /// Persists the image of bundle `bundle_number`, replacing any
    /// previous image under the same number.
    fn save(&self, bundle_number: u32, data: Bytes) -> Result<()>;

    /// Loads a bundle image; `None` if the number is unknown.
    fn load(&self, bundle_number: u32) -> Result<Option<Bytes>>;

    /// Removes a bundle image; removing an unknown number is not an
    /// error.
    fn delete(&self, bundle_number: u32) -> Result<()>;

    /// Enumerates every persisted bundle, for reconstruction after a
    /// reset. Backends skip (and log) entries they cannot read rather
    /// than failing the whole scan.
    fn recover(&self) -> Result<Vec<RecoveredBundle>>;

    /// Removes everything.
    fn wipe(&self) -> Result<()>;
}
