/*!
Bundle Processing Agent for constrained nodes.

Store-and-forward of RFC 5050 bundles between intermittently connected
peers: a reference-counted bundle slot pool, persistent slot-addressed
storage with expiration and eviction, a dispatcher with a redundancy
filter, flooding/chain routing with per-bundle neighbour bookkeeping, a
datagram convergence layer with segmentation and application-level
ACK/NACK, IP-ND discovery with a duty-cycle scheduler, and the agent
event loop that wires these together.

Link adapters (`tundra-lowpan-dgram`, `tundra-udp-dgram`) and storage
backends (`tundra-localdisk-storage`) plug in through the traits in
[`cla`] and [`storage`].
*/

mod dispatcher;
mod report;
mod store;

pub mod agent;
pub mod bundle;
pub mod cla;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod node_ids;
pub mod redundancy;
pub mod registration;
pub mod routing;
pub mod slot;
pub mod storage;

pub use bytes::Bytes;
pub use store::{DeleteReason, StoredInfo};

use std::sync::Arc;
use trace_err::*;
use tracing::{debug, error, info, trace, warn};
