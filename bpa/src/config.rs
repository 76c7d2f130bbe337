use std::time::Duration;

/// Storage eviction behaviour when capacity is exhausted after pruning
/// expired bundles.
///
/// "Older"/"younger" compare remaining lifetime against the incoming
/// bundle; "oldest"/"youngest" evict unconditionally by time held.
/// Locked bundles and bundles of higher priority than the incoming one
/// are never evicted.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EvictionPolicy {
    /// Refuse the incoming bundle instead of evicting.
    #[default]
    NeverDelete,
    /// Evict the bundle that has been held the longest.
    DeleteOldest,
    /// Evict the bundle that has been held the shortest.
    DeleteYoungest,
    /// Evict a bundle with less remaining lifetime than the incoming one.
    DeleteOlder,
    /// Evict a bundle with more remaining lifetime than the incoming one.
    DeleteYounger,
}

/// Storage configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageConfig {
    /// Maximum number of bundles held.
    pub capacity: usize,
    pub eviction: EvictionPolicy,
    /// Expired bundles are reaped on this cadence.
    pub prune_interval: Duration,
    /// How long a full save waits for concurrent deletions before
    /// giving up with `NoRoom`.
    pub no_room_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            eviction: EvictionPolicy::default(),
            prune_interval: Duration::from_secs(5),
            no_room_timeout: Duration::from_millis(100),
        }
    }
}

/// Convergence layer configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClConfig {
    /// Transmit ticket pool size.
    pub queue_size: usize,
    /// Slots kept free for high-priority tickets; normal-priority
    /// requests are refused when free slots drop to this reserve.
    pub queue_reserve: usize,
    /// App-layer ACK retries before a ticket is failed.
    pub retries: u8,
    /// Link-layer send retries before a ticket is failed.
    pub failed_retries: u8,
    /// How long a peer stays blocked waiting for an app-layer ACK.
    pub peer_timeout: Duration,
    /// Idle limit for a partially received multipart bundle.
    pub multipart_timeout: Duration,
    /// Pacing of ACK/NACK retransmissions.
    pub retransmit_timeout: Duration,
    /// Backoff after the link reports a busy radio.
    pub busy_backoff: Duration,
    /// Cadence of the blocked-peer and multipart timeout sweeper.
    pub sweep_interval: Duration,
}

impl Default for ClConfig {
    fn default() -> Self {
        Self {
            queue_size: 10,
            queue_reserve: 2,
            retries: 4,
            failed_retries: 15,
            peer_timeout: Duration::from_secs(5),
            multipart_timeout: Duration::from_secs(10),
            retransmit_timeout: Duration::from_millis(500),
            busy_backoff: Duration::from_millis(1),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Routing configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoutingConfig {
    pub strategy: crate::routing::Strategy,
    /// Per-bundle record of neighbours already served.
    pub neighbour_slots: usize,
    /// Strikes within the timeout window before a peer is declared dead.
    pub blacklist_threshold: u8,
    /// Strike counter reset window.
    pub blacklist_timeout: Duration,
    /// Whether a bundle delivered straight to its destination node is
    /// considered fully forwarded.
    pub delete_on_direct_delivery: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: crate::routing::Strategy::Flooding,
            neighbour_slots: 2,
            blacklist_threshold: 3,
            blacklist_timeout: Duration::from_secs(10),
            delete_on_direct_delivery: true,
        }
    }
}

/// Discovery configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryConfig {
    /// Maximum number of tracked neighbours.
    pub neighbour_cache: usize,
    /// Idle neighbours older than this are dropped.
    pub neighbour_timeout: Duration,
    pub schedule: crate::discovery::Schedule,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            neighbour_cache: 8,
            neighbour_timeout: Duration::from_secs(25),
            schedule: crate::discovery::Schedule::Periodic {
                cycle: Duration::from_secs(5),
            },
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Bundle slot pool size; defaults to storage capacity plus
    /// headroom for in-flight bundles.
    pub slot_count: Option<usize>,
    /// Recently delivered bundle numbers remembered by the redundancy
    /// filter.
    pub redundancy_size: usize,
    /// Lifetime given to locally generated status reports, in seconds.
    pub report_lifetime: u32,
    pub storage: StorageConfig,
    pub cl: ClConfig,
    pub routing: RoutingConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slot_count: None,
            redundancy_size: 16,
            report_lifetime: 3600,
            storage: StorageConfig::default(),
            cl: ClConfig::default(),
            routing: RoutingConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Config {
    pub(crate) fn slots(&self) -> usize {
        self.slot_count.unwrap_or(self.storage.capacity + 10)
    }
}
