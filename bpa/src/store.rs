/*!
The storage front-end.

Owns the bundle inventory and every storage policy decision: duplicate
rejection by bundle number, pruning of expired bundles, capacity
eviction by the configured [`EvictionPolicy`], lock handling, and the
side effects of deletion (status reports and purge notifications to the
agent). The bytes themselves are kept by a pluggable
[`storage::Storage`] backend.
*/

use super::*;
use crate::config::EvictionPolicy;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tundra_bpv6::{
    ageing::ClockState,
    bundle::{Bundle as WireBundle, Priority},
};

#[derive(Error, Debug)]
pub enum Error {
    /// No capacity could be freed for an incoming bundle.
    #[error("No room in bundle storage")]
    NoRoom,

    /// The slot pool is exhausted.
    #[error(transparent)]
    Slot(#[from] slot::Error),

    /// The backend failed.
    #[error(transparent)]
    Backend(#[from] storage::Error),

    /// A stored image failed to decode.
    #[error("Stored bundle {0} is corrupt")]
    Corrupt(u32),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Why a bundle left storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeleteReason {
    NoInformation,
    LifetimeExpired,
    DepletedStorage,
    /// The bundle reached its destination (or every forwarding
    /// obligation was met); deletion reports are suppressed.
    Delivered,
}

impl DeleteReason {
    pub fn reason_code(&self) -> tundra_bpv6::status_report::ReasonCode {
        use tundra_bpv6::status_report::ReasonCode;
        match self {
            DeleteReason::LifetimeExpired => ReasonCode::LifetimeExpired,
            DeleteReason::DepletedStorage => ReasonCode::DepletedStorage,
            _ => ReasonCode::NoAdditionalInformation,
        }
    }
}

/// Inventory record of one stored bundle.
#[derive(Debug, Clone)]
struct Entry {
    number: u32,
    /// Tick at which the bundle entered storage.
    rec_time_ms: u64,
    /// Age carried in the persisted image.
    age_at_save_ms: u32,
    creation_timestamp: u32,
    lifetime: u32,
    encoded_size: usize,
    priority: Priority,
    source_node: u32,
    /// Deletion must be reported to the report-to endpoint.
    report_on_delete: bool,
    locked: bool,
}

impl Entry {
    fn age_ms(&self, now: &ClockState) -> u32 {
        // Reuse the bundle ageing rules on the inventory fields.
        WireBundle {
            creation_timestamp: self.creation_timestamp,
            age_value_ms: self.age_at_save_ms,
            ..Default::default()
        }
        .age_ms(self.rec_time_ms, now)
    }

    fn has_expired(&self, now: &ClockState) -> bool {
        self.age_ms(now) / 1000 > self.lifetime
    }

    fn remaining_lifetime_secs(&self, now: &ClockState) -> u32 {
        self.lifetime.saturating_sub(self.age_ms(now) / 1000)
    }

    fn held_ms(&self, now: &ClockState) -> u64 {
        now.ticks_ms.saturating_sub(self.rec_time_ms)
    }
}

/// Public view of one stored bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInfo {
    pub bundle_number: u32,
    pub encoded_size: usize,
    pub remaining_lifetime_secs: u32,
    pub locked: bool,
}

pub(crate) struct Store {
    config: config::StorageConfig,
    backend: Arc<dyn storage::Storage>,
    pool: Arc<slot::Pool>,
    clock: Arc<dyn clock::Clock>,
    node: node_ids::NodeId,

    entries: Mutex<Vec<Entry>>,
    read_cache: Mutex<Option<(u32, slot::Handle)>>,

    /// Posted on every deletion; full saves wait here for room.
    deleted: tokio::sync::Notify,

    events: OnceLock<flume::Sender<agent::Event>>,
}

impl Store {
    pub fn new(
        config: config::StorageConfig,
        backend: Arc<dyn storage::Storage>,
        pool: Arc<slot::Pool>,
        clock: Arc<dyn clock::Clock>,
        node: node_ids::NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            backend,
            pool,
            clock,
            node,
            entries: Mutex::new(Vec::new()),
            read_cache: Mutex::new(None),
            deleted: tokio::sync::Notify::new(),
            events: OnceLock::new(),
        })
    }

    /// Wires the agent inbox and starts the expiry reaper.
    pub fn start(self: &Arc<Self>, events: flume::Sender<agent::Event>) {
        let _ = self.events.set(events);

        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.prune_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                store.prune();
            }
        });
    }

    /// Rebuilds the inventory from the backend after a reset.
    ///
    /// Corrupt images and images whose content does not match their
    /// key are discarded, not trusted.
    pub fn restore(&self) {
        let recovered = match self.backend.recover() {
            Ok(recovered) => recovered,
            Err(e) => {
                error!("Storage recovery scan failed: {e}");
                return;
            }
        };

        let now = self.clock.now();
        let mut entries = self.entries.lock().trace_expect("store poisoned");
        for item in recovered {
            let bundle = match WireBundle::parse(&item.data) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Skipping corrupt stored bundle {}: {e}", item.bundle_number);
                    let _ = self.backend.delete(item.bundle_number);
                    continue;
                }
            };
            if bundle.bundle_number() != item.bundle_number {
                warn!(
                    "Stored bundle {} does not match its key, skipping",
                    item.bundle_number
                );
                let _ = self.backend.delete(item.bundle_number);
                continue;
            }
            if entries.len() >= self.config.capacity {
                warn!("Recovered more bundles than capacity, dropping the rest");
                break;
            }
            entries.push(Self::entry_for(&bundle, item.data.len(), now.ticks_ms));
            debug!("Recovered bundle {} from storage", item.bundle_number);
        }
        info!("Storage restored with {} bundles", entries.len());
    }

    fn entry_for(bundle: &WireBundle, encoded_size: usize, rec_time_ms: u64) -> Entry {
        Entry {
            number: bundle.bundle_number(),
            rec_time_ms,
            age_at_save_ms: bundle.age_value_ms,
            creation_timestamp: bundle.creation_timestamp,
            lifetime: bundle.lifetime,
            encoded_size,
            priority: bundle.flags.priority,
            source_node: bundle.source.node,
            report_on_delete: bundle.flags.custody_requested || bundle.flags.report_deletion,
            locked: false,
        }
    }

    /// Stores the bundle behind `handle`, returning its bundle number.
    ///
    /// A bundle already in storage is reported as success without
    /// touching the existing entry. When storage is full the call
    /// prunes, evicts per policy, and finally waits up to the
    /// configured timeout for a concurrent deletion.
    pub async fn save(&self, handle: &slot::Handle) -> Result<u32> {
        let now = self.clock.now();
        let (number, encoded, proto) = {
            let guard = handle.read();
            let number = guard.bundle_number();
            let encoded = Bytes::from(guard.encode(&now));
            let mut proto = Self::entry_for(&guard.bundle, encoded.len(), now.ticks_ms);
            // The image carries the age it was encoded with.
            proto.number = number;
            proto.age_at_save_ms = guard.age_ms(&now);
            (number, encoded, proto)
        };

        let mut waited = false;
        loop {
            {
                let entries = self.entries.lock().trace_expect("store poisoned");
                if entries.iter().any(|e| e.number == number) {
                    trace!("Bundle {number} is already in storage");
                    return Ok(number);
                }
            }

            self.prune();

            enum Reservation {
                Pushed,
                Victim(u32),
                NoRoom,
            }

            let reservation = {
                let mut entries = self.entries.lock().trace_expect("store poisoned");
                if entries.len() < self.config.capacity {
                    entries.push(proto.clone());
                    Reservation::Pushed
                } else {
                    match self.pick_victim(&entries, &proto) {
                        Some(victim) => Reservation::Victim(victim),
                        None => Reservation::NoRoom,
                    }
                }
            };

            match reservation {
                Reservation::Victim(victim) => {
                    info!("Evicting bundle {victim} to make room");
                    self.delete(victim, DeleteReason::DepletedStorage);
                    continue;
                }
                Reservation::NoRoom => {
                    if waited {
                        warn!("Cannot store bundle {number}, no room");
                        return Err(Error::NoRoom);
                    }
                    waited = true;
                    let _ = tokio::time::timeout(
                        self.config.no_room_timeout,
                        self.deleted.notified(),
                    )
                    .await;
                    continue;
                }
                Reservation::Pushed => {}
            }

            // Reserved; now persist.
            if let Err(e) = self.backend.save(number, encoded.clone()) {
                self.entries
                    .lock()
                    .trace_expect("store poisoned")
                    .retain(|entry| entry.number != number);
                return Err(e.into());
            }
            debug!(
                "Stored bundle {number} ({} octets, src ipn:{})",
                encoded.len(),
                proto.source_node
            );
            return Ok(number);
        }
    }

    fn pick_victim(&self, entries: &[Entry], incoming: &Entry) -> Option<u32> {
        let now = self.clock.now();
        let candidates = entries
            .iter()
            .filter(|e| !e.locked && e.priority <= incoming.priority);

        match self.config.eviction {
            EvictionPolicy::NeverDelete => None,
            EvictionPolicy::DeleteOldest => candidates
                .max_by_key(|e| e.held_ms(&now))
                .map(|e| e.number),
            EvictionPolicy::DeleteYoungest => candidates
                .min_by_key(|e| e.held_ms(&now))
                .map(|e| e.number),
            EvictionPolicy::DeleteOlder => candidates
                .filter(|e| {
                    e.remaining_lifetime_secs(&now) < incoming.remaining_lifetime_secs(&now)
                })
                .min_by_key(|e| e.remaining_lifetime_secs(&now))
                .map(|e| e.number),
            EvictionPolicy::DeleteYounger => candidates
                .filter(|e| {
                    e.remaining_lifetime_secs(&now) > incoming.remaining_lifetime_secs(&now)
                })
                .max_by_key(|e| e.remaining_lifetime_secs(&now))
                .map(|e| e.number),
        }
    }

    /// Deletes every expired bundle.
    pub fn prune(&self) {
        let now = self.clock.now();
        let expired: Vec<u32> = {
            let entries = self.entries.lock().trace_expect("store poisoned");
            entries
                .iter()
                .filter(|e| e.has_expired(&now))
                .map(|e| e.number)
                .collect()
        };

        for number in expired {
            info!("Bundle {number} lifetime expired");
            self.delete(number, DeleteReason::LifetimeExpired);
        }
    }

    /// Removes a bundle, emitting the deletion side effects.
    ///
    /// Returns false if the bundle was not in storage.
    pub fn delete(&self, bundle_number: u32, reason: DeleteReason) -> bool {
        let entry = {
            let mut entries = self.entries.lock().trace_expect("store poisoned");
            let Some(index) = entries.iter().position(|e| e.number == bundle_number) else {
                return false;
            };
            entries.remove(index)
        };

        debug!("Deleting bundle {bundle_number} with reason {reason:?}");

        {
            let mut cache = self.read_cache.lock().trace_expect("store poisoned");
            if matches!(*cache, Some((number, _)) if number == bundle_number) {
                *cache = None;
            }
        }

        // A deletion report needs the subject bundle's primary fields.
        let report_subject = if entry.report_on_delete
            && reason != DeleteReason::Delivered
            && entry.source_node != self.node.node_number()
        {
            self.backend
                .load(bundle_number)
                .ok()
                .flatten()
                .and_then(|data| WireBundle::parse(&data).ok())
                .map(Box::new)
        } else {
            None
        };

        if let Err(e) = self.backend.delete(bundle_number) {
            warn!("Backend failed to delete bundle {bundle_number}: {e}");
        }

        if let Some(events) = self.events.get() {
            let _ = events.send(agent::Event::BundleDeleted {
                bundle_number,
                reason,
                report_subject,
            });
        }

        self.deleted.notify_waiters();
        true
    }

    /// Reads a bundle back into a fresh slot.
    ///
    /// The most recently read bundle is served from a one-entry cache.
    pub fn read(&self, bundle_number: u32) -> Result<Option<slot::Handle>> {
        let rec_time_ms = {
            let entries = self.entries.lock().trace_expect("store poisoned");
            let Some(entry) = entries.iter().find(|e| e.number == bundle_number) else {
                return Ok(None);
            };
            entry.rec_time_ms
        };

        {
            let cache = self.read_cache.lock().trace_expect("store poisoned");
            if let Some((number, handle)) = cache.as_ref() {
                if *number == bundle_number {
                    return Ok(Some(handle.clone()));
                }
            }
        }

        let Some(data) = self.backend.load(bundle_number)? else {
            warn!("Bundle {bundle_number} listed but not in backend");
            return Ok(None);
        };

        let bundle = WireBundle::parse(&data).map_err(|e| {
            warn!("Stored bundle {bundle_number} failed to decode: {e}");
            Error::Corrupt(bundle_number)
        })?;

        let handle = self
            .pool
            .create(bundle::Bundle::new(bundle, rec_time_ms))?;

        *self.read_cache.lock().trace_expect("store poisoned") = Some((bundle_number, handle.clone()));
        Ok(Some(handle))
    }

    /// Locks a bundle against capacity eviction.
    pub fn lock_bundle(&self, bundle_number: u32) -> bool {
        self.set_locked(bundle_number, true)
    }

    pub fn unlock_bundle(&self, bundle_number: u32) -> bool {
        self.set_locked(bundle_number, false)
    }

    fn set_locked(&self, bundle_number: u32, locked: bool) -> bool {
        let mut entries = self.entries.lock().trace_expect("store poisoned");
        match entries.iter_mut().find(|e| e.number == bundle_number) {
            Some(entry) => {
                entry.locked = locked;
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.lock().trace_expect("store poisoned").len()
    }

    pub fn free_space(&self) -> usize {
        self.config.capacity - self.count().min(self.config.capacity)
    }

    pub fn contains(&self, bundle_number: u32) -> bool {
        self.entries
            .lock()
            .trace_expect("store poisoned")
            .iter()
            .any(|e| e.number == bundle_number)
    }

    /// Snapshot of the inventory in insertion order.
    pub fn list(&self) -> Vec<StoredInfo> {
        let now = self.clock.now();
        self.entries
            .lock()
            .trace_expect("store poisoned")
            .iter()
            .map(|e| StoredInfo {
                bundle_number: e.number,
                encoded_size: e.encoded_size,
                remaining_lifetime_secs: e.remaining_lifetime_secs(&now),
                locked: e.locked,
            })
            .collect()
    }
}
