/*!
Bundle age derivation.

A bundle's age is preferred from its creation timestamp whenever both
the bundle and the local node have trusted clocks; otherwise it falls
back to the age-extension-block value accumulated hop by hop, plus the
time the bundle has spent on this node.
*/

use crate::bundle::Bundle;

/// Seconds between the Unix epoch and the DTN epoch (2000-01-01T00:00:00Z).
pub const DTN_EPOCH_OFFSET: u64 = 946_684_800;

/// A wall-clock instant in DTN time.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtnTime {
    /// Seconds since the DTN epoch.
    pub secs: u32,
    pub micros: u32,
}

impl DtnTime {
    /// Converts a Unix timestamp; `None` before the DTN epoch.
    pub fn from_unix(secs: u64, micros: u32) -> Option<Self> {
        Some(Self {
            secs: secs.checked_sub(DTN_EPOCH_OFFSET)?.try_into().ok()?,
            micros,
        })
    }

    /// Converts a [`time::OffsetDateTime`]; `None` before the DTN epoch.
    pub fn from_offset(odt: time::OffsetDateTime) -> Option<Self> {
        Self::from_unix(
            u64::try_from(odt.unix_timestamp()).ok()?,
            odt.microsecond(),
        )
    }
}

/// A snapshot of the local clocks, taken when an age decision is made.
#[derive(Debug, Default, Copy, Clone)]
pub struct ClockState {
    /// Monotonic local time in milliseconds since an arbitrary origin.
    pub ticks_ms: u64,

    /// Wall-clock DTN time, present only while the platform reports its
    /// clock as trustworthy.
    pub dtn_time: Option<DtnTime>,
}

impl Bundle {
    /// The bundle's current age in milliseconds.
    ///
    /// `rec_time_ms` is the monotonic tick at which the bundle arrived
    /// on (or was created by) this node.
    pub fn age_ms(&self, rec_time_ms: u64, now: &ClockState) -> u32 {
        if self.creation_timestamp != 0 {
            if let Some(dtn_now) = now.dtn_time {
                // A local clock behind the source clock reads as age 0.
                if dtn_now.secs < self.creation_timestamp {
                    return 0;
                }
                let age = (dtn_now.secs - self.creation_timestamp) as u64 * 1000
                    + (dtn_now.micros / 1000) as u64;
                return age.min(u32::MAX as u64) as u32;
            }
        }

        let held = now.ticks_ms.saturating_sub(rec_time_ms);
        (self.age_value_ms as u64 + held).min(u32::MAX as u64) as u32
    }

    /// Whether the bundle has outlived its lifetime.
    pub fn has_expired(&self, rec_time_ms: u64, now: &ClockState) -> bool {
        self.age_ms(rec_time_ms, now) / 1000 > self.lifetime
    }
}
