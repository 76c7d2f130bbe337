use tundra_bpv6::ageing::{ClockState, DtnTime};

/// Source of local time for the agent.
///
/// Provides the coarse monotonic tick used for bundle ageing and the
/// optional wall clock in DTN time. `dtn_time` must return `None`
/// whenever the platform cannot vouch for its clock; ageing then falls
/// back to the age-extension-block path.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary origin.
    fn ticks_ms(&self) -> u64;

    /// Trusted wall-clock DTN time, if the platform has one.
    fn dtn_time(&self) -> Option<DtnTime>;

    /// Snapshot both clocks for an ageing decision.
    fn now(&self) -> ClockState {
        ClockState {
            ticks_ms: self.ticks_ms(),
            dtn_time: self.dtn_time(),
        }
    }
}

/// System clock: monotonic ticks from [`std::time::Instant`], wall
/// clock from the OS, reported as trusted.
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn ticks_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn dtn_time(&self) -> Option<DtnTime> {
        DtnTime::from_offset(time::OffsetDateTime::now_utc())
    }
}

/// System ticks without a trusted wall clock, for nodes that boot
/// with an unsynchronised RTC.
pub struct UnsyncedClock(SystemClock);

impl UnsyncedClock {
    pub fn new() -> Self {
        Self(SystemClock::new())
    }
}

impl Default for UnsyncedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for UnsyncedClock {
    fn ticks_ms(&self) -> u64 {
        self.0.ticks_ms()
    }

    fn dtn_time(&self) -> Option<DtnTime> {
        None
    }
}
