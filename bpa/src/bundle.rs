use super::*;

/// Process-internal state carried alongside a bundle while it is on
/// this node. None of it is serialised.
#[derive(Debug, Default, Clone)]
pub struct Metadata {
    /// Monotonic tick at which the bundle arrived or was created here.
    /// Ageing is measured from this point when clocks are untrusted.
    pub rec_time_ms: u64,

    /// The peer the bundle was received from, when it came off a link.
    pub received_from: Option<cla::Address>,

    /// Received signal strength of the final frame, when the link
    /// reports one.
    pub rssi: Option<i16>,
}

/// A bundle plus its process-internal metadata.
#[derive(Debug, Default, Clone)]
pub struct Bundle {
    pub bundle: tundra_bpv6::bundle::Bundle,
    pub metadata: Metadata,
}

impl Bundle {
    /// Wraps a freshly created or received bundle, stamping its arrival
    /// time.
    pub fn new(bundle: tundra_bpv6::bundle::Bundle, rec_time_ms: u64) -> Self {
        Self {
            bundle,
            metadata: Metadata {
                rec_time_ms,
                ..Default::default()
            },
        }
    }

    pub fn bundle_number(&self) -> u32 {
        self.bundle.bundle_number()
    }

    pub fn age_ms(&self, now: &tundra_bpv6::ageing::ClockState) -> u32 {
        self.bundle.age_ms(self.metadata.rec_time_ms, now)
    }

    pub fn has_expired(&self, now: &tundra_bpv6::ageing::ClockState) -> bool {
        self.bundle.has_expired(self.metadata.rec_time_ms, now)
    }

    /// Encodes the bundle with its current age.
    pub fn encode(&self, now: &tundra_bpv6::ageing::ClockState) -> Vec<u8> {
        self.bundle.encode(self.age_ms(now))
    }
}
