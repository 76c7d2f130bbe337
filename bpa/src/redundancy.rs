use std::sync::Mutex;

/// Remembers recently delivered bundle numbers in a small ring so that
/// duplicates arriving over different paths (or retransmissions whose
/// ACK was lost) are dropped without disturbing the sender.
pub struct RedundancyFilter {
    inner: Mutex<Inner>,
}

struct Inner {
    ring: Vec<Option<u32>>,
    cursor: usize,
}

impl RedundancyFilter {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: vec![None; size.max(1)],
                cursor: 0,
            }),
        }
    }

    /// Whether `bundle_number` has been seen recently.
    pub fn check(&self, bundle_number: u32) -> bool {
        self.inner
            .lock()
            .expect("redundancy filter poisoned")
            .ring
            .contains(&Some(bundle_number))
    }

    /// Records `bundle_number`, overwriting the oldest entry.
    pub fn set(&self, bundle_number: u32) {
        let mut inner = self.inner.lock().expect("redundancy filter poisoned");
        let cursor = inner.cursor;
        inner.ring[cursor] = Some(bundle_number);
        inner.cursor = (cursor + 1) % inner.ring.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_recent_numbers() {
        let filter = RedundancyFilter::new(4);
        assert!(!filter.check(42));
        filter.set(42);
        assert!(filter.check(42));
    }

    #[test]
    fn ring_overwrites_oldest() {
        let filter = RedundancyFilter::new(3);
        for n in 1..=3 {
            filter.set(n);
        }
        assert!(filter.check(1));

        filter.set(4);
        assert!(!filter.check(1));
        assert!(filter.check(2));
        assert!(filter.check(4));
    }

    #[test]
    fn zero_is_a_valid_bundle_number() {
        let filter = RedundancyFilter::new(2);
        assert!(!filter.check(0));
        filter.set(0);
        assert!(filter.check(0));
    }
}
