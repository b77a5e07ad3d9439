//! Memory usage accounting.
//!
//! Coders can allocate large dictionaries and match finder tables. The
//! [`MemLimit`] tracker lets a caller put a byte budget on that: every sizable
//! allocation is claimed against the budget first, and a refused claim
//! reports how much memory would have been needed, so the caller can retry
//! with a higher limit.
//!
//! The tracker is plain bookkeeping; it does not own or wrap the allocations
//! themselves. All operations are O(1) and the counters can be read at any
//! time.

use crate::error::{Result, XzError};

/// Byte-budget tracker for coder allocations.
#[derive(Debug, Clone)]
pub struct MemLimit {
    limit: u64,
    live: u64,
    peak: u64,
    count: u32,
}

impl MemLimit {
    /// Create a tracker with the given byte budget.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            live: 0,
            peak: 0,
            count: 0,
        }
    }

    /// Claim `size` bytes against the budget.
    ///
    /// A claim is refused when the live total has already reached past the
    /// limit, or when the request alone exceeds it. The peak counter is
    /// updated even for refused claims, so after a failure
    /// [`MemLimit::peak_requested`] tells how much would have been needed.
    pub fn claim(&mut self, size: u64) -> Result<()> {
        let needed = self.live.saturating_add(size);
        if needed > self.peak {
            self.peak = needed;
        }

        if self.live > self.limit || size > self.limit {
            return Err(XzError::MemLimit { needed });
        }

        self.live = needed;
        self.count += 1;
        Ok(())
    }

    /// Release a previously claimed allocation.
    pub fn release(&mut self, size: u64) {
        debug_assert!(self.live >= size && self.count > 0);
        self.live = self.live.saturating_sub(size);
        self.count = self.count.saturating_sub(1);
    }

    /// Currently claimed bytes.
    pub fn live(&self) -> u64 {
        self.live
    }

    /// Largest total ever requested, counting refused claims.
    pub fn peak_requested(&self) -> u64 {
        self.peak
    }

    /// Number of outstanding claims.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The configured budget.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Change the budget. Existing claims stay live.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_scenario() {
        let mut mem = MemLimit::new(6144);

        mem.claim(4096).unwrap();
        mem.claim(4096).unwrap();
        assert_eq!(mem.count(), 2);

        let err = mem.claim(4096).unwrap_err();
        match err {
            XzError::MemLimit { needed } => assert!(needed >= 12288),
            other => panic!("unexpected error: {other}"),
        }
        assert!(mem.peak_requested() >= 12288);
        assert_eq!(mem.count(), 2);
    }

    #[test]
    fn test_oversized_single_claim() {
        let mut mem = MemLimit::new(1 << 16);
        assert!(mem.claim(1 << 20).is_err());
        assert_eq!(mem.live(), 0);
        assert_eq!(mem.peak_requested(), 1 << 20);
    }

    #[test]
    fn test_release_restores_budget() {
        let mut mem = MemLimit::new(8192);
        mem.claim(8000).unwrap();
        assert!(mem.claim(8192 + 1).is_err());

        mem.release(8000);
        assert_eq!(mem.live(), 0);
        assert_eq!(mem.count(), 0);
        mem.claim(4096).unwrap();
    }

    #[test]
    fn test_peak_survives_release() {
        let mut mem = MemLimit::new(u64::MAX);
        mem.claim(1000).unwrap();
        mem.claim(500).unwrap();
        mem.release(1000);
        mem.release(500);
        assert_eq!(mem.live(), 0);
        assert_eq!(mem.peak_requested(), 1500);
    }

    #[test]
    fn test_set_limit() {
        let mut mem = MemLimit::new(1 << 16);
        mem.claim(4096).unwrap();
        mem.claim(4096).unwrap();

        mem.set_limit(6144);
        assert_eq!(mem.limit(), 6144);
        assert!(mem.claim(4096).is_err());
    }
}
