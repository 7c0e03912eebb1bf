//! Engine configuration.

/// Scan strategy of the hazard-pointer engine.
///
/// Both variants have identical external semantics; they differ only in
/// how the retired buffer is intersected with the published hazards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    /// Collect every published hazard into a sorted set, then keep each
    /// retired pointer found in it.
    Classic,
    /// Sort the retired buffer in place and mark matches through the
    /// address LSB while walking the hazard slots. Falls back to
    /// [`ScanType::Classic`] when a retired address already carries the
    /// LSB.
    InPlace,
}

/// Configuration of an [`HpDomain`](crate::HpDomain).
#[derive(Debug, Clone)]
pub struct HpConfig {
    /// Upper bound on simultaneously live guards per thread.
    pub hazard_pointers_per_thread: usize,
    /// Sizes the hazard collection of a scan pass.
    pub max_threads: usize,
    /// Retired entries a thread buffers before a scan is forced.
    ///
    /// Zero means derive the default, `hazard_pointers_per_thread *
    /// max_threads * 2`, which guarantees every scan frees at least one
    /// entry.
    pub retired_capacity: usize,
    /// Scan strategy.
    pub scan_type: ScanType,
}

impl Default for HpConfig {
    fn default() -> Self {
        Self {
            hazard_pointers_per_thread: 8,
            max_threads: 128,
            retired_capacity: 0,
            scan_type: ScanType::InPlace,
        }
    }
}

impl HpConfig {
    pub(crate) fn validate(&self) {
        assert!(
            self.hazard_pointers_per_thread >= 1
                && self.hazard_pointers_per_thread <= usize::BITS as usize,
            "hazard_pointers_per_thread must be in 1..={}",
            usize::BITS
        );
        assert!(self.max_threads >= 1, "max_threads must be at least 1");
    }

    pub(crate) fn retired_capacity(&self) -> usize {
        if self.retired_capacity != 0 {
            self.retired_capacity
        } else {
            self.hazard_pointers_per_thread * self.max_threads * 2
        }
    }
}

/// Configuration of an [`HrcDomain`](crate::HrcDomain).
#[derive(Debug, Clone)]
pub struct HrcConfig {
    /// Upper bound on simultaneously live guards per thread.
    ///
    /// The default leaves two slots of headroom over the HP default for
    /// the clean-up callbacks, which walk links under their own guards.
    pub hazard_pointers_per_thread: usize,
    /// Sizes the hazard collection of a scan pass.
    pub max_threads: usize,
    /// Retired slots per thread record. Zero derives the default from
    /// the link counts below.
    pub retired_capacity: usize,
    /// Largest number of counted links a managed node carries.
    pub max_node_links: usize,
    /// Links in live nodes that may transiently point at a deleted node.
    pub max_transient_links: usize,
}

impl Default for HrcConfig {
    fn default() -> Self {
        Self {
            hazard_pointers_per_thread: 10,
            max_threads: 128,
            retired_capacity: 0,
            max_node_links: 4,
            max_transient_links: 8,
        }
    }
}

impl HrcConfig {
    pub(crate) fn validate(&self) {
        assert!(
            self.hazard_pointers_per_thread >= 1
                && self.hazard_pointers_per_thread <= usize::BITS as usize,
            "hazard_pointers_per_thread must be in 1..={}",
            usize::BITS
        );
        assert!(self.max_threads >= 1, "max_threads must be at least 1");
    }

    pub(crate) fn retired_capacity(&self) -> usize {
        if self.retired_capacity != 0 {
            self.retired_capacity
        } else {
            self.max_threads
                * (self.hazard_pointers_per_thread + self.max_node_links + self.max_transient_links + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hp_defaults_guarantee_scan_progress() {
        let cfg = HpConfig::default();
        // A full hazard map can pin at most hp * max_threads entries, so
        // twice that always leaves something to reclaim.
        assert!(cfg.retired_capacity() >= cfg.hazard_pointers_per_thread * cfg.max_threads * 2);
    }

    #[test]
    fn explicit_capacity_wins() {
        let cfg = HpConfig {
            retired_capacity: 16,
            ..HpConfig::default()
        };
        assert_eq!(cfg.retired_capacity(), 16);
    }

    #[test]
    #[should_panic(expected = "hazard_pointers_per_thread")]
    fn zero_hazards_rejected() {
        HpConfig {
            hazard_pointers_per_thread: 0,
            ..HpConfig::default()
        }
        .validate();
    }
}
