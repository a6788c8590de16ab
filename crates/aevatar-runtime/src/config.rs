/// Absolute hop bound applied regardless of per-envelope limits.
pub const HOP_SAFETY_CEILING: u32 = 100;

/// Knobs shared by every agent a host creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// `max_hop_count` stamped on new envelopes.
    pub default_max_hop_count: u32,
    /// Never forward past this many hops, whatever the envelope says.
    pub hop_safety_ceiling: u32,
    /// Snapshot every N committed versions. Zero disables snapshots.
    pub snapshot_interval: u64,
    /// Depth cap when flattening a handler error's cause chain.
    pub max_cause_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_max_hop_count: 50,
            hop_safety_ceiling: HOP_SAFETY_CEILING,
            snapshot_interval: 100,
            max_cause_depth: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_max_hop_count(mut self, hops: u32) -> Self {
        self.default_max_hop_count = hops;
        self
    }

    /// Values above [`HOP_SAFETY_CEILING`] are clamped to it.
    pub fn hop_safety_ceiling(mut self, hops: u32) -> Self {
        self.hop_safety_ceiling = hops.min(HOP_SAFETY_CEILING);
        self
    }

    pub fn snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn max_cause_depth(mut self, depth: usize) -> Self {
        self.max_cause_depth = depth.max(1);
        self
    }
}
