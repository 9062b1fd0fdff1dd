//! Read-only configuration consumed by the passes.
//!
//! `PlatformCaps` describes what the target hardware can do; `PassFlags` is
//! the per-rule kill-switch surface used for bisection and regression
//! triage. Both are plain structs passed by reference; passes never mutate
//! them.

/// Hardware capability flags gating individual rewrite rules.
#[derive(Copy, Clone, Debug)]
pub struct PlatformCaps {
    /// Fused 4-way dot-product-accumulate on packed i8 lanes.
    pub has_dp4a: bool,

    /// Add-with-carry as one instruction.
    pub has_uaddc: bool,

    /// Hardware write-combining on URB traffic, allowing merged writes to be
    /// padded to a full channel mask for alignment efficiency.
    pub supports_write_combining: bool,

    /// Largest integer bit width with native operation support. Widths in
    /// `{8, 16, 32, 64}` up to (and including) this are "legal"; everything
    /// else must be re-expressed by the legalizer.
    pub max_legal_int_width: u32,
}

impl Default for PlatformCaps {
    fn default() -> Self {
        PlatformCaps {
            has_dp4a: true,
            has_uaddc: true,
            supports_write_combining: false,
            max_legal_int_width: 64,
        }
    }
}

impl PlatformCaps {
    pub fn is_legal_int_width(&self, bits: u32) -> bool {
        matches!(bits, 8 | 16 | 32 | 64) && bits <= self.max_legal_int_width
    }

    /// Smallest legal width that can hold `bits`, if any single one can.
    pub fn smallest_legal_int_width_holding(&self, bits: u32) -> Option<u32> {
        [8u32, 16, 32, 64]
            .into_iter()
            .find(|&w| w >= bits && self.is_legal_int_width(w))
    }

    /// The lane width the legalizer splits over-wide integers into.
    pub fn legal_lane_width(&self) -> u32 {
        self.max_legal_int_width
    }
}

/// Per-rule enable bits. Default state for every rule is active; turning one
/// off is strictly a debugging aid and never required for correctness.
#[derive(Copy, Clone, Debug)]
pub struct PassFlags {
    pub canonicalize_bool_not: bool,
    pub strength_reduce: bool,
    pub hoist_casts: bool,
    pub match_bfrev: bool,
    pub match_uaddc: bool,
    pub match_dp4a: bool,
    pub narrow_i64: bool,
    pub shrink_allocas: bool,
    pub merge_urb_writes: bool,
    pub legalize_int_widths: bool,
}

impl Default for PassFlags {
    fn default() -> Self {
        PassFlags {
            canonicalize_bool_not: true,
            strength_reduce: true,
            hoist_casts: true,
            match_bfrev: true,
            match_uaddc: true,
            match_dp4a: true,
            narrow_i64: true,
            shrink_allocas: true,
            merge_urb_writes: true,
            legalize_int_widths: true,
        }
    }
}
