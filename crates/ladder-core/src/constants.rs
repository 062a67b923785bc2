//! Program constants. All monetary values in minor units (1 whole unit = 10^8 minor units).

use crate::types::TierNo;

/// Minor units per whole currency unit.
pub const UNIT: u64 = 100_000_000;

/// Number of fractional digits carried by [`UNIT`].
pub const UNIT_DECIMALS: usize = 8;

/// The program's entry tier. Its fee is paid straight to the referrer.
pub const ENTRY_TIER: TierNo = 1;

/// Default bound on the overflow search, in levels below the search start.
pub const DEFAULT_MAX_SCAN_DEPTH: u32 = 32;

/// Default bound on the number of steps a single cascade may run.
pub const DEFAULT_MAX_CASCADE_STEPS: usize = 4_096;

/// Default number of re-evaluations after a commit-time conflict.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 8;

/// Default currency code passed to direct payouts.
pub const DEFAULT_CURRENCY: &str = "USDT";

/// Number of earliest placements at a level that qualify as "first or second".
pub const ELIGIBLE_PER_LEVEL: usize = 2;

/// Upper bound on referrer-chain hops when looking for a placed ancestor
/// in a higher tier's tree.
pub const MAX_REFERRER_HOPS: usize = 1_024;
