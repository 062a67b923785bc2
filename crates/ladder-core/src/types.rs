//! Core records: placements, activations, holding-ledger entries.
//!
//! All monetary values are in minor units (1 whole unit = 10^8 minor units).
//! Timestamps are unix milliseconds; `seq` is the store-assigned write order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{UNIT, UNIT_DECIMALS};
use crate::error::AmountError;

/// A numbered, priced unlock level within a track.
pub type TierNo = u32;

/// Opaque member identifier. Members are owned externally.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct MemberId(pub u64);

impl MemberId {
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// One independent compensation scheme.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A money amount in minor units.
///
/// Arithmetic is checked.
///
/// # Examples
///
/// ```
/// use ladder_core::types::Amount;
/// let fee: Amount = "0.0044".parse().unwrap();
/// assert_eq!(fee.units(), 440_000);
/// assert_eq!(fee.to_string(), "0.0044");
/// ```
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    pub fn from_units(units: u64) -> Self {
        Self(units)
    }

    pub fn units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Parse a decimal string with up to eight fractional digits.
    pub fn from_decimal(s: &str) -> Result<Self, AmountError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::Empty);
        }
        if let Some(c) = whole.chars().chain(frac.chars()).find(|c| !c.is_ascii_digit()) {
            return Err(AmountError::InvalidCharacter(c));
        }
        if frac.len() > UNIT_DECIMALS {
            return Err(AmountError::TooPrecise(frac.len()));
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole.parse::<u64>().map_err(|_| AmountError::Overflow)?
        };
        let mut frac_units = 0u64;
        for (i, c) in frac.chars().enumerate() {
            let digit = u64::from(c as u8 - b'0');
            frac_units += digit * 10u64.pow((UNIT_DECIMALS - 1 - i) as u32);
        }

        whole_units
            .checked_mul(UNIT)
            .and_then(|w| w.checked_add(frac_units))
            .map(Self)
            .ok_or(AmountError::Overflow)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNIT;
        let frac = self.0 % UNIT;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:0width$}", width = UNIT_DECIMALS);
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

/// Child position under a tree parent.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Scan order for open positions: left before right.
    pub const ORDER: [Side; 2] = [Side::Left, Side::Right];
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

/// Identifies one placement tree: a (track, tier) pair.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct TreeKey {
    pub track: TrackId,
    pub tier: TierNo,
}

impl fmt::Display for TreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.track, self.tier)
    }
}

/// Identifies a member within one placement tree. Placements, activations,
/// and holding balances are all keyed by this triple.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct TierKey {
    pub member: MemberId,
    pub track: TrackId,
    pub tier: TierNo,
}

impl TierKey {
    pub fn new(member: MemberId, track: TrackId, tier: TierNo) -> Self {
        Self { member, track, tier }
    }

    pub fn tree(&self) -> TreeKey {
        TreeKey { track: self.track, tier: self.tier }
    }

    /// The same member in another tier of the same track.
    pub fn with_tier(&self, tier: TierNo) -> Self {
        Self { tier, ..*self }
    }
}

impl fmt::Display for TierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.member, self.track, self.tier)
    }
}

/// Creation stamp: wall-clock millis plus the store's monotonic sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp {
    pub created_at: i64,
    pub seq: u64,
}

/// A member's position in one (track, tier) binary tree.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Placement {
    pub member_id: MemberId,
    pub track: TrackId,
    pub tier_no: TierNo,
    /// The member who invited this member. Independent of tree structure.
    pub referrer_id: Option<MemberId>,
    /// The node this member is attached under. `None` for the tree root.
    pub tree_parent_id: Option<MemberId>,
    /// `None` for the tree root.
    pub side: Option<Side>,
    /// Distance from the tree root.
    pub depth: u32,
    /// Number of occupied child slots (0..=2).
    pub filled: u8,
    pub created_at: i64,
    pub seq: u64,
}

impl Placement {
    pub fn key(&self) -> TierKey {
        TierKey::new(self.member_id, self.track, self.tier_no)
    }

    pub fn tree(&self) -> TreeKey {
        TreeKey { track: self.track, tier: self.tier_no }
    }

    pub fn is_root(&self) -> bool {
        self.tree_parent_id.is_none()
    }

    /// Creation order used by the eligibility check.
    pub fn order_key(&self) -> Stamp {
        Stamp { created_at: self.created_at, seq: self.seq }
    }

    /// Whether placement went somewhere other than directly under the referrer.
    pub fn is_overflow(&self) -> bool {
        self.referrer_id.is_some() && self.referrer_id != self.tree_parent_id
    }
}

/// Occupants of a parent's two child slots.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Children {
    pub left: Option<MemberId>,
    pub right: Option<MemberId>,
}

impl Children {
    pub fn get(&self, side: Side) -> Option<MemberId> {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    pub fn set(&mut self, side: Side, member: MemberId) {
        match side {
            Side::Left => self.left = Some(member),
            Side::Right => self.right = Some(member),
        }
    }

    /// First open side, left before right.
    pub fn first_open(&self) -> Option<Side> {
        Side::ORDER.into_iter().find(|side| self.get(*side).is_none())
    }

    /// Occupants in left-to-right order.
    pub fn occupants(&self) -> impl Iterator<Item = MemberId> {
        self.left.into_iter().chain(self.right)
    }

    pub fn count(&self) -> u8 {
        self.occupants().count() as u8
    }
}

/// How an activation was paid for.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum ActivationSource {
    DirectPayment,
    HoldingFunds,
}

impl fmt::Display for ActivationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectPayment => f.write_str("direct-payment"),
            Self::HoldingFunds => f.write_str("holding-funds"),
        }
    }
}

/// Why a fee went to the external pool.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum RouteReason {
    /// The member is too close to its tree root for the tier's distance.
    NoAncestor,
    /// The member is not among the first two at the required depth.
    NotEligible,
    /// The ancestor's next tier is not offered, so there is nothing to fund.
    NoNextTier,
    /// The route could not be decided; the fee is held for the pool.
    RoutingFailed,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAncestor => f.write_str("no-ancestor"),
            Self::NotEligible => f.write_str("not-eligible"),
            Self::NoNextTier => f.write_str("no-next-tier"),
            Self::RoutingFailed => f.write_str("routing-failed"),
        }
    }
}

/// Why a fee was paid out directly.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum PayoutReason {
    /// Entry-tier fee paid to the inviting member.
    Referral,
    /// No referrer or ancestor; paid to the configured fallback account.
    FallbackAccount,
}

impl fmt::Display for PayoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Referral => f.write_str("referral"),
            Self::FallbackAccount => f.write_str("fallback-account"),
        }
    }
}

/// Where an activation's fee was routed.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum FeeRoute {
    /// Credited to `ancestor`'s holding account for `funds_tier`.
    Holding { ancestor: MemberId, funds_tier: TierNo },
    /// Paid out directly through the direct-credit rail.
    Direct { recipient: MemberId, reason: PayoutReason },
    /// Forwarded to the external pool mechanism.
    Pool { reason: RouteReason },
}

impl FeeRoute {
    /// Whether fulfilling this route needs an external call.
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Holding { .. })
    }
}

impl fmt::Display for FeeRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Holding { ancestor, funds_tier } => write!(f, "holding:{ancestor}/{funds_tier}"),
            Self::Direct { recipient, reason } => write!(f, "direct:{recipient}:{reason}"),
            Self::Pool { reason } => write!(f, "pool:{reason}"),
        }
    }
}

/// A completed tier unlock. At most one per (member, track, tier).
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Activation {
    pub member_id: MemberId,
    pub track: TrackId,
    pub tier_no: TierNo,
    pub fee_paid: Amount,
    pub is_auto_triggered: bool,
    pub source: ActivationSource,
    pub route: FeeRoute,
    pub completed_at: i64,
}

impl Activation {
    pub fn key(&self) -> TierKey {
        TierKey::new(self.member_id, self.track, self.tier_no)
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum Direction {
    Credit,
    Debit,
}

/// One immutable holding-ledger line.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct HoldingEntry {
    pub member_id: MemberId,
    pub track: TrackId,
    /// The tier being funded.
    pub tier_no: TierNo,
    pub direction: Direction,
    pub amount: Amount,
    /// The member whose unlock produced this line. Debits name the holder.
    pub origin_member_id: MemberId,
    pub created_at: i64,
    pub seq: u64,
}

impl HoldingEntry {
    pub fn key(&self) -> TierKey {
        TierKey::new(self.member_id, self.track, self.tier_no)
    }
}

/// What an unresolved event is waiting on.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum UnresolvedKind {
    /// A committed activation whose fee could not be forwarded to the pool.
    PoolForward { reason: RouteReason },
    /// A committed activation whose fee could not be paid out directly.
    DirectPayout { recipient: MemberId, reason: PayoutReason },
    /// A paid unlock that was not run. The event amount is the fee.
    PendingUnlock,
    /// An auto-unlock check that could not be evaluated.
    PendingAutoUnlock,
}

/// A money movement surfaced for manual reconciliation.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UnresolvedEvent {
    pub id: u64,
    pub member_id: MemberId,
    pub track: TrackId,
    pub tier_no: TierNo,
    pub amount: Amount,
    pub kind: UnresolvedKind,
    pub reference: String,
    pub detail: String,
    pub raised_at: i64,
}

impl UnresolvedEvent {
    pub fn key(&self) -> TierKey {
        TierKey::new(self.member_id, self.track, self.tier_no)
    }
}
