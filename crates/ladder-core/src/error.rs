//! Error types for the Ladder cascade.
//!
//! Domain outcomes (no ancestor, not eligible, insufficient holding, already
//! activated) are values, not errors. Only the conditions below escalate.
use thiserror::Error;

use crate::types::{MemberId, Side, TierNo, TrackId};

/// Commit-time validation failures. The write set was not applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("member {member} already placed in track {track} tier {tier}")] AlreadyPlaced { member: MemberId, track: TrackId, tier: TierNo },
    #[error("{side} slot under {parent} already taken in track {track} tier {tier}")] SlotTaken { parent: MemberId, side: Side, track: TrackId, tier: TierNo },
    #[error("tree root already set for track {track} tier {tier}")] RootTaken { track: TrackId, tier: TierNo },
    #[error("parent {parent} is not placed in track {track} tier {tier}")] MissingParent { parent: MemberId, track: TrackId, tier: TierNo },
    #[error("member {member} already activated track {track} tier {tier}")] AlreadyActivated { member: MemberId, track: TrackId, tier: TierNo },
    #[error("debit of {need} exceeds holding {have} for {member} track {track} tier {tier}")] Overdraft { member: MemberId, track: TrackId, tier: TierNo, have: u64, need: u64 },
    #[error("unresolved event not found: {0}")] UnknownEvent(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("write conflict: {0}")] Conflict(#[from] Conflict),
    #[error("transient storage failure: {0}")] Transient(String),
    #[error("storage backend: {0}")] Backend(String),
    #[error("codec: {0}")] Codec(String),
}

impl StoreError {
    /// Whether the failure may clear on retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the failure came from commit-time validation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no open position within {max_depth} levels below {start}")] Exhausted { start: MemberId, max_depth: u32 },
    #[error("member {member} not placed in track {track} tier {tier}")] NotPlaced { member: MemberId, track: TrackId, tier: TierNo },
    #[error("member {member} has no entry placement in track {track}")] NotRegistered { member: MemberId, track: TrackId },
    #[error("member {0} cannot refer itself")] SelfReferral(MemberId),
    #[error(transparent)] Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger amounts must be positive")] NonPositiveAmount,
    #[error("ledger arithmetic overflow")] Overflow,
    #[error("debits exceed credits for {member} track {track} tier {tier}")] Inconsistent { member: MemberId, track: TrackId, tier: TierNo },
    #[error(transparent)] Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")] Unavailable(String),
}

/// Failure reported by an external fee destination (pool or direct payout).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("gateway rejected: {0}")] Rejected(String),
    #[error("gateway unavailable: {0}")] Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")] Empty,
    #[error("invalid character in amount: {0}")] InvalidCharacter(char),
    #[error("too many fractional digits: {0}")] TooPrecise(usize),
    #[error("amount overflow")] Overflow,
}
