//! Holding ledger: the append-only credit/debit journal per (member, track, tier).
//!
//! A balance is always recomputed from the full row set; there is no cached
//! running total to drift. Rows are built here and written through
//! [`CascadeStore::commit`](crate::store::CascadeStore::commit), which also
//! refuses any debit larger than the balance.

use crate::error::LedgerError;
use crate::store::CascadeStore;
use crate::types::{Amount, Direction, HoldingEntry, MemberId, Stamp, TierKey};

/// Net position of a set of rows in minor units. Negative only if the rows
/// are inconsistent.
pub fn net_units(entries: &[HoldingEntry]) -> i128 {
    entries
        .iter()
        .map(|e| match e.direction {
            Direction::Credit => i128::from(e.amount.units()),
            Direction::Debit => -i128::from(e.amount.units()),
        })
        .sum()
}

/// `Σcredits − Σdebits` for one key's rows.
pub fn balance_of(key: &TierKey, entries: &[HoldingEntry]) -> Result<Amount, LedgerError> {
    let net = net_units(entries);
    if net < 0 {
        return Err(LedgerError::Inconsistent {
            member: key.member,
            track: key.track,
            tier: key.tier,
        });
    }
    u64::try_from(net).map(Amount).map_err(|_| LedgerError::Overflow)
}

/// Build a credit row funding `key`'s tier, originating from `origin`'s unlock.
pub fn credit_entry(
    key: TierKey,
    amount: Amount,
    origin: MemberId,
    stamp: Stamp,
) -> Result<HoldingEntry, LedgerError> {
    entry(key, Direction::Credit, amount, origin, stamp)
}

/// Build a debit row. The caller checks the balance first; the store
/// re-checks at commit.
pub fn debit_entry(key: TierKey, amount: Amount, stamp: Stamp) -> Result<HoldingEntry, LedgerError> {
    entry(key, Direction::Debit, amount, key.member, stamp)
}

fn entry(
    key: TierKey,
    direction: Direction,
    amount: Amount,
    origin: MemberId,
    stamp: Stamp,
) -> Result<HoldingEntry, LedgerError> {
    if amount.is_zero() {
        return Err(LedgerError::NonPositiveAmount);
    }
    Ok(HoldingEntry {
        member_id: key.member,
        track: key.track,
        tier_no: key.tier,
        direction,
        amount,
        origin_member_id: origin,
        created_at: stamp.created_at,
        seq: stamp.seq,
    })
}

/// Credit and debit sums for one key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    pub credits: Amount,
    pub debits: Amount,
}

/// Read view over a store's ledger rows.
pub struct HoldingLedger<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: CascadeStore + ?Sized> HoldingLedger<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Current balance, recomputed from every row for the key.
    pub fn balance(&self, key: &TierKey) -> Result<Amount, LedgerError> {
        let entries = self.store.holding_entries(key)?;
        balance_of(key, &entries)
    }

    /// Rows for the key in write order.
    pub fn history(&self, key: &TierKey) -> Result<Vec<HoldingEntry>, LedgerError> {
        Ok(self.store.holding_entries(key)?)
    }

    pub fn totals(&self, key: &TierKey) -> Result<LedgerTotals, LedgerError> {
        let mut totals = LedgerTotals::default();
        for e in self.store.holding_entries(key)? {
            let slot = match e.direction {
                Direction::Credit => &mut totals.credits,
                Direction::Debit => &mut totals.debits,
            };
            *slot = slot.checked_add(e.amount).ok_or(LedgerError::Overflow)?;
        }
        Ok(totals)
    }
}
