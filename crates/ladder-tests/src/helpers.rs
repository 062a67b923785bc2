//! Shared test helpers: recording gateways and engine builders.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use ladder_core::catalog::StaticCatalog;
use ladder_core::error::RouteError;
use ladder_core::store::{CascadeStore, MemoryStore};
use ladder_core::traits::{DirectCredit, PoolGateway, Receipt};
use ladder_core::types::{Amount, MemberId, PayoutReason, RouteReason, TierNo, TrackId};
use ladder_engine::config::RetryPolicy;
use ladder_engine::{CascadeEngine, EngineConfig};

pub const TRACK: TrackId = TrackId(1);

/// Parse a decimal fee, e.g. `"0.0044"`.
pub fn fee(s: &str) -> Amount {
    s.parse().unwrap()
}

/// One pool forward as seen by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forward {
    pub member: MemberId,
    pub amount: Amount,
    pub tier: TierNo,
    pub reason: RouteReason,
    pub reference: String,
}

/// Pool gateway that records forwards and can be switched off.
#[derive(Default)]
pub struct RecordingPool {
    pub forwards: Mutex<Vec<Forward>>,
    down: AtomicBool,
}

impl RecordingPool {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.forwards.lock().iter().map(|f| f.amount.units()).sum()
    }
}

impl PoolGateway for RecordingPool {
    fn forward(
        &self,
        member: MemberId,
        amount: Amount,
        _track: TrackId,
        tier: TierNo,
        reason: RouteReason,
        reference: &str,
    ) -> Result<Receipt, RouteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RouteError::Unavailable("pool offline".into()));
        }
        self.forwards.lock().push(Forward {
            member,
            amount,
            tier,
            reason,
            reference: reference.to_string(),
        });
        Ok(Receipt::new(format!("pool-{reference}")))
    }
}

/// Direct payout rail that records payouts and can be switched off.
#[derive(Default)]
pub struct RecordingRail {
    pub payouts: Mutex<Vec<(MemberId, Amount, PayoutReason)>>,
    down: AtomicBool,
}

impl RecordingRail {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.payouts.lock().iter().map(|(_, a, _)| a.units()).sum()
    }
}

impl DirectCredit for RecordingRail {
    fn pay(
        &self,
        recipient: MemberId,
        amount: Amount,
        _currency: &str,
        reason: PayoutReason,
        reference: &str,
    ) -> Result<Receipt, RouteError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RouteError::Rejected("wallet frozen".into()));
        }
        self.payouts.lock().push((recipient, amount, reason));
        Ok(Receipt::new(format!("pay-{reference}")))
    }
}

/// An engine plus handles on its gateways.
pub struct Harness<S> {
    pub engine: Arc<CascadeEngine<S>>,
    pub pool: Arc<RecordingPool>,
    pub rail: Arc<RecordingRail>,
}

/// Defaults with retries that never sleep.
pub fn test_config() -> EngineConfig {
    EngineConfig { retry: RetryPolicy::immediate(3), ..EngineConfig::default() }
}

/// Tier 1 at 0.0022, then doubling: 0.0044, 0.0088, 0.0176.
pub fn doubling_catalog() -> StaticCatalog {
    StaticCatalog::new().with_track(
        TRACK,
        &[fee("0.0022"), fee("0.0044"), fee("0.0088"), fee("0.0176")],
    )
}

/// Every tier from 1 to `tiers` at the same price.
pub fn flat_catalog(tiers: u32, price: Amount) -> StaticCatalog {
    (1..=tiers).fold(StaticCatalog::new(), |c, t| c.with_price(TRACK, t, price))
}

/// Engine over `store` with a clock that ticks one millisecond per read.
pub fn harness_with<S: CascadeStore>(
    store: S,
    catalog: StaticCatalog,
    config: EngineConfig,
) -> Harness<S> {
    let pool = Arc::new(RecordingPool::default());
    let rail = Arc::new(RecordingRail::default());
    let ticks = AtomicI64::new(1_700_000_000_000);
    let engine = CascadeEngine::with_clock(
        Arc::new(RwLock::new(store)),
        Arc::new(catalog),
        pool.clone(),
        rail.clone(),
        config,
        move || ticks.fetch_add(1, Ordering::SeqCst),
    )
    .unwrap();
    Harness { engine: Arc::new(engine), pool, rail }
}

pub fn memory_harness(catalog: StaticCatalog) -> Harness<MemoryStore> {
    harness_with(MemoryStore::new(), catalog, test_config())
}

/// Register `(member, referrer)` pairs in order.
pub fn register_all<S: CascadeStore>(engine: &CascadeEngine<S>, members: &[(u64, Option<u64>)]) {
    for &(m, r) in members {
        engine.register(MemberId(m), r.map(MemberId), TRACK).unwrap();
    }
}

/// Sum of holding balances for `members` over tiers 1..=`max_tier`.
pub fn total_held<S: CascadeStore>(engine: &CascadeEngine<S>, members: &[u64], max_tier: TierNo) -> u64 {
    members
        .iter()
        .flat_map(|&m| (1..=max_tier).map(move |t| (m, t)))
        .map(|(m, t)| engine.balance(MemberId(m), TRACK, t).unwrap().units())
        .sum()
}
