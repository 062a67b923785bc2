//! Cascade Engine: the unlock state machine.
//!
//! An unlock request enters as the first step of a work queue. Each step
//! reads a consistent snapshot, plans a single [`WriteSet`] (debit, placement,
//! activation, and the fee credit when it goes to an ancestor), and commits
//! it. A credit to an ancestor queues an auto-unlock check for that
//! ancestor's tier, which is the recursion of the cascade, unrolled.
//!
//! Per step:
//!
//! ```text
//! Requested ──► AlreadyActivated | InsufficientHolding | TierNotOffered   (no-op)
//!     │
//!     └──► Routed(holding) ──► commit ──► queue AutoUnlock(ancestor, N+1)
//!     └──► Routed(pool | direct) ──► commit ──► external call
//! ```
//!
//! External calls happen after the commit. A failure is journaled as an
//! unresolved event and never undoes the member's activation. So is a route
//! that cannot be decided: the fee is journaled for the pool and the
//! activation still commits.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, error, info, warn};

use ladder_core::constants::ENTRY_TIER;
use ladder_core::error::{Conflict, PlacementError, StoreError};
use ladder_core::ledger::{credit_entry, debit_entry, HoldingLedger};
use ladder_core::placement::{PlacementStore, PlannedPlacement};
use ladder_core::resolver::AncestorResolver;
use ladder_core::store::{CascadeStore, WriteSet};
use ladder_core::traits::{DirectCredit, PoolGateway, TierCatalog};
use ladder_core::types::{
    Activation, ActivationSource, Amount, FeeRoute, HoldingEntry, MemberId, Placement,
    RouteReason, Stamp, TierKey, TierNo, TrackId, TreeKey, UnresolvedEvent, UnresolvedKind,
};

use crate::config::EngineConfig;
use crate::error::{CascadeError, ConfigError};
use crate::locks::KeyLocks;
use crate::report::{CascadeReport, RouteReceipt, StepOutcome};
use crate::retry::{Retrier, Retryable};
use crate::routing::{self, Router};

/// One unit of work in the cascade queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadeStep {
    /// A member pays `fee` directly to unlock a tier.
    Unlock { key: TierKey, fee: Amount },
    /// Unlock from holding funds if the balance covers the tier price.
    AutoUnlock { key: TierKey },
}

impl CascadeStep {
    pub fn key(&self) -> TierKey {
        match *self {
            Self::Unlock { key, .. } | Self::AutoUnlock { key } => key,
        }
    }

    /// The step a parked journal event stands for.
    pub fn parked(event: &UnresolvedEvent) -> Option<Self> {
        let key = event.key();
        match event.kind {
            UnresolvedKind::PendingUnlock => Some(Self::Unlock { key, fee: event.amount }),
            UnresolvedKind::PendingAutoUnlock => Some(Self::AutoUnlock { key }),
            UnresolvedKind::PoolForward { .. } | UnresolvedKind::DirectPayout { .. } => None,
        }
    }
}

/// A planned step: what to commit and what to do after.
struct StepPlan {
    outcome: StepOutcome,
    writes: Option<WriteSet>,
    /// External delivery after commit.
    dispatch: Option<Dispatch>,
    /// Holding key to check for auto-unlock after commit.
    follow_up: Option<TierKey>,
}

impl StepPlan {
    fn noop(outcome: StepOutcome) -> Self {
        Self { outcome, writes: None, dispatch: None, follow_up: None }
    }
}

struct Dispatch {
    key: TierKey,
    amount: Amount,
    route: FeeRoute,
    reference: String,
    /// Journal the route instead of calling the gateway.
    hold: Option<String>,
}

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

/// Drives unlock requests through the cascade.
///
/// Cheap to share: wrap in an `Arc` and call from any number of threads.
pub struct CascadeEngine<S> {
    store: Arc<RwLock<S>>,
    catalog: Arc<dyn TierCatalog>,
    pool: Arc<dyn PoolGateway>,
    direct: Arc<dyn DirectCredit>,
    config: EngineConfig,
    /// Held per event id while a journaled event is replayed.
    replays: KeyLocks<u64>,
    clock: Clock,
}

impl<S: CascadeStore> CascadeEngine<S> {
    pub fn new(
        store: Arc<RwLock<S>>,
        catalog: Arc<dyn TierCatalog>,
        pool: Arc<dyn PoolGateway>,
        direct: Arc<dyn DirectCredit>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(store, catalog, pool, direct, config, || {
            chrono::Utc::now().timestamp_millis()
        })
    }

    /// Create an engine with a custom clock (unix millis), for tests.
    pub fn with_clock(
        store: Arc<RwLock<S>>,
        catalog: Arc<dyn TierCatalog>,
        pool: Arc<dyn PoolGateway>,
        direct: Arc<dyn DirectCredit>,
        config: EngineConfig,
        clock: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            catalog,
            pool,
            direct,
            config,
            replays: KeyLocks::new(),
            clock: Box::new(clock),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> Arc<RwLock<S>> {
        Arc::clone(&self.store)
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Place a member in the track's entry-tier tree. Idempotent.
    pub fn register(
        &self,
        member: MemberId,
        referrer: Option<MemberId>,
        track: TrackId,
    ) -> Result<Placement, CascadeError> {
        let tree = TreeKey { track, tier: ENTRY_TIER };
        let key = TierKey::new(member, track, ENTRY_TIER);
        let placement = Retrier::new(&self.config.retry, self.config.max_conflict_retries).run("register", || {
            let mut store = self.store.write();
            ladder_core::placement::insert(&mut *store, member, referrer, tree, self.now(), self.config.max_scan_depth)
                .map_err(CascadeError::from)
        })?;
        info!(%key, parent = ?placement.tree_parent_id, side = ?placement.side, depth = placement.depth, "member registered");
        Ok(placement)
    }

    /// A member pays `fee` to unlock `tier`.
    ///
    /// The tier must be offered and the fee positive. An already unlocked
    /// tier reports [`StepOutcome::AlreadyActivated`] and writes nothing.
    pub fn request_unlock(
        &self,
        member: MemberId,
        track: TrackId,
        tier: TierNo,
        fee: Amount,
    ) -> Result<CascadeReport, CascadeError> {
        if fee.is_zero() {
            return Err(CascadeError::NonPositiveFee);
        }
        if !self.catalog.is_offered(track, tier)? {
            return Err(CascadeError::TierNotOffered { track, tier });
        }
        let key = TierKey::new(member, track, tier);
        debug!(%key, %fee, "unlock requested");
        self.run(CascadeStep::Unlock { key, fee })
    }

    /// Unlock from holding funds if the balance covers the price.
    pub fn try_auto_unlock(
        &self,
        member: MemberId,
        track: TrackId,
        tier: TierNo,
    ) -> Result<CascadeReport, CascadeError> {
        self.run(CascadeStep::AutoUnlock { key: TierKey::new(member, track, tier) })
    }

    /// Re-drive a journaled event: deliver a failed external route again, or
    /// re-run a parked unlock. The event is settled on success.
    ///
    /// Replays of one event are serialized, so a route is delivered at most
    /// once per settlement.
    pub fn retry_unresolved(&self, id: u64) -> Result<CascadeReport, CascadeError> {
        let result = self.replays.with_lock(&id, || self.replay(id));
        self.replays.release(&id);
        result
    }

    fn replay(&self, id: u64) -> Result<CascadeReport, CascadeError> {
        let event = self
            .store
            .read()
            .unresolved_event(id)?
            .ok_or(CascadeError::UnknownEvent(id))?;
        let key = event.key();

        let mut report = match routing::route_of(&event.kind) {
            Some(route) => {
                let receipt = routing::dispatch(
                    self.pool.as_ref(),
                    self.direct.as_ref(),
                    &self.config.currency,
                    &key,
                    event.amount,
                    &route,
                    &event.reference,
                )?;
                info!(event = id, %key, %route, receipt = %receipt.id, "unresolved route delivered");
                CascadeReport {
                    receipts: vec![RouteReceipt {
                        key,
                        route,
                        amount: event.amount,
                        reference: event.reference.clone(),
                        receipt_id: receipt.id,
                    }],
                    ..CascadeReport::default()
                }
            }
            None => match CascadeStep::parked(&event) {
                Some(step) => self.run(step)?,
                None => CascadeReport::default(),
            },
        };

        self.resolve(id)?;
        report.resolved.push(id);
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn balance(&self, member: MemberId, track: TrackId, tier: TierNo) -> Result<Amount, CascadeError> {
        let store = self.store.read();
        Ok(HoldingLedger::new(&*store).balance(&TierKey::new(member, track, tier))?)
    }

    pub fn ledger_history(
        &self,
        member: MemberId,
        track: TrackId,
        tier: TierNo,
    ) -> Result<Vec<HoldingEntry>, CascadeError> {
        let store = self.store.read();
        Ok(HoldingLedger::new(&*store).history(&TierKey::new(member, track, tier))?)
    }

    pub fn activation(&self, member: MemberId, track: TrackId, tier: TierNo) -> Result<Option<Activation>, CascadeError> {
        Ok(self.store.read().activation(&TierKey::new(member, track, tier))?)
    }

    pub fn placement(&self, member: MemberId, track: TrackId, tier: TierNo) -> Result<Option<Placement>, CascadeError> {
        Ok(self.store.read().placement(&TierKey::new(member, track, tier))?)
    }

    /// The member's ancestor `tier` steps up the tier's tree.
    pub fn upline(&self, member: MemberId, track: TrackId, tier: TierNo) -> Result<Option<Placement>, CascadeError> {
        let store = self.store.read();
        let resolver = AncestorResolver::new(&*store, self.config.max_scan_depth);
        Ok(resolver.nth_upline(&TierKey::new(member, track, tier))?)
    }

    /// Placements exactly `depth` levels below a member in a tier's tree.
    pub fn subtree_level(
        &self,
        member: MemberId,
        track: TrackId,
        tier: TierNo,
        depth: u32,
    ) -> Result<Vec<Placement>, CascadeError> {
        let store = self.store.read();
        let placements = PlacementStore::new(&*store, self.config.max_scan_depth);
        let ancestor = placements.require(&TierKey::new(member, track, tier))?;
        Ok(placements.level_below(&ancestor, depth)?)
    }

    /// Events waiting for manual reconciliation, oldest first.
    pub fn reconcile(&self) -> Result<Vec<UnresolvedEvent>, CascadeError> {
        Ok(self.store.read().unresolved_events()?)
    }

    // ------------------------------------------------------------------
    // Work queue
    // ------------------------------------------------------------------

    fn run(&self, first: CascadeStep) -> Result<CascadeReport, CascadeError> {
        let mut report = CascadeReport::default();
        let mut queue = VecDeque::from([first]);
        let mut steps = 0usize;

        while let Some(step) = queue.pop_front() {
            if steps >= self.config.max_cascade_steps {
                queue.push_front(step);
                warn!(steps, remaining = queue.len(), "cascade step budget exhausted");
                for parked in queue.drain(..) {
                    let event = self.raise_pending(&parked, "cascade step budget exhausted")?;
                    report.unresolved.push(event);
                }
                break;
            }
            steps += 1;

            let plan = match self.execute(&step) {
                Ok(plan) => plan,
                Err(err) if steps == 1 => return Err(err),
                Err(err) => {
                    error!(key = %step.key(), error = %err, "cascade step failed");
                    let event = self.raise_pending(&step, &err.to_string())?;
                    report.unresolved.push(event);
                    continue;
                }
            };

            if let Some(dispatch) = plan.dispatch {
                self.deliver(dispatch, &mut report)?;
            }
            if let Some(next) = plan.follow_up {
                queue.push_back(CascadeStep::AutoUnlock { key: next });
            }
            report.steps.push(plan.outcome);
        }

        Ok(report)
    }

    /// Plan and commit one step, with retries.
    fn execute(&self, step: &CascadeStep) -> Result<StepPlan, CascadeError> {
        let mut retrier = Retrier::new(&self.config.retry, self.config.max_conflict_retries);
        retrier.run("cascade step", || {
            // Upgradable: readers proceed, but no other step can commit
            // between this plan and its commit.
            let store = self.store.upgradable_read();
            let mut plan = self.plan(&*store, step)?;
            if let Some(writes) = plan.writes.take() {
                RwLockUpgradableReadGuard::upgrade(store).commit(writes)?;
            }
            if let StepOutcome::Activated { key, fee, source, auto, route } = &plan.outcome {
                info!(%key, %fee, %source, auto, %route, "tier activated");
            }
            Ok(plan)
        })
    }

    fn plan(&self, store: &S, step: &CascadeStep) -> Result<StepPlan, CascadeError> {
        let key = step.key();
        if store.is_activated(&key)? {
            debug!(%key, "already activated");
            return Ok(StepPlan::noop(StepOutcome::AlreadyActivated { key }));
        }

        let mut writes = WriteSet::new();
        let (fee, source, auto) = match *step {
            CascadeStep::Unlock { fee, .. } => (fee, ActivationSource::DirectPayment, false),
            CascadeStep::AutoUnlock { .. } => {
                let Some(cost) = self.catalog.price(key.track, key.tier)? else {
                    debug!(%key, "tier not offered");
                    return Ok(StepPlan::noop(StepOutcome::TierNotOffered { key }));
                };
                let have = HoldingLedger::new(store).balance(&key)?;
                if have < cost {
                    debug!(%key, %have, need = %cost, "holding below tier price");
                    return Ok(StepPlan::noop(StepOutcome::InsufficientHolding { key, have, need: cost }));
                }
                writes.append(debit_entry(key, cost, self.stamp(store)?)?);
                (cost, ActivationSource::HoldingFunds, true)
            }
        };

        let (placement, pending) = self.ensure_placement(store, &key, &mut writes)?;
        let mut hold = None;
        let route = match Router::new(store, self.catalog.as_ref(), &self.config).route(&placement, pending) {
            Ok(route) => route,
            Err(err) if err.is_transient() || err.is_conflict() => return Err(err),
            Err(err) => {
                warn!(%key, error = %err, "fee route undecided, holding for pool");
                hold = Some(err.to_string());
                FeeRoute::Pool { reason: RouteReason::RoutingFailed }
            }
        };

        writes.activate(Activation {
            member_id: key.member,
            track: key.track,
            tier_no: key.tier,
            fee_paid: fee,
            is_auto_triggered: auto,
            source,
            route,
            completed_at: self.now(),
        });

        let mut follow_up = None;
        let mut dispatch = None;
        match route {
            FeeRoute::Holding { ancestor, funds_tier } => {
                let target = TierKey::new(ancestor, key.track, funds_tier);
                writes.append(credit_entry(target, fee, key.member, self.stamp(store)?)?);
                follow_up = Some(target);
            }
            FeeRoute::Pool { .. } | FeeRoute::Direct { .. } => {
                dispatch = Some(Dispatch {
                    key,
                    amount: fee,
                    route,
                    reference: routing::reference(&key, &source.to_string()),
                    hold,
                });
            }
        }

        Ok(StepPlan {
            outcome: StepOutcome::Activated { key, fee, source, auto, route },
            writes: Some(writes),
            dispatch,
            follow_up,
        })
    }

    /// The member's placement in the key's tree, planning one if missing.
    /// Returns whether the placement is pending in `writes`.
    fn ensure_placement(
        &self,
        store: &S,
        key: &TierKey,
        writes: &mut WriteSet,
    ) -> Result<(Placement, bool), CascadeError> {
        let placements = PlacementStore::new(store, self.config.max_scan_depth);
        if let Some(existing) = placements.get(key)? {
            return Ok((existing, false));
        }
        let entry = placements
            .get(&key.with_tier(ENTRY_TIER))?
            .ok_or(PlacementError::NotRegistered { member: key.member, track: key.track })?;
        let stamp = self.stamp(store)?;
        match placements.plan_insert(key.member, entry.referrer_id, key.tree(), stamp)? {
            PlannedPlacement::Existing(p) => Ok((p, false)),
            PlannedPlacement::New(p) => {
                debug!(%key, parent = ?p.tree_parent_id, side = ?p.side, depth = p.depth, "placement planned");
                writes.place(p.clone());
                Ok((p, true))
            }
        }
    }

    /// Deliver an external route; journal it on failure.
    fn deliver(&self, dispatch: Dispatch, report: &mut CascadeReport) -> Result<(), CascadeError> {
        let Dispatch { key, amount, route, reference, hold } = dispatch;
        if let Some(detail) = hold {
            if let Some(kind) = routing::unresolved_kind(&route) {
                report.unresolved.push(self.raise(key, amount, kind, reference, detail)?);
            }
            return Ok(());
        }
        let result = routing::dispatch(
            self.pool.as_ref(),
            self.direct.as_ref(),
            &self.config.currency,
            &key,
            amount,
            &route,
            &reference,
        );
        match result {
            Ok(receipt) => {
                debug!(%key, %route, receipt = %receipt.id, "fee delivered");
                report.receipts.push(RouteReceipt { key, route, amount, reference, receipt_id: receipt.id });
            }
            Err(err) => {
                warn!(%key, %route, error = %err, "fee routing failed");
                if let Some(kind) = routing::unresolved_kind(&route) {
                    let event = self.raise(key, amount, kind, reference, err.to_string())?;
                    report.unresolved.push(event);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation journal
    // ------------------------------------------------------------------

    fn raise_pending(&self, step: &CascadeStep, detail: &str) -> Result<UnresolvedEvent, CascadeError> {
        let key = step.key();
        let (amount, kind) = match *step {
            CascadeStep::Unlock { fee, .. } => (fee, UnresolvedKind::PendingUnlock),
            CascadeStep::AutoUnlock { .. } => (Amount::ZERO, UnresolvedKind::PendingAutoUnlock),
        };
        let reference = routing::reference(&key, "pending-unlock");
        self.raise(key, amount, kind, reference, detail.to_string())
    }

    fn raise(
        &self,
        key: TierKey,
        amount: Amount,
        kind: UnresolvedKind,
        reference: String,
        detail: String,
    ) -> Result<UnresolvedEvent, CascadeError> {
        let event = Retrier::new(&self.config.retry, self.config.max_conflict_retries).run("raise unresolved", || {
            let mut store = self.store.write();
            let event = UnresolvedEvent {
                id: store.next_seq()?,
                member_id: key.member,
                track: key.track,
                tier_no: key.tier,
                amount,
                kind,
                reference: reference.clone(),
                detail: detail.clone(),
                raised_at: self.now(),
            };
            let mut writes = WriteSet::new();
            writes.raise(event.clone());
            store.commit(writes)?;
            Ok::<_, StoreError>(event)
        })?;
        error!(event = event.id, %key, %amount, kind = ?event.kind, detail = %event.detail, "unresolved event raised");
        Ok(event)
    }

    fn resolve(&self, id: u64) -> Result<(), CascadeError> {
        let result = Retrier::new(&self.config.retry, 0).run("resolve unresolved", || {
            let mut writes = WriteSet::new();
            writes.resolve(id);
            self.store.write().commit(writes)
        });
        match result {
            Ok(_) => {
                info!(event = id, "unresolved event settled");
                Ok(())
            }
            // Settled concurrently.
            Err(StoreError::Conflict(Conflict::UnknownEvent(_))) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn stamp(&self, store: &S) -> Result<Stamp, StoreError> {
        Ok(Stamp { created_at: self.now(), seq: store.next_seq()? })
    }
}
