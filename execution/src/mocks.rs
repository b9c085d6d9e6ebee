//! Fixtures for tests: funded ledgers, scripted crash points, a ledger that
//! fails on demand, and a fast engine configuration.

use crate::crash::{derive_round_seed, CrashError, CrashSource, RoundSeed};
use crate::engine::{EngineConfig, RoundEngine, RoundEvent, StakeLimits};
use crate::ledger::{
    Applied, DeltaRequest, Ledger, LedgerError, MemoryLedger, PendingCredit, PendingResolved,
    Resolution, RoundArchive,
};
use crate::round_scheduler::{MultiplierCurve, PhaseConfig};
use aviator_types::{
    Account, Amount, BetRecord, GatewayCallback, Multiplier, NewAccount, RoundNumber, RoundPhase,
    RoundRecord, Transaction, ROUND_HISTORY_LEN,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const TEST_MASTER_SEED: RoundSeed = [42u8; 32];

/// Betting closes at 1s, the multiplier climbs 0.10x every 100ms tick, and
/// the next round opens 500ms after a crash.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        phases: PhaseConfig::new(1_000, 100, 500),
        curve: MultiplierCurve {
            base_step: 10,
            accel_bps: 0,
        },
        limits: StakeLimits::default(),
        history_len: ROUND_HISTORY_LEN,
    }
}

pub fn open_funded<L: Ledger>(ledger: &L, id: &str, balance: Amount) -> Account {
    ledger
        .open_account(
            NewAccount {
                id: id.to_string(),
                opening_balance: balance,
                ..Default::default()
            },
            0,
        )
        .expect("failed to open test account")
}

pub fn funded_ledger(accounts: &[(&str, Amount)]) -> Arc<MemoryLedger> {
    let ledger = MemoryLedger::new();
    for (id, balance) in accounts {
        open_funded(&ledger, id, *balance);
    }
    Arc::new(ledger)
}

pub fn callback(correlation_id: &str, result_code: i32, amount: Option<Amount>) -> GatewayCallback {
    GatewayCallback {
        correlation_id: correlation_id.to_string(),
        result_code,
        amount,
        receipt_ref: Some(format!("R-{correlation_id}")),
        result_desc: None,
    }
}

/// Crash points fed from a script. Falls back to `fallback` once the script
/// runs out.
pub struct ScriptedCrash {
    points: VecDeque<Result<Multiplier, CrashError>>,
    fallback: Multiplier,
}

impl ScriptedCrash {
    pub fn new(points: impl IntoIterator<Item = u32>) -> Self {
        Self {
            points: points
                .into_iter()
                .map(|p| Ok(Multiplier::from_hundredths(p)))
                .collect(),
            fallback: Multiplier::from_hundredths(200),
        }
    }

    /// Make the next scripted round fail to produce a crash point.
    pub fn then_fail(mut self) -> Self {
        self.points
            .push_back(Err(CrashError::Unavailable("scripted failure".to_string())));
        self
    }

    pub fn then(mut self, point: u32) -> Self {
        self.points.push_back(Ok(Multiplier::from_hundredths(point)));
        self
    }
}

impl CrashSource for ScriptedCrash {
    fn seed_for(&self, round: RoundNumber) -> RoundSeed {
        derive_round_seed(&TEST_MASTER_SEED, round)
    }

    fn crash_point(&mut self, _round: RoundNumber, _seed: &RoundSeed) -> Result<Multiplier, CrashError> {
        self.points.pop_front().unwrap_or(Ok(self.fallback))
    }
}

pub fn test_engine(
    ledger: Arc<MemoryLedger>,
    crash: ScriptedCrash,
) -> RoundEngine<MemoryLedger, ScriptedCrash> {
    RoundEngine::new(test_engine_config(), ledger, crash, 0).expect("failed to start engine")
}

/// Tick `engine` every 100ms from `now_ms` until its multiplier reaches
/// `target` or the round leaves `Flying`. Returns the last tick time and the
/// events emitted on the way.
pub fn fly_to<L, C>(engine: &mut RoundEngine<L, C>, target: u32, mut now_ms: u64) -> (u64, Vec<RoundEvent>)
where
    L: Ledger + RoundArchive,
    C: CrashSource,
{
    let target = Multiplier::from_hundredths(target);
    let mut events = Vec::new();
    while engine.phase() == RoundPhase::Flying && engine.round().multiplier < target {
        now_ms += 100;
        events.extend(engine.tick(now_ms));
    }
    (now_ms, events)
}

/// Wraps a [`MemoryLedger`] and fails credits (positive deltas) with a
/// storage error while the switch is on.
#[derive(Default)]
pub struct FlakyLedger {
    inner: MemoryLedger,
    fail_credits: AtomicBool,
}

impl FlakyLedger {
    pub fn new(inner: MemoryLedger) -> Self {
        Self {
            inner,
            fail_credits: AtomicBool::new(false),
        }
    }

    pub fn fail_credits(&self, fail: bool) {
        self.fail_credits.store(fail, Ordering::SeqCst);
    }
}

impl Ledger for FlakyLedger {
    fn open_account(&self, account: NewAccount, now_ms: u64) -> Result<Account, LedgerError> {
        self.inner.open_account(account, now_ms)
    }

    fn account(&self, id: &str) -> Result<Account, LedgerError> {
        self.inner.account(id)
    }

    fn apply_delta(&self, request: DeltaRequest) -> Result<Applied, LedgerError> {
        if request.amount > 0 && self.fail_credits.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("disk unavailable".to_string()));
        }
        self.inner.apply_delta(request)
    }

    fn record_pending(&self, credit: PendingCredit) -> Result<Transaction, LedgerError> {
        self.inner.record_pending(credit)
    }

    fn resolve_pending(
        &self,
        external_ref: &str,
        resolution: Resolution,
        now_ms: u64,
    ) -> Result<PendingResolved, LedgerError> {
        self.inner.resolve_pending(external_ref, resolution, now_ms)
    }

    fn transaction_by_ref(&self, external_ref: &str) -> Result<Option<Transaction>, LedgerError> {
        self.inner.transaction_by_ref(external_ref)
    }

    fn link_correlation(&self, reference: &str, correlation_id: &str) -> Result<(), LedgerError> {
        self.inner.link_correlation(reference, correlation_id)
    }

    fn linked_reference(&self, correlation_id: &str) -> Result<Option<String>, LedgerError> {
        self.inner.linked_reference(correlation_id)
    }

    fn transactions_by_ref_prefix(&self, prefix: &str) -> Result<Vec<Transaction>, LedgerError> {
        self.inner.transactions_by_ref_prefix(prefix)
    }

    fn transactions(&self, account_id: &str, limit: usize) -> Result<Vec<Transaction>, LedgerError> {
        self.inner.transactions(account_id, limit)
    }
}

impl RoundArchive for FlakyLedger {
    fn mark_round_open(&self, round_number: RoundNumber, started_at_ms: u64) -> Result<(), LedgerError> {
        self.inner.mark_round_open(round_number, started_at_ms)
    }

    fn unresolved_rounds(&self) -> Result<Vec<(RoundNumber, u64)>, LedgerError> {
        self.inner.unresolved_rounds()
    }

    fn archive_round(&self, round: &RoundRecord, bets: &[BetRecord]) -> Result<(), LedgerError> {
        self.inner.archive_round(round, bets)
    }

    fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, LedgerError> {
        self.inner.recent_rounds(limit)
    }

    fn latest_round_number(&self) -> Result<Option<RoundNumber>, LedgerError> {
        self.inner.latest_round_number()
    }

    fn bet_history(&self, account_id: &str, limit: usize) -> Result<Vec<BetRecord>, LedgerError> {
        self.inner.bet_history(account_id, limit)
    }
}

/// Sum of every balance-affecting transaction for `account_id`.
pub fn replayed_balance<L: Ledger>(ledger: &L, account_id: &str) -> i64 {
    ledger
        .transactions(account_id, usize::MAX)
        .expect("failed to read transactions")
        .iter()
        .filter(|t| t.affects_balance())
        .map(|t| t.amount)
        .sum()
}
