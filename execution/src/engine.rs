//! Round Engine: the single owner of the round clock.
//!
//! The engine is synchronous and takes `now_ms` from its caller. One task owns
//! it and feeds it bets, cash-outs and ticks in arrival order; nothing else
//! mutates round state.
//!
//! ## Tick order
//!
//! While flying, each tick:
//! 1. computes the next multiplier from the growth curve,
//! 2. pays auto-cashouts whose target was crossed (at the target, and only if
//!    the target is strictly below the crash point),
//! 3. crashes the round if the new multiplier reached the crash point, moving
//!    every remaining active stake to `Lost`.
//!
//! Manual cash-outs are settled as they arrive, at the multiplier current at
//! that moment. A round whose crash point is not above the starting 1.00x
//! crashes at take-off and never enters `Flying`, so a cash-out is only ever
//! paid strictly below the crash point.
//!
//! ## Restarts
//!
//! Each round is marked open in the archive before it accepts stakes, and
//! every bet debit carries a `bet:{round}:{account}:{panel}` reference. On
//! start the engine settles any round still marked open: stakes that were
//! already cashed out are recorded as such, the rest are refunded, and the
//! round is archived as voided. Numbering resumes after the highest round
//! ever opened.
//!
//! ## Voided rounds
//!
//! A crash generator fault, or a ledger failure while paying an auto-cashout,
//! voids the round: it jumps to `Crashed` with `voided = true` and every active
//! stake is refunded. Refunds that fail are kept and retried on later ticks
//! under an idempotent reference, so no stake is silently dropped.

use crate::bets::{BetRegistry, StakeKey};
use crate::crash::{CrashError, CrashSource, SeededCrash};
use crate::ledger::{to_delta, Applied, DeltaRequest, Ledger, LedgerError, RoundArchive};
use crate::round_scheduler::{MultiplierCurve, PhaseConfig, RoundScheduler};
use aviator_types::{
    AccountId, Amount, AutoplayConfig, BetRecord, Multiplier, PanelId, Round, RoundNumber,
    RoundPhase, RoundRecord, Stake, StakeStatus, TransactionKind, DEFAULT_MAX_PANELS,
    DEFAULT_MAX_STAKE, MIN_AUTO_CASHOUT, MIN_STAKE, ROUND_HISTORY_LEN,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeLimits {
    pub min_stake: Amount,
    pub max_stake: Amount,
    pub max_panels: u8,
}

impl Default for StakeLimits {
    fn default() -> Self {
        Self {
            min_stake: MIN_STAKE,
            max_stake: DEFAULT_MAX_STAKE,
            max_panels: DEFAULT_MAX_PANELS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub phases: PhaseConfig,
    pub curve: MultiplierCurve,
    pub limits: StakeLimits,
    /// Resolved rounds kept in memory for the history strip.
    pub history_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            phases: PhaseConfig::default(),
            curve: MultiplierCurve::default(),
            limits: StakeLimits::default(),
            history_len: ROUND_HISTORY_LEN,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        self.phases.validate()?;
        if self.limits.min_stake == 0 {
            return Err("min_stake must be greater than zero");
        }
        if self.limits.min_stake > self.limits.max_stake {
            return Err("min_stake must not exceed max_stake");
        }
        if self.limits.max_panels == 0 {
            return Err("max_panels must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("cannot {action} while round is {phase}")]
    InvalidPhase {
        action: &'static str,
        phase: &'static str,
    },
    #[error("betting window has closed")]
    BettingClosed,
    #[error("panel {panel} out of range (max {max})")]
    PanelOutOfRange { panel: PanelId, max: u8 },
    #[error("stake {amount} below minimum {min}")]
    BelowMinimum { amount: Amount, min: Amount },
    #[error("stake {amount} above maximum {max}")]
    AboveMaximum { amount: Amount, max: Amount },
    #[error("auto-cashout target {0} is below 1.01x")]
    InvalidAutoCashout(Multiplier),
    #[error("panel {0} already holds a stake this round")]
    StakeExists(PanelId),
    #[error("no active stake on panel {0}")]
    NoActiveStake(PanelId),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Crash(#[from] CrashError),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidPhase { .. } | EngineError::BettingClosed => "INVALID_PHASE",
            EngineError::PanelOutOfRange { .. } => "PANEL_OUT_OF_RANGE",
            EngineError::BelowMinimum { .. } => "BELOW_MINIMUM",
            EngineError::AboveMaximum { .. } => "ABOVE_MAXIMUM",
            EngineError::InvalidAutoCashout(_) => "INVALID_AUTO_CASHOUT",
            EngineError::StakeExists(_) => "STAKE_EXISTS",
            EngineError::NoActiveStake(_) => "NO_ACTIVE_STAKE",
            EngineError::Ledger(e) => e.code(),
            EngineError::Crash(e) => e.code(),
        }
    }

    /// Errors caused by the request rather than by a failing dependency.
    pub fn is_rejection(&self) -> bool {
        match self {
            EngineError::Ledger(e) => e.is_rejection(),
            EngineError::Crash(_) => false,
            _ => true,
        }
    }
}

/// Accepted bet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacedBet {
    pub stake: Stake,
    pub balance: Amount,
}

/// Settled cash-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cashout {
    pub round_number: RoundNumber,
    pub account_id: AccountId,
    pub panel_id: PanelId,
    pub multiplier: Multiplier,
    pub payout: Amount,
    pub balance: Amount,
    pub auto: bool,
}

/// Things that happened inside the engine, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundEvent {
    RoundOpened {
        round_number: RoundNumber,
        betting_ends_at_ms: u64,
    },
    BetPlaced(PlacedBet),
    TookOff {
        round_number: RoundNumber,
        at_ms: u64,
    },
    Multiplier {
        round_number: RoundNumber,
        multiplier: Multiplier,
    },
    CashedOut(Cashout),
    Crashed(RoundRecord),
    Voided {
        record: RoundRecord,
        reason: String,
        refunded: usize,
    },
    AutoplayStopped {
        account_id: AccountId,
        panel_id: PanelId,
        reason: String,
    },
}

/// Client-safe view of the live round. The crash point is only present once
/// the round has crashed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub round_number: RoundNumber,
    pub phase: RoundPhase,
    pub multiplier: Multiplier,
    pub betting_ends_at_ms: u64,
    pub crash_point: Option<Multiplier>,
    pub voided: bool,
    pub stakes: Vec<Stake>,
}

pub(crate) fn bet_ref(round: RoundNumber, account_id: &str, panel: PanelId) -> String {
    format!("bet:{round}:{account_id}:{panel}")
}

/// Inverse of [`bet_ref`] for one round. Account ids may contain `:`.
fn parse_bet_ref(external_ref: &str, round: RoundNumber) -> Option<(AccountId, PanelId)> {
    let rest = external_ref.strip_prefix(&format!("bet:{round}:"))?;
    let (account_id, panel) = rest.rsplit_once(':')?;
    Some((account_id.to_string(), panel.parse().ok()?))
}

/// Lowest multiplier whose payout on `amount` is `payout`.
fn multiplier_for_payout(amount: Amount, payout: Amount) -> Option<Multiplier> {
    if amount == 0 {
        return None;
    }
    let hundredths = (u128::from(payout) * 100).div_ceil(u128::from(amount));
    u32::try_from(hundredths).ok().map(Multiplier::from_hundredths)
}

pub(crate) fn win_ref(round: RoundNumber, account_id: &str, panel: PanelId) -> String {
    format!("win:{round}:{account_id}:{panel}")
}

pub(crate) fn void_ref(round: RoundNumber, account_id: &str, panel: PanelId) -> String {
    format!("void:{round}:{account_id}:{panel}")
}

pub struct RoundEngine<L, C = SeededCrash> {
    config: EngineConfig,
    scheduler: RoundScheduler,
    ledger: Arc<L>,
    crash: C,
    round: Round,
    phase_ends_at_ms: u64,
    bets: BetRegistry,
    autoplay: BTreeMap<StakeKey, AutoplayConfig>,
    /// Newest first.
    history: VecDeque<RoundRecord>,
    owed_refunds: Vec<Stake>,
    /// Resolved round whose archive write failed. The next round waits for it.
    unarchived: Option<(RoundRecord, Vec<BetRecord>)>,
}

impl<L, C> RoundEngine<L, C>
where
    L: Ledger + RoundArchive,
    C: CrashSource,
{
    /// Build an engine, settle rounds a previous process left open, and open
    /// the round after the highest one ever opened.
    pub fn new(config: EngineConfig, ledger: Arc<L>, crash: C, now_ms: u64) -> Result<Self, EngineError> {
        let latest = ledger.latest_round_number()?.unwrap_or(0);
        let scheduler = RoundScheduler::new(config.phases);
        let placeholder = Round {
            round_number: latest,
            seed: [0u8; 32],
            crash_point: None,
            phase: RoundPhase::Crashed,
            multiplier: Multiplier::ONE,
            started_at_ms: now_ms,
            betting_ends_at_ms: now_ms,
            crashed_at_ms: None,
            voided: false,
        };
        let mut engine = Self {
            config,
            scheduler,
            ledger,
            crash,
            round: placeholder,
            phase_ends_at_ms: now_ms,
            bets: BetRegistry::new(latest),
            autoplay: BTreeMap::new(),
            history: VecDeque::new(),
            owed_refunds: Vec::new(),
            unarchived: None,
        };
        for (round_number, started_at_ms) in engine.ledger.unresolved_rounds()? {
            engine.settle_interrupted(round_number, started_at_ms, now_ms)?;
        }
        engine.history = engine.ledger.recent_rounds(engine.config.history_len)?.into();
        let next = latest.saturating_add(1);
        engine.open_round(next, now_ms)?;
        info!(round = next, resumed_from = latest, "round engine started");
        Ok(engine)
    }

    /// Void a round that was open when the previous process stopped.
    fn settle_interrupted(
        &self,
        round_number: RoundNumber,
        started_at_ms: u64,
        now_ms: u64,
    ) -> Result<RoundRecord, EngineError> {
        let mut records = Vec::new();
        let mut refunded = 0;
        for debit in self
            .ledger
            .transactions_by_ref_prefix(&format!("bet:{round_number}:"))?
        {
            let Some((account_id, panel_id)) = debit
                .external_ref
                .as_deref()
                .and_then(|r| parse_bet_ref(r, round_number))
            else {
                warn!(round = round_number, txn = debit.id, "unreadable bet reference");
                continue;
            };
            let amount = debit.amount.unsigned_abs();
            let win = self
                .ledger
                .transaction_by_ref(&win_ref(round_number, &account_id, panel_id))?;
            let record = match win {
                Some(win) => {
                    let payout = win.amount.unsigned_abs();
                    BetRecord {
                        round_number,
                        account_id,
                        panel_id,
                        amount,
                        status: StakeStatus::CashedOut,
                        cashout_multiplier: multiplier_for_payout(amount, payout),
                        payout,
                    }
                }
                None => {
                    let stake = Stake {
                        round_number,
                        account_id,
                        panel_id,
                        amount,
                        status: StakeStatus::Active,
                        cashout_multiplier: None,
                        auto_cashout: None,
                        bet_txn: debit.id,
                        placed_at_ms: debit.created_at_ms,
                    };
                    match self.refund(&stake, now_ms) {
                        Ok(_) | Err(LedgerError::DuplicateRef(_)) => refunded += 1,
                        Err(err) => return Err(err.into()),
                    }
                    BetRecord {
                        status: StakeStatus::Refunded,
                        payout: amount,
                        ..stake.to_record()
                    }
                }
            };
            records.push(record);
        }
        let record = RoundRecord {
            round_number,
            crash_multiplier: Multiplier::ONE,
            voided: true,
            started_at_ms,
            crashed_at_ms: now_ms,
            total_staked: records
                .iter()
                .filter(|b| b.status != StakeStatus::Refunded)
                .map(|b| b.amount)
                .fold(0, Amount::saturating_add),
            total_paid_out: records
                .iter()
                .filter(|b| b.status == StakeStatus::CashedOut)
                .map(|b| b.payout)
                .fold(0, Amount::saturating_add),
        };
        self.ledger.archive_round(&record, &records)?;
        warn!(round = round_number, stakes = records.len(), refunded, "interrupted round voided");
        Ok(record)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// The live round, including its crash point once materialized.
    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn phase(&self) -> RoundPhase {
        self.round.phase
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_number: self.round.round_number,
            phase: self.round.phase,
            multiplier: self.round.multiplier,
            betting_ends_at_ms: self.round.betting_ends_at_ms,
            crash_point: match self.round.phase {
                RoundPhase::Crashed => self.round.crash_point,
                _ => None,
            },
            voided: self.round.voided,
            stakes: self.bets.stakes().cloned().collect(),
        }
    }

    /// Resolved rounds, newest first.
    pub fn recent_rounds(&self) -> Vec<RoundRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn stake(&self, account_id: &str, panel_id: PanelId) -> Option<&Stake> {
        self.bets.get(account_id, panel_id)
    }

    pub fn autoplay(&self, account_id: &str, panel_id: PanelId) -> Option<&AutoplayConfig> {
        self.autoplay.get(&(account_id.to_string(), panel_id))
    }

    /// Refunds that could not be written yet.
    pub fn owed_refunds(&self) -> &[Stake] {
        &self.owed_refunds
    }

    fn validate_stake(
        &self,
        panel_id: PanelId,
        amount: Amount,
        auto_cashout: Option<Multiplier>,
    ) -> Result<(), EngineError> {
        let limits = &self.config.limits;
        if panel_id >= limits.max_panels {
            return Err(EngineError::PanelOutOfRange {
                panel: panel_id,
                max: limits.max_panels,
            });
        }
        if amount < limits.min_stake {
            return Err(EngineError::BelowMinimum {
                amount,
                min: limits.min_stake,
            });
        }
        if amount > limits.max_stake {
            return Err(EngineError::AboveMaximum {
                amount,
                max: limits.max_stake,
            });
        }
        match auto_cashout {
            Some(target) if target < MIN_AUTO_CASHOUT => Err(EngineError::InvalidAutoCashout(target)),
            _ => Ok(()),
        }
    }

    /// Place a stake for the open round, debiting the ledger atomically.
    pub fn place_bet(
        &mut self,
        account_id: &str,
        panel_id: PanelId,
        amount: Amount,
        auto_cashout: Option<Multiplier>,
        now_ms: u64,
    ) -> Result<PlacedBet, EngineError> {
        if !self
            .scheduler
            .is_betting_open(self.round.phase, self.phase_ends_at_ms, now_ms)
        {
            return Err(match self.round.phase {
                RoundPhase::Waiting => EngineError::BettingClosed,
                phase => EngineError::InvalidPhase {
                    action: "place a bet",
                    phase: phase.as_str(),
                },
            });
        }
        self.validate_stake(panel_id, amount, auto_cashout)?;
        if self.bets.contains(account_id, panel_id) {
            return Err(EngineError::StakeExists(panel_id));
        }
        let round_number = self.round.round_number;
        let applied = self.ledger.apply_delta(
            DeltaRequest::new(
                account_id,
                -to_delta(amount)?,
                TransactionKind::Bet,
                format!("round {round_number} panel {panel_id} bet"),
                now_ms,
            )
            .with_ref(bet_ref(round_number, account_id, panel_id)),
        )?;
        let stake = Stake {
            round_number,
            account_id: account_id.to_string(),
            panel_id,
            amount,
            status: StakeStatus::Active,
            cashout_multiplier: None,
            auto_cashout,
            bet_txn: applied.txn_id,
            placed_at_ms: now_ms,
        };
        if let Err(rejected) = self.bets.insert(stake.clone()) {
            if let Err(err) = self.refund(&rejected, now_ms) {
                error!(round = round_number, account = %account_id, ?err, "refund of rejected stake failed");
                self.owed_refunds.push(rejected);
            }
            return Err(EngineError::StakeExists(panel_id));
        }
        debug!(round = round_number, account = %account_id, panel = panel_id, amount, "bet placed");
        Ok(PlacedBet {
            stake,
            balance: applied.balance,
        })
    }

    /// Cash out an active stake at the current multiplier.
    pub fn cash_out(&mut self, account_id: &str, panel_id: PanelId, now_ms: u64) -> Result<Cashout, EngineError> {
        if !self.scheduler.can_cash_out(self.round.phase) {
            return Err(EngineError::InvalidPhase {
                action: "cash out",
                phase: self.round.phase.as_str(),
            });
        }
        if self
            .round
            .crash_point
            .is_some_and(|point| self.round.multiplier >= point)
        {
            return Err(EngineError::InvalidPhase {
                action: "cash out",
                phase: RoundPhase::Crashed.as_str(),
            });
        }
        let key = (account_id.to_string(), panel_id);
        let multiplier = self.round.multiplier;
        self.settle_cashout(&key, multiplier, false, now_ms)
    }

    fn settle_cashout(
        &mut self,
        key: &StakeKey,
        multiplier: Multiplier,
        auto: bool,
        now_ms: u64,
    ) -> Result<Cashout, EngineError> {
        let (account_id, panel_id) = key;
        let amount = match self.bets.get(account_id, *panel_id) {
            Some(stake) if stake.status == StakeStatus::Active => stake.amount,
            _ => return Err(EngineError::NoActiveStake(*panel_id)),
        };
        let round_number = self.round.round_number;
        let payout = multiplier.payout(amount);
        let applied = self.ledger.apply_delta(
            DeltaRequest::new(
                account_id.clone(),
                to_delta(payout)?,
                TransactionKind::Win,
                format!("round {round_number} panel {panel_id} cashed out at {multiplier}"),
                now_ms,
            )
            .with_ref(win_ref(round_number, account_id, *panel_id)),
        )?;
        self.bets
            .resolve(key, StakeStatus::CashedOut, Some(multiplier))
            .ok_or(EngineError::NoActiveStake(*panel_id))?;
        debug!(round = round_number, account = %account_id, panel = panel_id, %multiplier, payout, auto, "cashed out");
        Ok(Cashout {
            round_number,
            account_id: account_id.clone(),
            panel_id: *panel_id,
            multiplier,
            payout,
            balance: applied.balance,
            auto,
        })
    }

    /// Configure (or disable) the autoplay agent for one panel. Enabled agents
    /// bet when the next round opens.
    pub fn set_autoplay(
        &mut self,
        account_id: &str,
        panel_id: PanelId,
        config: AutoplayConfig,
    ) -> Result<(), EngineError> {
        let key = (account_id.to_string(), panel_id);
        if !config.enabled {
            if panel_id >= self.config.limits.max_panels {
                return Err(EngineError::PanelOutOfRange {
                    panel: panel_id,
                    max: self.config.limits.max_panels,
                });
            }
            self.autoplay.remove(&key);
            return Ok(());
        }
        self.validate_stake(panel_id, config.bet_amount, config.auto_cashout)?;
        self.ledger.account(account_id)?;
        self.autoplay.insert(key, config);
        Ok(())
    }

    /// Advance the round clock to `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<RoundEvent> {
        let mut events = Vec::new();
        self.retry_owed_refunds(now_ms);
        match self.round.phase {
            RoundPhase::Waiting => {
                if self
                    .scheduler
                    .can_take_off(self.round.phase, self.phase_ends_at_ms, now_ms)
                {
                    self.take_off(now_ms, &mut events);
                }
            }
            RoundPhase::Flying => self.advance(now_ms, &mut events),
            RoundPhase::Crashed => {
                if self
                    .scheduler
                    .can_start_new_round(self.round.phase, self.phase_ends_at_ms, now_ms)
                    && self.retry_archive()
                {
                    let next = self.round.round_number.saturating_add(1);
                    match self.open_round(next, now_ms) {
                        Ok(opened) => events.extend(opened),
                        Err(err) => {
                            error!(round = next, ?err, "failed to open round, retrying next tick");
                        }
                    }
                }
            }
        }
        events
    }

    fn open_round(&mut self, round_number: RoundNumber, now_ms: u64) -> Result<Vec<RoundEvent>, LedgerError> {
        self.ledger.mark_round_open(round_number, now_ms)?;
        let betting_ends_at_ms = self.scheduler.betting_phase_end_time(now_ms);
        self.round = Round {
            round_number,
            seed: self.crash.seed_for(round_number),
            crash_point: None,
            phase: RoundPhase::Waiting,
            multiplier: Multiplier::ONE,
            started_at_ms: now_ms,
            betting_ends_at_ms,
            crashed_at_ms: None,
            voided: false,
        };
        self.phase_ends_at_ms = betting_ends_at_ms;
        self.bets.reset(round_number);

        let mut events = vec![RoundEvent::RoundOpened {
            round_number,
            betting_ends_at_ms,
        }];
        let agents: Vec<_> = self
            .autoplay
            .iter()
            .map(|(key, config)| (key.clone(), config.clone()))
            .collect();
        for ((account_id, panel_id), config) in agents {
            match self.place_bet(&account_id, panel_id, config.bet_amount, config.auto_cashout, now_ms) {
                Ok(placed) => events.push(RoundEvent::BetPlaced(placed)),
                Err(err) if err.is_rejection() => {
                    info!(round = round_number, account = %account_id, panel = panel_id, %err, "autoplay stopped");
                    self.autoplay.remove(&(account_id.clone(), panel_id));
                    events.push(RoundEvent::AutoplayStopped {
                        account_id,
                        panel_id,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(round = round_number, account = %account_id, panel = panel_id, ?err, "autoplay bet skipped");
                }
            }
        }
        Ok(events)
    }

    fn take_off(&mut self, now_ms: u64, events: &mut Vec<RoundEvent>) {
        let round_number = self.round.round_number;
        let seed = self.round.seed;
        match self.crash.crash_point(round_number, &seed) {
            Ok(point) => {
                self.round.crash_point = Some(point);
                events.push(RoundEvent::TookOff {
                    round_number,
                    at_ms: now_ms,
                });
                if point <= self.round.multiplier {
                    self.crash_round(now_ms, events);
                } else {
                    self.round.phase = RoundPhase::Flying;
                    // Flying ends on the crash check, not on the clock.
                    self.phase_ends_at_ms = u64::MAX;
                }
            }
            Err(err) => self.void_round(now_ms, format!("crash generator failed: {err}"), events),
        }
    }

    fn advance(&mut self, now_ms: u64, events: &mut Vec<RoundEvent>) {
        let Some(crash_point) = self.round.crash_point else {
            self.void_round(now_ms, "round flying without a crash point".to_string(), events);
            return;
        };
        let previous = self.round.multiplier;
        let next = self.config.curve.next(previous);

        for (key, target) in self.bets.auto_cashouts_due(previous, next, crash_point) {
            match self.settle_cashout(&key, target, true, now_ms) {
                Ok(cashout) => events.push(RoundEvent::CashedOut(cashout)),
                Err(err) if err.is_rejection() => {
                    warn!(round = self.round.round_number, account = %key.0, panel = key.1, %err, "auto-cashout rejected");
                }
                Err(err) => {
                    self.void_round(now_ms, format!("auto-cashout failed: {err}"), events);
                    return;
                }
            }
        }

        if next >= crash_point {
            self.round.multiplier = crash_point;
            self.crash_round(now_ms, events);
        } else {
            self.round.multiplier = next;
            events.push(RoundEvent::Multiplier {
                round_number: self.round.round_number,
                multiplier: next,
            });
        }
    }

    fn crash_round(&mut self, now_ms: u64, events: &mut Vec<RoundEvent>) {
        self.enter_crashed(now_ms);
        for key in self.bets.active_keys() {
            self.bets.resolve(&key, StakeStatus::Lost, None);
        }
        let record = self.archive(now_ms);
        info!(
            round = record.round_number,
            crash = %record.crash_multiplier,
            staked = record.total_staked,
            paid = record.total_paid_out,
            "round crashed"
        );
        events.push(RoundEvent::Crashed(record));
    }

    fn void_round(&mut self, now_ms: u64, reason: String, events: &mut Vec<RoundEvent>) {
        let round_number = self.round.round_number;
        error!(round = round_number, %reason, "voiding round");
        self.enter_crashed(now_ms);
        self.round.voided = true;
        let mut refunded = 0;
        for key in self.bets.active_keys() {
            let Some(stake) = self.bets.get(&key.0, key.1).cloned() else {
                continue;
            };
            match self.refund(&stake, now_ms) {
                Ok(_) | Err(LedgerError::DuplicateRef(_)) => refunded += 1,
                Err(err) => {
                    error!(round = round_number, account = %stake.account_id, panel = stake.panel_id, ?err, "refund deferred");
                    self.owed_refunds.push(stake);
                }
            }
            self.bets.resolve(&key, StakeStatus::Refunded, None);
        }
        let record = self.archive(now_ms);
        events.push(RoundEvent::Voided {
            record,
            reason,
            refunded,
        });
    }

    fn enter_crashed(&mut self, now_ms: u64) {
        self.round.phase = RoundPhase::Crashed;
        self.round.crashed_at_ms = Some(now_ms);
        self.phase_ends_at_ms = self.scheduler.cooldown_phase_timing(now_ms);
    }

    fn archive(&mut self, now_ms: u64) -> RoundRecord {
        let record = RoundRecord {
            round_number: self.round.round_number,
            crash_multiplier: self.round.crash_point.unwrap_or(self.round.multiplier),
            voided: self.round.voided,
            started_at_ms: self.round.started_at_ms,
            crashed_at_ms: now_ms,
            total_staked: self.bets.total_staked(),
            total_paid_out: self.bets.total_paid_out(),
        };
        let bets = self.bets.records();
        if let Err(err) = self.ledger.archive_round(&record, &bets) {
            error!(round = record.round_number, ?err, "failed to archive round, will retry");
            self.unarchived = Some((record.clone(), bets));
        }
        self.history.push_front(record.clone());
        self.history.truncate(self.config.history_len);
        record
    }

    /// Write a pending archive. Returns whether nothing is left pending.
    fn retry_archive(&mut self) -> bool {
        let Some((record, bets)) = self.unarchived.take() else {
            return true;
        };
        match self.ledger.archive_round(&record, &bets) {
            Ok(()) | Err(LedgerError::DuplicateRef(_)) => {
                info!(round = record.round_number, "deferred archive written");
                true
            }
            Err(err) => {
                warn!(round = record.round_number, ?err, "archive still failing");
                self.unarchived = Some((record, bets));
                false
            }
        }
    }

    fn refund(&self, stake: &Stake, now_ms: u64) -> Result<Applied, LedgerError> {
        self.ledger.apply_delta(
            DeltaRequest::new(
                stake.account_id.clone(),
                to_delta(stake.amount)?,
                TransactionKind::Bet,
                format!(
                    "round {} panel {} voided, stake refunded",
                    stake.round_number, stake.panel_id
                ),
                now_ms,
            )
            .with_ref(void_ref(stake.round_number, &stake.account_id, stake.panel_id)),
        )
    }

    fn retry_owed_refunds(&mut self, now_ms: u64) {
        if self.owed_refunds.is_empty() {
            return;
        }
        let owed = std::mem::take(&mut self.owed_refunds);
        for stake in owed {
            match self.refund(&stake, now_ms) {
                Ok(_) | Err(LedgerError::DuplicateRef(_)) => {
                    info!(round = stake.round_number, account = %stake.account_id, panel = stake.panel_id, "deferred refund applied");
                }
                Err(_) => self.owed_refunds.push(stake),
            }
        }
    }
}
