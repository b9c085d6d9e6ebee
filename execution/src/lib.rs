//! Aviator execution layer.
//!
//! This crate contains the crash game's deterministic logic: the round engine
//! and its scheduler, crash point generation, the bet and withdrawal
//! registries, payment reconciliation, and the ledger backends they share.
//!
//! ## Determinism requirements
//! - Do not read the wall clock here; every operation takes `now_ms` from the caller.
//! - Crash points derive only from the round seed and the configured curve.
//! - Avoid iteration order of hash-based collections influencing outputs.
//!
//! ## Ledger invariants
//! Balances change only through [`Ledger::apply_delta`] (and the pending and
//! withdrawal transitions built on the same atomic step). A balance never goes
//! negative, and it always equals the sum of the balance-affecting rows in the
//! transaction log.
//!
//! The primary entrypoint is [`RoundEngine`].
//!
//! ## Minimal round (example)
//! ```rust,ignore
//! use aviator_execution::{EngineConfig, MemoryLedger, RoundEngine, SeededCrash, CrashCurve};
//! use std::sync::Arc;
//!
//! let ledger = Arc::new(MemoryLedger::new());
//! let crash = SeededCrash::new(master_secret, CrashCurve::default())?;
//! let mut engine = RoundEngine::new(EngineConfig::default(), ledger, crash, now_ms)?;
//! engine.place_bet("alice", 0, 100, None, now_ms)?;
//! for event in engine.tick(now_ms + 5_000) {
//!     // TookOff, Multiplier, CashedOut, Crashed, ...
//! }
//! ```

pub mod bets;
pub mod crash;
pub mod engine;
pub mod ledger;
pub mod reconciler;
pub mod round_scheduler;
pub mod withdrawals;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;


pub use bets::{BetRegistry, StakeKey};
pub use crash::{
    derive_round_seed, generate_crash_point, CrashCurve, CrashError, CrashSource, RoundSeed,
    SeededCrash, SEED_LEN,
};
pub use engine::{
    Cashout, EngineConfig, EngineError, PlacedBet, RoundEngine, RoundEvent, RoundSnapshot,
    StakeLimits,
};
pub use ledger::{
    refund_ref, with_retry, Applied, DeltaRequest, Ledger, LedgerError, MemoryLedger,
    PendingCredit, PendingResolved, Resolution, RoundArchive, SqliteLedger, WithdrawalRequest,
    WithdrawalResolution, WithdrawalResolved, WithdrawalStore, DEFAULT_RETRY_ATTEMPTS,
};
pub use reconciler::{
    deposit_reference, BonusCredit, CallbackOutcome, DepositIntent, PaymentError, PaymentLimits,
    PaymentReconciler,
};
pub use round_scheduler::{MultiplierCurve, PhaseConfig, RoundScheduler};
pub use withdrawals::{withdrawal_reference, WithdrawalError, WithdrawalRegistry};
