//! Ledger Store: account balances, the append-only transaction log, the
//! withdrawal rows whose funds it reserves, and the round archive.
//!
//! ## Atomicity
//!
//! Every balance change goes through a single compare-and-mutate step inside
//! the backend's atomic boundary (one SQLite immediate transaction, or one
//! critical section for the in-memory store). A debit that would take the
//! balance below zero fails with no transaction row written, and every
//! successful delta writes exactly one row.
//!
//! Status transitions on pending rows (deposits awaiting a callback, reserved
//! withdrawals) check `status = pending` inside the same boundary as the write,
//! so replays and racing resolvers observe `AlreadyTerminal` instead of
//! applying twice.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use aviator_types::{
    Account, AccountId, Amount, BetRecord, Delta, NewAccount, RoundNumber, RoundRecord,
    Transaction, TransactionKind, TxnId, Withdrawal, WithdrawalId, WithdrawalStatus,
};
use thiserror::Error as ThisError;
use tracing::warn;

/// Default number of attempts for a contended mutation.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("account already exists: {0}")]
    AccountExists(AccountId),
    #[error("invalid referrer: {0}")]
    InvalidReferrer(String),
    #[error("insufficient funds (balance={balance}, requested={requested})")]
    InsufficientFunds { balance: Amount, requested: Amount },
    #[error("amount must be non-zero")]
    ZeroAmount,
    #[error("amount out of range")]
    AmountOverflow,
    #[error("external reference already used: {0}")]
    DuplicateRef(String),
    #[error("unknown external reference: {0}")]
    UnknownRef(String),
    #[error("withdrawal not found: {0}")]
    WithdrawalNotFound(WithdrawalId),
    #[error("withdrawal {0} is no longer pending")]
    WithdrawalNotPending(WithdrawalId),
    #[error("ledger conflict, please retry")]
    Conflict,
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::AccountExists(_) => "ACCOUNT_EXISTS",
            LedgerError::InvalidReferrer(_) => "INVALID_REFERRER",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::ZeroAmount | LedgerError::AmountOverflow => "INVALID_AMOUNT",
            LedgerError::DuplicateRef(_) => "DUPLICATE_REFERENCE",
            LedgerError::UnknownRef(_) => "UNKNOWN_CORRELATION",
            LedgerError::WithdrawalNotFound(_) => "WITHDRAWAL_NOT_FOUND",
            LedgerError::WithdrawalNotPending(_) => "ALREADY_RESOLVED",
            LedgerError::Conflict => "LEDGER_CONFLICT",
            LedgerError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Errors that reflect the request rather than the store's health.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, LedgerError::Conflict | LedgerError::Storage(_))
    }
}

/// A single atomic balance change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaRequest {
    pub account_id: AccountId,
    pub amount: Delta,
    pub kind: TransactionKind,
    pub external_ref: Option<String>,
    pub description: String,
    pub now_ms: u64,
}

impl DeltaRequest {
    pub fn new(
        account_id: impl Into<AccountId>,
        amount: Delta,
        kind: TransactionKind,
        description: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            amount,
            kind,
            external_ref: None,
            description: description.into(),
            now_ms,
        }
    }

    pub fn with_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }
}

/// Result of a successful delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Applied {
    pub txn_id: TxnId,
    pub balance: Amount,
}

/// A credit recorded as pending until the gateway confirms it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCredit {
    pub account_id: AccountId,
    pub amount: Amount,
    pub kind: TransactionKind,
    pub external_ref: String,
    pub description: String,
    pub now_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Complete { receipt_ref: Option<String> },
    Fail,
}

/// Outcome of resolving a pending credit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingResolved {
    Completed {
        txn: Transaction,
        balance: Amount,
        /// Set when this credit flipped the account's `first_deposit_made`.
        first_deposit: bool,
        referrer_id: Option<AccountId>,
    },
    Failed {
        txn: Transaction,
    },
    AlreadyTerminal {
        txn: Transaction,
    },
}

/// Request to reserve funds for a withdrawal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub account_id: AccountId,
    pub amount: Amount,
    pub phone_number: String,
    pub now_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithdrawalResolution {
    Approve,
    Reject { reason: String },
}

impl WithdrawalResolution {
    pub fn status(&self) -> WithdrawalStatus {
        match self {
            WithdrawalResolution::Approve => WithdrawalStatus::Completed,
            WithdrawalResolution::Reject { .. } => WithdrawalStatus::Rejected,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithdrawalResolved {
    Applied {
        withdrawal: Withdrawal,
        /// Compensating credit written on rejection.
        refund: Option<Applied>,
    },
    AlreadyTerminal {
        withdrawal: Withdrawal,
    },
}

/// External reference of the refund for a rejected withdrawal.
pub fn refund_ref(id: WithdrawalId) -> String {
    format!("{}withdrawal:{id}", aviator_types::REFUND_REF_PREFIX)
}

/// Account balances and the transaction log.
pub trait Ledger: Send + Sync {
    fn open_account(&self, account: NewAccount, now_ms: u64) -> Result<Account, LedgerError>;

    fn account(&self, id: &str) -> Result<Account, LedgerError>;

    /// The only balance-mutation primitive exposed to callers.
    fn apply_delta(&self, request: DeltaRequest) -> Result<Applied, LedgerError>;

    fn record_pending(&self, credit: PendingCredit) -> Result<Transaction, LedgerError>;

    fn resolve_pending(
        &self,
        external_ref: &str,
        resolution: Resolution,
        now_ms: u64,
    ) -> Result<PendingResolved, LedgerError>;

    fn transaction_by_ref(&self, external_ref: &str) -> Result<Option<Transaction>, LedgerError>;

    /// Make the gateway's `correlation_id` an alias of `reference`, our own
    /// key for a payment request. Each correlation id links once.
    fn link_correlation(&self, reference: &str, correlation_id: &str) -> Result<(), LedgerError>;

    fn linked_reference(&self, correlation_id: &str) -> Result<Option<String>, LedgerError>;

    /// Every transaction whose external reference starts with `prefix`, oldest first.
    fn transactions_by_ref_prefix(&self, prefix: &str) -> Result<Vec<Transaction>, LedgerError>;

    /// Newest first.
    fn transactions(&self, account_id: &str, limit: usize) -> Result<Vec<Transaction>, LedgerError>;
}

/// Withdrawal rows, kept in the ledger's atomic boundary so a reservation and
/// its debit (or a rejection and its refund) commit together.
pub trait WithdrawalStore: Ledger {
    fn reserve_withdrawal(&self, request: WithdrawalRequest) -> Result<Withdrawal, LedgerError>;

    fn attach_correlation(&self, id: WithdrawalId, correlation_id: &str) -> Result<(), LedgerError>;

    fn withdrawal(&self, id: WithdrawalId) -> Result<Withdrawal, LedgerError>;

    fn withdrawal_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Withdrawal>, LedgerError>;

    /// Oldest first.
    fn pending_withdrawals(&self, limit: usize) -> Result<Vec<Withdrawal>, LedgerError>;

    fn resolve_withdrawal(
        &self,
        id: WithdrawalId,
        resolution: WithdrawalResolution,
        now_ms: u64,
    ) -> Result<WithdrawalResolved, LedgerError>;
}

/// Resolved rounds and stakes.
///
/// A round is marked open before it takes any stake and the mark is cleared
/// by [`RoundArchive::archive_round`] in the same write, so a round left open
/// by a crashed process can be found and settled on the next start.
pub trait RoundArchive: Send + Sync {
    /// Record that `round_number` is live. Numbers already used fail with
    /// [`LedgerError::DuplicateRef`].
    fn mark_round_open(&self, round_number: RoundNumber, started_at_ms: u64) -> Result<(), LedgerError>;

    /// Rounds marked open and never archived, with their open time, oldest first.
    fn unresolved_rounds(&self) -> Result<Vec<(RoundNumber, u64)>, LedgerError>;

    fn archive_round(&self, round: &RoundRecord, bets: &[BetRecord]) -> Result<(), LedgerError>;

    /// Newest first.
    fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, LedgerError>;

    /// Highest round number ever opened, archived or not.
    fn latest_round_number(&self) -> Result<Option<RoundNumber>, LedgerError>;

    /// Newest first.
    fn bet_history(&self, account_id: &str, limit: usize) -> Result<Vec<BetRecord>, LedgerError>;
}

/// Run `op`, retrying on [`LedgerError::Conflict`] up to `attempts` times.
pub fn with_retry<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        tried += 1;
        match op() {
            Err(LedgerError::Conflict) if tried < attempts => continue,
            Err(LedgerError::Conflict) => {
                warn!(attempts = tried, "ledger conflict persisted after retries");
                return Err(LedgerError::Conflict);
            }
            other => return other,
        }
    }
}

pub(crate) fn to_delta(amount: Amount) -> Result<Delta, LedgerError> {
    Delta::try_from(amount).map_err(|_| LedgerError::AmountOverflow)
}
