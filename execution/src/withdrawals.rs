//! Withdrawal Registry.
//!
//! A request reserves its funds with an atomic debit before the row exists,
//! so two concurrent requests can never spend the same balance. Resolution
//! is one-shot: a second `approve`/`reject` on a terminal withdrawal fails
//! with [`WithdrawalError::AlreadyResolved`] and writes nothing.

use crate::ledger::{
    Applied, LedgerError, WithdrawalRequest, WithdrawalResolution, WithdrawalResolved,
    WithdrawalStore,
};
use aviator_types::{
    normalize_phone, Amount, PhoneError, Withdrawal, WithdrawalId, WithdrawalStatus,
    MIN_WITHDRAWAL, WITHDRAWAL_REF_PREFIX,
};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::info;

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum WithdrawalError {
    #[error("withdrawal {amount} below minimum {min}")]
    BelowMinimum { amount: Amount, min: Amount },
    #[error(transparent)]
    InvalidPhone(#[from] PhoneError),
    #[error("withdrawal {id} already {}", .status.as_str())]
    AlreadyResolved { id: WithdrawalId, status: WithdrawalStatus },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl WithdrawalError {
    pub fn code(&self) -> &'static str {
        match self {
            WithdrawalError::BelowMinimum { .. } => "BELOW_MINIMUM",
            WithdrawalError::InvalidPhone(_) => "INVALID_PHONE",
            WithdrawalError::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            WithdrawalError::Ledger(e) => e.code(),
        }
    }
}

/// Our reference for a gateway payout. It is attached as the withdrawal's
/// correlation id before the payout request leaves, so a callback that echoes
/// it can never arrive ahead of it.
pub fn withdrawal_reference(id: WithdrawalId) -> String {
    format!("{WITHDRAWAL_REF_PREFIX}{id}")
}

pub struct WithdrawalRegistry<S> {
    store: Arc<S>,
    min_withdrawal: Amount,
}

impl<S> Clone for WithdrawalRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            min_withdrawal: self.min_withdrawal,
        }
    }
}

impl<S: WithdrawalStore> WithdrawalRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            min_withdrawal: MIN_WITHDRAWAL,
        }
    }

    pub fn with_minimum(mut self, min_withdrawal: Amount) -> Self {
        self.min_withdrawal = min_withdrawal;
        self
    }

    /// Reserve `amount` from the account and open a pending withdrawal.
    pub fn request(
        &self,
        account_id: &str,
        amount: Amount,
        phone: &str,
        now_ms: u64,
    ) -> Result<Withdrawal, WithdrawalError> {
        if amount < self.min_withdrawal {
            return Err(WithdrawalError::BelowMinimum {
                amount,
                min: self.min_withdrawal,
            });
        }
        let phone_number = normalize_phone(phone)?;
        let withdrawal = self.store.reserve_withdrawal(WithdrawalRequest {
            account_id: account_id.to_string(),
            amount,
            phone_number,
            now_ms,
        })?;
        info!(id = withdrawal.id, account = %account_id, amount, "withdrawal requested");
        Ok(withdrawal)
    }

    /// Link a pending withdrawal to a payout reference.
    pub fn attach_correlation(&self, id: WithdrawalId, correlation_id: &str) -> Result<(), WithdrawalError> {
        match self.store.attach_correlation(id, correlation_id) {
            Err(LedgerError::WithdrawalNotPending(_)) => Err(self.already_resolved(id)?),
            other => Ok(other?),
        }
    }

    pub fn approve(&self, id: WithdrawalId, now_ms: u64) -> Result<Withdrawal, WithdrawalError> {
        let (withdrawal, _) = self.finish(id, WithdrawalResolution::Approve, now_ms)?;
        Ok(withdrawal)
    }

    /// Reject and refund. The refund is written in the same atomic step as
    /// the status change.
    pub fn reject(
        &self,
        id: WithdrawalId,
        reason: &str,
        now_ms: u64,
    ) -> Result<(Withdrawal, Option<Applied>), WithdrawalError> {
        self.finish(
            id,
            WithdrawalResolution::Reject {
                reason: reason.to_string(),
            },
            now_ms,
        )
    }

    fn finish(
        &self,
        id: WithdrawalId,
        resolution: WithdrawalResolution,
        now_ms: u64,
    ) -> Result<(Withdrawal, Option<Applied>), WithdrawalError> {
        match self.store.resolve_withdrawal(id, resolution, now_ms)? {
            WithdrawalResolved::Applied { withdrawal, refund } => {
                info!(id, status = withdrawal.status.as_str(), refunded = refund.is_some(), "withdrawal resolved");
                Ok((withdrawal, refund))
            }
            WithdrawalResolved::AlreadyTerminal { withdrawal } => Err(WithdrawalError::AlreadyResolved {
                id,
                status: withdrawal.status,
            }),
        }
    }

    fn already_resolved(&self, id: WithdrawalId) -> Result<WithdrawalError, WithdrawalError> {
        let withdrawal = self.store.withdrawal(id)?;
        Ok(WithdrawalError::AlreadyResolved {
            id,
            status: withdrawal.status,
        })
    }

    pub fn get(&self, id: WithdrawalId) -> Result<Withdrawal, WithdrawalError> {
        Ok(self.store.withdrawal(id)?)
    }

    /// Oldest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<Withdrawal>, WithdrawalError> {
        Ok(self.store.pending_withdrawals(limit)?)
    }
}
