//! Payment Reconciler.
//!
//! Gateway callbacks arrive out of band, possibly early, late or more than
//! once. Every payment request carries our own reference, written to the
//! ledger before the request leaves. A callback's correlation id is either
//! that reference or the gateway's own id, which is linked to it once the
//! gateway answers. The reference is matched first against withdrawals, then
//! against pending deposit transactions. The status check and the status write
//! happen inside the ledger's atomic boundary, so a replayed callback resolves
//! to [`CallbackOutcome::Duplicate`] and changes nothing.
//!
//! Deposits are two-phase. [`PaymentReconciler::prepare_deposit`] validates
//! the request, then [`PaymentReconciler::record_deposit`] writes the pending
//! transaction under our reference before the gateway is contacted.

use crate::ledger::{
    to_delta, Applied, DeltaRequest, LedgerError, PendingCredit, PendingResolved, Resolution,
    WithdrawalResolution, WithdrawalResolved, WithdrawalStore,
};
use aviator_types::{
    basis_points, normalize_phone, AccountId, Amount, GatewayCallback, PhoneError, Transaction,
    TransactionKind, Withdrawal, BONUS_REF_PREFIX, DEPOSIT_REF_PREFIX, MAX_DEPOSIT, MIN_DEPOSIT,
    PAYMENT_RETRY_REASON, REFERRAL_BONUS_BPS,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{error, info, warn};

/// Our reference for a deposit request, unique per `token`.
pub fn deposit_reference(token: impl std::fmt::Display) -> String {
    format!("{DEPOSIT_REF_PREFIX}{token}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLimits {
    pub min_deposit: Amount,
    pub max_deposit: Amount,
    /// Bonus paid to the referrer on a referred account's first deposit.
    pub referral_bonus_bps: u64,
}

impl Default for PaymentLimits {
    fn default() -> Self {
        Self {
            min_deposit: MIN_DEPOSIT,
            max_deposit: MAX_DEPOSIT,
            referral_bonus_bps: REFERRAL_BONUS_BPS,
        }
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("deposit {amount} below minimum {min}")]
    BelowMinimum { amount: Amount, min: Amount },
    #[error("deposit {amount} above maximum {max}")]
    AboveMaximum { amount: Amount, max: Amount },
    #[error(transparent)]
    InvalidPhone(#[from] PhoneError),
    #[error("payment failed, please retry")]
    GatewayFailed,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl PaymentError {
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::BelowMinimum { .. } => "BELOW_MINIMUM",
            PaymentError::AboveMaximum { .. } => "ABOVE_MAXIMUM",
            PaymentError::InvalidPhone(_) => "INVALID_PHONE",
            PaymentError::GatewayFailed => "PAYMENT_FAILED",
            PaymentError::Ledger(e) => e.code(),
        }
    }
}

/// A validated deposit, ready to be sent to the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositIntent {
    pub account_id: AccountId,
    pub amount: Amount,
    /// Normalized `254XXXXXXXXX`.
    pub phone_number: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BonusCredit {
    pub referrer_id: AccountId,
    pub amount: Amount,
    pub applied: Applied,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    DepositCompleted {
        txn: Transaction,
        balance: Amount,
        bonus: Option<BonusCredit>,
    },
    DepositFailed {
        txn: Transaction,
    },
    WithdrawalCompleted {
        withdrawal: Withdrawal,
    },
    WithdrawalRejected {
        withdrawal: Withdrawal,
        refund: Option<Applied>,
    },
    /// The matching record was already terminal. Nothing changed.
    Duplicate { correlation_id: String },
    /// No deposit or withdrawal carries this correlation id.
    UnknownCorrelation { correlation_id: String },
}

impl CallbackOutcome {
    /// Whether the callback changed any state.
    pub fn applied(&self) -> bool {
        !matches!(
            self,
            CallbackOutcome::Duplicate { .. } | CallbackOutcome::UnknownCorrelation { .. }
        )
    }
}

pub struct PaymentReconciler<S> {
    store: Arc<S>,
    limits: PaymentLimits,
}

impl<S> Clone for PaymentReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            limits: self.limits,
        }
    }
}

impl<S: WithdrawalStore> PaymentReconciler<S> {
    pub fn new(store: Arc<S>, limits: PaymentLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &PaymentLimits {
        &self.limits
    }

    /// Validate a deposit before any gateway call is made.
    pub fn prepare_deposit(
        &self,
        account_id: &str,
        amount: Amount,
        phone: &str,
    ) -> Result<DepositIntent, PaymentError> {
        if amount < self.limits.min_deposit {
            return Err(PaymentError::BelowMinimum {
                amount,
                min: self.limits.min_deposit,
            });
        }
        if amount > self.limits.max_deposit {
            return Err(PaymentError::AboveMaximum {
                amount,
                max: self.limits.max_deposit,
            });
        }
        let phone_number = normalize_phone(phone)?;
        self.store.account(account_id)?;
        Ok(DepositIntent {
            account_id: account_id.to_string(),
            amount,
            phone_number,
        })
    }

    /// Record the pending deposit under `reference`, our own key for it.
    /// Call this before the gateway is contacted.
    pub fn record_deposit(
        &self,
        intent: &DepositIntent,
        reference: &str,
        now_ms: u64,
    ) -> Result<Transaction, PaymentError> {
        let txn = self.store.record_pending(PendingCredit {
            account_id: intent.account_id.clone(),
            amount: intent.amount,
            kind: TransactionKind::Deposit,
            external_ref: reference.to_string(),
            description: format!("deposit from {}", intent.phone_number),
            now_ms,
        })?;
        info!(account = %intent.account_id, amount = intent.amount, reference, "deposit pending");
        Ok(txn)
    }

    /// Link the id the gateway returned to our reference. A gateway that
    /// echoes our reference back needs no link.
    pub fn link_correlation(&self, reference: &str, correlation_id: &str) -> Result<(), PaymentError> {
        if reference == correlation_id {
            return Ok(());
        }
        self.store.link_correlation(reference, correlation_id)?;
        Ok(())
    }

    /// Fail a pending deposit whose gateway request never went through.
    pub fn abandon_deposit(&self, reference: &str, now_ms: u64) -> Result<(), PaymentError> {
        match self.store.resolve_pending(reference, Resolution::Fail, now_ms)? {
            PendingResolved::Failed { txn } => {
                info!(reference, account = %txn.account_id, "deposit abandoned");
            }
            resolved => {
                warn!(reference, ?resolved, "deposit resolved before it could be abandoned");
            }
        }
        Ok(())
    }

    /// Apply a gateway callback. Replays and unknown references are absorbed.
    pub fn handle_callback(
        &self,
        callback: &GatewayCallback,
        now_ms: u64,
    ) -> Result<CallbackOutcome, PaymentError> {
        let linked = self.store.linked_reference(&callback.correlation_id)?;
        let correlation_id = linked.as_deref().unwrap_or(&callback.correlation_id);
        if let Some(withdrawal) = self.store.withdrawal_by_correlation(correlation_id)? {
            return self.settle_withdrawal(withdrawal, callback, now_ms);
        }

        let resolution = if callback.is_success() {
            Resolution::Complete {
                receipt_ref: callback.receipt_ref.clone(),
            }
        } else {
            Resolution::Fail
        };
        let resolved = match self.store.resolve_pending(correlation_id, resolution, now_ms) {
            Err(LedgerError::UnknownRef(_)) => {
                warn!(correlation = %callback.correlation_id, "callback for unknown correlation id");
                return Ok(CallbackOutcome::UnknownCorrelation {
                    correlation_id: callback.correlation_id.clone(),
                });
            }
            other => other?,
        };
        match resolved {
            PendingResolved::AlreadyTerminal { txn } => {
                info!(correlation = %correlation_id, status = txn.status.as_str(), "duplicate callback ignored");
                Ok(CallbackOutcome::Duplicate {
                    correlation_id: callback.correlation_id.clone(),
                })
            }
            PendingResolved::Failed { txn } => {
                info!(correlation = %correlation_id, account = %txn.account_id, code = callback.result_code, "deposit failed");
                Ok(CallbackOutcome::DepositFailed { txn })
            }
            PendingResolved::Completed {
                txn,
                balance,
                first_deposit,
                referrer_id,
            } => {
                if let Some(reported) = callback.amount {
                    if i64::try_from(reported).ok() != Some(txn.amount) {
                        warn!(correlation = %correlation_id, recorded = txn.amount, reported, "callback amount differs from recorded deposit");
                    }
                }
                info!(correlation = %correlation_id, account = %txn.account_id, amount = txn.amount, "deposit completed");
                let bonus = match (first_deposit, referrer_id) {
                    (true, Some(referrer_id)) => self.credit_referral_bonus(&txn, referrer_id, now_ms),
                    _ => None,
                };
                Ok(CallbackOutcome::DepositCompleted {
                    txn,
                    balance,
                    bonus,
                })
            }
        }
    }

    fn settle_withdrawal(
        &self,
        withdrawal: Withdrawal,
        callback: &GatewayCallback,
        now_ms: u64,
    ) -> Result<CallbackOutcome, PaymentError> {
        let resolution = if callback.is_success() {
            WithdrawalResolution::Approve
        } else {
            WithdrawalResolution::Reject {
                reason: PAYMENT_RETRY_REASON.to_string(),
            }
        };
        match self.store.resolve_withdrawal(withdrawal.id, resolution, now_ms)? {
            WithdrawalResolved::AlreadyTerminal { withdrawal } => {
                info!(id = withdrawal.id, correlation = %callback.correlation_id, "duplicate payout callback ignored");
                Ok(CallbackOutcome::Duplicate {
                    correlation_id: callback.correlation_id.clone(),
                })
            }
            WithdrawalResolved::Applied { withdrawal, refund } => {
                info!(id = withdrawal.id, status = withdrawal.status.as_str(), "payout settled");
                Ok(match refund {
                    None => CallbackOutcome::WithdrawalCompleted { withdrawal },
                    refund => CallbackOutcome::WithdrawalRejected { withdrawal, refund },
                })
            }
        }
    }

    /// Credit the referrer once. The bonus is a separate atomic delta keyed by
    /// the deposit's reference; a failure here leaves the deposit credited.
    fn credit_referral_bonus(
        &self,
        deposit: &Transaction,
        referrer_id: AccountId,
        now_ms: u64,
    ) -> Option<BonusCredit> {
        let deposited = Amount::try_from(deposit.amount).ok()?;
        let amount = basis_points(deposited, self.limits.referral_bonus_bps);
        if amount == 0 {
            return None;
        }
        let external_ref = format!(
            "{BONUS_REF_PREFIX}{}",
            deposit.external_ref.as_deref().unwrap_or_default()
        );
        let request = to_delta(amount).map(|delta| {
            DeltaRequest::new(
                referrer_id.clone(),
                delta,
                TransactionKind::Bonus,
                format!("referral bonus for {}", deposit.account_id),
                now_ms,
            )
            .with_ref(external_ref)
        });
        match request.and_then(|request| self.store.apply_delta(request)) {
            Ok(applied) => {
                info!(referrer = %referrer_id, account = %deposit.account_id, amount, "referral bonus credited");
                Some(BonusCredit {
                    referrer_id,
                    amount,
                    applied,
                })
            }
            Err(err) => {
                error!(referrer = %referrer_id, account = %deposit.account_id, amount, ?err, "referral bonus not credited");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Ledger, MemoryLedger};
    use crate::mocks::{callback, funded_ledger};
    use aviator_types::{NewAccount, TransactionStatus, RESULT_SUCCESS};

    fn reconciler() -> (Arc<MemoryLedger>, PaymentReconciler<MemoryLedger>) {
        let ledger = funded_ledger(&[("alice", 0)]);
        (ledger.clone(), PaymentReconciler::new(ledger, PaymentLimits::default()))
    }

    #[test]
    fn test_prepare_deposit_limits() {
        let (_, reconciler) = reconciler();
        assert_eq!(
            reconciler.prepare_deposit("alice", 9, "0712345678"),
            Err(PaymentError::BelowMinimum { amount: 9, min: 10 })
        );
        assert_eq!(
            reconciler.prepare_deposit("alice", 150_001, "0712345678"),
            Err(PaymentError::AboveMaximum {
                amount: 150_001,
                max: 150_000
            })
        );
        assert_eq!(
            reconciler.prepare_deposit("alice", 100, "not a phone").map_err(|e| e.code()),
            Err("INVALID_PHONE")
        );
        assert_eq!(
            reconciler.prepare_deposit("bob", 100, "0712345678").map_err(|e| e.code()),
            Err("ACCOUNT_NOT_FOUND")
        );
        let intent = reconciler.prepare_deposit("alice", 150_000, "+254 712 345 678").unwrap();
        assert_eq!(intent.phone_number, "254712345678");
    }

    #[test]
    fn test_deposit_is_pending_until_callback() {
        let (ledger, reconciler) = reconciler();
        let intent = reconciler.prepare_deposit("alice", 500, "0712345678").unwrap();
        let txn = reconciler.record_deposit(&intent, "ws_CO_1", 1).unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);
        assert_eq!(ledger.account("alice").unwrap().balance, 0);

        let outcome = reconciler
            .handle_callback(&callback("ws_CO_1", RESULT_SUCCESS, Some(500)), 2)
            .unwrap();
        match outcome {
            CallbackOutcome::DepositCompleted { txn, balance, bonus } => {
                assert_eq!(txn.status, TransactionStatus::Completed);
                assert_eq!(balance, 500);
                assert!(bonus.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(ledger.account("alice").unwrap().first_deposit_made);
    }

    #[test]
    fn test_failed_deposit_credits_nothing() {
        let (ledger, reconciler) = reconciler();
        let intent = reconciler.prepare_deposit("alice", 500, "0712345678").unwrap();
        reconciler.record_deposit(&intent, "ws_CO_2", 1).unwrap();
        let outcome = reconciler
            .handle_callback(&callback("ws_CO_2", 1032, None), 2)
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::DepositFailed { .. }));
        assert_eq!(ledger.account("alice").unwrap().balance, 0);
        assert!(!ledger.account("alice").unwrap().first_deposit_made);
    }

    #[test]
    fn test_unknown_correlation_is_absorbed() {
        let (_, reconciler) = reconciler();
        let outcome = reconciler
            .handle_callback(&callback("nobody", RESULT_SUCCESS, Some(10)), 1)
            .unwrap();
        assert_eq!(
            outcome,
            CallbackOutcome::UnknownCorrelation {
                correlation_id: "nobody".to_string()
            }
        );
        assert!(!outcome.applied());
    }

    #[test]
    fn test_callback_matches_our_reference_or_the_linked_id() {
        let (ledger, reconciler) = reconciler();
        let early = deposit_reference("a");
        let intent = reconciler.prepare_deposit("alice", 200, "0712345678").unwrap();
        reconciler.record_deposit(&intent, &early, 1).unwrap();
        // The gateway called back with our reference before returning its own id.
        let outcome = reconciler
            .handle_callback(&callback(&early, RESULT_SUCCESS, Some(200)), 2)
            .unwrap();
        assert!(matches!(outcome, CallbackOutcome::DepositCompleted { balance: 200, .. }));
        reconciler.link_correlation(&early, "ws_CO_9").unwrap();
        let replay = reconciler
            .handle_callback(&callback("ws_CO_9", RESULT_SUCCESS, Some(200)), 3)
            .unwrap();
        assert_eq!(
            replay,
            CallbackOutcome::Duplicate {
                correlation_id: "ws_CO_9".to_string()
            }
        );

        let late = deposit_reference("b");
        reconciler.record_deposit(&intent, &late, 4).unwrap();
        reconciler.link_correlation(&late, "ws_CO_10").unwrap();
        reconciler.link_correlation(&late, &late).unwrap();
        reconciler
            .handle_callback(&callback("ws_CO_10", RESULT_SUCCESS, Some(200)), 5)
            .unwrap();
        assert_eq!(ledger.account("alice").unwrap().balance, 400);
        assert_eq!(
            reconciler.link_correlation(&early, "ws_CO_10").map_err(|e| e.code()),
            Err("DUPLICATE_REFERENCE")
        );
    }

    #[test]
    fn test_abandoned_deposit_ignores_later_success() {
        let (ledger, reconciler) = reconciler();
        let reference = deposit_reference("x");
        let intent = reconciler.prepare_deposit("alice", 300, "0712345678").unwrap();
        reconciler.record_deposit(&intent, &reference, 1).unwrap();
        reconciler.abandon_deposit(&reference, 2).unwrap();
        let txn = ledger.transaction_by_ref(&reference).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Failed);

        let outcome = reconciler
            .handle_callback(&callback(&reference, RESULT_SUCCESS, Some(300)), 3)
            .unwrap();
        assert!(!outcome.applied());
        assert_eq!(ledger.account("alice").unwrap().balance, 0);
    }

    #[test]
    fn test_referral_bonus_on_first_deposit_only() {
        let (ledger, reconciler) = reconciler();
        ledger
            .open_account(
                NewAccount {
                    id: "bob".to_string(),
                    referrer_id: Some("alice".to_string()),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        for (n, correlation) in ["c-1", "c-2"].iter().enumerate() {
            let intent = reconciler.prepare_deposit("bob", 1_000, "0712345678").unwrap();
            reconciler.record_deposit(&intent, correlation, n as u64).unwrap();
            reconciler
                .handle_callback(&callback(correlation, RESULT_SUCCESS, Some(1_000)), n as u64)
                .unwrap();
        }
        assert_eq!(ledger.account("bob").unwrap().balance, 2_000);
        assert_eq!(ledger.account("alice").unwrap().balance, 100);
        let bonus = ledger.transaction_by_ref("bonus:c-1").unwrap().unwrap();
        assert_eq!(bonus.kind, TransactionKind::Bonus);
        assert!(ledger.transaction_by_ref("bonus:c-2").unwrap().is_none());
    }
}
