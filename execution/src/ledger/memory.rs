use super::{
    refund_ref, to_delta, Applied, DeltaRequest, Ledger, LedgerError, PendingCredit,
    PendingResolved, Resolution, RoundArchive, WithdrawalRequest, WithdrawalResolution,
    WithdrawalResolved, WithdrawalStore,
};
use aviator_types::{
    Account, AccountId, Amount, BetRecord, Delta, NewAccount, RoundNumber, RoundRecord,
    Transaction, TransactionKind, TransactionStatus, TxnId, Withdrawal, WithdrawalId,
    WithdrawalStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    transactions: Vec<Transaction>,
    by_ref: HashMap<String, TxnId>,
    withdrawals: Vec<Withdrawal>,
    by_correlation: HashMap<String, WithdrawalId>,
    links: HashMap<String, String>,
    open_rounds: BTreeMap<RoundNumber, u64>,
    rounds: Vec<RoundRecord>,
    bets: Vec<BetRecord>,
}

impl State {
    fn account_mut(&mut self, id: &str) -> Result<&mut Account, LedgerError> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    fn txn_mut(&mut self, id: TxnId) -> Result<&mut Transaction, LedgerError> {
        let index = usize::try_from(id.saturating_sub(1))
            .map_err(|_| LedgerError::Storage(format!("transaction id {id} out of range")))?;
        self.transactions
            .get_mut(index)
            .ok_or_else(|| LedgerError::Storage(format!("transaction {id} missing")))
    }

    fn withdrawal_mut(&mut self, id: WithdrawalId) -> Result<&mut Withdrawal, LedgerError> {
        let index = usize::try_from(id.saturating_sub(1))
            .map_err(|_| LedgerError::WithdrawalNotFound(id))?;
        self.withdrawals
            .get_mut(index)
            .filter(|w| w.id == id)
            .ok_or(LedgerError::WithdrawalNotFound(id))
    }

    fn ensure_ref_free(&self, external_ref: Option<&str>) -> Result<(), LedgerError> {
        match external_ref {
            Some(r) if self.by_ref.contains_key(r) => Err(LedgerError::DuplicateRef(r.to_string())),
            _ => Ok(()),
        }
    }

    /// Compute the balance after `amount` without mutating anything.
    fn checked_balance(balance: Amount, amount: Delta) -> Result<Amount, LedgerError> {
        if amount >= 0 {
            balance
                .checked_add(amount.unsigned_abs())
                .ok_or(LedgerError::AmountOverflow)
        } else {
            balance
                .checked_sub(amount.unsigned_abs())
                .ok_or(LedgerError::InsufficientFunds {
                    balance,
                    requested: amount.unsigned_abs(),
                })
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_txn(
        &mut self,
        account_id: &str,
        amount: Delta,
        kind: TransactionKind,
        status: TransactionStatus,
        external_ref: Option<String>,
        description: String,
        now_ms: u64,
    ) -> TxnId {
        let id = self.transactions.len() as TxnId + 1;
        if let Some(r) = &external_ref {
            self.by_ref.insert(r.clone(), id);
        }
        self.transactions.push(Transaction {
            id,
            account_id: account_id.to_string(),
            amount,
            kind,
            status,
            external_ref,
            description,
            created_at_ms: now_ms,
        });
        id
    }

    fn apply(&mut self, request: DeltaRequest) -> Result<Applied, LedgerError> {
        if request.amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.ensure_ref_free(request.external_ref.as_deref())?;
        let account = self.account_mut(&request.account_id)?;
        let balance = Self::checked_balance(account.balance, request.amount)?;
        account.balance = balance;
        let txn_id = self.push_txn(
            &request.account_id,
            request.amount,
            request.kind,
            TransactionStatus::Completed,
            request.external_ref,
            request.description,
            request.now_ms,
        );
        Ok(Applied { txn_id, balance })
    }
}

/// In-process ledger for tests and demo mode.
///
/// A single critical section covers every operation, which is stricter than
/// the per-account serialization the ledger contract requires.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Storage("memory ledger lock poisoned".to_string()))
    }
}

impl Ledger for MemoryLedger {
    fn open_account(&self, account: NewAccount, now_ms: u64) -> Result<Account, LedgerError> {
        let mut state = self.lock()?;
        if state.accounts.contains_key(&account.id) {
            return Err(LedgerError::AccountExists(account.id));
        }
        if let Some(referrer) = &account.referrer_id {
            if referrer == &account.id || !state.accounts.contains_key(referrer) {
                return Err(LedgerError::InvalidReferrer(referrer.clone()));
            }
        }
        let opening = to_delta(account.opening_balance)?;
        let created = Account {
            id: account.id.clone(),
            balance: account.opening_balance,
            phone_number: account.phone_number,
            first_deposit_made: false,
            referrer_id: account.referrer_id,
            created_at_ms: now_ms,
        };
        state.accounts.insert(account.id.clone(), created.clone());
        if opening > 0 {
            state.push_txn(
                &account.id,
                opening,
                TransactionKind::Deposit,
                TransactionStatus::Completed,
                None,
                "opening balance".to_string(),
                now_ms,
            );
        }
        Ok(created)
    }

    fn account(&self, id: &str) -> Result<Account, LedgerError> {
        let state = self.lock()?;
        state
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }

    fn apply_delta(&self, request: DeltaRequest) -> Result<Applied, LedgerError> {
        self.lock()?.apply(request)
    }

    fn record_pending(&self, credit: PendingCredit) -> Result<Transaction, LedgerError> {
        if credit.amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let amount = to_delta(credit.amount)?;
        let mut state = self.lock()?;
        state.ensure_ref_free(Some(&credit.external_ref))?;
        state.account_mut(&credit.account_id)?;
        let id = state.push_txn(
            &credit.account_id,
            amount,
            credit.kind,
            TransactionStatus::Pending,
            Some(credit.external_ref),
            credit.description,
            credit.now_ms,
        );
        Ok(state.txn_mut(id)?.clone())
    }

    fn resolve_pending(
        &self,
        external_ref: &str,
        resolution: Resolution,
        _now_ms: u64,
    ) -> Result<PendingResolved, LedgerError> {
        let mut state = self.lock()?;
        let id = *state
            .by_ref
            .get(external_ref)
            .ok_or_else(|| LedgerError::UnknownRef(external_ref.to_string()))?;
        let txn = state.txn_mut(id)?.clone();
        if txn.status.is_terminal() {
            return Ok(PendingResolved::AlreadyTerminal { txn });
        }
        match resolution {
            Resolution::Fail => {
                let row = state.txn_mut(id)?;
                row.status = TransactionStatus::Failed;
                Ok(PendingResolved::Failed { txn: row.clone() })
            }
            Resolution::Complete { receipt_ref } => {
                let account = state.account_mut(&txn.account_id)?;
                let balance = State::checked_balance(account.balance, txn.amount)?;
                account.balance = balance;
                let first_deposit =
                    txn.kind == TransactionKind::Deposit && !account.first_deposit_made;
                if first_deposit {
                    account.first_deposit_made = true;
                }
                let referrer_id = account.referrer_id.clone();
                let row = state.txn_mut(id)?;
                row.status = TransactionStatus::Completed;
                if let Some(receipt) = receipt_ref {
                    row.description = format!("{} (receipt {receipt})", row.description);
                }
                Ok(PendingResolved::Completed {
                    txn: row.clone(),
                    balance,
                    first_deposit,
                    referrer_id,
                })
            }
        }
    }

    fn transaction_by_ref(&self, external_ref: &str) -> Result<Option<Transaction>, LedgerError> {
        let mut state = self.lock()?;
        match state.by_ref.get(external_ref).copied() {
            Some(id) => Ok(Some(state.txn_mut(id)?.clone())),
            None => Ok(None),
        }
    }

    fn link_correlation(&self, reference: &str, correlation_id: &str) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        if state.links.contains_key(correlation_id) {
            return Err(LedgerError::DuplicateRef(correlation_id.to_string()));
        }
        state
            .links
            .insert(correlation_id.to_string(), reference.to_string());
        Ok(())
    }

    fn linked_reference(&self, correlation_id: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.lock()?.links.get(correlation_id).cloned())
    }

    fn transactions_by_ref_prefix(&self, prefix: &str) -> Result<Vec<Transaction>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.external_ref.as_deref().is_some_and(|r| r.starts_with(prefix)))
            .cloned()
            .collect())
    }

    fn transactions(&self, account_id: &str, limit: usize) -> Result<Vec<Transaction>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl WithdrawalStore for MemoryLedger {
    fn reserve_withdrawal(&self, request: WithdrawalRequest) -> Result<Withdrawal, LedgerError> {
        if request.amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let amount = to_delta(request.amount)?;
        let mut state = self.lock()?;
        let id = state.withdrawals.len() as WithdrawalId + 1;
        let applied = state.apply(DeltaRequest::new(
            request.account_id.clone(),
            -amount,
            TransactionKind::Withdrawal,
            format!("withdrawal #{id} to {}", request.phone_number),
            request.now_ms,
        ))?;
        state.txn_mut(applied.txn_id)?.status = TransactionStatus::Pending;
        let withdrawal = Withdrawal {
            id,
            account_id: request.account_id,
            amount: request.amount,
            phone_number: request.phone_number,
            status: WithdrawalStatus::Pending,
            rejection_reason: None,
            correlation_id: None,
            debit_txn: applied.txn_id,
            requested_at_ms: request.now_ms,
            resolved_at_ms: None,
        };
        state.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    fn attach_correlation(&self, id: WithdrawalId, correlation_id: &str) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        if state.by_correlation.contains_key(correlation_id) {
            return Err(LedgerError::DuplicateRef(correlation_id.to_string()));
        }
        let withdrawal = state.withdrawal_mut(id)?;
        if withdrawal.status.is_terminal() || withdrawal.correlation_id.is_some() {
            return Err(LedgerError::WithdrawalNotPending(id));
        }
        withdrawal.correlation_id = Some(correlation_id.to_string());
        state.by_correlation.insert(correlation_id.to_string(), id);
        Ok(())
    }

    fn withdrawal(&self, id: WithdrawalId) -> Result<Withdrawal, LedgerError> {
        Ok(self.lock()?.withdrawal_mut(id)?.clone())
    }

    fn withdrawal_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Withdrawal>, LedgerError> {
        let mut state = self.lock()?;
        match state.by_correlation.get(correlation_id).copied() {
            Some(id) => Ok(Some(state.withdrawal_mut(id)?.clone())),
            None => Ok(None),
        }
    }

    fn pending_withdrawals(&self, limit: usize) -> Result<Vec<Withdrawal>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .withdrawals
            .iter()
            .filter(|w| w.status == WithdrawalStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    fn resolve_withdrawal(
        &self,
        id: WithdrawalId,
        resolution: WithdrawalResolution,
        now_ms: u64,
    ) -> Result<WithdrawalResolved, LedgerError> {
        let mut state = self.lock()?;
        let current = state.withdrawal_mut(id)?.clone();
        if current.status.is_terminal() {
            return Ok(WithdrawalResolved::AlreadyTerminal {
                withdrawal: current,
            });
        }
        let (refund, debit_status, reason) = match &resolution {
            WithdrawalResolution::Approve => (None, TransactionStatus::Completed, None),
            WithdrawalResolution::Reject { reason } => {
                let applied = state.apply(
                    DeltaRequest::new(
                        current.account_id.clone(),
                        to_delta(current.amount)?,
                        TransactionKind::Deposit,
                        format!("refund for withdrawal #{id}"),
                        now_ms,
                    )
                    .with_ref(refund_ref(id)),
                )?;
                (Some(applied), TransactionStatus::Failed, Some(reason.clone()))
            }
        };
        state.txn_mut(current.debit_txn)?.status = debit_status;
        let withdrawal = state.withdrawal_mut(id)?;
        withdrawal.status = resolution.status();
        withdrawal.rejection_reason = reason;
        withdrawal.resolved_at_ms = Some(now_ms);
        Ok(WithdrawalResolved::Applied {
            withdrawal: withdrawal.clone(),
            refund,
        })
    }
}

impl RoundArchive for MemoryLedger {
    fn mark_round_open(&self, round_number: RoundNumber, started_at_ms: u64) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        let used = state.open_rounds.contains_key(&round_number)
            || state.rounds.iter().any(|r| r.round_number == round_number);
        if used {
            return Err(LedgerError::DuplicateRef(format!("round:{round_number}")));
        }
        state.open_rounds.insert(round_number, started_at_ms);
        Ok(())
    }

    fn unresolved_rounds(&self) -> Result<Vec<(RoundNumber, u64)>, LedgerError> {
        let state = self.lock()?;
        Ok(state.open_rounds.iter().map(|(round, at)| (*round, *at)).collect())
    }

    fn archive_round(&self, round: &RoundRecord, bets: &[BetRecord]) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        if state.rounds.iter().any(|r| r.round_number == round.round_number) {
            return Err(LedgerError::DuplicateRef(format!("round:{}", round.round_number)));
        }
        state.open_rounds.remove(&round.round_number);
        state.rounds.push(round.clone());
        state.bets.extend_from_slice(bets);
        Ok(())
    }

    fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, LedgerError> {
        let state = self.lock()?;
        Ok(state.rounds.iter().rev().take(limit).cloned().collect())
    }

    fn latest_round_number(&self) -> Result<Option<RoundNumber>, LedgerError> {
        let state = self.lock()?;
        let archived = state.rounds.iter().map(|r| r.round_number).max();
        let open = state.open_rounds.keys().next_back().copied();
        Ok(archived.max(open))
    }

    fn bet_history(&self, account_id: &str, limit: usize) -> Result<Vec<BetRecord>, LedgerError> {
        let state = self.lock()?;
        Ok(state
            .bets
            .iter()
            .rev()
            .filter(|b| b.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
