//! Durable ledger on SQLite.
//!
//! Each write runs in a `BEGIN IMMEDIATE` transaction so the balance update,
//! the status check and the log insert commit or roll back together. Balance
//! changes are a single conditional `UPDATE ... WHERE balance + ?delta >= 0`.
//! `SQLITE_BUSY` and `SQLITE_LOCKED` surface as [`LedgerError::Conflict`] and
//! are retried up to the configured budget.

use super::{
    refund_ref, to_delta, with_retry, Applied, DeltaRequest, Ledger, LedgerError, PendingCredit,
    PendingResolved, Resolution, RoundArchive, WithdrawalRequest, WithdrawalResolution,
    WithdrawalResolved, WithdrawalStore, DEFAULT_RETRY_ATTEMPTS,
};
use aviator_types::{
    Account, BetRecord, Multiplier, NewAccount, RoundNumber, RoundRecord, StakeStatus,
    Transaction, TransactionKind, TransactionStatus, TxnId, Withdrawal, WithdrawalId,
    WithdrawalStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT_MS: u64 = 250;

/// Idle connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 8;

const TXN_COLUMNS: &str =
    "id, account_id, amount, kind, status, external_ref, description, created_at_ms";

const WITHDRAWAL_COLUMNS: &str = "id, account_id, amount, phone_number, status, \
     rejection_reason, correlation_id, debit_txn, requested_at_ms, resolved_at_ms";

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                LedgerError::Conflict
            }
            _ => LedgerError::Storage(err.to_string()),
        }
    }
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn invalid_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value {value:?}").into(),
    )
}

fn map_account(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        balance: row.get(1)?,
        phone_number: row.get(2)?,
        first_deposit_made: row.get(3)?,
        referrer_id: row.get(4)?,
        created_at_ms: row.get(5)?,
    })
}

fn map_txn(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let kind: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        kind: TransactionKind::parse(&kind).ok_or_else(|| invalid_text(3, &kind))?,
        status: TransactionStatus::parse(&status).ok_or_else(|| invalid_text(4, &status))?,
        external_ref: row.get(5)?,
        description: row.get(6)?,
        created_at_ms: row.get(7)?,
    })
}

fn map_withdrawal(row: &Row<'_>) -> rusqlite::Result<Withdrawal> {
    let status: String = row.get(4)?;
    Ok(Withdrawal {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        phone_number: row.get(3)?,
        status: WithdrawalStatus::parse(&status).ok_or_else(|| invalid_text(4, &status))?,
        rejection_reason: row.get(5)?,
        correlation_id: row.get(6)?,
        debit_txn: row.get(7)?,
        requested_at_ms: row.get(8)?,
        resolved_at_ms: row.get(9)?,
    })
}

fn map_round(row: &Row<'_>) -> rusqlite::Result<RoundRecord> {
    Ok(RoundRecord {
        round_number: row.get(0)?,
        crash_multiplier: Multiplier::from_hundredths(row.get(1)?),
        voided: row.get(2)?,
        started_at_ms: row.get(3)?,
        crashed_at_ms: row.get(4)?,
        total_staked: row.get(5)?,
        total_paid_out: row.get(6)?,
    })
}

fn map_bet(row: &Row<'_>) -> rusqlite::Result<BetRecord> {
    let status: String = row.get(4)?;
    let cashout: Option<u32> = row.get(5)?;
    Ok(BetRecord {
        round_number: row.get(0)?,
        account_id: row.get(1)?,
        panel_id: row.get(2)?,
        amount: row.get(3)?,
        status: StakeStatus::parse(&status).ok_or_else(|| invalid_text(4, &status))?,
        cashout_multiplier: cashout.map(Multiplier::from_hundredths),
        payout: row.get(6)?,
    })
}

fn open_connection(path: &Path) -> Result<Connection, LedgerError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE IF NOT EXISTS accounts (
             id TEXT PRIMARY KEY,
             balance INTEGER NOT NULL CHECK (balance >= 0),
             phone_number TEXT,
             first_deposit_made INTEGER NOT NULL DEFAULT 0,
             referrer_id TEXT REFERENCES accounts(id),
             created_at_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS transactions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             account_id TEXT NOT NULL REFERENCES accounts(id),
             amount INTEGER NOT NULL,
             kind TEXT NOT NULL,
             status TEXT NOT NULL,
             external_ref TEXT,
             description TEXT NOT NULL,
             created_at_ms INTEGER NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS transactions_external_ref
             ON transactions(external_ref) WHERE external_ref IS NOT NULL;
         CREATE INDEX IF NOT EXISTS transactions_account ON transactions(account_id, id);
         CREATE TABLE IF NOT EXISTS withdrawals (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             account_id TEXT NOT NULL REFERENCES accounts(id),
             amount INTEGER NOT NULL,
             phone_number TEXT NOT NULL,
             status TEXT NOT NULL,
             rejection_reason TEXT,
             correlation_id TEXT,
             debit_txn INTEGER NOT NULL REFERENCES transactions(id),
             requested_at_ms INTEGER NOT NULL,
             resolved_at_ms INTEGER
         );
         CREATE UNIQUE INDEX IF NOT EXISTS withdrawals_correlation
             ON withdrawals(correlation_id) WHERE correlation_id IS NOT NULL;
         CREATE INDEX IF NOT EXISTS withdrawals_status ON withdrawals(status, id);
         CREATE TABLE IF NOT EXISTS payment_links (
             correlation_id TEXT PRIMARY KEY,
             reference TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS rounds (
             round_number INTEGER PRIMARY KEY,
             crash_multiplier INTEGER NOT NULL,
             voided INTEGER NOT NULL,
             started_at_ms INTEGER NOT NULL,
             crashed_at_ms INTEGER NOT NULL,
             total_staked INTEGER NOT NULL,
             total_paid_out INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS open_rounds (
             round_number INTEGER PRIMARY KEY,
             started_at_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS bets (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             round_number INTEGER NOT NULL,
             account_id TEXT NOT NULL,
             panel_id INTEGER NOT NULL,
             amount INTEGER NOT NULL,
             status TEXT NOT NULL,
             cashout_multiplier INTEGER,
             payout INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS bets_account ON bets(account_id, id);",
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn insert_txn(
    conn: &Connection,
    account_id: &str,
    amount: i64,
    kind: TransactionKind,
    status: TransactionStatus,
    external_ref: Option<&str>,
    description: &str,
    now_ms: u64,
) -> Result<TxnId, LedgerError> {
    let inserted = conn.execute(
        "INSERT INTO transactions
             (account_id, amount, kind, status, external_ref, description, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            account_id,
            amount,
            kind.as_str(),
            status.as_str(),
            external_ref,
            description,
            now_ms
        ],
    );
    match inserted {
        Ok(_) => TxnId::try_from(conn.last_insert_rowid())
            .map_err(|_| LedgerError::Storage("negative transaction id".to_string())),
        Err(err) if is_constraint(&err) => Err(LedgerError::DuplicateRef(
            external_ref.unwrap_or_default().to_string(),
        )),
        Err(err) => Err(err.into()),
    }
}

fn balance_of(conn: &Connection, account_id: &str) -> Result<Option<u64>, LedgerError> {
    Ok(conn
        .query_row(
            "SELECT balance FROM accounts WHERE id = ?1",
            [account_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Conditional balance update plus one log row, inside the caller's transaction.
fn apply_in(
    conn: &Connection,
    request: &DeltaRequest,
    status: TransactionStatus,
) -> Result<Applied, LedgerError> {
    if request.amount == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    let changed = conn.execute(
        "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 AND balance + ?1 >= 0",
        params![request.amount, request.account_id],
    )?;
    if changed == 0 {
        return Err(match balance_of(conn, &request.account_id)? {
            None => LedgerError::AccountNotFound(request.account_id.clone()),
            Some(balance) => LedgerError::InsufficientFunds {
                balance,
                requested: request.amount.unsigned_abs(),
            },
        });
    }
    let txn_id = insert_txn(
        conn,
        &request.account_id,
        request.amount,
        request.kind,
        status,
        request.external_ref.as_deref(),
        &request.description,
        request.now_ms,
    )?;
    let balance = balance_of(conn, &request.account_id)?
        .ok_or_else(|| LedgerError::AccountNotFound(request.account_id.clone()))?;
    Ok(Applied { txn_id, balance })
}

fn txn_by_ref(conn: &Connection, external_ref: &str) -> Result<Option<Transaction>, LedgerError> {
    Ok(conn
        .query_row(
            &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE external_ref = ?1"),
            [external_ref],
            map_txn,
        )
        .optional()?)
}

fn txn_by_id(conn: &Connection, id: TxnId) -> Result<Transaction, LedgerError> {
    Ok(conn.query_row(
        &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE id = ?1"),
        [id],
        map_txn,
    )?)
}

fn withdrawal_by_id(conn: &Connection, id: WithdrawalId) -> Result<Withdrawal, LedgerError> {
    conn.query_row(
        &format!("SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = ?1"),
        [id],
        map_withdrawal,
    )
    .optional()?
    .ok_or(LedgerError::WithdrawalNotFound(id))
}

/// SQLite-backed ledger with a small pool of connections to one database file.
pub struct SqliteLedger {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    retry_attempts: u32,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "opened sqlite ledger");
        Ok(Self {
            path,
            idle: Mutex::new(vec![conn]),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    fn checkout(&self) -> Result<Connection, LedgerError> {
        let pooled = self
            .idle
            .lock()
            .map_err(|_| LedgerError::Storage("sqlite pool lock poisoned".to_string()))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => open_connection(&self.path),
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_CONNECTIONS {
                idle.push(conn);
            }
        }
    }

    /// Run a read on a pooled connection.
    fn read<T>(
        &self,
        op: impl FnMut(&Connection) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let conn = self.checkout()?;
        let mut op = op;
        let result = with_retry(self.retry_attempts, || op(&conn));
        self.checkin(conn);
        result
    }

    /// Run `op` inside an immediate transaction, committing on success.
    fn write<T>(
        &self,
        op: impl FnMut(&rusqlite::Transaction<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.checkout()?;
        let mut op = op;
        let result = with_retry(self.retry_attempts, || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        });
        self.checkin(conn);
        result
    }
}

impl Ledger for SqliteLedger {
    fn open_account(&self, account: NewAccount, now_ms: u64) -> Result<Account, LedgerError> {
        let opening = to_delta(account.opening_balance)?;
        self.write(|tx| {
            if let Some(referrer) = &account.referrer_id {
                if referrer == &account.id || balance_of(tx, referrer)?.is_none() {
                    return Err(LedgerError::InvalidReferrer(referrer.clone()));
                }
            }
            let inserted = tx.execute(
                "INSERT INTO accounts
                     (id, balance, phone_number, first_deposit_made, referrer_id, created_at_ms)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![
                    account.id,
                    opening,
                    account.phone_number,
                    account.referrer_id,
                    now_ms
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(err) if is_constraint(&err) => {
                    return Err(LedgerError::AccountExists(account.id.clone()))
                }
                Err(err) => return Err(err.into()),
            }
            if opening > 0 {
                insert_txn(
                    tx,
                    &account.id,
                    opening,
                    TransactionKind::Deposit,
                    TransactionStatus::Completed,
                    None,
                    "opening balance",
                    now_ms,
                )?;
            }
            Ok(Account {
                id: account.id.clone(),
                balance: account.opening_balance,
                phone_number: account.phone_number.clone(),
                first_deposit_made: false,
                referrer_id: account.referrer_id.clone(),
                created_at_ms: now_ms,
            })
        })
    }

    fn account(&self, id: &str) -> Result<Account, LedgerError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, balance, phone_number, first_deposit_made, referrer_id, created_at_ms
                 FROM accounts WHERE id = ?1",
                [id],
                map_account,
            )
            .optional()?
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
        })
    }

    fn apply_delta(&self, request: DeltaRequest) -> Result<Applied, LedgerError> {
        self.write(|tx| apply_in(tx, &request, TransactionStatus::Completed))
    }

    fn record_pending(&self, credit: PendingCredit) -> Result<Transaction, LedgerError> {
        if credit.amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let amount = to_delta(credit.amount)?;
        self.write(|tx| {
            if balance_of(tx, &credit.account_id)?.is_none() {
                return Err(LedgerError::AccountNotFound(credit.account_id.clone()));
            }
            let id = insert_txn(
                tx,
                &credit.account_id,
                amount,
                credit.kind,
                TransactionStatus::Pending,
                Some(&credit.external_ref),
                &credit.description,
                credit.now_ms,
            )?;
            txn_by_id(tx, id)
        })
    }

    fn resolve_pending(
        &self,
        external_ref: &str,
        resolution: Resolution,
        _now_ms: u64,
    ) -> Result<PendingResolved, LedgerError> {
        self.write(|tx| {
            let txn = txn_by_ref(tx, external_ref)?
                .ok_or_else(|| LedgerError::UnknownRef(external_ref.to_string()))?;
            if txn.status.is_terminal() {
                return Ok(PendingResolved::AlreadyTerminal { txn });
            }
            match &resolution {
                Resolution::Fail => {
                    tx.execute(
                        "UPDATE transactions SET status = ?1 WHERE id = ?2 AND status = ?3",
                        params![
                            TransactionStatus::Failed.as_str(),
                            txn.id,
                            TransactionStatus::Pending.as_str()
                        ],
                    )?;
                    Ok(PendingResolved::Failed {
                        txn: txn_by_id(tx, txn.id)?,
                    })
                }
                Resolution::Complete { receipt_ref } => {
                    tx.execute(
                        "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2",
                        params![txn.amount, txn.account_id],
                    )?;
                    let first_deposit = txn.kind == TransactionKind::Deposit
                        && tx.execute(
                            "UPDATE accounts SET first_deposit_made = 1
                             WHERE id = ?1 AND first_deposit_made = 0",
                            [&txn.account_id],
                        )? == 1;
                    let description = match receipt_ref {
                        Some(receipt) => format!("{} (receipt {receipt})", txn.description),
                        None => txn.description.clone(),
                    };
                    tx.execute(
                        "UPDATE transactions SET status = ?1, description = ?2
                         WHERE id = ?3 AND status = ?4",
                        params![
                            TransactionStatus::Completed.as_str(),
                            description,
                            txn.id,
                            TransactionStatus::Pending.as_str()
                        ],
                    )?;
                    let (balance, referrer_id): (u64, Option<String>) = tx.query_row(
                        "SELECT balance, referrer_id FROM accounts WHERE id = ?1",
                        [&txn.account_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    Ok(PendingResolved::Completed {
                        txn: txn_by_id(tx, txn.id)?,
                        balance,
                        first_deposit,
                        referrer_id,
                    })
                }
            }
        })
    }

    fn transaction_by_ref(&self, external_ref: &str) -> Result<Option<Transaction>, LedgerError> {
        self.read(|conn| txn_by_ref(conn, external_ref))
    }

    fn link_correlation(&self, reference: &str, correlation_id: &str) -> Result<(), LedgerError> {
        self.write(|tx| {
            match tx.execute(
                "INSERT INTO payment_links (correlation_id, reference) VALUES (?1, ?2)",
                params![correlation_id, reference],
            ) {
                Ok(_) => Ok(()),
                Err(err) if is_constraint(&err) => {
                    Err(LedgerError::DuplicateRef(correlation_id.to_string()))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn linked_reference(&self, correlation_id: &str) -> Result<Option<String>, LedgerError> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT reference FROM payment_links WHERE correlation_id = ?1",
                    [correlation_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn transactions_by_ref_prefix(&self, prefix: &str) -> Result<Vec<Transaction>, LedgerError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TXN_COLUMNS} FROM transactions
                 WHERE external_ref IS NOT NULL AND substr(external_ref, 1, length(?1)) = ?1
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map([prefix], map_txn)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn transactions(&self, account_id: &str, limit: usize) -> Result<Vec<Transaction>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TXN_COLUMNS} FROM transactions
                 WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![account_id, limit], map_txn)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

impl WithdrawalStore for SqliteLedger {
    fn reserve_withdrawal(&self, request: WithdrawalRequest) -> Result<Withdrawal, LedgerError> {
        if request.amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let amount = to_delta(request.amount)?;
        self.write(|tx| {
            let debit = DeltaRequest::new(
                request.account_id.clone(),
                -amount,
                TransactionKind::Withdrawal,
                format!("withdrawal to {}", request.phone_number),
                request.now_ms,
            );
            let applied = apply_in(tx, &debit, TransactionStatus::Pending)?;
            tx.execute(
                "INSERT INTO withdrawals
                     (account_id, amount, phone_number, status, debit_txn, requested_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request.account_id,
                    amount,
                    request.phone_number,
                    WithdrawalStatus::Pending.as_str(),
                    applied.txn_id,
                    request.now_ms
                ],
            )?;
            let id = WithdrawalId::try_from(tx.last_insert_rowid())
                .map_err(|_| LedgerError::Storage("negative withdrawal id".to_string()))?;
            withdrawal_by_id(tx, id)
        })
    }

    fn attach_correlation(&self, id: WithdrawalId, correlation_id: &str) -> Result<(), LedgerError> {
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE withdrawals SET correlation_id = ?1
                 WHERE id = ?2 AND status = ?3 AND correlation_id IS NULL",
                params![correlation_id, id, WithdrawalStatus::Pending.as_str()],
            );
            match updated {
                Ok(1) => Ok(()),
                Ok(_) => {
                    withdrawal_by_id(tx, id)?;
                    Err(LedgerError::WithdrawalNotPending(id))
                }
                Err(err) if is_constraint(&err) => {
                    Err(LedgerError::DuplicateRef(correlation_id.to_string()))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn withdrawal(&self, id: WithdrawalId) -> Result<Withdrawal, LedgerError> {
        self.read(|conn| withdrawal_by_id(conn, id))
    }

    fn withdrawal_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Withdrawal>, LedgerError> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE correlation_id = ?1"),
                    [correlation_id],
                    map_withdrawal,
                )
                .optional()?)
        })
    }

    fn pending_withdrawals(&self, limit: usize) -> Result<Vec<Withdrawal>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals
                 WHERE status = ?1 ORDER BY id ASC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                params![WithdrawalStatus::Pending.as_str(), limit],
                map_withdrawal,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn resolve_withdrawal(
        &self,
        id: WithdrawalId,
        resolution: WithdrawalResolution,
        now_ms: u64,
    ) -> Result<WithdrawalResolved, LedgerError> {
        self.write(|tx| {
            let current = withdrawal_by_id(tx, id)?;
            if current.status.is_terminal() {
                return Ok(WithdrawalResolved::AlreadyTerminal {
                    withdrawal: current,
                });
            }
            let reason = match &resolution {
                WithdrawalResolution::Approve => None,
                WithdrawalResolution::Reject { reason } => Some(reason.as_str()),
            };
            let updated = tx.execute(
                "UPDATE withdrawals SET status = ?1, rejection_reason = ?2, resolved_at_ms = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    resolution.status().as_str(),
                    reason,
                    now_ms,
                    id,
                    WithdrawalStatus::Pending.as_str()
                ],
            )?;
            if updated != 1 {
                return Err(LedgerError::WithdrawalNotPending(id));
            }
            let (refund, debit_status) = match &resolution {
                WithdrawalResolution::Approve => (None, TransactionStatus::Completed),
                WithdrawalResolution::Reject { .. } => {
                    let refund = DeltaRequest::new(
                        current.account_id.clone(),
                        to_delta(current.amount)?,
                        TransactionKind::Deposit,
                        format!("refund for withdrawal #{id}"),
                        now_ms,
                    )
                    .with_ref(refund_ref(id));
                    (
                        Some(apply_in(tx, &refund, TransactionStatus::Completed)?),
                        TransactionStatus::Failed,
                    )
                }
            };
            tx.execute(
                "UPDATE transactions SET status = ?1 WHERE id = ?2",
                params![debit_status.as_str(), current.debit_txn],
            )?;
            Ok(WithdrawalResolved::Applied {
                withdrawal: withdrawal_by_id(tx, id)?,
                refund,
            })
        })
    }
}

impl RoundArchive for SqliteLedger {
    fn mark_round_open(&self, round_number: RoundNumber, started_at_ms: u64) -> Result<(), LedgerError> {
        self.write(|tx| {
            let archived: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM rounds WHERE round_number = ?1)",
                [round_number],
                |row| row.get(0),
            )?;
            if archived {
                return Err(LedgerError::DuplicateRef(format!("round:{round_number}")));
            }
            match tx.execute(
                "INSERT INTO open_rounds (round_number, started_at_ms) VALUES (?1, ?2)",
                params![round_number, started_at_ms],
            ) {
                Ok(_) => Ok(()),
                Err(err) if is_constraint(&err) => {
                    Err(LedgerError::DuplicateRef(format!("round:{round_number}")))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn unresolved_rounds(&self) -> Result<Vec<(RoundNumber, u64)>, LedgerError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT round_number, started_at_ms FROM open_rounds ORDER BY round_number",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn archive_round(&self, round: &RoundRecord, bets: &[BetRecord]) -> Result<(), LedgerError> {
        self.write(|tx| {
            let inserted = tx.execute(
                "INSERT INTO rounds
                     (round_number, crash_multiplier, voided, started_at_ms, crashed_at_ms,
                      total_staked, total_paid_out)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    round.round_number,
                    round.crash_multiplier.hundredths(),
                    round.voided,
                    round.started_at_ms,
                    round.crashed_at_ms,
                    round.total_staked,
                    round.total_paid_out
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(err) if is_constraint(&err) => {
                    return Err(LedgerError::DuplicateRef(format!("round:{}", round.round_number)));
                }
                Err(err) => return Err(err.into()),
            }
            tx.execute(
                "DELETE FROM open_rounds WHERE round_number = ?1",
                [round.round_number],
            )?;
            let mut stmt = tx.prepare(
                "INSERT INTO bets
                     (round_number, account_id, panel_id, amount, status, cashout_multiplier, payout)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bet in bets {
                stmt.execute(params![
                    bet.round_number,
                    bet.account_id,
                    bet.panel_id,
                    bet.amount,
                    bet.status.as_str(),
                    bet.cashout_multiplier.map(Multiplier::hundredths),
                    bet.payout
                ])?;
            }
            Ok(())
        })
    }

    fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT round_number, crash_multiplier, voided, started_at_ms, crashed_at_ms,
                        total_staked, total_paid_out
                 FROM rounds ORDER BY round_number DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], map_round)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn latest_round_number(&self) -> Result<Option<RoundNumber>, LedgerError> {
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(round_number) FROM
                     (SELECT round_number FROM rounds UNION ALL SELECT round_number FROM open_rounds)",
                [],
                |row| row.get(0),
            )?)
        })
    }

    fn bet_history(&self, account_id: &str, limit: usize) -> Result<Vec<BetRecord>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT round_number, account_id, panel_id, amount, status, cashout_multiplier,
                        payout
                 FROM bets WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![account_id, limit], map_bet)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn open_temp() -> (tempfile::TempDir, SqliteLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SqliteLedger::open(dir.path().join("ledger.db")).unwrap();
        (dir, ledger)
    }

    fn fund(ledger: &SqliteLedger, id: &str, balance: u64) {
        ledger
            .open_account(
                NewAccount {
                    id: id.to_string(),
                    opening_balance: balance,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
    }

    #[test]
    fn test_conditional_debit() {
        let (_dir, ledger) = open_temp();
        fund(&ledger, "alice", 100);
        let applied = ledger
            .apply_delta(DeltaRequest::new("alice", -60, TransactionKind::Bet, "bet", 1))
            .unwrap();
        assert_eq!(applied.balance, 40);
        assert_eq!(
            ledger.apply_delta(DeltaRequest::new("alice", -41, TransactionKind::Bet, "bet", 2)),
            Err(LedgerError::InsufficientFunds {
                balance: 40,
                requested: 41
            })
        );
        assert_eq!(
            ledger.apply_delta(DeltaRequest::new("nobody", 5, TransactionKind::Win, "win", 2)),
            Err(LedgerError::AccountNotFound("nobody".to_string()))
        );
        // Opening balance plus the one successful bet.
        assert_eq!(ledger.transactions("alice", 10).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_ref_rolls_back_balance() {
        let (_dir, ledger) = open_temp();
        fund(&ledger, "alice", 0);
        let credit =
            DeltaRequest::new("alice", 25, TransactionKind::Bonus, "bonus", 1).with_ref("bonus:x");
        ledger.apply_delta(credit.clone()).unwrap();
        assert_eq!(
            ledger.apply_delta(credit),
            Err(LedgerError::DuplicateRef("bonus:x".to_string()))
        );
        assert_eq!(ledger.account("alice").unwrap().balance, 25);
    }

    #[test]
    fn test_pending_deposit_resolves_once() {
        let (_dir, ledger) = open_temp();
        fund(&ledger, "alice", 0);
        ledger
            .record_pending(PendingCredit {
                account_id: "alice".into(),
                amount: 500,
                kind: TransactionKind::Deposit,
                external_ref: "ws_CO_1".into(),
                description: "deposit".into(),
                now_ms: 1,
            })
            .unwrap();
        assert_eq!(ledger.account("alice").unwrap().balance, 0);

        let first = ledger
            .resolve_pending(
                "ws_CO_1",
                Resolution::Complete {
                    receipt_ref: Some("QKX1".into()),
                },
                2,
            )
            .unwrap();
        match first {
            PendingResolved::Completed {
                balance,
                first_deposit,
                txn,
                ..
            } => {
                assert_eq!(balance, 500);
                assert!(first_deposit);
                assert!(txn.description.contains("QKX1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let replay = ledger
            .resolve_pending("ws_CO_1", Resolution::Complete { receipt_ref: None }, 3)
            .unwrap();
        assert!(matches!(replay, PendingResolved::AlreadyTerminal { .. }));
        assert_eq!(ledger.account("alice").unwrap().balance, 500);
        assert!(ledger.account("alice").unwrap().first_deposit_made);
    }

    #[test]
    fn test_concurrent_debits_never_overdraw() {
        let (_dir, ledger) = open_temp();
        fund(&ledger, "alice", 1_000);
        let ledger = Arc::new(ledger.with_retry_attempts(50));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let mut ok = 0u64;
                    for j in 0..10 {
                        let request = DeltaRequest::new(
                            "alice",
                            -30,
                            TransactionKind::Bet,
                            format!("bet {i}-{j}"),
                            j,
                        );
                        if ledger.apply_delta(request).is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();
        let successes: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let balance = ledger.account("alice").unwrap().balance;
        assert_eq!(balance, 1_000 - 30 * successes);
        assert!(successes <= 33);
    }

    #[test]
    fn test_archive_roundtrip_and_latest_round() {
        let (_dir, ledger) = open_temp();
        assert_eq!(ledger.latest_round_number().unwrap(), None);
        let record = RoundRecord {
            round_number: 4,
            crash_multiplier: Multiplier::from_hundredths(180),
            voided: false,
            started_at_ms: 10,
            crashed_at_ms: 20,
            total_staked: 100,
            total_paid_out: 0,
        };
        let bet = BetRecord {
            round_number: 4,
            account_id: "alice".into(),
            panel_id: 1,
            amount: 100,
            status: StakeStatus::Lost,
            cashout_multiplier: None,
            payout: 0,
        };
        ledger.archive_round(&record, &[bet.clone()]).unwrap();
        assert_eq!(ledger.latest_round_number().unwrap(), Some(4));
        assert_eq!(ledger.recent_rounds(20).unwrap(), vec![record]);
        assert_eq!(ledger.bet_history("alice", 5).unwrap(), vec![bet]);
    }

    #[test]
    fn test_open_round_marker_lifecycle() {
        let (_dir, ledger) = open_temp();
        ledger.mark_round_open(5, 10).unwrap();
        assert_eq!(ledger.latest_round_number().unwrap(), Some(5));
        assert_eq!(ledger.unresolved_rounds().unwrap(), vec![(5, 10)]);
        assert!(matches!(ledger.mark_round_open(5, 11), Err(LedgerError::DuplicateRef(_))));

        let record = RoundRecord {
            round_number: 5,
            crash_multiplier: Multiplier::from_hundredths(210),
            voided: false,
            started_at_ms: 10,
            crashed_at_ms: 30,
            total_staked: 0,
            total_paid_out: 0,
        };
        ledger.archive_round(&record, &[]).unwrap();
        assert!(ledger.unresolved_rounds().unwrap().is_empty());
        assert_eq!(ledger.latest_round_number().unwrap(), Some(5));
        assert!(matches!(ledger.mark_round_open(5, 40), Err(LedgerError::DuplicateRef(_))));
        assert!(matches!(ledger.archive_round(&record, &[]), Err(LedgerError::DuplicateRef(_))));
    }

    #[test]
    fn test_transactions_by_ref_prefix() {
        let (_dir, ledger) = open_temp();
        fund(&ledger, "alice", 1_000);
        for r in ["bet:1:alice:0", "bet:1:alice:1", "bet:12:alice:0"] {
            ledger
                .apply_delta(DeltaRequest::new("alice", -10, TransactionKind::Bet, "bet", 1).with_ref(r))
                .unwrap();
        }
        let refs: Vec<_> = ledger
            .transactions_by_ref_prefix("bet:1:")
            .unwrap()
            .into_iter()
            .filter_map(|t| t.external_ref)
            .collect();
        assert_eq!(refs, vec!["bet:1:alice:0", "bet:1:alice:1"]);
        // LIKE wildcards are matched literally.
        assert!(ledger.transactions_by_ref_prefix("bet:_").unwrap().is_empty());
    }
}
