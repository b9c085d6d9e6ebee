use crate::{Amount, Delta};
use serde::{Deserialize, Serialize};

/// Opaque account identifier issued by the auth collaborator.
pub type AccountId = String;

/// Ledger-assigned transaction id.
pub type TxnId = u64;

/// Player account. Balance changes only through the ledger's delta primitive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub balance: Amount,
    pub phone_number: Option<String>,
    pub first_deposit_made: bool,
    pub referrer_id: Option<AccountId>,
    pub created_at_ms: u64,
}

/// Parameters for opening an account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub id: AccountId,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub referrer_id: Option<AccountId>,
    #[serde(default)]
    pub opening_balance: Amount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Bet,
    Win,
    Bonus,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Bet => "bet",
            TransactionKind::Win => "win",
            TransactionKind::Bonus => "bonus",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(TransactionKind::Deposit),
            "withdrawal" => Some(TransactionKind::Withdrawal),
            "bet" => Some(TransactionKind::Bet),
            "win" => Some(TransactionKind::Win),
            "bonus" => Some(TransactionKind::Bonus),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// One row of the append-only transaction log.
///
/// `external_ref` is the exact-match correlation key for anything resolved
/// out of band (gateway correlation ids, refund and bonus markers).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TxnId,
    pub account_id: AccountId,
    pub amount: Delta,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub external_ref: Option<String>,
    pub description: String,
    pub created_at_ms: u64,
}

impl Transaction {
    /// Whether this row has moved the account balance.
    ///
    /// Debits apply when written; deposits only once confirmed.
    pub fn affects_balance(&self) -> bool {
        self.kind != TransactionKind::Deposit || self.status == TransactionStatus::Completed
    }
}
