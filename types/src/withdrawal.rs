use crate::{AccountId, Amount, TxnId};
use serde::{Deserialize, Serialize};

pub type WithdrawalId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(WithdrawalStatus::Pending),
            "completed" => Some(WithdrawalStatus::Completed),
            "rejected" => Some(WithdrawalStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

/// Withdrawal request. Funds are reserved by `debit_txn` before the row exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub phone_number: String,
    pub status: WithdrawalStatus,
    pub rejection_reason: Option<String>,
    /// Gateway correlation id, set once a payout has been requested.
    pub correlation_id: Option<String>,
    pub debit_txn: TxnId,
    pub requested_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
}
