use crate::{AccountId, Amount, Multiplier, TxnId};
use serde::{Deserialize, Serialize};

/// Monotonically increasing round number; doubles as the round id.
pub type RoundNumber = u64;

/// Betting slot index within one account.
pub type PanelId = u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Waiting,
    Flying,
    Crashed,
}

impl RoundPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundPhase::Waiting => "waiting",
            RoundPhase::Flying => "flying",
            RoundPhase::Crashed => "crashed",
        }
    }
}

/// Live round owned by the engine.
///
/// The crash point is a pure function of the round seed, fixed when the round
/// is created; it is materialized at takeoff and never sent to clients before
/// the crash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Round {
    pub round_number: RoundNumber,
    pub seed: [u8; 32],
    pub crash_point: Option<Multiplier>,
    pub phase: RoundPhase,
    pub multiplier: Multiplier,
    pub started_at_ms: u64,
    pub betting_ends_at_ms: u64,
    pub crashed_at_ms: Option<u64>,
    pub voided: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeStatus {
    Active,
    CashedOut,
    Lost,
    Refunded,
}

impl StakeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StakeStatus::Active => "active",
            StakeStatus::CashedOut => "cashed_out",
            StakeStatus::Lost => "lost",
            StakeStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(StakeStatus::Active),
            "cashed_out" => Some(StakeStatus::CashedOut),
            "lost" => Some(StakeStatus::Lost),
            "refunded" => Some(StakeStatus::Refunded),
            _ => None,
        }
    }
}

/// A single bet held by one panel of one account within one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stake {
    pub round_number: RoundNumber,
    pub account_id: AccountId,
    pub panel_id: PanelId,
    pub amount: Amount,
    pub status: StakeStatus,
    pub cashout_multiplier: Option<Multiplier>,
    pub auto_cashout: Option<Multiplier>,
    pub bet_txn: TxnId,
    pub placed_at_ms: u64,
}

impl Stake {
    pub fn payout(&self) -> Amount {
        match (self.status, self.cashout_multiplier) {
            (StakeStatus::CashedOut, Some(m)) => m.payout(self.amount),
            (StakeStatus::Refunded, _) => self.amount,
            _ => 0,
        }
    }

    pub fn to_record(&self) -> BetRecord {
        BetRecord {
            round_number: self.round_number,
            account_id: self.account_id.clone(),
            panel_id: self.panel_id,
            amount: self.amount,
            status: self.status,
            cashout_multiplier: self.cashout_multiplier,
            payout: self.payout(),
        }
    }
}

/// Per-panel autoplay agent configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoplayConfig {
    pub enabled: bool,
    pub bet_amount: Amount,
    #[serde(default)]
    pub auto_cashout: Option<Multiplier>,
}

/// Archived outcome of one resolved round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub round_number: RoundNumber,
    pub crash_multiplier: Multiplier,
    pub voided: bool,
    pub started_at_ms: u64,
    pub crashed_at_ms: u64,
    pub total_staked: Amount,
    pub total_paid_out: Amount,
}

/// Archived outcome of one resolved stake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRecord {
    pub round_number: RoundNumber,
    pub account_id: AccountId,
    pub panel_id: PanelId,
    pub amount: Amount,
    pub status: StakeStatus,
    pub cashout_multiplier: Option<Multiplier>,
    pub payout: Amount,
}
