//! JSON messages exchanged over `/ws`.

use aviator_execution::{Cashout, RoundEvent, RoundSnapshot};
use aviator_types::{AccountId, Amount, AutoplayConfig, Multiplier, PanelId, RoundNumber, RoundRecord};
use serde::{Deserialize, Serialize};

/// Pushed to every connected client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    State {
        round: RoundSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Bet {
        round_number: RoundNumber,
        account_id: AccountId,
        panel_id: PanelId,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    Multiplier {
        round_number: RoundNumber,
        multiplier: Multiplier,
    },
    #[serde(rename_all = "camelCase")]
    Cashout {
        round_number: RoundNumber,
        account_id: AccountId,
        panel_id: PanelId,
        multiplier: Multiplier,
        payout: Amount,
        auto: bool,
    },
    #[serde(rename_all = "camelCase")]
    Crashed {
        record: RoundRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        void_reason: Option<String>,
    },
    History {
        rounds: Vec<RoundRecord>,
    },
    #[serde(rename_all = "camelCase")]
    AutoplayStopped {
        account_id: AccountId,
        panel_id: PanelId,
        reason: String,
    },
}

impl ServerEvent {
    /// Public projection of an engine event. Phase changes are not mapped
    /// here; the actor answers them with a full `State` snapshot.
    pub fn from_round_event(event: &RoundEvent) -> Option<Self> {
        match event {
            RoundEvent::RoundOpened { .. } | RoundEvent::TookOff { .. } => None,
            RoundEvent::BetPlaced(placed) => Some(ServerEvent::Bet {
                round_number: placed.stake.round_number,
                account_id: placed.stake.account_id.clone(),
                panel_id: placed.stake.panel_id,
                amount: placed.stake.amount,
            }),
            RoundEvent::Multiplier {
                round_number,
                multiplier,
            } => Some(ServerEvent::Multiplier {
                round_number: *round_number,
                multiplier: *multiplier,
            }),
            RoundEvent::CashedOut(cashout) => Some(ServerEvent::from(cashout)),
            RoundEvent::Crashed(record) => Some(ServerEvent::Crashed {
                record: record.clone(),
                void_reason: None,
            }),
            RoundEvent::Voided { record, reason, .. } => Some(ServerEvent::Crashed {
                record: record.clone(),
                void_reason: Some(reason.clone()),
            }),
            RoundEvent::AutoplayStopped {
                account_id,
                panel_id,
                reason,
            } => Some(ServerEvent::AutoplayStopped {
                account_id: account_id.clone(),
                panel_id: *panel_id,
                reason: reason.clone(),
            }),
        }
    }
}

impl From<&Cashout> for ServerEvent {
    fn from(cashout: &Cashout) -> Self {
        ServerEvent::Cashout {
            round_number: cashout.round_number,
            account_id: cashout.account_id.clone(),
            panel_id: cashout.panel_id,
            multiplier: cashout.multiplier,
            payout: cashout.payout,
            auto: cashout.auto,
        }
    }
}

/// Sent by a client. Every request carries a `requestId` echoed in the reply.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    #[serde(rename_all = "camelCase")]
    Bet {
        request_id: String,
        account_id: AccountId,
        #[serde(default)]
        panel_id: PanelId,
        amount: Amount,
        #[serde(default)]
        auto_cashout: Option<Multiplier>,
    },
    #[serde(rename_all = "camelCase")]
    Cashout {
        request_id: String,
        account_id: AccountId,
        #[serde(default)]
        panel_id: PanelId,
    },
    #[serde(rename_all = "camelCase")]
    Autoplay {
        request_id: String,
        account_id: AccountId,
        #[serde(default)]
        panel_id: PanelId,
        #[serde(flatten)]
        config: AutoplayConfig,
    },
}

/// Direct reply to one [`InboundMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundResponse {
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        balance: Option<Amount>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payout: Option<Amount>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        request_id: String,
        code: String,
        message: String,
    },
}
