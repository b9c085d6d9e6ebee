//! Plain data model for the aviator crash game: accounts, transactions,
//! rounds, stakes, withdrawals and gateway payloads. No I/O lives here.

pub mod account;
pub mod constants;
pub mod money;
pub mod payment;
pub mod round;
pub mod withdrawal;

pub use account::{
    Account, AccountId, NewAccount, Transaction, TransactionKind, TransactionStatus, TxnId,
};
pub use constants::*;
pub use money::{basis_points, Amount, Delta, Multiplier, ParseMultiplierError};
pub use payment::{normalize_phone, GatewayCallback, PhoneError, RESULT_SUCCESS};
pub use round::{
    AutoplayConfig, BetRecord, PanelId, Round, RoundNumber, RoundPhase, RoundRecord, Stake,
    StakeStatus,
};
pub use withdrawal::{Withdrawal, WithdrawalId, WithdrawalStatus};
