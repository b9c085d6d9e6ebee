use crate::Multiplier;

/// Smallest stake a panel may place.
pub const MIN_STAKE: u64 = 10;

/// Default ceiling for a single stake.
pub const DEFAULT_MAX_STAKE: u64 = 100_000;

/// Default number of independent betting panels per account.
pub const DEFAULT_MAX_PANELS: u8 = 2;

/// Lowest auto-cashout target a bettor may register.
pub const MIN_AUTO_CASHOUT: Multiplier = Multiplier::from_hundredths(101);

/// Default cap on any crash point (1000.00x).
pub const DEFAULT_MAX_CRASH: Multiplier = Multiplier::from_hundredths(100_000);

/// Default house edge in basis points (1%).
pub const DEFAULT_HOUSE_EDGE_BPS: u32 = 100;

/// Deposit limits accepted by the payment gateway.
pub const MIN_DEPOSIT: u64 = 10;
pub const MAX_DEPOSIT: u64 = 150_000;

/// Smallest withdrawal a player may request.
pub const MIN_WITHDRAWAL: u64 = 100;

/// Referral bonus on a referred player's first deposit (10%).
pub const REFERRAL_BONUS_BPS: u64 = 1_000;

/// Number of resolved rounds shown in the history strip.
pub const ROUND_HISTORY_LEN: usize = 20;

/// Default phase timings.
pub const DEFAULT_BETTING_MS: u64 = 5_000;
pub const DEFAULT_TICK_MS: u64 = 100;
pub const DEFAULT_COOLDOWN_MS: u64 = 3_000;

/// Prefix of the external reference written for a withdrawal refund.
pub const REFUND_REF_PREFIX: &str = "refund:";

/// Prefix of the external reference written for a referral bonus.
pub const BONUS_REF_PREFIX: &str = "bonus:";

/// Prefix of our own reference for a deposit request.
pub const DEPOSIT_REF_PREFIX: &str = "deposit-";

/// Prefix of our own reference for a gateway payout.
pub const WITHDRAWAL_REF_PREFIX: &str = "withdrawal-";

/// Reason recorded when a payout request never reached the gateway.
pub const PAYMENT_RETRY_REASON: &str = "payment failed, please retry";
