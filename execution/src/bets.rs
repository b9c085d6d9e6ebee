//! Bet Registry: the stakes of the current round, keyed by (account, panel).
//!
//! A stake only ever leaves `Active`. Every resolution goes through
//! [`BetRegistry::resolve`], which refuses a second transition, so no stake
//! can be paid twice or lost after being paid.

use aviator_types::{
    AccountId, Amount, BetRecord, Multiplier, PanelId, RoundNumber, Stake, StakeStatus,
};
use std::collections::BTreeMap;

pub type StakeKey = (AccountId, PanelId);

#[derive(Debug, Default)]
pub struct BetRegistry {
    round_number: RoundNumber,
    stakes: BTreeMap<StakeKey, Stake>,
}

impl BetRegistry {
    pub fn new(round_number: RoundNumber) -> Self {
        Self {
            round_number,
            stakes: BTreeMap::new(),
        }
    }

    pub fn round_number(&self) -> RoundNumber {
        self.round_number
    }

    pub fn contains(&self, account_id: &str, panel_id: PanelId) -> bool {
        self.stakes.contains_key(&(account_id.to_string(), panel_id))
    }

    pub fn get(&self, account_id: &str, panel_id: PanelId) -> Option<&Stake> {
        self.stakes.get(&(account_id.to_string(), panel_id))
    }

    /// Insert a freshly placed stake. Returns the stake back if the panel is taken.
    pub fn insert(&mut self, stake: Stake) -> Result<(), Stake> {
        let key = (stake.account_id.clone(), stake.panel_id);
        if self.stakes.contains_key(&key) || stake.round_number != self.round_number {
            return Err(stake);
        }
        self.stakes.insert(key, stake);
        Ok(())
    }

    pub fn stakes(&self) -> impl Iterator<Item = &Stake> {
        self.stakes.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &Stake> {
        self.stakes.values().filter(|s| s.status == StakeStatus::Active)
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Active stakes whose auto-cashout target lies in `(after, upto]` and
    /// strictly below `crash_point`, lowest target first.
    pub fn auto_cashouts_due(
        &self,
        after: Multiplier,
        upto: Multiplier,
        crash_point: Multiplier,
    ) -> Vec<(StakeKey, Multiplier)> {
        let mut due: Vec<_> = self
            .active()
            .filter_map(|s| {
                let target = s.auto_cashout?;
                (target > after && target <= upto && target < crash_point)
                    .then(|| ((s.account_id.clone(), s.panel_id), target))
            })
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due
    }

    /// Move an `Active` stake to `status`. Returns `None` if there is no
    /// active stake under `key`.
    pub fn resolve(
        &mut self,
        key: &StakeKey,
        status: StakeStatus,
        cashout: Option<Multiplier>,
    ) -> Option<&Stake> {
        let stake = self.stakes.get_mut(key)?;
        if stake.status != StakeStatus::Active || status == StakeStatus::Active {
            return None;
        }
        stake.status = status;
        stake.cashout_multiplier = match status {
            StakeStatus::CashedOut => cashout,
            _ => None,
        };
        Some(stake)
    }

    /// Keys of every stake still active.
    pub fn active_keys(&self) -> Vec<StakeKey> {
        self.active()
            .map(|s| (s.account_id.clone(), s.panel_id))
            .collect()
    }

    pub fn total_staked(&self) -> Amount {
        self.stakes
            .values()
            .filter(|s| s.status != StakeStatus::Refunded)
            .map(|s| s.amount)
            .fold(0, Amount::saturating_add)
    }

    pub fn total_paid_out(&self) -> Amount {
        self.stakes
            .values()
            .filter(|s| s.status == StakeStatus::CashedOut)
            .map(Stake::payout)
            .fold(0, Amount::saturating_add)
    }

    /// Records for every resolved stake, in key order.
    pub fn records(&self) -> Vec<BetRecord> {
        self.stakes
            .values()
            .filter(|s| s.status != StakeStatus::Active)
            .map(Stake::to_record)
            .collect()
    }

    /// Start tracking the next round.
    pub fn reset(&mut self, round_number: RoundNumber) {
        self.round_number = round_number;
        self.stakes.clear();
    }
}
