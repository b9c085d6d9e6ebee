//! Live round service.
//!
//! Drives a single authoritative [`aviator_execution::RoundEngine`] from one
//! tokio task and exposes it, together with the ledger, withdrawals and the
//! payment callback, over HTTP and WebSocket.

pub mod actor;
pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod messages;

use actor::{Clock, RoundActor, RoundHandle};
use anyhow::Context;
use aviator_execution::{
    Ledger, PaymentReconciler, RoundArchive, RoundEngine, RoundSeed, SeededCrash, WithdrawalRegistry,
    WithdrawalStore, SEED_LEN,
};
use config::{ValidatedConfig, WithdrawalMode};
use gateway::PaymentGateway;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything the service needs from a ledger backend.
pub trait Store: Ledger + WithdrawalStore + RoundArchive + 'static {}

impl<T: Ledger + WithdrawalStore + RoundArchive + 'static> Store for T {}

/// Shared state handed to every request handler.
pub struct AppState<L> {
    pub ledger: Arc<L>,
    pub rounds: RoundHandle,
    pub withdrawals: WithdrawalRegistry<L>,
    pub reconciler: PaymentReconciler<L>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub withdrawal_mode: WithdrawalMode,
    pub clock: Arc<dyn Clock>,
    pub admin_token: Option<String>,
}

impl<L> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            rounds: self.rounds.clone(),
            withdrawals: self.withdrawals.clone(),
            reconciler: self.reconciler.clone(),
            gateway: self.gateway.clone(),
            withdrawal_mode: self.withdrawal_mode,
            clock: self.clock.clone(),
            admin_token: self.admin_token.clone(),
        }
    }
}

impl<L: Store> AppState<L> {
    pub fn new(
        ledger: Arc<L>,
        rounds: RoundHandle,
        config: &ValidatedConfig,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            withdrawals: WithdrawalRegistry::new(ledger.clone()).with_minimum(config.min_withdrawal),
            reconciler: PaymentReconciler::new(ledger.clone(), config.payments),
            ledger,
            rounds,
            gateway,
            withdrawal_mode: config.withdrawal_mode,
            clock,
            admin_token: config.admin_token.clone(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// Master secret from config, or fresh from the OS.
pub fn master_seed(config: &ValidatedConfig) -> RoundSeed {
    config.master_seed.unwrap_or_else(|| {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        seed
    })
}

/// Build the engine, spawn the round actor and assemble the handler state.
pub fn start<L: Store>(
    ledger: Arc<L>,
    config: &ValidatedConfig,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<(AppState<L>, JoinHandle<()>)> {
    let crash = SeededCrash::new(master_seed(config), config.crash_curve.clone())
        .context("invalid crash curve")?;
    let engine = RoundEngine::new(config.engine.clone(), ledger.clone(), crash, clock.now_ms())
        .context("failed to start round engine")?;
    info!(
        round = engine.round().round_number,
        curve = ?config.crash_curve,
        "round engine ready"
    );
    let (rounds, actor) = RoundActor::spawn(engine, clock.clone(), config.tick_interval());
    Ok((AppState::new(ledger, rounds, config, gateway, clock), actor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::PausedClock;
    use crate::config::Config;
    use crate::gateway::SandboxGateway;
    use crate::messages::ServerEvent;
    use aviator_execution::mocks::open_funded;
    use aviator_execution::SqliteLedger;
    use tokio::sync::broadcast::error::RecvError;

    fn config() -> ValidatedConfig {
        Config {
            betting_ms: 1_000,
            tick_ms: 100,
            cooldown_ms: 500,
            master_seed: Some("07".repeat(SEED_LEN)),
            ..Config::default()
        }
        .validate()
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_after_archived_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let config = config();

        let ledger = Arc::new(SqliteLedger::open(&path).unwrap());
        open_funded(&*ledger, "alice", 1_000);
        let (state, actor) = start(
            ledger.clone(),
            &config,
            Arc::new(SandboxGateway::new()),
            Arc::new(PausedClock::start()),
        )
        .unwrap();
        let first = state.rounds.snapshot().await.unwrap().round_number;
        state.rounds.place_bet("alice", 0, 100, None).await.unwrap().unwrap();

        let mut events = state.rounds.subscribe();
        let crashed = loop {
            match events.recv().await {
                Ok(ServerEvent::Crashed { record, .. }) => break record,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("actor stopped"),
            }
        };
        assert_eq!(crashed.round_number, first);
        actor.abort();
        drop(state);

        let (state, _actor) = start(
            ledger.clone(),
            &config,
            Arc::new(SandboxGateway::new()),
            Arc::new(PausedClock::start()),
        )
        .unwrap();
        let resumed = state.rounds.snapshot().await.unwrap();
        assert!(resumed.round_number > first);
        let history = state.rounds.history().await.unwrap();
        assert!(history.iter().any(|round| round.round_number == first));
        assert_eq!(ledger.bet_history("alice", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_configured_seed_is_used() {
        assert_eq!(master_seed(&config()), [7u8; SEED_LEN]);
    }
}
