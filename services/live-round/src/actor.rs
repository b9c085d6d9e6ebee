//! The round actor.
//!
//! One tokio task owns the [`RoundEngine`]. Ticks and player commands are
//! serialized through it, so a cash-out is always judged against the phase
//! and multiplier the engine holds at that instant. Everything that
//! happened is fanned out to subscribers on a broadcast channel.
//!
//! Engine calls write to the ledger synchronously. On a multi-threaded
//! runtime they run under `block_in_place`.

use crate::messages::ServerEvent;
use aviator_execution::{
    Cashout, CrashSource, EngineError, Ledger, PlacedBet, RoundArchive, RoundEngine, RoundEvent,
    RoundSnapshot,
};
use aviator_types::{Amount, AutoplayConfig, Multiplier, PanelId, RoundRecord};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_BACKLOG: usize = 1024;
const EVENT_BACKLOG: usize = 1024;

/// Run engine work that writes to the ledger synchronously. On a
/// multi-threaded runtime the worker hands its other tasks off first.
fn in_place<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

/// Source of `now_ms` for everything the service does.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Milliseconds since the clock was created, on tokio's clock. Follows
/// paused time in tests.
#[cfg(test)]
pub(crate) struct PausedClock(tokio::time::Instant);

#[cfg(test)]
impl PausedClock {
    pub(crate) fn start() -> Self {
        Self(tokio::time::Instant::now())
    }
}

#[cfg(test)]
impl Clock for PausedClock {
    fn now_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

enum Command {
    PlaceBet {
        account_id: String,
        panel_id: PanelId,
        amount: Amount,
        auto_cashout: Option<Multiplier>,
        reply: oneshot::Sender<Result<PlacedBet, EngineError>>,
    },
    CashOut {
        account_id: String,
        panel_id: PanelId,
        reply: oneshot::Sender<Result<Cashout, EngineError>>,
    },
    Autoplay {
        account_id: String,
        panel_id: PanelId,
        config: AutoplayConfig,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoundSnapshot>,
    },
    History {
        reply: oneshot::Sender<Vec<RoundRecord>>,
    },
}

/// The actor went away before answering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActorGone;

/// Cheap, cloneable way to talk to the round actor.
#[derive(Clone)]
pub struct RoundHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ServerEvent>,
}

impl RoundHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ActorGone> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| ActorGone)?;
        response.await.map_err(|_| ActorGone)
    }

    pub async fn place_bet(
        &self,
        account_id: &str,
        panel_id: PanelId,
        amount: Amount,
        auto_cashout: Option<Multiplier>,
    ) -> Result<Result<PlacedBet, EngineError>, ActorGone> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::PlaceBet {
            account_id,
            panel_id,
            amount,
            auto_cashout,
            reply,
        })
        .await
    }

    pub async fn cash_out(&self, account_id: &str, panel_id: PanelId) -> Result<Result<Cashout, EngineError>, ActorGone> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::CashOut {
            account_id,
            panel_id,
            reply,
        })
        .await
    }

    pub async fn set_autoplay(
        &self,
        account_id: &str,
        panel_id: PanelId,
        config: AutoplayConfig,
    ) -> Result<Result<(), EngineError>, ActorGone> {
        let account_id = account_id.to_string();
        self.call(|reply| Command::Autoplay {
            account_id,
            panel_id,
            config,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<RoundSnapshot, ActorGone> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<RoundRecord>, ActorGone> {
        self.call(|reply| Command::History { reply }).await
    }
}

pub struct RoundActor<L, C> {
    engine: RoundEngine<L, C>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ServerEvent>,
}

impl<L, C> RoundActor<L, C>
where
    L: Ledger + RoundArchive + 'static,
    C: CrashSource + 'static,
{
    /// Spawn the actor. It stops once every [`RoundHandle`] is dropped.
    pub fn spawn(engine: RoundEngine<L, C>, clock: Arc<dyn Clock>, tick: Duration) -> (RoundHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BACKLOG);
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        let handle = RoundHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let actor = Self {
            engine,
            clock,
            tick,
            commands,
            events,
        };
        (handle, tokio::spawn(actor.run()))
    }

    async fn run(mut self) {
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(round = self.engine.round().round_number, tick_ms = self.tick.as_millis() as u64, "round actor started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = self.clock.now_ms();
                    let events = in_place(|| self.engine.tick(now_ms));
                    self.publish(&events);
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    in_place(|| self.handle(command));
                }
            }
        }
        info!("round actor stopped");
    }

    fn handle(&mut self, command: Command) {
        let now_ms = self.clock.now_ms();
        match command {
            Command::PlaceBet {
                account_id,
                panel_id,
                amount,
                auto_cashout,
                reply,
            } => {
                let result = self
                    .engine
                    .place_bet(&account_id, panel_id, amount, auto_cashout, now_ms);
                if let Ok(placed) = &result {
                    self.publish(&[RoundEvent::BetPlaced(placed.clone())]);
                }
                let _ = reply.send(result);
            }
            Command::CashOut {
                account_id,
                panel_id,
                reply,
            } => {
                let result = self.engine.cash_out(&account_id, panel_id, now_ms);
                match &result {
                    Ok(cashout) => self.publish(&[RoundEvent::CashedOut(cashout.clone())]),
                    Err(err) if !err.is_rejection() => {
                        warn!(account = %account_id, panel = panel_id, ?err, "cash-out failed")
                    }
                    Err(err) => debug!(account = %account_id, panel = panel_id, %err, "cash-out rejected"),
                }
                let _ = reply.send(result);
            }
            Command::Autoplay {
                account_id,
                panel_id,
                config,
                reply,
            } => {
                let _ = reply.send(self.engine.set_autoplay(&account_id, panel_id, config));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::History { reply } => {
                let _ = reply.send(self.engine.recent_rounds());
            }
        }
    }

    fn publish(&self, events: &[RoundEvent]) {
        let mut phase_changed = false;
        let mut resolved = false;
        for event in events {
            match event {
                RoundEvent::RoundOpened { .. } | RoundEvent::TookOff { .. } => phase_changed = true,
                RoundEvent::Crashed(_) => resolved = true,
                RoundEvent::Voided { record, reason, refunded } => {
                    error!(round = record.round_number, %reason, refunded, "round voided");
                    resolved = true;
                }
                _ => {}
            }
            if let Some(message) = ServerEvent::from_round_event(event) {
                self.send(message);
            }
        }
        if resolved {
            self.send(ServerEvent::History {
                rounds: self.engine.recent_rounds(),
            });
        }
        if phase_changed || resolved {
            self.send(ServerEvent::State {
                round: self.engine.snapshot(),
            });
        }
    }

    fn send(&self, event: ServerEvent) {
        // No subscribers is normal between connections.
        let _ = self.events.send(event);
    }
}
