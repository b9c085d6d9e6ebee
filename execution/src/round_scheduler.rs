//! Round scheduler state machine for the crash game.
//!
//! This module provides the deterministic timing rules for the round cycle,
//! kept apart from stakes and ledger I/O so it can be tested in isolation.
//!
//! ## Phases
//!
//! A round cycles through three phases, with no terminal state:
//! 1. **Waiting** - betting window is open for `betting_ms`
//! 2. **Flying** - the multiplier climbs once per tick until the crash point
//! 3. **Crashed** - stakes are resolved, then a `cooldown_ms` pause
//!
//! `Flying` has no wall-clock deadline; it ends when the multiplier reaches
//! the round's crash point.
//!
//! ## Deterministic Clock
//!
//! Every method takes `now_ms` from the caller. Nothing here reads the system
//! clock, so a replay with the same timestamps yields the same transitions.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aviator_execution::round_scheduler::{PhaseConfig, RoundScheduler};
//!
//! let scheduler = RoundScheduler::new(PhaseConfig::default());
//! let betting_ends = scheduler.betting_phase_end_time(now_ms);
//! assert!(scheduler.is_betting_open(RoundPhase::Waiting, betting_ends, now_ms));
//! ```

use aviator_types::{Multiplier, RoundPhase, DEFAULT_BETTING_MS, DEFAULT_COOLDOWN_MS, DEFAULT_TICK_MS};
use serde::{Deserialize, Serialize};

/// Phase configuration with durations in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Duration of the betting window.
    pub betting_ms: u64,
    /// Interval between multiplier ticks while flying.
    pub tick_ms: u64,
    /// Pause after a crash before the next round opens.
    pub cooldown_ms: u64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            betting_ms: DEFAULT_BETTING_MS,
            tick_ms: DEFAULT_TICK_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

impl PhaseConfig {
    /// Create a new phase configuration with the given durations.
    pub fn new(betting_ms: u64, tick_ms: u64, cooldown_ms: u64) -> Self {
        Self {
            betting_ms,
            tick_ms,
            cooldown_ms,
        }
    }

    /// Validate the configuration (all durations must be > 0).
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.betting_ms == 0 {
            return Err("betting_ms must be greater than zero");
        }
        if self.tick_ms == 0 {
            return Err("tick_ms must be greater than zero");
        }
        if self.cooldown_ms == 0 {
            return Err("cooldown_ms must be greater than zero");
        }
        Ok(())
    }
}

/// Growth of the live multiplier, in hundredths per tick.
///
/// `step(m) = max(1, base_step + m * accel_bps / 10_000)`. The curve never
/// looks at the crash point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierCurve {
    pub base_step: u32,
    pub accel_bps: u32,
}

impl Default for MultiplierCurve {
    fn default() -> Self {
        // Roughly +0.05x per tick early on, speeding up as the plane climbs.
        Self {
            base_step: 5,
            accel_bps: 100,
        }
    }
}

impl MultiplierCurve {
    pub fn step(&self, current: Multiplier) -> u32 {
        let accel = u64::from(current.hundredths()) * u64::from(self.accel_bps) / 10_000;
        let step = u64::from(self.base_step).saturating_add(accel).max(1);
        u32::try_from(step).unwrap_or(u32::MAX)
    }

    pub fn next(&self, current: Multiplier) -> Multiplier {
        current.saturating_add(self.step(current))
    }
}

/// Pure state machine for round phase timing.
#[derive(Clone, Debug)]
pub struct RoundScheduler {
    config: PhaseConfig,
}

impl RoundScheduler {
    /// Create a new round scheduler with the given configuration.
    pub fn new(config: PhaseConfig) -> Self {
        Self { config }
    }

    /// Get the phase configuration.
    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    /// Calculate the end time for a new round's betting window.
    pub fn betting_phase_end_time(&self, start_time_ms: u64) -> u64 {
        start_time_ms.saturating_add(self.config.betting_ms)
    }

    /// Check if betting is currently allowed.
    pub fn is_betting_open(&self, current_phase: RoundPhase, phase_ends_at_ms: u64, now_ms: u64) -> bool {
        current_phase == RoundPhase::Waiting && now_ms < phase_ends_at_ms
    }

    /// Check if the betting window has closed and the round can take off.
    pub fn can_take_off(&self, current_phase: RoundPhase, phase_ends_at_ms: u64, now_ms: u64) -> bool {
        current_phase == RoundPhase::Waiting && now_ms >= phase_ends_at_ms
    }

    /// Check if cash-outs are accepted.
    pub fn can_cash_out(&self, current_phase: RoundPhase) -> bool {
        current_phase == RoundPhase::Flying
    }

    /// Calculate the end of the cooldown that follows a crash at `now_ms`.
    pub fn cooldown_phase_timing(&self, now_ms: u64) -> u64 {
        now_ms.saturating_add(self.config.cooldown_ms)
    }

    /// Check if the cooldown is over and the next round can open.
    pub fn can_start_new_round(&self, current_phase: RoundPhase, phase_ends_at_ms: u64, now_ms: u64) -> bool {
        current_phase == RoundPhase::Crashed && now_ms >= phase_ends_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PhaseConfig {
        PhaseConfig {
            betting_ms: 5_000,
            tick_ms: 100,
            cooldown_ms: 3_000,
        }
    }

    #[test]
    fn test_phase_config_validation() {
        let valid = test_config();
        assert!(valid.validate().is_ok());

        let invalid_betting = PhaseConfig { betting_ms: 0, ..valid };
        assert!(invalid_betting.validate().is_err());

        let invalid_tick = PhaseConfig { tick_ms: 0, ..valid };
        assert!(invalid_tick.validate().is_err());

        let invalid_cooldown = PhaseConfig { cooldown_ms: 0, ..valid };
        assert!(invalid_cooldown.validate().is_err());
    }

    #[test]
    fn test_is_betting_open() {
        let scheduler = RoundScheduler::new(test_config());

        // Waiting, before end time
        assert!(scheduler.is_betting_open(RoundPhase::Waiting, 5_000, 4_999));

        // Waiting, at end time (not open)
        assert!(!scheduler.is_betting_open(RoundPhase::Waiting, 5_000, 5_000));

        // Wrong phase
        assert!(!scheduler.is_betting_open(RoundPhase::Flying, 5_000, 0));
        assert!(!scheduler.is_betting_open(RoundPhase::Crashed, 5_000, 0));
    }

    #[test]
    fn test_can_take_off_and_restart() {
        let scheduler = RoundScheduler::new(test_config());
        assert!(scheduler.can_take_off(RoundPhase::Waiting, 5_000, 5_000));
        assert!(!scheduler.can_take_off(RoundPhase::Waiting, 5_000, 4_000));
        assert!(!scheduler.can_take_off(RoundPhase::Crashed, 5_000, 6_000));

        assert!(scheduler.can_start_new_round(RoundPhase::Crashed, 9_000, 9_000));
        assert!(!scheduler.can_start_new_round(RoundPhase::Crashed, 9_000, 8_999));
        assert!(!scheduler.can_start_new_round(RoundPhase::Flying, 9_000, 9_500));
    }

    #[test]
    fn test_can_cash_out_only_while_flying() {
        let scheduler = RoundScheduler::new(test_config());
        assert!(scheduler.can_cash_out(RoundPhase::Flying));
        assert!(!scheduler.can_cash_out(RoundPhase::Waiting));
        assert!(!scheduler.can_cash_out(RoundPhase::Crashed));
    }

    #[test]
    fn test_multiplier_curve_accelerates() {
        let curve = MultiplierCurve::default();
        assert_eq!(curve.next(Multiplier::ONE), Multiplier::from_hundredths(106));
        assert_eq!(curve.step(Multiplier::from_hundredths(1_000)), 15);
        let flat = MultiplierCurve {
            base_step: 0,
            accel_bps: 0,
        };
        // Always advances by at least one hundredth.
        assert_eq!(flat.next(Multiplier::ONE), Multiplier::from_hundredths(101));
    }

    #[test]
    fn test_multiplier_curve_is_monotonic() {
        let curve = MultiplierCurve::default();
        let mut m = Multiplier::ONE;
        for _ in 0..500 {
            let next = curve.next(m);
            assert!(next > m);
            m = next;
        }
    }

    #[test]
    fn test_full_round_cycle() {
        let scheduler = RoundScheduler::new(test_config());
        let mut now_ms = 1_000u64;

        let betting_ends = scheduler.betting_phase_end_time(now_ms);
        assert_eq!(betting_ends, 6_000);
        assert!(scheduler.is_betting_open(RoundPhase::Waiting, betting_ends, now_ms));

        now_ms = 6_000;
        assert!(scheduler.can_take_off(RoundPhase::Waiting, betting_ends, now_ms));

        // Crash detected by the engine at 8.2s.
        now_ms = 8_200;
        let cooldown_ends = scheduler.cooldown_phase_timing(now_ms);
        assert_eq!(cooldown_ends, 11_200);
        assert!(!scheduler.can_start_new_round(RoundPhase::Crashed, cooldown_ends, 11_000));
        assert!(scheduler.can_start_new_round(RoundPhase::Crashed, cooldown_ends, 11_200));
    }

    #[test]
    fn test_overflow_protection() {
        let config = PhaseConfig {
            betting_ms: u64::MAX,
            tick_ms: u64::MAX,
            cooldown_ms: u64::MAX,
        };
        let scheduler = RoundScheduler::new(config);

        assert_eq!(scheduler.betting_phase_end_time(u64::MAX), u64::MAX);
        assert_eq!(scheduler.cooldown_phase_timing(u64::MAX), u64::MAX);
        let saturated = MultiplierCurve {
            base_step: u32::MAX,
            accel_bps: u32::MAX,
        };
        assert_eq!(
            saturated.next(Multiplier::from_hundredths(u32::MAX)),
            Multiplier::from_hundredths(u32::MAX)
        );
    }
}
