//! Crash point generation.
//!
//! Every round gets a seed derived from the master secret:
//!
//! ```text
//! seed[n]  = SHA256(master_secret || n || "crash")
//! crash[n] = curve(seed[n])
//! ```
//!
//! The crash point is a pure function of the seed and the configured curve, so
//! it is fixed as soon as the round exists and cannot adapt to the bets placed
//! on it. The live multiplier is driven by a separate, seed-independent curve
//! (see [`crate::round_scheduler::MultiplierCurve`]), so watching it reveals
//! nothing about where the round will end.

use aviator_types::{Multiplier, RoundNumber, DEFAULT_HOUSE_EDGE_BPS, DEFAULT_MAX_CRASH};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error as ThisError;

pub const SEED_LEN: usize = 32;

pub type RoundSeed = [u8; SEED_LEN];

/// Probability scale for the hazard curve.
const PPM: u64 = 1_000_000;

/// Bits of the seed used by the house-edge curve.
const HOUSE_EDGE_BITS: u32 = 52;

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum CrashError {
    #[error("house edge must be below 10000 bps (got {0})")]
    EdgeOutOfRange(u32),
    #[error("crash cap must be at least 1.00x (got {0})")]
    CapTooLow(Multiplier),
    #[error("hazard base must be below 1000000 ppm (got {0})")]
    HazardOutOfRange(u32),
    #[error("crash source unavailable: {0}")]
    Unavailable(String),
}

impl CrashError {
    pub fn code(&self) -> &'static str {
        "CONFIGURATION_FAULT"
    }
}

/// Tunable crash distribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrashCurve {
    /// Inverse-uniform distribution with a fixed house edge.
    HouseEdge { edge_bps: u32, max: Multiplier },
    /// Step-wise walk with a hazard rising with the square of the multiplier.
    Hazard {
        base_ppm: u32,
        slope_ppm: u32,
        max: Multiplier,
    },
}

impl Default for CrashCurve {
    fn default() -> Self {
        CrashCurve::HouseEdge {
            edge_bps: DEFAULT_HOUSE_EDGE_BPS,
            max: DEFAULT_MAX_CRASH,
        }
    }
}

impl CrashCurve {
    pub fn max(&self) -> Multiplier {
        match self {
            CrashCurve::HouseEdge { max, .. } | CrashCurve::Hazard { max, .. } => *max,
        }
    }

    pub fn validate(&self) -> Result<(), CrashError> {
        if self.max() < Multiplier::ONE {
            return Err(CrashError::CapTooLow(self.max()));
        }
        match self {
            CrashCurve::HouseEdge { edge_bps, .. } if *edge_bps >= 10_000 => {
                Err(CrashError::EdgeOutOfRange(*edge_bps))
            }
            CrashCurve::Hazard { base_ppm, .. } if u64::from(*base_ppm) >= PPM => {
                Err(CrashError::HazardOutOfRange(*base_ppm))
            }
            _ => Ok(()),
        }
    }
}

/// Derive the seed for `round` from the master secret.
pub fn derive_round_seed(master: &RoundSeed, round: RoundNumber) -> RoundSeed {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update(round.to_be_bytes());
    hasher.update(b"crash"); // Domain separator
    hasher.finalize().into()
}

/// Map a round seed to its crash point. Always within `[1.00x, curve.max()]`.
pub fn generate_crash_point(seed: &RoundSeed, curve: &CrashCurve) -> Result<Multiplier, CrashError> {
    curve.validate()?;
    let point = match curve {
        CrashCurve::HouseEdge { edge_bps, max } => house_edge(seed, *edge_bps, *max),
        CrashCurve::Hazard {
            base_ppm,
            slope_ppm,
            max,
        } => hazard(seed, *base_ppm, *slope_ppm, *max),
    };
    Ok(point.clamp_to(Multiplier::ONE, curve.max()))
}

fn house_edge(seed: &RoundSeed, edge_bps: u32, max: Multiplier) -> Multiplier {
    let mut head = [0u8; 8];
    head.copy_from_slice(&seed[..8]);
    let h = u128::from(u64::from_be_bytes(head) >> (64 - HOUSE_EDGE_BITS));
    let e = 1u128 << HOUSE_EDGE_BITS;
    let numerator = u128::from(10_000 - edge_bps) * e;
    let hundredths = numerator / (100 * (e - h));
    let capped = hundredths.min(u128::from(max.hundredths()));
    Multiplier::from_hundredths(u32::try_from(capped).unwrap_or(u32::MAX))
}

fn hazard(seed: &RoundSeed, base_ppm: u32, slope_ppm: u32, max: Multiplier) -> Multiplier {
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let cap = max.hundredths();
    let mut m = Multiplier::ONE.hundredths();
    while m < cap {
        let over = u64::from(m - Multiplier::ONE.hundredths());
        let rising = u64::from(slope_ppm).saturating_mul(over.saturating_mul(over)) / 10_000;
        let p = u64::from(base_ppm).saturating_add(rising).min(PPM);
        if rng.gen_range(0..PPM) < p {
            break;
        }
        m += 1;
    }
    Multiplier::from_hundredths(m)
}

/// Where the engine gets its crash points from.
pub trait CrashSource: Send {
    fn seed_for(&self, round: RoundNumber) -> RoundSeed;

    fn crash_point(&mut self, round: RoundNumber, seed: &RoundSeed) -> Result<Multiplier, CrashError>;
}

/// Production source: master secret plus a configured curve.
#[derive(Clone, Debug)]
pub struct SeededCrash {
    master: RoundSeed,
    curve: CrashCurve,
}

impl SeededCrash {
    pub fn new(master: RoundSeed, curve: CrashCurve) -> Result<Self, CrashError> {
        curve.validate()?;
        Ok(Self { master, curve })
    }

    pub fn curve(&self) -> &CrashCurve {
        &self.curve
    }
}

impl CrashSource for SeededCrash {
    fn seed_for(&self, round: RoundNumber) -> RoundSeed {
        derive_round_seed(&self.master, round)
    }

    fn crash_point(&mut self, _round: RoundNumber, seed: &RoundSeed) -> Result<Multiplier, CrashError> {
        generate_crash_point(seed, &self.curve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MASTER: RoundSeed = [7u8; SEED_LEN];

    fn hazard_curve() -> CrashCurve {
        CrashCurve::Hazard {
            base_ppm: 2_000,
            slope_ppm: 1_000,
            max: Multiplier::from_hundredths(10_000),
        }
    }

    #[test]
    fn test_round_seeds_are_deterministic_and_distinct() {
        assert_eq!(derive_round_seed(&MASTER, 5), derive_round_seed(&MASTER, 5));
        assert_ne!(derive_round_seed(&MASTER, 5), derive_round_seed(&MASTER, 6));
        assert_ne!(derive_round_seed(&MASTER, 5), derive_round_seed(&[8u8; 32], 5));
    }

    #[test]
    fn test_house_edge_extremes() {
        let curve = CrashCurve::default();
        // h = 0 gives 0.99x before clamping.
        assert_eq!(generate_crash_point(&[0u8; 32], &curve).unwrap(), Multiplier::ONE);
        // h at the top of the range hits the cap.
        assert_eq!(generate_crash_point(&[0xff; 32], &curve).unwrap(), DEFAULT_MAX_CRASH);
    }

    #[test]
    fn test_house_edge_half_point() {
        let mut seed = [0u8; 32];
        seed[0] = 0x80; // h = 2^51
        let curve = CrashCurve::HouseEdge {
            edge_bps: 0,
            max: DEFAULT_MAX_CRASH,
        };
        assert_eq!(
            generate_crash_point(&seed, &curve).unwrap(),
            Multiplier::from_hundredths(200)
        );
    }

    #[test]
    fn test_house_edge_distribution() {
        let curve = CrashCurve::default();
        let rounds = 20_000u64;
        let at_least_two = (0..rounds)
            .filter(|n| {
                let seed = derive_round_seed(&MASTER, *n);
                generate_crash_point(&seed, &curve).unwrap() >= Multiplier::from_hundredths(200)
            })
            .count() as f64;
        // P(crash >= 2x) = 0.99 / 2
        let observed = at_least_two / rounds as f64;
        assert!((observed - 0.495).abs() < 0.02, "observed {observed}");
    }

    #[test]
    fn test_hazard_is_deterministic_and_capped() {
        let seed = derive_round_seed(&MASTER, 11);
        let curve = hazard_curve();
        let a = generate_crash_point(&seed, &curve).unwrap();
        assert_eq!(a, generate_crash_point(&seed, &curve).unwrap());

        let certain = CrashCurve::Hazard {
            base_ppm: 999_999,
            slope_ppm: u32::MAX,
            max: Multiplier::from_hundredths(500),
        };
        assert!(generate_crash_point(&seed, &certain).unwrap() <= Multiplier::from_hundredths(102));

        let never = CrashCurve::Hazard {
            base_ppm: 0,
            slope_ppm: 0,
            max: Multiplier::from_hundredths(300),
        };
        assert_eq!(
            generate_crash_point(&seed, &never).unwrap(),
            Multiplier::from_hundredths(300)
        );
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            CrashCurve::HouseEdge {
                edge_bps: 10_000,
                max: DEFAULT_MAX_CRASH
            }
            .validate(),
            Err(CrashError::EdgeOutOfRange(10_000))
        );
        assert_eq!(
            CrashCurve::HouseEdge {
                edge_bps: 100,
                max: Multiplier::from_hundredths(99)
            }
            .validate(),
            Err(CrashError::CapTooLow(Multiplier::from_hundredths(99)))
        );
        assert!(matches!(
            SeededCrash::new(
                MASTER,
                CrashCurve::Hazard {
                    base_ppm: 1_000_000,
                    slope_ppm: 0,
                    max: DEFAULT_MAX_CRASH
                }
            ),
            Err(CrashError::HazardOutOfRange(_))
        ));
    }

    #[test]
    fn test_curve_config_shape() {
        let curve: CrashCurve =
            serde_json::from_str(r#"{"kind":"hazard","base_ppm":2000,"slope_ppm":1000,"max":10000}"#)
                .unwrap();
        assert_eq!(curve, hazard_curve());
    }

    proptest! {
        #[test]
        fn prop_crash_point_within_bounds(seed in any::<[u8; 32]>(), edge in 0u32..2_000, cap in 100u32..200_000) {
            let curve = CrashCurve::HouseEdge { edge_bps: edge, max: Multiplier::from_hundredths(cap) };
            let point = generate_crash_point(&seed, &curve).unwrap();
            prop_assert!(point >= Multiplier::ONE);
            prop_assert!(point <= Multiplier::from_hundredths(cap));
        }

        #[test]
        fn prop_hazard_within_bounds(seed in any::<[u8; 32]>(), base in 0u32..50_000, slope in 0u32..50_000) {
            let curve = CrashCurve::Hazard { base_ppm: base, slope_ppm: slope, max: Multiplier::from_hundredths(2_000) };
            let point = generate_crash_point(&seed, &curve).unwrap();
            prop_assert!(point >= Multiplier::ONE);
            prop_assert!(point <= Multiplier::from_hundredths(2_000));
        }
    }
}
