//! Human-like timing jitter for keystroke playback.
//!
//! Two independent AR(1) drift processes per key (press-time and hold) give
//! slow wander; a truncated Gaussian adds per-event variance. Press-time
//! jitter is attenuated for fast repeats so rapid taps stay believable, and
//! an absolute cap keeps the effect subtle in every regime.
//!
//! Suggested factors: time 0.02–0.10, hold 0.05–0.15.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

#[derive(Debug, Clone, Copy)]
pub struct JitterParams {
    /// Fraction of the press anchor used for press-time jitter.
    pub factor_time: f64,
    /// Fraction of the hold duration used for hold jitter.
    pub factor_hold: f64,
    /// AR(1) coefficient.
    pub drift_strength: f64,
    /// Portion of the factor reserved for the drift component.
    pub drift_ratio: f64,
    /// Truncate the normal at ±clip·σ.
    pub clip_sigma: f64,
    /// Anchors at or below this are strongly attenuated.
    pub time_floor_s: f64,
    /// Full effect from this anchor upward.
    pub time_soft_s: f64,
    /// Hard absolute cap on the press-time delta.
    pub abs_cap_time_s: f64,
}

impl Default for JitterParams {
    fn default() -> Self {
        JitterParams {
            factor_time: 0.0,
            factor_hold: 0.0,
            drift_strength: 0.90,
            drift_ratio: 0.35,
            clip_sigma: 3.0,
            time_floor_s: 0.040,
            time_soft_s: 0.200,
            abs_cap_time_s: 0.012,
        }
    }
}

impl JitterParams {
    pub fn with_factors(factor_time: f64, factor_hold: f64) -> Self {
        JitterParams {
            factor_time,
            factor_hold,
            ..JitterParams::default()
        }
    }
}

pub struct HumanJitter {
    ft: f64,
    fh: f64,
    rho: f64,
    dratio: f64,
    clip: f64,
    floor: f64,
    soft: f64,
    abs_cap: f64,
    rng: StdRng,
    drift_time: HashMap<u8, f64>,
    drift_hold: HashMap<u8, f64>,
}

impl HumanJitter {
    pub fn new(params: JitterParams) -> Self {
        Self::with_rng(params, StdRng::from_entropy())
    }

    pub fn seeded(params: JitterParams, seed: u64) -> Self {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }

    fn with_rng(p: JitterParams, rng: StdRng) -> Self {
        let floor = p.time_floor_s.max(0.0);
        HumanJitter {
            ft: p.factor_time.max(0.0),
            fh: p.factor_hold.max(0.0),
            rho: p.drift_strength.clamp(0.0, 0.999),
            dratio: p.drift_ratio.clamp(0.0, 0.95),
            clip: p.clip_sigma.max(1.0),
            floor,
            soft: p.time_soft_s.max(floor + 1e-6),
            abs_cap: p.abs_cap_time_s.max(0.0),
            rng,
            drift_time: HashMap::new(),
            drift_hold: HashMap::new(),
        }
    }

    fn trunc_norm(&mut self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        let x = match Normal::new(0.0, sigma) {
            Ok(n) => n.sample(&mut self.rng),
            Err(_) => return 0.0,
        };
        let lim = self.clip * sigma;
        x.clamp(-lim, lim)
    }

    fn smoothstep01(x: f64) -> f64 {
        let x = x.clamp(0.0, 1.0);
        x * x * (3.0 - 2.0 * x)
    }

    /// Cadence attenuation: a small residual below the floor so fast repeats
    /// are not perfectly rigid, rising smoothly to 1.0 at the soft anchor.
    fn atten_from_anchor(&self, anchor_s: f64) -> f64 {
        if anchor_s <= self.floor {
            return 0.20;
        }
        if anchor_s >= self.soft {
            return 1.0;
        }
        let x = (anchor_s - self.floor) / (self.soft - self.floor);
        0.20 + 0.80 * Self::smoothstep01(x)
    }

    /// Dimensionless fraction in `[-factor·atten, +factor·atten]`.
    fn jitter_frac(&mut self, key: u8, factor: f64, atten: f64, hold_store: bool) -> f64 {
        if factor <= 0.0 || atten <= 0.0 {
            return 0.0;
        }
        let eff = factor * atten;
        let micro_sigma = (eff * (1.0 - self.dratio)) / self.clip;
        let drift_sigma = (eff * self.dratio * atten) / self.clip;

        let step = self.trunc_norm(drift_sigma);
        let store = if hold_store {
            &mut self.drift_hold
        } else {
            &mut self.drift_time
        };
        let prev = store.get(&key).copied().unwrap_or(0.0);
        let next = self.rho * prev + step;
        store.insert(key, next);

        let micro = self.trunc_norm(micro_sigma);
        (next + micro).clamp(-eff, eff)
    }

    /// Additive press-time jitter in seconds. `anchor_s` is the time since
    /// the previous press of the same key.
    pub fn time_jitter(&mut self, usage: u8, anchor_s: f64) -> f64 {
        if anchor_s <= 0.0 || self.ft <= 0.0 {
            return 0.0;
        }
        let atten = self.atten_from_anchor(anchor_s);
        let frac = self.jitter_frac(usage, self.ft, atten, false);
        let delta = anchor_s * frac;
        let cap = self.abs_cap.min(self.ft.abs() * anchor_s * 1.25);
        delta.clamp(-cap, cap)
    }

    /// Additive hold jitter in seconds, without cadence attenuation.
    pub fn hold_jitter(&mut self, usage: u8, hold_s: f64) -> f64 {
        if hold_s <= 0.0 || self.fh <= 0.0 {
            return 0.0;
        }
        let frac = self.jitter_frac(usage, self.fh, 1.0, true);
        hold_s * frac
    }

    /// Uniform draw in `[lo, hi)`, shared with callers that schedule random
    /// pauses from the same RNG stream.
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        self.rng.gen_range(lo..hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jitter(ft: f64, fh: f64, seed: u64) -> HumanJitter {
        HumanJitter::seeded(JitterParams::with_factors(ft, fh), seed)
    }

    #[test]
    fn zero_factor_is_silent() {
        let mut j = jitter(0.0, 0.0, 1);
        for _ in 0..100 {
            assert_eq!(j.time_jitter(4, 0.5), 0.0);
            assert_eq!(j.hold_jitter(4, 0.5), 0.0);
        }
    }

    #[test]
    fn press_delta_respects_absolute_cap() {
        let mut j = jitter(0.08, 0.0, 42);
        for _ in 0..2000 {
            let delta = j.time_jitter(30, 1.0);
            // cap = min(0.012, 0.08 * 1.0 * 1.25) = 0.012
            assert!(delta.abs() <= 0.012 + 1e-12, "delta {delta} over cap");
        }
    }

    #[test]
    fn press_delta_respects_anchor_proportional_cap() {
        let mut j = jitter(0.05, 0.0, 7);
        let anchor = 0.05;
        let cap = (0.05f64 * anchor * 1.25).min(0.012);
        for _ in 0..2000 {
            let delta = j.time_jitter(30, anchor);
            assert!(delta.abs() <= cap + 1e-12);
        }
    }

    #[test]
    fn hold_fraction_bounded_by_factor() {
        let mut j = jitter(0.0, 0.10, 9);
        let hold = 0.3;
        for _ in 0..2000 {
            let delta = j.hold_jitter(5, hold);
            assert!(delta.abs() <= 0.10 * hold + 1e-12);
        }
    }

    #[test]
    fn attenuation_shape() {
        let j = jitter(0.05, 0.0, 0);
        assert!((j.atten_from_anchor(0.010) - 0.20).abs() < 1e-12);
        assert!((j.atten_from_anchor(0.040) - 0.20).abs() < 1e-12);
        assert!((j.atten_from_anchor(0.500) - 1.0).abs() < 1e-12);
        let mid = j.atten_from_anchor(0.120);
        assert!(mid > 0.20 && mid < 1.0);
        // Monotonic between floor and soft.
        assert!(j.atten_from_anchor(0.080) < j.atten_from_anchor(0.160));
    }

    #[test]
    fn seeded_streams_are_deterministic() {
        let mut a = jitter(0.05, 0.05, 1234);
        let mut b = jitter(0.05, 0.05, 1234);
        for _ in 0..50 {
            assert_eq!(a.time_jitter(4, 0.3), b.time_jitter(4, 0.3));
            assert_eq!(a.hold_jitter(4, 0.2), b.hold_jitter(4, 0.2));
        }
    }

    #[test]
    fn drift_streams_are_per_key() {
        // Keys must not share drift state: feeding key A heavily should not
        // change what a fresh key B produces relative to a fresh jitterer.
        let mut warm = jitter(0.05, 0.0, 77);
        for _ in 0..100 {
            warm.time_jitter(4, 0.3);
        }
        let before = warm.drift_time.get(&5).copied();
        assert_eq!(before, None);
    }
}
