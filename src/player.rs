//! Recording playback: speed scaling, per-key humanisation, same-key
//! spacing, a unified down/up timeline, and cancel-responsive dispatch to
//! the HID sink. The skill injector hooks into the timeline walk.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::cancel::CancelFlag;
use crate::error::Result;
use crate::hid::ReportSink;
use crate::injector::SkillInjector;
use crate::jitter::{HumanJitter, JitterParams};
use crate::keymap;
use crate::recorder::{Action, Recording};
use crate::util;

#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub speed: f64,
    pub jitter_time: f64,
    pub jitter_hold: f64,
    pub min_hold_s: f64,
    pub min_repeat_same_key_s: f64,
    /// `<= 0` loops forever.
    pub loop_count: i64,
    pub ignore_keys: Vec<String>,
    /// Probability of dropping an ignore-key action.
    pub ignore_tolerance: f64,
    /// Fixed RNG seed; tests only.
    pub seed: Option<u64>,
}

impl Default for PlayOptions {
    fn default() -> Self {
        PlayOptions {
            speed: 1.0,
            jitter_time: 0.0,
            jitter_hold: 0.0,
            min_hold_s: 0.001,
            min_repeat_same_key_s: 0.010,
            loop_count: 1,
            ignore_keys: Vec::new(),
            ignore_tolerance: 0.0,
            seed: None,
        }
    }
}

/// `Down` sorts before `Up` so a same-instant release of one key and press
/// of another keeps both in the report for that frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Edge {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEvent {
    pub t: f64,
    pub edge: Edge,
    pub usage: u8,
}

pub fn parse_ignore_keys(names: &[String]) -> BTreeSet<u8> {
    names
        .iter()
        .map(|n| keymap::name_to_usage(n))
        .filter(|&u| u > 0)
        .collect()
}

/// Apply speed, ignore-sampling, jitter and same-key spacing, then flatten
/// to a sorted down/up timeline.
pub fn build_timeline(
    actions: &[Action],
    opts: &PlayOptions,
    hj: &mut HumanJitter,
    rng: &mut StdRng,
) -> Vec<TimelineEvent> {
    let inv_speed = if opts.speed > 0.0 { 1.0 / opts.speed } else { 1.0 };

    let ignore = parse_ignore_keys(&opts.ignore_keys);
    let mut scaled: Vec<Action> = Vec::with_capacity(actions.len());
    let mut dropped = 0usize;
    for a in actions {
        if !ignore.is_empty()
            && opts.ignore_tolerance > 0.0
            && ignore.contains(&a.usage)
            && rng.gen::<f64>() < opts.ignore_tolerance
        {
            dropped += 1;
            continue;
        }
        scaled.push(Action {
            usage: a.usage,
            press: (a.press * inv_speed).max(0.0),
            dur: (a.dur * inv_speed).max(0.0),
        });
    }
    if dropped > 0 {
        debug!(dropped, total = actions.len(), "ignore-key sampling dropped actions");
    }

    let mut last_press: HashMap<u8, f64> = HashMap::new();
    let mut last_release: HashMap<u8, f64> = HashMap::new();
    let mut events: Vec<TimelineEvent> = Vec::with_capacity(scaled.len() * 2);

    for a in &scaled {
        let mut press_at = a.press;

        // Press-time jitter, anchored to the previous press of this key.
        // A key never pressed before gets an effectively infinite anchor:
        // full attenuation range, bounded by the absolute cap.
        let prev = last_press.get(&a.usage).copied().unwrap_or(-1e9);
        let anchor = (press_at - prev).max(0.040);
        press_at += hj.time_jitter(a.usage, anchor);
        if press_at < 0.0 {
            press_at = 0.0;
        }

        let hold = (a.dur + hj.hold_jitter(a.usage, a.dur)).max(opts.min_hold_s);

        // Same-key spacing: never repeat a key faster than the configured gap.
        if let Some(up) = last_release.get(&a.usage) {
            let earliest = up + opts.min_repeat_same_key_s;
            if press_at < earliest {
                press_at = earliest;
            }
        }

        let release_at = press_at + hold;
        events.push(TimelineEvent {
            t: press_at,
            edge: Edge::Down,
            usage: a.usage,
        });
        events.push(TimelineEvent {
            t: release_at,
            edge: Edge::Up,
            usage: a.usage,
        });
        last_press.insert(a.usage, press_at);
        last_release.insert(a.usage, release_at);
    }

    events.sort_by(|a, b| {
        a.t.partial_cmp(&b.t)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.edge.cmp(&b.edge))
            .then(a.usage.cmp(&b.usage))
    });
    events
}

/// Replays recordings into a [`ReportSink`].
pub struct Player<S: ReportSink> {
    sink: S,
}

impl<S: ReportSink> Player<S> {
    pub fn new(sink: S) -> Self {
        Player { sink }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Play a recording file. Returns `Ok(true)` iff playback ran to
    /// completion without cancellation.
    pub async fn play(
        &mut self,
        path: impl AsRef<Path>,
        opts: &PlayOptions,
        cancel: &CancelFlag,
        injector: Option<&mut SkillInjector>,
    ) -> Result<bool> {
        let actions = Recording::load(path.as_ref())?.into_actions();
        self.play_actions(&actions, opts, cancel, injector).await
    }

    /// Play in-memory actions (used for post-record preview).
    pub async fn play_actions(
        &mut self,
        actions: &[Action],
        opts: &PlayOptions,
        cancel: &CancelFlag,
        mut injector: Option<&mut SkillInjector>,
    ) -> Result<bool> {
        if actions.is_empty() {
            self.sink.all_up()?;
            return Ok(true);
        }

        let mut rng = match opts.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let params = JitterParams::with_factors(opts.jitter_time, opts.jitter_hold);
        let mut hj = match opts.seed {
            Some(s) => HumanJitter::seeded(params, s ^ 0x9e37_79b9),
            None => HumanJitter::new(params),
        };
        let events = build_timeline(actions, opts, &mut hj, &mut rng);
        let ignore_usages: Vec<u8> = parse_ignore_keys(&opts.ignore_keys).into_iter().collect();

        let mut iteration: u64 = 0;
        loop {
            if opts.loop_count > 0 && iteration >= opts.loop_count as u64 {
                break;
            }
            iteration += 1;

            if cancel.is_cancelled() {
                self.sink.all_up()?;
                return Ok(false);
            }

            let mut now = 0.0f64;
            let mut modmask = 0u8;
            let mut down: BTreeSet<u8> = BTreeSet::new();
            self.sink.all_up()?;

            for ev in &events {
                let wait = (ev.t - now).max(0.0);
                if cancel.sleep_cancellable(wait).await {
                    self.sink.all_up()?;
                    return Ok(false);
                }
                now = ev.t;

                if let Some(inj) = injector.as_deref_mut() {
                    let wall = util::now_secs();

                    // Rotation frozen: the cast owns this window, drop our
                    // own event instead of queueing it.
                    if inj.should_freeze_rotation(wall) {
                        continue;
                    }

                    let pressed: Vec<u8> = down.iter().copied().collect();
                    if let Some(cast) = inj.check_and_inject(&pressed, wall, &ignore_usages) {
                        if cast.pre_pause > 0.0 && cancel.sleep_cancellable(cast.pre_pause).await {
                            self.sink.all_up()?;
                            return Ok(false);
                        }
                        apply_edge(&mut modmask, &mut down, cast.usage, Edge::Down);
                        self.sink.send(modmask, &down)?;
                        if cancel.sleep_cancellable(cast.press_duration).await {
                            self.sink.all_up()?;
                            return Ok(false);
                        }
                        apply_edge(&mut modmask, &mut down, cast.usage, Edge::Up);
                        self.sink.send(modmask, &down)?;
                        if cast.post_pause > 0.0 && cancel.sleep_cancellable(cast.post_pause).await {
                            self.sink.all_up()?;
                            return Ok(false);
                        }
                    }
                }

                apply_edge(&mut modmask, &mut down, ev.usage, ev.edge);
                self.sink.send(modmask, &down)?;
            }

            // Loop boundary: nothing held across iterations.
            self.sink.all_up()?;
        }

        Ok(true)
    }

    /// Play one randomly chosen recording from `paths` per iteration.
    pub async fn play_playlist(
        &mut self,
        paths: &[PathBuf],
        opts: &PlayOptions,
        cancel: &CancelFlag,
        mut injector: Option<&mut SkillInjector>,
    ) -> Result<bool> {
        let existing: Vec<&PathBuf> = paths.iter().filter(|p| p.exists()).collect();
        if existing.is_empty() {
            self.sink.all_up()?;
            return Ok(true);
        }
        let mut rng = match opts.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let single = PlayOptions {
            loop_count: 1,
            ..opts.clone()
        };

        let mut iteration: u64 = 0;
        loop {
            if opts.loop_count > 0 && iteration >= opts.loop_count as u64 {
                break;
            }
            iteration += 1;

            if cancel.is_cancelled() {
                self.sink.all_up()?;
                return Ok(false);
            }
            let pick = existing
                .choose(&mut rng)
                .copied()
                .cloned()
                .unwrap_or_default();
            info!(file = %pick.display(), "playlist pick");
            if !self
                .play(&pick, &single, cancel, injector.as_deref_mut())
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn apply_edge(modmask: &mut u8, down: &mut BTreeSet<u8>, usage: u8, edge: Edge) {
    if keymap::is_modifier_usage(usage) {
        let bit = keymap::mod_bit_for_usage(usage);
        match edge {
            Edge::Down => *modmask |= bit,
            Edge::Up => *modmask &= !bit,
        }
    } else {
        match edge {
            Edge::Down => {
                down.insert(usage);
            }
            Edge::Up => {
                down.remove(&usage);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::testing::MockSink;

    fn opts_plain() -> PlayOptions {
        PlayOptions {
            seed: Some(1),
            ..PlayOptions::default()
        }
    }

    fn timeline_for(actions: &[Action], opts: &PlayOptions) -> Vec<TimelineEvent> {
        let mut hj = HumanJitter::seeded(
            JitterParams::with_factors(opts.jitter_time, opts.jitter_hold),
            9,
        );
        let mut rng = StdRng::seed_from_u64(9);
        build_timeline(actions, opts, &mut hj, &mut rng)
    }

    #[test]
    fn same_key_spacing_enforced() {
        let actions = [
            Action { usage: 30, press: 0.0, dur: 0.005 },
            Action { usage: 30, press: 0.010, dur: 0.005 },
        ];
        let events = timeline_for(&actions, &opts_plain());
        // down0, up0, down1, up1
        assert_eq!(events.len(), 4);
        let up0 = events[1].t;
        let down1 = events[2].t;
        assert!(down1 >= up0 + 0.010 - 1e-9, "down1={down1} up0={up0}");
        assert!((down1 - 0.015).abs() < 1e-9);
    }

    #[test]
    fn first_press_gets_full_jitter_range() {
        // A key's first press has no prior press to anchor to: the anchor is
        // effectively infinite, so jitter is bounded by the absolute cap and
        // not by fast-repeat attenuation of the press offset itself.
        let actions = [Action { usage: 4, press: 0.050, dur: 0.1 }];
        let opts = PlayOptions {
            jitter_time: 0.05,
            ..PlayOptions::default()
        };
        let mut max_delta = 0.0f64;
        for seed in 0..100 {
            let mut hj = HumanJitter::seeded(JitterParams::with_factors(0.05, 0.0), seed);
            let mut rng = StdRng::seed_from_u64(seed);
            let events = build_timeline(&actions, &opts, &mut hj, &mut rng);
            max_delta = max_delta.max((events[0].t - 0.050).abs());
        }
        // A 50 ms anchor would cap the delta at 0.05·0.05·1.25 ≈ 3.1 ms;
        // the unbounded anchor reaches the 12 ms absolute cap.
        assert!(max_delta > 0.004, "max_delta = {max_delta}");
        assert!(max_delta <= 0.012 + 1e-9);
    }

    #[test]
    fn speed_scales_presses_and_holds() {
        let actions = [Action { usage: 4, press: 1.0, dur: 0.5 }];
        let opts = PlayOptions {
            speed: 2.0,
            ..opts_plain()
        };
        let events = timeline_for(&actions, &opts);
        assert!((events[0].t - 0.5).abs() < 1e-9);
        assert!((events[1].t - 0.75).abs() < 1e-9);
    }

    #[test]
    fn downs_sort_before_ups_at_equal_times() {
        let actions = [
            Action { usage: 4, press: 0.0, dur: 0.1 },
            Action { usage: 5, press: 0.1, dur: 0.1 },
        ];
        let events = timeline_for(&actions, &opts_plain());
        let at_tenth: Vec<_> = events.iter().filter(|e| (e.t - 0.1).abs() < 1e-9).collect();
        assert_eq!(at_tenth.len(), 2);
        assert_eq!(at_tenth[0].edge, Edge::Down);
        assert_eq!(at_tenth[1].edge, Edge::Up);
    }

    #[test]
    fn ignore_sampling_drops_everything_at_tolerance_one() {
        let actions = [
            Action { usage: 4, press: 0.0, dur: 0.1 },
            Action { usage: 5, press: 0.2, dur: 0.1 },
        ];
        let opts = PlayOptions {
            ignore_keys: vec!["A".into()],
            ignore_tolerance: 1.0,
            ..opts_plain()
        };
        let events = timeline_for(&actions, &opts);
        assert!(events.iter().all(|e| e.usage != 4));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_emits_press_then_release_100ms_apart() {
        let actions = [Action { usage: 4, press: 0.0, dur: 0.100 }];
        let mut player = Player::new(MockSink::default());
        let cancel = CancelFlag::new();
        let start = tokio::time::Instant::now();
        let done = player
            .play_actions(&actions, &opts_plain(), &cancel, None)
            .await
            .unwrap();
        assert!(done);
        assert_eq!(start.elapsed(), std::time::Duration::from_millis(100));
        let reports = player.into_sink().reports;
        // all_up, press A, release A, all_up
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[0], [0u8; 8]);
        assert_eq!(reports[1], [0, 0, 4, 0, 0, 0, 0, 0]);
        assert_eq!(reports[2], [0u8; 8]);
        assert_eq!(reports[3], [0u8; 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_keys_and_reports_incomplete() {
        let actions = [Action { usage: 4, press: 0.0, dur: 5.0 }];
        let mut player = Player::new(MockSink::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let done = player
            .play_actions(&actions, &opts_plain(), &cancel, None)
            .await
            .unwrap();
        assert!(!done);
        let reports = player.into_sink().reports;
        assert_eq!(*reports.last().unwrap(), [0u8; 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_count_replays_timeline() {
        let actions = [Action { usage: 5, press: 0.0, dur: 0.01 }];
        let opts = PlayOptions {
            loop_count: 3,
            ..opts_plain()
        };
        let mut player = Player::new(MockSink::default());
        let done = player
            .play_actions(&actions, &opts, &CancelFlag::new(), None)
            .await
            .unwrap();
        assert!(done);
        let reports = player.into_sink().reports;
        let presses = reports
            .iter()
            .filter(|r| r[2..].contains(&5))
            .count();
        assert_eq!(presses, 3);
    }
}
