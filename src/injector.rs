//! In-band skill injection during playback.
//!
//! Every decision walks a prioritised cascade per skill; a downstream flag is
//! cleared whenever an upstream flag clears:
//!
//! 1. cooldown + randomised delay (grouped skills bypass this gate)
//! 2. opposite-arrow trigger + per-skill delay
//! 3. key-replacement decision (replace an ignore key, or wait after SPACE)
//! 4. idle (no keys pressed) unless in replacement mode
//! 5. group order (sequential members, restart window after the last)
//!
//! A successful cast returns the keystroke plus pause envelope to the Player,
//! which performs the press atomically inside its timeline walk. Skills with
//! `frozen_rotation_during_casting` additionally freeze the rotation for the
//! whole cast envelope.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::keymap::{self, USAGE_ARROW_LEFT, USAGE_ARROW_RIGHT, USAGE_SPACE};
use crate::skills::SkillConfig;

/// What the Player must do for one injected cast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkillCast {
    pub usage: u8,
    pub pre_pause: f64,
    pub post_pause: f64,
    pub press_duration: f64,
}

/// How gate 3 will be satisfied once decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplacementMode {
    Undecided,
    /// Cast substitutes for an ignore-key event; idle gate is waived.
    ReplaceIgnoreKey,
    /// Wait for a SPACE release plus a randomised delay.
    AfterSpace,
}

#[derive(Debug)]
struct SkillState {
    config: SkillConfig,
    usage: u8,

    last_used_time: f64,
    is_casting: bool,
    cast_end_time: f64,

    cooldown_ready_time: f64,
    can_cast_after: f64,

    opposite_arrow_timer: f64,
    opposite_arrow_delay: f64,

    replacement_mode: ReplacementMode,
    space_released_time: f64,
    space_delay: f64,

    // Cascade flags.
    cooldown_passed: bool,
    arrow_ready: bool,
    replacement_ready: bool,

    // Group sequencing.
    group_delay_end_time: f64,
    group_first_cast: bool,
    group_restart_time: f64,
}

pub struct SkillInjector {
    skills: Vec<SkillState>,
    /// Rotation is paused while `now < frozen_until`.
    frozen_until: f64,
    last_arrow_direction: Option<u8>,
    /// group_id → ordered member indices into `skills`.
    groups: HashMap<String, Vec<usize>>,
    /// group_id → index of the next member expected to cast.
    group_next: HashMap<String, usize>,
    rng: StdRng,
}

impl SkillInjector {
    pub fn new(selected: Vec<SkillConfig>) -> Self {
        Self::with_rng(selected, StdRng::from_entropy())
    }

    pub fn seeded(selected: Vec<SkillConfig>, seed: u64) -> Self {
        Self::with_rng(selected, StdRng::seed_from_u64(seed))
    }

    fn with_rng(selected: Vec<SkillConfig>, mut rng: StdRng) -> Self {
        let mut configs = selected;
        configs.sort_by_key(|c| c.order);

        let mut skills = Vec::with_capacity(configs.len());
        for config in configs {
            let usage = keymap::name_to_usage(&config.keystroke);
            let initial_delay: f64 = rng.gen_range(1.0..30.0);
            skills.push(SkillState {
                usage,
                last_used_time: 0.0,
                is_casting: false,
                cast_end_time: 0.0,
                cooldown_ready_time: 0.0,
                can_cast_after: initial_delay,
                opposite_arrow_timer: 0.0,
                opposite_arrow_delay: 0.0,
                replacement_mode: ReplacementMode::Undecided,
                space_released_time: 0.0,
                space_delay: 0.0,
                cooldown_passed: false,
                arrow_ready: false,
                replacement_ready: false,
                group_delay_end_time: 0.0,
                group_first_cast: true,
                group_restart_time: 0.0,
                config,
            });
        }

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, s) in skills.iter().enumerate() {
            if let Some(gid) = &s.config.group_id {
                groups.entry(gid.clone()).or_default().push(i);
            }
        }
        let group_next = groups.keys().map(|g| (g.clone(), 0usize)).collect();

        SkillInjector {
            skills,
            frozen_until: 0.0,
            last_arrow_direction: None,
            groups,
            group_next,
            rng,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Rotation events must be skipped while a frozen cast owns the window.
    pub fn should_freeze_rotation(&self, now: f64) -> bool {
        now < self.frozen_until
    }

    /// Gate 2 trigger: a Left→Right or Right→Left transition arms a
    /// randomised timer on every skill whose cooldown already passed.
    /// Re-pressing the opposite arrow resets the timer.
    fn update_arrow_tracking(&mut self, pressed: &[u8], now: f64) {
        let current = if pressed.contains(&USAGE_ARROW_LEFT) {
            Some(USAGE_ARROW_LEFT)
        } else if pressed.contains(&USAGE_ARROW_RIGHT) {
            Some(USAGE_ARROW_RIGHT)
        } else {
            None
        };
        let Some(dir) = current else { return };

        let opposite = if dir == USAGE_ARROW_LEFT {
            USAGE_ARROW_RIGHT
        } else {
            USAGE_ARROW_LEFT
        };
        if self.last_arrow_direction == Some(opposite) {
            for i in 0..self.skills.len() {
                let eligible = self.skills[i].cooldown_passed && !self.skills[i].is_casting;
                if eligible {
                    let base = self.skills[i].config.cast_position;
                    let delay = self.rng.gen_range(base..base + 0.2);
                    let s = &mut self.skills[i];
                    s.opposite_arrow_timer = now;
                    s.opposite_arrow_delay = delay;
                    s.arrow_ready = false;
                }
            }
        }
        self.last_arrow_direction = Some(dir);
    }

    fn update_casting_state(&mut self, now: f64) {
        for s in &mut self.skills {
            if s.is_casting && now >= s.cast_end_time {
                s.is_casting = false;
            }
        }
    }

    /// Evaluate gates 1–3 for one skill, clearing downstream flags whenever
    /// an upstream gate fails.
    fn update_conditions(&mut self, idx: usize, pressed: &[u8], now: f64, ignore_keys: &[u8]) {
        // Gate 1: cooldown + randomised delay. Grouped skills always pass;
        // their timing lives in gate 5.
        let grouped = self.skills[idx].config.group_id.is_some();
        let pass1 = grouped
            || (now >= self.skills[idx].can_cast_after && !self.skills[idx].is_casting);
        if !pass1 {
            let s = &mut self.skills[idx];
            s.cooldown_passed = false;
            s.arrow_ready = false;
            s.replacement_ready = false;
            return;
        }
        self.skills[idx].cooldown_passed = true;

        // Gate 2: opposite arrow + delay.
        {
            let s = &mut self.skills[idx];
            if s.opposite_arrow_timer > 0.0
                && now >= s.opposite_arrow_timer + s.opposite_arrow_delay
            {
                s.arrow_ready = true;
            }
            if !s.arrow_ready {
                s.replacement_ready = false;
                return;
            }
        }

        // Gate 3: key replacement.
        if self.skills[idx].config.key_replacement {
            if self.skills[idx].replacement_mode == ReplacementMode::Undecided {
                let rate = self.skills[idx].config.replace_rate;
                let replace = self.rng.gen::<f64>() < rate;
                let space_delay = self.rng.gen_range(0.33..0.5);
                let s = &mut self.skills[idx];
                s.replacement_mode = if replace {
                    ReplacementMode::ReplaceIgnoreKey
                } else {
                    ReplacementMode::AfterSpace
                };
                s.space_delay = space_delay;
            }
            let s = &mut self.skills[idx];
            match s.replacement_mode {
                ReplacementMode::ReplaceIgnoreKey => {
                    s.replacement_ready = !ignore_keys.is_empty();
                }
                ReplacementMode::AfterSpace => {
                    let space_pressed = pressed.contains(&USAGE_SPACE);
                    if !space_pressed && s.space_released_time == 0.0 {
                        s.space_released_time = now;
                    }
                    s.replacement_ready = s.space_released_time > 0.0
                        && now >= s.space_released_time + s.space_delay;
                }
                ReplacementMode::Undecided => {}
            }
        } else {
            self.skills[idx].replacement_ready = true;
        }
    }

    /// Gate 5: sequential group progression.
    fn group_order_allows(&mut self, idx: usize, now: f64) -> bool {
        let Some(gid) = self.skills[idx].config.group_id.clone() else {
            return true;
        };
        let Some(members) = self.groups.get(&gid) else {
            return true;
        };
        let Some(pos) = members.iter().position(|&m| m == idx) else {
            return true;
        };
        let next = self.group_next.get(&gid).copied().unwrap_or(0);
        if next != pos {
            return false;
        }

        if pos == 0 {
            // First member: immediate on the very first cycle, then gated on
            // the restart window set by the previous cycle's last member.
            let s = &self.skills[idx];
            return s.group_first_cast || now >= s.group_restart_time;
        }

        let prev_idx = members[pos - 1];
        let prev_last_used = self.skills[prev_idx].last_used_time;
        if prev_last_used == 0.0 {
            return false;
        }
        if self.skills[idx].group_delay_end_time == 0.0 {
            let gap = self.rng.gen_range(1.0..5.0);
            let prev_delay = self.skills[prev_idx].config.delay_after;
            self.skills[idx].group_delay_end_time = prev_last_used + prev_delay + gap;
        }
        now >= self.skills[idx].group_delay_end_time
    }

    fn gates_pass(&self, idx: usize) -> bool {
        let s = &self.skills[idx];
        s.config.is_selected
            && !s.is_casting
            && s.cooldown_passed
            && s.arrow_ready
            && s.replacement_ready
    }

    fn cast(&mut self, idx: usize, now: f64) -> Option<SkillCast> {
        if self.skills[idx].usage == 0 {
            debug!(
                skill = %self.skills[idx].config.name,
                keystroke = %self.skills[idx].config.keystroke,
                "skill keystroke does not map to a usage, skipping cast"
            );
            return None;
        }

        let press_duration = self.rng.gen_range(0.1..0.15);
        let cooldown_delay = self.rng.gen_range(1.0..30.0);
        let skill_delay = self.skills[idx].config.skill_delay;
        let general_post = self.rng.gen_range(skill_delay..skill_delay + 0.2);

        {
            let s = &mut self.skills[idx];
            s.is_casting = true;
            s.last_used_time = now;
            s.cooldown_ready_time = now + s.config.cooldown;
            s.can_cast_after = s.cooldown_ready_time + cooldown_delay;
            s.cooldown_passed = false;
            s.arrow_ready = false;
            s.replacement_ready = false;
            s.opposite_arrow_timer = 0.0;
            s.space_released_time = 0.0;
            s.space_delay = 0.0;
            s.replacement_mode = ReplacementMode::Undecided;
            s.group_delay_end_time = 0.0;
        }

        // Group bookkeeping: advance, or close the cycle and schedule the
        // restart window.
        if let Some(gid) = self.skills[idx].config.group_id.clone() {
            if let Some(members) = self.groups.get(&gid).cloned() {
                if let Some(pos) = members.iter().position(|&m| m == idx) {
                    if pos + 1 == members.len() {
                        let restart_gap = self.rng.gen_range(1.0..5.0);
                        let restart =
                            now + self.skills[idx].config.cooldown + restart_gap;
                        for &m in &members {
                            let s = &mut self.skills[m];
                            s.group_restart_time = restart;
                            s.group_first_cast = false;
                        }
                        self.group_next.insert(gid, 0);
                    } else {
                        self.group_next.insert(gid, pos + 1);
                    }
                }
            }
        }

        let usage = self.skills[idx].usage;
        let cast = if self.skills[idx].config.frozen_rotation_during_casting {
            let pre = self.rng.gen_range(0.5..0.7);
            let post = self.rng.gen_range(0.5..0.7);
            let total = pre + press_duration + post + general_post;
            self.skills[idx].cast_end_time = now + total;
            self.frozen_until = now + total;
            SkillCast {
                usage,
                pre_pause: pre,
                post_pause: post + general_post,
                press_duration,
            }
        } else {
            self.skills[idx].cast_end_time = now + press_duration + general_post;
            SkillCast {
                usage,
                pre_pause: 0.0,
                post_pause: general_post,
                press_duration,
            }
        };

        info!(
            skill = %self.skills[idx].config.name,
            usage,
            frozen = self.skills[idx].config.frozen_rotation_during_casting,
            "skill cast scheduled"
        );
        Some(cast)
    }

    /// The Player calls this at every timeline event. Returns a cast when
    /// all gates pass for some skill.
    pub fn check_and_inject(
        &mut self,
        pressed: &[u8],
        now: f64,
        ignore_keys: &[u8],
    ) -> Option<SkillCast> {
        self.update_arrow_tracking(pressed, now);
        self.update_casting_state(now);
        for i in 0..self.skills.len() {
            self.update_conditions(i, pressed, now, ignore_keys);
        }

        for i in 0..self.skills.len() {
            if !self.gates_pass(i) {
                continue;
            }
            if !self.group_order_allows(i, now) {
                continue;
            }
            // Gate 4: idle, waived in replacement mode.
            let replacement = self.skills[i].replacement_mode == ReplacementMode::ReplaceIgnoreKey;
            if replacement || pressed.is_empty() {
                return self.cast(i, now);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, keystroke: &str) -> SkillConfig {
        SkillConfig {
            id: name.to_string(),
            name: name.to_string(),
            keystroke: keystroke.to_string(),
            cooldown: 10.0,
            key_replacement: false,
            replace_rate: 0.7,
            frozen_rotation_during_casting: false,
            is_selected: true,
            order: 0,
            group_id: None,
            delay_after: 0.0,
            cast_position: 0.3,
            skill_delay: 0.0,
            variant: "cd skill".into(),
            is_open: false,
            is_enabled: true,
        }
    }

    /// Walk one skill through cooldown → arrow transition → idle and return
    /// the cast. `start` must exceed the worst-case initial delay (30 s).
    fn drive_to_cast(inj: &mut SkillInjector, start: f64) -> (f64, SkillCast) {
        // Establish cooldown_passed, then an opposite-arrow transition.
        assert!(inj.check_and_inject(&[], start, &[]).is_none());
        assert!(inj
            .check_and_inject(&[USAGE_ARROW_RIGHT], start + 0.1, &[])
            .is_none());
        assert!(inj
            .check_and_inject(&[USAGE_ARROW_LEFT], start + 0.2, &[])
            .is_none());
        // Past the worst-case arrow delay (cast_position + 0.2), idle.
        let t = start + 0.2 + 0.6;
        let cast = inj.check_and_inject(&[], t, &[]).expect("cast expected");
        (t, cast)
    }

    #[test]
    fn cooldown_gate_blocks_before_random_delay() {
        let mut inj = SkillInjector::seeded(vec![config("s", "Q")], 1);
        // can_cast_after ∈ [1, 30]; at t=0.5 nothing can fire.
        assert!(inj.check_and_inject(&[], 0.5, &[]).is_none());
    }

    #[test]
    fn arrow_then_idle_produces_cast_with_bounded_envelope() {
        let mut inj = SkillInjector::seeded(vec![config("s", "Q")], 2);
        let (_, cast) = drive_to_cast(&mut inj, 40.0);
        assert_eq!(cast.usage, keymap::name_to_usage("Q"));
        assert_eq!(cast.pre_pause, 0.0);
        assert!(cast.press_duration >= 0.1 && cast.press_duration < 0.15);
        assert!(cast.post_pause >= 0.0 && cast.post_pause < 0.2);
    }

    #[test]
    fn no_injection_while_keys_are_held() {
        let mut inj = SkillInjector::seeded(vec![config("s", "Q")], 3);
        assert!(inj.check_and_inject(&[], 40.0, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], 40.1, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], 40.2, &[]).is_none());
        // Arrow delay elapsed but a key is still held: gate 4 blocks.
        assert!(inj.check_and_inject(&[4], 41.0, &[]).is_none());
        assert!(inj.check_and_inject(&[], 41.1, &[]).is_some());
    }

    #[test]
    fn cast_resets_cooldown_and_cannot_refire_immediately() {
        let mut inj = SkillInjector::seeded(vec![config("s", "Q")], 4);
        let (t, _) = drive_to_cast(&mut inj, 40.0);
        // Cooldown is 10 s plus 1–30 s random delay; at t+1 nothing fires
        // even after fresh arrow transitions.
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], t + 0.5, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], t + 0.6, &[]).is_none());
        assert!(inj.check_and_inject(&[], t + 1.0, &[]).is_none());
    }

    #[test]
    fn frozen_skill_freezes_rotation_for_the_envelope() {
        let mut cfg = config("f", "W");
        cfg.frozen_rotation_during_casting = true;
        let mut inj = SkillInjector::seeded(vec![cfg], 5);
        let (t, cast) = drive_to_cast(&mut inj, 40.0);
        assert!(cast.pre_pause >= 0.5 && cast.pre_pause < 0.7);
        assert!(inj.should_freeze_rotation(t + 0.1));
        let total = cast.pre_pause + cast.press_duration + cast.post_pause;
        assert!(!inj.should_freeze_rotation(t + total + 0.01));
    }

    #[test]
    fn unmapped_keystroke_never_casts() {
        let mut inj = SkillInjector::seeded(vec![config("s", "NOKEY")], 6);
        assert!(inj.check_and_inject(&[], 40.0, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], 40.1, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], 40.2, &[]).is_none());
        assert!(inj.check_and_inject(&[], 41.0, &[]).is_none());
    }

    #[test]
    fn group_members_cast_in_order_with_delays() {
        let mut a = config("a", "Q");
        a.group_id = Some("g".into());
        a.order = 0;
        let mut b = config("b", "W");
        b.group_id = Some("g".into());
        b.order = 1;
        let mut inj = SkillInjector::seeded(vec![a, b], 7);

        // Arrow transition arms both (grouped skills bypass gate 1).
        assert!(inj.check_and_inject(&[], 1.0, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], 1.1, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], 1.2, &[]).is_none());

        let t = 1.2 + 0.6;
        let first = inj.check_and_inject(&[], t, &[]).expect("first member");
        assert_eq!(first.usage, keymap::name_to_usage("Q"));

        // Second member waits at least delay_after + 1 s after the first.
        assert!(inj.check_and_inject(&[], t + 0.5, &[]).is_none());
        // Re-arm arrows for the second member (its arrow flag reset on arm).
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], t + 1.0, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], t + 1.1, &[]).is_none());
        // Past both the group gap upper bound (5 s) and the arrow delay.
        let second = inj
            .check_and_inject(&[], t + 7.0, &[])
            .expect("second member");
        assert_eq!(second.usage, keymap::name_to_usage("W"));
    }

    #[test]
    fn replacement_mode_waives_the_idle_gate() {
        let mut cfg = config("r", "E");
        cfg.key_replacement = true;
        cfg.replace_rate = 1.0; // always replacement mode
        let mut inj = SkillInjector::seeded(vec![cfg], 8);
        assert!(inj.check_and_inject(&[], 40.0, &[30]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], 40.1, &[30]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], 40.2, &[30]).is_none());
        // Keys held, but replacement mode with a non-empty ignore set casts.
        let cast = inj.check_and_inject(&[4, 5], 41.0, &[30]);
        assert!(cast.is_some());
    }

    #[test]
    fn replacement_mode_requires_ignore_keys() {
        let mut cfg = config("r", "E");
        cfg.key_replacement = true;
        cfg.replace_rate = 1.0;
        let mut inj = SkillInjector::seeded(vec![cfg], 9);
        assert!(inj.check_and_inject(&[], 40.0, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_RIGHT], 40.1, &[]).is_none());
        assert!(inj.check_and_inject(&[USAGE_ARROW_LEFT], 40.2, &[]).is_none());
        // Empty ignore set: gate 3 never satisfies in replacement mode.
        assert!(inj.check_and_inject(&[], 41.0, &[]).is_none());
    }
}
