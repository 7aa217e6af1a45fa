//! Keyboard→HID pass-through with hotkey chords.
//!
//! The chord logic lives in [`BridgeCore`], a pure state machine over
//! `(code, value)` key transitions, so it is testable without devices. The
//! async shell feeds it from a grabbed evdev node and forwards the filtered
//! reports to the HID sink.
//!
//! Chord semantics: a hotkey arms on the inactive→active transition; its key
//! usage is stripped from every outgoing report from that moment; the action
//! fires once both chord components are released. The downstream host never
//! sees the chord key.

use std::collections::BTreeSet;
use std::time::Duration;

use input_linux_sys::input_event;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::evdev::{event_seconds, is_key_event, InputDevice};
use crate::hid::ReportSink;
use crate::keymap::{self, Hotkey};
use crate::recorder::{Action, Recorder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    Stop,
    Record,
    Extra(String),
}

/// What one key transition produced.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    /// Filtered report to emit, if the state changed.
    pub report: Option<(u8, BTreeSet<u8>)>,
    /// A hotkey completed; the shell must send all-up and return this.
    pub action: Option<BridgeAction>,
    /// In record mode: a transition to feed the recorder (usage, is_down).
    pub record: Option<(u8, bool)>,
}

struct ArmedHotkey {
    hotkey: Hotkey,
    action: BridgeAction,
    armed: bool,
}

impl ArmedHotkey {
    fn new(hotkey: Hotkey, action: BridgeAction) -> Self {
        ArmedHotkey {
            hotkey,
            action,
            armed: false,
        }
    }
}

/// Pure chord state machine.
pub struct BridgeCore {
    hotkeys: Vec<ArmedHotkey>,
    modmask: u8,
    down: BTreeSet<u8>,
    recording: bool,
}

impl BridgeCore {
    pub fn new(stop: Hotkey, record: Option<Hotkey>, extras: Vec<(Hotkey, String)>) -> Self {
        let mut hotkeys = vec![ArmedHotkey::new(stop, BridgeAction::Stop)];
        if let Some(r) = record {
            hotkeys.push(ArmedHotkey::new(r, BridgeAction::Record));
        }
        for (hk, label) in extras {
            hotkeys.push(ArmedHotkey::new(hk, BridgeAction::Extra(label)));
        }
        BridgeCore {
            hotkeys,
            modmask: 0,
            down: BTreeSet::new(),
            recording: false,
        }
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    fn chord_active(&self, hk: &Hotkey) -> bool {
        (self.modmask & keymap::mod_bit(hk.mod_code)) != 0 && self.down.contains(&hk.key_usage)
    }

    fn chord_fully_released(&self, hk: &Hotkey) -> bool {
        (self.modmask & keymap::mod_bit(hk.mod_code)) == 0 && !self.down.contains(&hk.key_usage)
    }

    fn any_chord_active(&self) -> bool {
        self.hotkeys.iter().any(|h| self.chord_active(&h.hotkey))
    }

    /// Current state minus every armed hotkey's key usage.
    fn filtered_report(&self) -> (u8, BTreeSet<u8>) {
        let mut keys = self.down.clone();
        for h in &self.hotkeys {
            if h.armed || self.chord_active(&h.hotkey) {
                keys.remove(&h.hotkey.key_usage);
            }
        }
        (self.modmask, keys)
    }

    /// Process one EV_KEY transition. Repeats (value 2) are ignored.
    pub fn step(&mut self, code: u16, value: i32) -> Step {
        if value == 2 {
            return Step::default();
        }
        let is_down = value == 1;

        let prev_active: Vec<bool> = self
            .hotkeys
            .iter()
            .map(|h| self.chord_active(&h.hotkey))
            .collect();

        // Track state.
        if keymap::is_modifier_code(code) {
            let bit = keymap::mod_bit(code);
            if is_down {
                self.modmask |= bit;
            } else {
                self.modmask &= !bit;
            }
        } else {
            let usage = keymap::usage_from_code(code);
            if usage != 0 {
                if is_down {
                    self.down.insert(usage);
                } else {
                    self.down.remove(&usage);
                }
            }
        }

        let mut out = Step::default();

        // Record everything outside an active chord (non-modifiers only).
        // Releases of a still-armed chord key stay out of the recording too.
        if self.recording && !keymap::is_modifier_code(code) && !self.any_chord_active() {
            let usage = keymap::usage_from_code(code);
            let armed_key = self
                .hotkeys
                .iter()
                .any(|h| h.armed && h.hotkey.key_usage == usage);
            if usage != 0 && !armed_key {
                out.record = Some((usage, is_down));
            }
        }

        // Arm on inactive→active; act once the armed chord is fully released
        // and this transition released one of its components.
        for (i, &prev) in prev_active.iter().enumerate() {
            let hk = self.hotkeys[i].hotkey;
            let curr = self.chord_active(&hk);
            if !self.hotkeys[i].armed && !prev && curr {
                self.hotkeys[i].armed = true;
                debug!(action = ?self.hotkeys[i].action, "hotkey armed");
            }
            let part_of_chord = code == hk.mod_code || code == hk.key_code;
            if self.hotkeys[i].armed
                && !curr
                && value == 0
                && part_of_chord
                && self.chord_fully_released(&hk)
            {
                self.hotkeys[i].armed = false;
                out.action = Some(self.hotkeys[i].action.clone());
                return out;
            }
        }

        out.report = Some(self.filtered_report());
        out
    }
}

/// The evdev-side shell: owns a grabbed input device, feeds the core, and
/// forwards filtered reports.
pub struct Bridge {
    afd: AsyncFd<InputDevice>,
    core: BridgeCore,
}

impl Bridge {
    pub fn new(
        dev: InputDevice,
        stop: Hotkey,
        record: Option<Hotkey>,
        extras: Vec<(Hotkey, String)>,
    ) -> Result<Self> {
        let afd = AsyncFd::new(dev).map_err(Error::Io)?;
        Ok(Bridge {
            afd,
            core: BridgeCore::new(stop, record, extras),
        })
    }

    pub fn grab(&mut self) -> Result<()> {
        self.afd.get_mut().grab().map_err(Error::Io)
    }

    async fn next_event(&mut self) -> Result<input_event> {
        loop {
            let mut guard = self.afd.readable().await.map_err(Error::Io)?;
            match guard.try_io(|inner| inner.get_ref().read_event()) {
                Ok(Ok(ev)) => return Ok(ev),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Forward events until a hotkey fires. `sink = None` swallows input
    /// (used while watching for the stop chord during playback).
    pub async fn run<S: ReportSink>(&mut self, mut sink: Option<&mut S>) -> Result<BridgeAction> {
        loop {
            let ev = self.next_event().await?;
            if !is_key_event(&ev) {
                continue;
            }
            let step = self.core.step(ev.code, ev.value);
            if let Some(action) = step.action {
                if let Some(s) = sink.as_deref_mut() {
                    s.all_up()?;
                }
                info!(?action, "bridge hotkey fired");
                return Ok(action);
            }
            if let (Some(s), Some((mask, keys))) = (sink.as_deref_mut(), step.report) {
                s.send(mask, &keys)?;
            }
        }
    }

    /// Record variant: forwards live, collects non-chord transitions, stops
    /// on the stop hotkey. Returns the captured actions.
    pub async fn run_record<S: ReportSink>(&mut self, sink: &mut S) -> Result<Vec<Action>> {
        self.core.set_recording(true);
        let mut rec = Recorder::new();
        let mut started = false;
        let mut last_t = 0.0f64;

        let result: Result<()> = loop {
            let ev = self.next_event().await?;
            if !is_key_event(&ev) {
                continue;
            }
            let t = event_seconds(&ev);
            let step = self.core.step(ev.code, ev.value);

            if let Some((usage, is_down)) = step.record {
                if !started {
                    rec.start(t);
                    started = true;
                }
                last_t = t;
                if is_down {
                    rec.on_down(usage, t);
                } else {
                    rec.on_up(usage, t);
                }
            }

            match step.action {
                Some(BridgeAction::Stop) => {
                    sink.all_up()?;
                    break Ok(());
                }
                // Other chords are inert while recording.
                Some(_) => continue,
                None => {}
            }
            if let Some((mask, keys)) = step.report {
                sink.send(mask, &keys)?;
            }
        };
        result?;

        self.core.set_recording(false);
        rec.finalize(Some(last_t));
        let actions = rec.into_actions();
        info!(count = actions.len(), "recording captured");
        Ok(actions)
    }

    /// Release the device (drop also does this).
    pub fn release(mut self) {
        self.afd.get_mut().ungrab();
    }
}

/// Wait for one press+release of `hotkey` on the (grabbed) device, e.g. the
/// stop chord during playback. Input is swallowed, nothing is forwarded.
pub async fn wait_hotkey_release(dev: InputDevice, hotkey: Hotkey) -> Result<()> {
    let mut dev = dev;
    let _ = dev.grab();
    let mut bridge = Bridge::new(dev, hotkey, None, Vec::new())?;
    loop {
        match bridge.run::<crate::hid::HidWriter>(None).await? {
            BridgeAction::Stop => return Ok(()),
            _ => continue,
        }
    }
}

/// Sleep-based retry loop until a keyboard shows up.
pub async fn wait_for_keyboard(preferred: Option<&std::path::Path>) -> std::path::PathBuf {
    loop {
        if let Some(p) = preferred {
            if p.exists() {
                return p.to_path_buf();
            }
        }
        if let Some(found) = crate::evdev::find_keyboard() {
            info!(path = %found.display(), "keyboard found");
            return found;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keymap::parse_hotkey;

    const LCTRL: u16 = 29;
    const Q: u16 = 16;
    const A: u16 = 30;

    fn core() -> BridgeCore {
        let stop = parse_hotkey("LCTRL+Q").unwrap();
        let record = parse_hotkey("LCTRL+R").unwrap();
        BridgeCore::new(stop, Some(record), Vec::new())
    }

    fn report_of(step: &Step) -> (u8, Vec<u8>) {
        let (mask, keys) = step.report.clone().expect("report expected");
        (mask, keys.into_iter().collect())
    }

    #[test]
    fn chord_is_stripped_and_acts_on_full_release() {
        let mut c = core();

        // down LCTRL: modifier alone is forwarded.
        let s1 = c.step(LCTRL, 1);
        assert_eq!(report_of(&s1), (1, vec![]));
        assert!(s1.action.is_none());

        // down Q: chord arms, Q never reaches the report.
        let s2 = c.step(Q, 1);
        assert_eq!(report_of(&s2), (1, vec![]));
        assert!(s2.action.is_none());

        // up Q: chord inactive but LCTRL still held, no action yet.
        let s3 = c.step(Q, 0);
        assert_eq!(report_of(&s3), (1, vec![]));
        assert!(s3.action.is_none());

        // up LCTRL: fully released → STOP.
        let s4 = c.step(LCTRL, 0);
        assert!(s4.report.is_none());
        assert_eq!(s4.action, Some(BridgeAction::Stop));
    }

    #[test]
    fn plain_keys_pass_through() {
        let mut c = core();
        let s = c.step(A, 1);
        assert_eq!(report_of(&s), (0, vec![4]));
        let s = c.step(A, 0);
        assert_eq!(report_of(&s), (0, vec![]));
    }

    #[test]
    fn repeats_are_ignored() {
        let mut c = core();
        c.step(A, 1);
        let s = c.step(A, 2);
        assert_eq!(s, Step::default());
    }

    #[test]
    fn record_chord_returns_record() {
        let mut c = core();
        c.step(LCTRL, 1);
        c.step(19, 1); // R
        c.step(19, 0);
        let s = c.step(LCTRL, 0);
        assert_eq!(s.action, Some(BridgeAction::Record));
    }

    #[test]
    fn extra_chord_returns_label() {
        let stop = parse_hotkey("LCTRL+Q").unwrap();
        let save = parse_hotkey("LCTRL+S").unwrap();
        let mut c = BridgeCore::new(stop, None, vec![(save, "CHOICE_SAVE".into())]);
        c.step(LCTRL, 1);
        c.step(31, 1); // S
        c.step(31, 0);
        let s = c.step(LCTRL, 0);
        assert_eq!(s.action, Some(BridgeAction::Extra("CHOICE_SAVE".into())));
    }

    #[test]
    fn recording_skips_chord_keys() {
        let mut c = core();
        c.set_recording(true);

        let s = c.step(A, 1);
        assert_eq!(s.record, Some((4, true)));
        let s = c.step(A, 0);
        assert_eq!(s.record, Some((4, false)));

        // Chord keys never reach the recorder.
        c.step(LCTRL, 1);
        let s = c.step(Q, 1);
        assert_eq!(s.record, None);
        let s = c.step(Q, 0);
        assert!(s.record.is_none() || s.record.map(|(u, _)| u) != Some(20));
    }

    #[test]
    fn release_order_modifier_first_still_acts() {
        let mut c = core();
        c.step(LCTRL, 1);
        c.step(Q, 1);
        // Modifier released first: chord inactive but Q still down.
        let s = c.step(LCTRL, 0);
        assert!(s.action.is_none());
        // Q released last → fully released → STOP.
        let s = c.step(Q, 0);
        assert_eq!(s.action, Some(BridgeAction::Stop));
    }

    #[test]
    fn armed_strip_persists_until_action() {
        let mut c = core();
        c.step(LCTRL, 1);
        c.step(Q, 1);
        // Press Q again while armed (chord re-activates): still stripped.
        c.step(Q, 0);
        let s = c.step(Q, 1);
        assert_eq!(report_of(&s), (1, vec![]));
    }
}
