//! Keystroke recordings: live capture, the two on-disk shapes, and the
//! directory helpers the daemon and IPC layer use to address them.
//!
//! Canonical unit is the [`Action`] `{usage, press, dur}` with `press`
//! measured in seconds from the start of the recording. The event shape
//! `{t, type, usage}` survives on disk for compatibility and is normalised
//! to actions on load.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Canonical playback unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub usage: u8,
    /// Seconds from recording start.
    pub press: f64,
    /// Hold duration in seconds.
    pub dur: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Down,
    Up,
}

/// Raw timestamped transition, the second accepted on-disk shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Seconds since an arbitrary epoch base; only differences matter.
    pub t: f64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub usage: u8,
}

/// A recording document as found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recording {
    Actions {
        #[serde(default)]
        t0: f64,
        actions: Vec<Action>,
    },
    Events {
        #[serde(default)]
        t0: f64,
        events: Vec<RecordedEvent>,
    },
}

impl Recording {
    pub fn from_actions(actions: Vec<Action>) -> Self {
        Recording::Actions { t0: 0.0, actions }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write atomically: temp sibling then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "recording saved");
        Ok(())
    }

    /// Normalise to sorted actions. Event recordings are paired down/up;
    /// see [`events_to_actions`] for the edge-case rules.
    pub fn into_actions(self) -> Vec<Action> {
        match self {
            Recording::Actions { mut actions, .. } => {
                actions.sort_by(|a, b| {
                    a.press
                        .partial_cmp(&b.press)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.usage.cmp(&b.usage))
                });
                actions
            }
            Recording::Events { events, .. } => events_to_actions(&events),
        }
    }
}

/// Pair down/up transitions into actions.
///
/// Timestamps are rebased to the first event. An up without a matching down
/// becomes a 1 ms tap ending at its timestamp; a down that never closes
/// becomes a 10 ms tap. Output is sorted by `(press, usage)` and every
/// `press`/`dur` is non-negative.
pub fn events_to_actions(events: &[RecordedEvent]) -> Vec<Action> {
    let mut evs: Vec<RecordedEvent> = events.to_vec();
    evs.sort_by(|a, b| a.t.partial_cmp(&b.t).unwrap_or(std::cmp::Ordering::Equal));
    let Some(first) = evs.first() else {
        return Vec::new();
    };
    let base = first.t;

    let mut down_at: HashMap<u8, f64> = HashMap::new();
    let mut actions = Vec::new();

    for ev in &evs {
        let t = ev.t - base;
        match ev.kind {
            EventKind::Down => {
                // Keep the first press time on auto-repeat duplicates.
                down_at.entry(ev.usage).or_insert(t);
            }
            EventKind::Up => {
                let t_down = down_at
                    .remove(&ev.usage)
                    .unwrap_or_else(|| (t - 0.001).max(0.0));
                actions.push(Action {
                    usage: ev.usage,
                    press: t_down,
                    dur: (t - t_down).max(0.0),
                });
            }
        }
    }

    for (usage, t_down) in down_at {
        actions.push(Action {
            usage,
            press: t_down,
            dur: 0.010,
        });
    }

    actions.sort_by(|a, b| {
        a.press
            .partial_cmp(&b.press)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.usage.cmp(&b.usage))
    });
    actions
}

/// Live capture: collects down/up timestamps and emits actions.
#[derive(Debug, Default)]
pub struct Recorder {
    t0: f64,
    actions: Vec<Action>,
    downs: HashMap<u8, f64>,
    last_time: f64,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder::default()
    }

    /// Start the clock. The first call wins; later transitions are measured
    /// against this base.
    pub fn start(&mut self, now: f64) {
        self.t0 = now;
        self.last_time = now;
    }

    pub fn on_down(&mut self, usage: u8, now: f64) {
        self.downs.entry(usage).or_insert(now);
    }

    pub fn on_up(&mut self, usage: u8, now: f64) {
        let (press_t, dur) = match self.downs.remove(&usage) {
            Some(t) => (t, (now - t).max(0.0)),
            // Missed the down: synthesise a zero-length press at release.
            None => (now, 0.0),
        };
        self.push(usage, press_t, dur);
        self.last_time = now;
    }

    /// Close any still-held keys at `now`.
    pub fn finalize(&mut self, now: Option<f64>) {
        let n = now.unwrap_or(self.last_time);
        let mut held: Vec<(u8, f64)> = self.downs.drain().collect();
        held.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        for (usage, press_t) in held {
            let dur = (n - press_t).max(0.0);
            self.push(usage, press_t, dur);
        }
    }

    fn push(&mut self, usage: u8, abs_press: f64, dur: f64) {
        self.actions.push(Action {
            usage,
            press: (abs_press - self.t0).max(0.0),
            dur,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Sorted actions, consuming the recorder.
    pub fn into_actions(mut self) -> Vec<Action> {
        self.actions.sort_by(|a, b| {
            a.press
                .partial_cmp(&b.press)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.usage.cmp(&b.usage))
        });
        self.actions
    }
}

/// One row of a recording listing.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    /// Path relative to the base dir, extension stripped.
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordingMeta>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordingMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// Validate a user-supplied recording name as a relative path: non-empty,
/// no `.`/`..`/absolute components. This is the single choke point for every
/// path that arrives over IPC.
pub fn safe_relpath(name: &str) -> Result<PathBuf> {
    let trimmed = name.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidPath(name.to_string()));
    }
    let p = Path::new(trimmed);
    for comp in p.components() {
        match comp {
            Component::Normal(part) if !part.is_empty() => {}
            _ => return Err(Error::InvalidPath(name.to_string())),
        }
    }
    Ok(p.to_path_buf())
}

/// Resolve a recording name to a path under `base`, appending `.json` when
/// the extension is absent.
pub fn resolve_record_path(base: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
    let mut rel = safe_relpath(name)?;
    let has_json = rel
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if !has_json {
        let mut os = rel.into_os_string();
        os.push(".json");
        rel = PathBuf::from(os);
    }
    Ok(base.as_ref().join(rel))
}

/// One record per `*.json` under `base`, recursively, sorted by name.
/// Counts and duration are filled in when the file parses cheaply; a corrupt
/// file still gets a row.
pub fn list_recordings_recursive(base: impl AsRef<Path>) -> Vec<RecordingEntry> {
    let base = base.as_ref();
    let mut items = Vec::new();
    if !base.exists() {
        return items;
    }
    for entry in walkdir::WalkDir::new(base)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let Ok(rel) = path.strip_prefix(base) else {
            continue;
        };
        let name = rel.with_extension("").to_string_lossy().replace('\\', "/");
        let Ok(stat) = entry.metadata() else { continue };
        let mtime = stat
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let meta = fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
            .and_then(|doc| {
                let mut meta = RecordingMeta::default();
                if let Some(a) = doc.get("actions").and_then(|v| v.as_array()) {
                    meta.actions = Some(a.len());
                }
                if let Some(e) = doc.get("events").and_then(|v| v.as_array()) {
                    meta.events = Some(e.len());
                }
                meta.duration = doc.get("duration").and_then(|v| v.as_f64());
                if meta.actions.is_none() && meta.events.is_none() && meta.duration.is_none() {
                    None
                } else {
                    Some(meta)
                }
            });

        items.push(RecordingEntry {
            name,
            path: path.to_string_lossy().into_owned(),
            size: stat.len(),
            mtime,
            meta,
        });
    }
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(t: f64, kind: EventKind, usage: u8) -> RecordedEvent {
        RecordedEvent { t, kind, usage }
    }

    #[test]
    fn pairing_rebases_to_first_event() {
        let actions = events_to_actions(&[
            ev(100.0, EventKind::Down, 4),
            ev(100.1, EventKind::Up, 4),
        ]);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].usage, 4);
        assert!(actions[0].press.abs() < 1e-9);
        assert!((actions[0].dur - 0.1).abs() < 1e-9);
    }

    #[test]
    fn unmatched_up_becomes_one_ms_tap() {
        let actions = events_to_actions(&[
            ev(5.0, EventKind::Down, 6),
            ev(5.2, EventKind::Up, 7),
            ev(5.4, EventKind::Up, 6),
        ]);
        let tap = actions.iter().find(|a| a.usage == 7).unwrap();
        assert!((tap.press - 0.199).abs() < 1e-9);
        assert!((tap.dur - 0.001).abs() < 1e-9);
    }

    #[test]
    fn unclosed_down_becomes_ten_ms_tap() {
        let actions = events_to_actions(&[
            ev(0.0, EventKind::Down, 4),
            ev(0.1, EventKind::Up, 4),
            ev(0.2, EventKind::Down, 5),
        ]);
        let tail = actions.iter().find(|a| a.usage == 5).unwrap();
        assert!((tail.press - 0.2).abs() < 1e-9);
        assert!((tail.dur - 0.010).abs() < 1e-9);
    }

    #[test]
    fn actions_sorted_by_press_then_usage() {
        let actions = events_to_actions(&[
            ev(0.0, EventKind::Down, 9),
            ev(0.0, EventKind::Down, 4),
            ev(0.5, EventKind::Up, 9),
            ev(0.5, EventKind::Up, 4),
        ]);
        let order: Vec<u8> = actions.iter().map(|a| a.usage).collect();
        assert_eq!(order, vec![4, 9]);
    }

    #[test]
    fn recorder_live_capture() {
        let mut rec = Recorder::new();
        rec.start(10.0);
        rec.on_down(4, 10.0);
        rec.on_up(4, 10.1);
        rec.on_down(5, 10.2);
        rec.finalize(Some(10.5));
        let actions = rec.into_actions();
        assert_eq!(actions.len(), 2);
        assert!((actions[0].press - 0.0).abs() < 1e-9);
        assert!((actions[0].dur - 0.1).abs() < 1e-9);
        assert!((actions[1].press - 0.2).abs() < 1e-9);
        assert!((actions[1].dur - 0.3).abs() < 1e-9);
    }

    #[test]
    fn up_without_down_is_zero_length() {
        let mut rec = Recorder::new();
        rec.start(0.0);
        rec.on_up(30, 1.0);
        let actions = rec.into_actions();
        assert_eq!(actions[0].dur, 0.0);
        assert!((actions[0].press - 1.0).abs() < 1e-9);
    }

    #[test]
    fn path_validation() {
        assert!(safe_relpath("").is_err());
        assert!(safe_relpath("   ").is_err());
        assert!(safe_relpath(".").is_err());
        assert!(safe_relpath("..").is_err());
        assert!(safe_relpath("a/../b").is_err());
        assert!(safe_relpath("sub/dir/name").is_ok());
        // Leading slashes are stripped: the name stays under the base dir.
        assert_eq!(
            safe_relpath("/etc/passwd").unwrap(),
            PathBuf::from("etc/passwd")
        );
    }

    #[test]
    fn resolve_appends_extension() {
        let p = resolve_record_path("/base", "combo").unwrap();
        assert_eq!(p, PathBuf::from("/base/combo.json"));
        let q = resolve_record_path("/base", "combo.json").unwrap();
        assert_eq!(q, PathBuf::from("/base/combo.json"));
    }

    #[test]
    fn document_shapes_round_trip() {
        let doc = Recording::from_actions(vec![Action {
            usage: 4,
            press: 0.0,
            dur: 0.1,
        }]);
        let json = serde_json::to_string(&doc).unwrap();
        let back: Recording = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);

        let events_json = r#"{"t0": 3.0, "events": [{"t": 3.0, "type": "down", "usage": 4},
                                                    {"t": 3.1, "type": "up", "usage": 4}]}"#;
        let rec: Recording = serde_json::from_str(events_json).unwrap();
        let actions = rec.into_actions();
        assert_eq!(actions.len(), 1);
        assert!((actions[0].dur - 0.1).abs() < 1e-9);
    }
}
