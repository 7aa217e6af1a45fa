//! Boot-protocol keyboard report output to the USB-gadget endpoint.
//!
//! The endpoint is a plain byte-writable file (`/dev/hidg0`). Disconnects
//! surface as `BrokenPipe`; those are retried with exponential backoff and a
//! device reopen between attempts. Repeated full-retry failures open a
//! circuit breaker that silently swallows writes for a cooldown window so a
//! flapping USB host cannot wedge the daemon.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keymap;

/// Backoff schedule for broken-pipe retries.
const RETRY_DELAYS: [Duration; 5] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];
/// Full-retry failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 3;
/// How long the breaker stays open.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(10);

/// Build the fixed 8-byte boot report: `[modmask, 0, k0..k5]`.
/// Keys beyond the sixth are dropped (boot protocol limit).
pub fn build_report(modmask: u8, keys: &BTreeSet<u8>) -> [u8; 8] {
    let mut report = [0u8; 8];
    report[0] = modmask;
    for (slot, usage) in keys.iter().take(6).enumerate() {
        report[2 + slot] = *usage;
    }
    report
}

/// Anything that accepts boot reports. The gadget writer implements this;
/// tests substitute an in-memory sink.
pub trait ReportSink {
    fn send(&mut self, modmask: u8, keys: &BTreeSet<u8>) -> Result<()>;
    fn all_up(&mut self) -> Result<()>;
}

impl<T: ReportSink + ?Sized> ReportSink for &mut T {
    fn send(&mut self, modmask: u8, keys: &BTreeSet<u8>) -> Result<()> {
        (**self).send(modmask, keys)
    }
    fn all_up(&mut self) -> Result<()> {
        (**self).all_up()
    }
}

/// Writer for the USB-gadget HID endpoint with reconnect and breaker logic.
pub struct HidWriter {
    path: PathBuf,
    file: File,
    full_retry_failures: u32,
    breaker_open_until: Option<Instant>,
    breaker_logged: bool,
}

impl HidWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open_endpoint(&path)?;
        debug!(path = %path.display(), "HID endpoint opened");
        Ok(HidWriter {
            path,
            file,
            full_retry_failures: 0,
            breaker_open_until: None,
            breaker_logged: false,
        })
    }

    fn open_endpoint(path: &Path) -> Result<File> {
        // A gadget that is mid-enumeration can refuse the open briefly.
        let mut delay = Duration::from_millis(100);
        let mut last_err = None;
        for attempt in 0..3 {
            match OpenOptions::new().write(true).open(path) {
                Ok(f) => return Ok(f),
                Err(e) => {
                    if attempt < 2 {
                        warn!(
                            path = %path.display(),
                            attempt = attempt + 1,
                            error = %e,
                            "HID endpoint open failed, retrying"
                        );
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => Error::Io(e),
            None => Error::FatalInit(format!("cannot open HID endpoint {}", path.display())),
        })
    }

    fn reopen(&mut self) -> Result<()> {
        info!(path = %self.path.display(), "reopening HID endpoint");
        self.file = Self::open_endpoint(&self.path)?;
        Ok(())
    }

    fn breaker_is_open(&mut self) -> bool {
        match self.breaker_open_until {
            Some(until) if Instant::now() < until => {
                if !self.breaker_logged {
                    warn!("HID circuit breaker open, suppressing writes");
                    self.breaker_logged = true;
                }
                true
            }
            Some(_) => {
                // Cooldown elapsed, self-heal.
                self.breaker_open_until = None;
                self.breaker_logged = false;
                self.full_retry_failures = 0;
                info!("HID circuit breaker closed, resuming writes");
                false
            }
            None => false,
        }
    }

    fn write_with_retry(&mut self, report: &[u8; 8]) -> Result<()> {
        if self.breaker_is_open() {
            return Ok(());
        }
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            match self.file.write_all(report) {
                Ok(()) => {
                    if self.full_retry_failures > 0 {
                        info!(
                            prior_failures = self.full_retry_failures,
                            "HID write succeeded, USB link recovered"
                        );
                        self.full_retry_failures = 0;
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    if attempt + 1 == RETRY_DELAYS.len() {
                        self.full_retry_failures += 1;
                        warn!(
                            consecutive = self.full_retry_failures,
                            "HID write still broken after full retry schedule"
                        );
                        if self.full_retry_failures >= BREAKER_THRESHOLD {
                            self.breaker_open_until = Some(Instant::now() + BREAKER_COOLDOWN);
                            self.breaker_logged = false;
                            warn!(
                                cooldown_s = BREAKER_COOLDOWN.as_secs(),
                                "HID circuit breaker opened"
                            );
                            // Swallow: degraded, not fatal.
                            return Ok(());
                        }
                        return Err(Error::Io(e));
                    }
                    warn!(
                        attempt = attempt + 1,
                        wait_ms = delay.as_millis() as u64,
                        "BrokenPipe on HID write, waiting for USB reconnect"
                    );
                    std::thread::sleep(*delay);
                    // The reopen succeeds even while the host is away; the
                    // next write tells us whether the link is back.
                    self.reopen()?;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        // Every path through the final attempt returns above.
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "HID write retries exhausted",
        )))
    }

    /// Emit a report for the given modifier mask and pressed-key set.
    pub fn send(&mut self, modmask: u8, keys: &BTreeSet<u8>) -> Result<()> {
        let report = build_report(modmask, keys);
        self.write_with_retry(&report)
    }

    /// Release everything: eight zero bytes.
    pub fn all_up(&mut self) -> Result<()> {
        self.write_with_retry(&[0u8; 8])
    }

    pub fn close(self) {
        // Drop closes the fd.
    }
}

impl ReportSink for HidWriter {
    fn send(&mut self, modmask: u8, keys: &BTreeSet<u8>) -> Result<()> {
        HidWriter::send(self, modmask, keys)
    }
    fn all_up(&mut self) -> Result<()> {
        HidWriter::all_up(self)
    }
}

/// Stateful press/release adapter over a [`ReportSink`].
///
/// Pathfinding and port-flow code thinks in individual key transitions; this
/// keeps the current modifier mask and pressed set and emits a fresh report
/// on every change. Modifier usages update the mask instead of the key set.
pub struct KeyPad<S: ReportSink> {
    sink: S,
    modmask: u8,
    pressed: BTreeSet<u8>,
}

impl<S: ReportSink> KeyPad<S> {
    pub fn new(sink: S) -> Self {
        KeyPad {
            sink,
            modmask: 0,
            pressed: BTreeSet::new(),
        }
    }

    pub fn press(&mut self, usage: u8) -> Result<()> {
        if keymap::is_modifier_usage(usage) {
            self.modmask |= keymap::mod_bit_for_usage(usage);
        } else {
            self.pressed.insert(usage);
        }
        self.sink.send(self.modmask, &self.pressed)
    }

    pub fn release(&mut self, usage: u8) -> Result<()> {
        if keymap::is_modifier_usage(usage) {
            self.modmask &= !keymap::mod_bit_for_usage(usage);
        } else {
            self.pressed.remove(&usage);
        }
        self.sink.send(self.modmask, &self.pressed)
    }

    pub fn all_up(&mut self) -> Result<()> {
        self.modmask = 0;
        self.pressed.clear();
        self.sink.all_up()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

pub mod testing {
    //! In-memory sink recording every report, for timeline assertions in
    //! unit and integration tests.

    use super::*;

    #[derive(Default)]
    pub struct MockSink {
        pub reports: Vec<[u8; 8]>,
    }

    impl ReportSink for MockSink {
        fn send(&mut self, modmask: u8, keys: &BTreeSet<u8>) -> Result<()> {
            self.reports.push(build_report(modmask, keys));
            Ok(())
        }
        fn all_up(&mut self) -> Result<()> {
            self.reports.push([0u8; 8]);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(v: &[u8]) -> BTreeSet<u8> {
        v.iter().copied().collect()
    }

    #[test]
    fn report_layout() {
        let r = build_report(0b0000_0101, &keys(&[4, 5, 6]));
        assert_eq!(r, [5, 0, 4, 5, 6, 0, 0, 0]);
    }

    #[test]
    fn report_truncates_to_six_keys() {
        let r = build_report(0, &keys(&[4, 5, 6, 7, 8, 9, 10, 11]));
        assert_eq!(&r[2..], &[4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn keypad_tracks_modifiers_in_the_mask() {
        let mut pad = KeyPad::new(testing::MockSink::default());
        pad.press(224).unwrap(); // LCTRL
        pad.press(4).unwrap(); // A
        pad.release(224).unwrap();
        pad.release(4).unwrap();
        let reports = &pad.sink_mut().reports;
        assert_eq!(reports[0], [1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reports[1], [1, 0, 4, 0, 0, 0, 0, 0]);
        assert_eq!(reports[2], [0, 0, 4, 0, 0, 0, 0, 0]);
        assert_eq!(reports[3], [0u8; 8]);
    }

    #[test]
    fn keypad_all_up_clears_state() {
        let mut pad = KeyPad::new(testing::MockSink::default());
        pad.press(230).unwrap();
        pad.press(30).unwrap();
        pad.all_up().unwrap();
        pad.press(5).unwrap();
        let last = *pad.sink_mut().reports.last().unwrap();
        assert_eq!(last, [0, 0, 5, 0, 0, 0, 0, 0]);
    }
}
