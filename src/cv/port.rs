//! Portal navigation: the UP-then-adjust retry flow, and the detector that
//! spots involuntary ports (abrupt jumps or detection loss).

use tracing::{debug, info, warn};

use super::map::DeparturePoint;
use super::PositionSource;
use crate::error::Result;
use crate::hid::{KeyPad, ReportSink};
use crate::keymap::{USAGE_ARROW_LEFT, USAGE_ARROW_RIGHT, USAGE_ARROW_UP};

/// X adjustments attempted after the initial UP press.
const MAX_ADJUST_ATTEMPTS: u32 = 3;
const UP_PRESS_DURATION: f64 = 0.1;
const ADJUST_PRESS_DURATION: f64 = 0.1;
/// Settle time after an UP press before re-reading the position.
const CHECK_DELAY: f64 = 0.5;

async fn press_key<S: ReportSink>(pad: &mut KeyPad<S>, usage: u8, duration: f64) -> Result<()> {
    pad.press(usage)?;
    tokio::time::sleep(std::time::Duration::from_secs_f64(duration)).await;
    pad.release(usage)?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}

/// Portal ascent: press UP; while the target is not hit, nudge LEFT or
/// RIGHT toward it and press UP again, up to three adjustments.
pub struct PortFlow;

impl PortFlow {
    pub async fn execute<S: ReportSink>(
        pad: &mut KeyPad<S>,
        pos: &dyn PositionSource,
        current: (i32, i32),
        target: &DeparturePoint,
    ) -> Result<bool> {
        info!(
            from = ?current,
            to = ?(target.x, target.y),
            point = %target.name,
            "port flow started"
        );

        press_key(pad, USAGE_ARROW_UP, UP_PRESS_DURATION).await?;
        tokio::time::sleep(std::time::Duration::from_secs_f64(CHECK_DELAY)).await;

        let mut latest = pos.position();
        if let Some((x, y)) = latest {
            if target.check_hit(x, y) {
                info!("port reached on the initial UP press");
                return Ok(true);
            }
        }

        for attempt in 1..=MAX_ADJUST_ATTEMPTS {
            debug!(attempt, "port flow adjustment");
            let Some((x, _)) = latest.or_else(|| pos.position()) else {
                warn!("no position available during port flow");
                latest = None;
                continue;
            };

            match x.cmp(&target.x) {
                std::cmp::Ordering::Less => {
                    press_key(pad, USAGE_ARROW_RIGHT, ADJUST_PRESS_DURATION).await?
                }
                std::cmp::Ordering::Greater => {
                    press_key(pad, USAGE_ARROW_LEFT, ADJUST_PRESS_DURATION).await?
                }
                std::cmp::Ordering::Equal => {}
            }

            press_key(pad, USAGE_ARROW_UP, UP_PRESS_DURATION).await?;
            tokio::time::sleep(std::time::Duration::from_secs_f64(CHECK_DELAY)).await;

            latest = pos.position();
            if let Some((x, y)) = latest {
                if target.check_hit(x, y) {
                    info!(attempt, "port reached");
                    return Ok(true);
                }
            }
        }

        warn!(point = %target.name, "port flow exhausted its adjustments");
        Ok(false)
    }
}

/// Spots involuntary teleports so the navigator can reset to point 0.
pub struct PortDetector {
    last_pos: Option<(i32, i32)>,
    last_time: f64,
}

/// A jump beyond this distance in one observation counts as a port.
const PORT_DISTANCE_THRESHOLD: f64 = 50.0;
/// Detection silence beyond this counts as a port (map change, loading).
const DETECTION_TIMEOUT_S: f64 = 2.0;

impl Default for PortDetector {
    fn default() -> Self {
        PortDetector {
            last_pos: None,
            last_time: 0.0,
        }
    }
}

impl PortDetector {
    pub fn new() -> Self {
        PortDetector::default()
    }

    pub fn update_position(&mut self, pos: (i32, i32), now: f64) {
        self.last_pos = Some(pos);
        self.last_time = now;
    }

    /// True when the position jumped or detection went silent too long.
    pub fn check_port(&self, current: Option<(i32, i32)>, now: f64) -> bool {
        let Some(last) = self.last_pos else {
            return false;
        };
        if now - self.last_time > DETECTION_TIMEOUT_S {
            warn!(gap_s = now - self.last_time, "detection gap, possible port");
            return true;
        }
        if let Some((x, y)) = current {
            let dx = (x - last.0) as f64;
            let dy = (y - last.1) as f64;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance > PORT_DISTANCE_THRESHOLD {
                warn!(distance, from = ?last, to = ?(x, y), "abrupt position change, port detected");
                return true;
            }
        }
        false
    }

    pub fn reset(&mut self) {
        self.last_pos = None;
        self.last_time = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv::map::{RotationMode, ToleranceMode};
    use crate::hid::testing::MockSink;
    use crate::keymap;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    struct Script(RefCell<VecDeque<Option<(i32, i32)>>>);

    impl PositionSource for Script {
        fn position(&self) -> Option<(i32, i32)> {
            let mut q = self.0.borrow_mut();
            if q.len() > 1 {
                q.pop_front().flatten()
            } else {
                q.front().copied().flatten()
            }
        }
    }

    fn teleport_target() -> DeparturePoint {
        DeparturePoint {
            id: "port".into(),
            name: "port".into(),
            x: 100,
            y: 40,
            order: 0,
            tolerance_mode: ToleranceMode::Both,
            tolerance_value: 5,
            created_at: 0.0,
            rotation_paths: Vec::new(),
            rotation_mode: RotationMode::Random,
            is_teleport_point: true,
            auto_play: true,
            pathfinding_sequence: None,
        }
    }

    fn count_presses(reports: &[[u8; 8]], usage: u8) -> usize {
        // Count rising edges of the usage across consecutive reports.
        let mut count = 0;
        let mut held = false;
        for r in reports {
            let now = r[2..].contains(&usage);
            if now && !held {
                count += 1;
            }
            held = now;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_adjustments() {
        // Stays at (50, 80) for the first two checks, lands on the third.
        let script = Script(RefCell::new(
            [
                Some((50, 80)), // after initial UP
                Some((50, 80)), // after first adjusted UP
                Some((100, 40)), // after second adjusted UP
            ]
            .into_iter()
            .collect(),
        ));
        let mut pad = KeyPad::new(MockSink::default());
        let ok = PortFlow::execute(&mut pad, &script, (50, 80), &teleport_target())
            .await
            .unwrap();
        assert!(ok);

        let reports = &pad.sink_mut().reports;
        assert_eq!(count_presses(reports, keymap::USAGE_ARROW_UP), 3);
        assert_eq!(count_presses(reports, keymap::USAGE_ARROW_RIGHT), 2);
        assert_eq!(count_presses(reports, keymap::USAGE_ARROW_LEFT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_exhausting_adjustments() {
        let script = Script(RefCell::new([Some((50, 80))].into_iter().collect()));
        let mut pad = KeyPad::new(MockSink::default());
        let ok = PortFlow::execute(&mut pad, &script, (50, 80), &teleport_target())
            .await
            .unwrap();
        assert!(!ok);
        // Initial + three adjustment rounds.
        assert_eq!(
            count_presses(&pad.sink_mut().reports, keymap::USAGE_ARROW_UP),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn adjusts_left_when_overshooting() {
        let script = Script(RefCell::new(
            [Some((150, 80)), Some((100, 40))].into_iter().collect(),
        ));
        let mut pad = KeyPad::new(MockSink::default());
        let ok = PortFlow::execute(&mut pad, &script, (150, 80), &teleport_target())
            .await
            .unwrap();
        assert!(ok);
        assert!(count_presses(&pad.sink_mut().reports, keymap::USAGE_ARROW_LEFT) >= 1);
    }

    #[test]
    fn port_detector_spots_jumps_and_gaps() {
        let mut det = PortDetector::new();
        // No history: nothing to compare.
        assert!(!det.check_port(Some((0, 0)), 0.0));
        det.update_position((10, 10), 1.0);

        // Small move: fine.
        assert!(!det.check_port(Some((15, 12)), 1.5));
        // 60 px jump: port.
        assert!(det.check_port(Some((70, 10)), 1.6));
        // Silence beyond two seconds: port.
        assert!(det.check_port(None, 3.5));

        det.reset();
        assert!(!det.check_port(Some((200, 200)), 10.0));
    }
}
