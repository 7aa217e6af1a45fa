//! Movement strategies for reaching a departure point.
//!
//! Three strategies, tried in priority order:
//! 1. **Recorded** — the point carries a pre-recorded movement sequence;
//!    replay it with its original timing (no humanisation).
//! 2. **Class-based** — directional movement built from class primitives
//!    (double jump, rope lift, teleport) with humanised timing. X is aligned
//!    first, then Y.
//! 3. **Simple** — dominant-axis arrow presses scaled by distance, up to
//!    five attempts.

use std::path::Path;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::map::DeparturePoint;
use super::PositionSource;
use crate::error::Result;
use crate::hid::{KeyPad, ReportSink};
use crate::keymap::{
    self, USAGE_ARROW_DOWN, USAGE_ARROW_LEFT, USAGE_ARROW_RIGHT, USAGE_ARROW_UP,
};
use crate::recorder::Recording;

/// Alignment tolerance on each axis.
const AXIS_TOLERANCE: i32 = 5;
/// X distances above this use the class movement skill.
const LARGE_X: i32 = 24;
/// Y distances above this use rope lift / teleport.
const LARGE_Y: i32 = 38;
/// Y distances below this get a single fine-adjust tap.
const SMALL_Y: i32 = 3;
/// Base key press duration for jumps and taps.
const PRESS_BASE: f64 = 0.15;
const SIMPLE_MAX_ATTEMPTS: u32 = 5;

fn jitter(base: f64) -> f64 {
    if base <= 0.0 {
        return base;
    }
    rand::thread_rng().gen_range(base * 0.9..base * 1.1)
}

fn uniform(lo: f64, hi: f64) -> f64 {
    rand::thread_rng().gen_range(lo..hi)
}

async fn sleep_s(secs: f64) {
    if secs > 0.0 {
        tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
    }
}

/// Timed arrow press duration: 0.12 s at 1 px rising linearly to 2.0 s at
/// 50 px, capped.
fn timed_arrow_duration(distance: i32) -> f64 {
    if distance <= 0 {
        return 0.12;
    }
    let slope = (2.0 - 0.12) / 49.0;
    (0.12 + (distance - 1) as f64 * slope).min(2.0)
}

/// Post-movement settle time, linear in the distance.
fn settle_time(distance: i32, movement: Movement) -> f64 {
    let (min_wait, max_wait) = match movement {
        Movement::RopeLift => (1.5, 2.0),
        Movement::DoubleJump => (0.9, 1.3),
        Movement::FineAdjust => return uniform(0.5, 0.8),
    };
    let d = distance.clamp(5, LARGE_Y) as f64;
    min_wait + (d - 5.0) / (LARGE_Y as f64 - 5.0) * (max_wait - min_wait)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Movement {
    RopeLift,
    DoubleJump,
    FineAdjust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassType {
    Other,
    Magician,
}

/// Parsed class-based pathfinding configuration from a CV item.
#[derive(Debug, Clone)]
pub struct ClassConfig {
    pub class_type: ClassType,
    pub rope_lift_key: Option<u8>,
    pub diagonal_movement_key: Option<u8>,
    pub double_jump_up_allowed: bool,
    pub y_axis_jump_skill: Option<u8>,
    pub teleport_skill: Option<u8>,
}

impl ClassConfig {
    /// Parse the free-form `pathfinding_config` document. `None` when no
    /// class type is configured (falls back to the simple strategy).
    pub fn from_value(doc: &Value) -> Option<Self> {
        let class_type = match doc.get("class_type").and_then(Value::as_str)? {
            "magician" => ClassType::Magician,
            _ => ClassType::Other,
        };
        let key = |field: &str| {
            doc.get(field)
                .and_then(Value::as_str)
                .map(keymap::name_to_usage)
                .filter(|&u| u != 0)
        };
        Some(ClassConfig {
            class_type,
            rope_lift_key: key("rope_lift_key"),
            diagonal_movement_key: key("diagonal_movement_key"),
            double_jump_up_allowed: doc
                .get("double_jump_up_allowed")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            y_axis_jump_skill: key("y_axis_jump_skill"),
            teleport_skill: key("teleport_skill"),
        })
    }
}

/// Strategy selector and executor.
pub struct PathfindingController {
    class: Option<ClassConfig>,
    jump_key: u8,
}

impl PathfindingController {
    pub fn new(pathfinding_config: &Value, jump_key: u8) -> Self {
        let class = ClassConfig::from_value(pathfinding_config);
        if let Some(c) = &class {
            info!(class = ?c.class_type, jump_key, "class-based pathfinding configured");
        }
        PathfindingController { class, jump_key }
    }

    /// Navigate toward `target`. Returns `Ok(true)` when the point's hit
    /// predicate is satisfied afterwards.
    pub async fn navigate_to<S: ReportSink>(
        &self,
        pad: &mut KeyPad<S>,
        pos: &dyn PositionSource,
        record_dir: &Path,
        current: (i32, i32),
        target: &DeparturePoint,
    ) -> Result<bool> {
        if let Some(sequence) = &target.pathfinding_sequence {
            let path = crate::recorder::resolve_record_path(record_dir, sequence)
                .unwrap_or_else(|_| record_dir.join(sequence));
            return replay_recorded(pad, pos, &path, target).await;
        }
        if let Some(class) = &self.class {
            return navigate_class(class, self.jump_key, pad, pos, current, target).await;
        }
        navigate_simple(pad, pos, current, target).await
    }
}

/// Strategy 1: replay a recorded movement sequence with its own timing.
async fn replay_recorded<S: ReportSink>(
    pad: &mut KeyPad<S>,
    pos: &dyn PositionSource,
    path: &Path,
    target: &DeparturePoint,
) -> Result<bool> {
    info!(sequence = %path.display(), point = %target.name, "replaying pathfinding sequence");
    let actions = Recording::load(path)?.into_actions();
    if actions.is_empty() {
        warn!(sequence = %path.display(), "pathfinding sequence is empty");
        return Ok(false);
    }
    let base = actions[0].press;
    let mut cursor = 0.0f64;
    for action in &actions {
        let at = action.press - base;
        sleep_s(at - cursor).await;
        cursor = at;
        pad.press(action.usage)?;
        sleep_s(action.dur).await;
        cursor += action.dur;
        pad.release(action.usage)?;
    }
    sleep_s(0.3).await;
    Ok(check_hit(pos, target))
}

fn check_hit(pos: &dyn PositionSource, target: &DeparturePoint) -> bool {
    pos.position()
        .map(|(x, y)| target.check_hit(x, y))
        .unwrap_or(false)
}

/// Strategy 2 dispatch.
async fn navigate_class<S: ReportSink>(
    class: &ClassConfig,
    jump_key: u8,
    pad: &mut KeyPad<S>,
    pos: &dyn PositionSource,
    current: (i32, i32),
    target: &DeparturePoint,
) -> Result<bool> {
    if target.check_hit(current.0, current.1) {
        return Ok(true);
    }
    let dx = target.x - current.0;
    let dy = target.y - current.1;
    debug!(dx, dy, class = ?class.class_type, point = %target.name, "class navigation step");

    // X first, then Y.
    if dx.abs() > AXIS_TOLERANCE {
        match class.class_type {
            ClassType::Magician => move_horizontal_magician(class, pad, dx).await?,
            ClassType::Other => move_horizontal_other(jump_key, pad, dx).await?,
        }
        return Ok(check_hit(pos, target));
    }
    if dy.abs() > AXIS_TOLERANCE {
        match class.class_type {
            ClassType::Magician => move_vertical_magician(class, jump_key, pad, dy).await?,
            ClassType::Other => move_vertical_other(class, jump_key, pad, dy).await?,
        }
        return Ok(check_hit(pos, target));
    }
    Ok(check_hit(pos, target))
}

async fn press_tap<S: ReportSink>(pad: &mut KeyPad<S>, usage: u8, duration: f64) -> Result<()> {
    pad.press(usage)?;
    sleep_s(jitter(duration)).await;
    pad.release(usage)?;
    Ok(())
}

async fn double_jump_horizontal<S: ReportSink>(
    pad: &mut KeyPad<S>,
    arrow: u8,
    jump_key: u8,
) -> Result<()> {
    pad.press(arrow)?;
    sleep_s(0.05).await;
    press_tap(pad, jump_key, PRESS_BASE).await?;
    sleep_s(uniform(0.3, 0.5)).await;
    press_tap(pad, jump_key, PRESS_BASE).await?;
    sleep_s(0.05).await;
    pad.release(arrow)?;
    Ok(())
}

async fn double_jump_up<S: ReportSink>(
    pad: &mut KeyPad<S>,
    jump_key: u8,
    distance_y: i32,
) -> Result<()> {
    press_tap(pad, jump_key, PRESS_BASE).await?;
    // Larger climbs need the second jump earlier: 0.25 s gap at 5 px down
    // to 0.14 s at 38 px.
    let base_gap = (0.25 - ((distance_y - 5) as f64 / 33.0) * 0.11).clamp(0.14, 0.25);
    sleep_s(jitter(base_gap)).await;
    pad.press(USAGE_ARROW_UP)?;
    sleep_s(0.05).await;
    press_tap(pad, jump_key, PRESS_BASE).await?;
    sleep_s(0.05).await;
    pad.release(USAGE_ARROW_UP)?;
    Ok(())
}

async fn y_axis_jump<S: ReportSink>(pad: &mut KeyPad<S>, jump_key: u8, skill: u8) -> Result<()> {
    press_tap(pad, jump_key, PRESS_BASE).await?;
    sleep_s(uniform(0.1, 0.3)).await;
    press_tap(pad, skill, PRESS_BASE).await?;
    Ok(())
}

async fn jump_down<S: ReportSink>(pad: &mut KeyPad<S>, jump_key: u8) -> Result<()> {
    pad.press(USAGE_ARROW_DOWN)?;
    sleep_s(0.05).await;
    press_tap(pad, jump_key, PRESS_BASE).await?;
    sleep_s(jitter(0.2).min(0.3)).await;
    pad.release(USAGE_ARROW_DOWN)?;
    Ok(())
}

async fn rope_lift<S: ReportSink>(pad: &mut KeyPad<S>, rope_key: u8) -> Result<()> {
    press_tap(pad, rope_key, 0.2).await
}

async fn fine_adjust_vertical<S: ReportSink>(pad: &mut KeyPad<S>, dy: i32) -> Result<()> {
    let arrow = if dy < 0 { USAGE_ARROW_UP } else { USAGE_ARROW_DOWN };
    press_tap(pad, arrow, uniform(0.1, 0.15)).await
}

async fn move_horizontal_other<S: ReportSink>(
    jump_key: u8,
    pad: &mut KeyPad<S>,
    dx: i32,
) -> Result<()> {
    let distance = dx.abs();
    let arrow = if dx > 0 { USAGE_ARROW_RIGHT } else { USAGE_ARROW_LEFT };
    if distance > LARGE_X {
        double_jump_horizontal(pad, arrow, jump_key).await?;
    } else {
        press_tap(pad, arrow, timed_arrow_duration(distance)).await?;
    }
    sleep_s(settle_time(distance, Movement::DoubleJump)).await;
    Ok(())
}

async fn move_vertical_other<S: ReportSink>(
    class: &ClassConfig,
    jump_key: u8,
    pad: &mut KeyPad<S>,
    dy: i32,
) -> Result<()> {
    let distance = dy.abs();
    let movement;
    if distance < SMALL_Y {
        fine_adjust_vertical(pad, dy).await?;
        movement = Movement::FineAdjust;
    } else if dy < 0 {
        // Climb.
        if distance > LARGE_Y {
            if let Some(rope) = class.rope_lift_key {
                rope_lift(pad, rope).await?;
                movement = Movement::RopeLift;
            } else if let Some(skill) = class.y_axis_jump_skill {
                y_axis_jump(pad, jump_key, skill).await?;
                movement = Movement::DoubleJump;
            } else {
                warn!("no climb movement configured for large distances");
                return Ok(());
            }
        } else if class.double_jump_up_allowed {
            double_jump_up(pad, jump_key, distance).await?;
            movement = Movement::DoubleJump;
        } else if let Some(skill) = class.y_axis_jump_skill {
            y_axis_jump(pad, jump_key, skill).await?;
            movement = Movement::DoubleJump;
        } else {
            warn!("no climb movement configured for small distances");
            return Ok(());
        }
    } else {
        jump_down(pad, jump_key).await?;
        movement = Movement::DoubleJump;
    }
    sleep_s(settle_time(distance, movement)).await;
    Ok(())
}

async fn move_horizontal_magician<S: ReportSink>(
    class: &ClassConfig,
    pad: &mut KeyPad<S>,
    dx: i32,
) -> Result<()> {
    let distance = dx.abs();
    let arrow = if dx > 0 { USAGE_ARROW_RIGHT } else { USAGE_ARROW_LEFT };
    if distance > LARGE_X {
        if let Some(teleport) = class.teleport_skill {
            pad.press(arrow)?;
            sleep_s(uniform(0.05, 0.15)).await;
            press_tap(pad, teleport, PRESS_BASE).await?;
            sleep_s(uniform(0.05, 0.15)).await;
            pad.release(arrow)?;
        } else {
            warn!("teleport not configured, falling back to timed arrow");
            press_tap(pad, arrow, timed_arrow_duration(distance)).await?;
        }
    } else {
        press_tap(pad, arrow, timed_arrow_duration(distance)).await?;
    }
    sleep_s(settle_time(distance, Movement::DoubleJump)).await;
    Ok(())
}

async fn move_vertical_magician<S: ReportSink>(
    class: &ClassConfig,
    jump_key: u8,
    pad: &mut KeyPad<S>,
    dy: i32,
) -> Result<()> {
    let distance = dy.abs();
    let mut movement = Movement::DoubleJump;
    if distance < SMALL_Y {
        fine_adjust_vertical(pad, dy).await?;
        movement = Movement::FineAdjust;
    } else if dy < 0 {
        if distance > LARGE_Y && class.rope_lift_key.is_some() {
            if let Some(rope) = class.rope_lift_key {
                rope_lift(pad, rope).await?;
                movement = Movement::RopeLift;
            }
        } else if let Some(teleport) = class.teleport_skill {
            // Jump, hold UP, teleport, release.
            press_tap(pad, jump_key, PRESS_BASE).await?;
            pad.press(USAGE_ARROW_UP)?;
            sleep_s(uniform(0.05, 0.15)).await;
            press_tap(pad, teleport, PRESS_BASE).await?;
            sleep_s(uniform(0.05, 0.15)).await;
            pad.release(USAGE_ARROW_UP)?;
        } else if let Some(rope) = class.rope_lift_key {
            rope_lift(pad, rope).await?;
            movement = Movement::RopeLift;
        } else {
            warn!("no climb movement configured");
            return Ok(());
        }
    } else if let Some(teleport) = class.teleport_skill {
        // Descend: hold DOWN, wait, teleport, release.
        pad.press(USAGE_ARROW_DOWN)?;
        sleep_s(uniform(0.2, 0.4)).await;
        press_tap(pad, teleport, PRESS_BASE).await?;
        sleep_s(uniform(0.05, 0.15)).await;
        pad.release(USAGE_ARROW_DOWN)?;
    } else {
        warn!("teleport not configured for descent");
        return Ok(());
    }
    sleep_s(settle_time(distance, movement)).await;
    Ok(())
}

/// Strategy 3: dominant-axis arrow presses, re-checking up to five times.
async fn navigate_simple<S: ReportSink>(
    pad: &mut KeyPad<S>,
    pos: &dyn PositionSource,
    mut current: (i32, i32),
    target: &DeparturePoint,
) -> Result<bool> {
    for attempt in 0..SIMPLE_MAX_ATTEMPTS {
        if target.check_hit(current.0, current.1) {
            debug!(attempt, "simple navigation reached target");
            return Ok(true);
        }
        let dx = target.x - current.0;
        let dy = target.y - current.1;
        let distance = ((dx * dx + dy * dy) as f64).sqrt();
        let duration = (0.1 + distance / 200.0).min(0.3);

        if dx.abs() > AXIS_TOLERANCE {
            let arrow = if dx > 0 { USAGE_ARROW_RIGHT } else { USAGE_ARROW_LEFT };
            press_tap(pad, arrow, duration).await?;
            sleep_s(0.05).await;
        }
        if dy.abs() > AXIS_TOLERANCE {
            let arrow = if dy > 0 { USAGE_ARROW_DOWN } else { USAGE_ARROW_UP };
            press_tap(pad, arrow, duration).await?;
            sleep_s(0.05).await;
        }

        sleep_s(0.3).await;
        match pos.position() {
            Some(p) => current = p,
            None => {
                warn!("position unavailable during simple navigation");
                continue;
            }
        }
    }
    warn!(point = %target.name, "simple navigation exhausted its attempts");
    Ok(false)
}
