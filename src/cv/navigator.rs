//! Sequential progression through a map's departure points.

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::map::{DeparturePoint, RotationMode};

#[derive(Debug, Clone, Serialize)]
pub struct NavigationState {
    pub current_point_index: usize,
    pub total_points: usize,
    pub current_point_name: String,
    pub last_rotation_played: Option<String>,
    pub rotations_played_count: u64,
    pub cycles_completed: u64,
}

pub struct PointNavigator {
    points: Vec<DeparturePoint>,
    map_name: String,
    loop_points: bool,
    current: usize,
    rotations_played: u64,
    cycles_completed: u64,
    last_rotation: Option<String>,
}

impl PointNavigator {
    /// Points are sorted by their `order` field. At least one is required.
    pub fn new(
        mut points: Vec<DeparturePoint>,
        map_name: impl Into<String>,
        loop_points: bool,
    ) -> crate::error::Result<Self> {
        if points.is_empty() {
            return Err(crate::error::Error::protocol("no departure points provided"));
        }
        points.sort_by_key(|p| p.order);
        let map_name = map_name.into();
        info!(
            map = %map_name,
            points = points.len(),
            loop_points,
            "point navigator initialised"
        );
        Ok(PointNavigator {
            points,
            map_name,
            loop_points,
            current: 0,
            rotations_played: 0,
            cycles_completed: 0,
            last_rotation: None,
        })
    }

    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    pub fn current_point(&self) -> &DeparturePoint {
        &self.points[self.current.min(self.points.len() - 1)]
    }

    pub fn points(&self) -> &[DeparturePoint] {
        &self.points
    }

    /// Move to the next point; wraps (counting a cycle) when looping.
    /// Returns false at the end of a non-looping sequence.
    pub fn advance(&mut self) -> bool {
        if self.current + 1 >= self.points.len() {
            if self.loop_points {
                self.current = 0;
                self.cycles_completed += 1;
                info!(cycles = self.cycles_completed, "navigator wrapped to first point");
                return true;
            }
            info!("navigator reached end of sequence");
            return false;
        }
        self.current += 1;
        debug!(index = self.current, name = %self.current_point().name, "advanced to next point");
        true
    }

    /// Back to point 0 (port detected, or manual reset).
    pub fn reset(&mut self) {
        self.current = 0;
        self.rotations_played = 0;
        self.cycles_completed = 0;
        self.last_rotation = None;
    }

    /// Pick a rotation for the point according to its rotation mode.
    pub fn select_rotation(&mut self, point: &DeparturePoint) -> Option<String> {
        if point.rotation_paths.is_empty() {
            warn!(point = %point.name, "no rotations linked");
            return None;
        }
        let selected = match point.rotation_mode {
            RotationMode::Single => point.rotation_paths[0].clone(),
            RotationMode::Sequential => {
                let idx = (self.rotations_played as usize) % point.rotation_paths.len();
                point.rotation_paths[idx].clone()
            }
            RotationMode::Random => point
                .rotation_paths
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_else(|| point.rotation_paths[0].clone()),
        };
        self.last_rotation = Some(selected.clone());
        self.rotations_played += 1;
        Some(selected)
    }

    pub fn state(&self) -> NavigationState {
        NavigationState {
            current_point_index: self.current,
            total_points: self.points.len(),
            current_point_name: self.current_point().name.clone(),
            last_rotation_played: self.last_rotation.clone(),
            rotations_played_count: self.rotations_played,
            cycles_completed: self.cycles_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv::map::ToleranceMode;

    fn point(name: &str, order: u32, rotations: &[&str], mode: RotationMode) -> DeparturePoint {
        DeparturePoint {
            id: name.into(),
            name: name.into(),
            x: 0,
            y: 0,
            order,
            tolerance_mode: ToleranceMode::Both,
            tolerance_value: 5,
            created_at: 0.0,
            rotation_paths: rotations.iter().map(|s| s.to_string()).collect(),
            rotation_mode: mode,
            is_teleport_point: false,
            auto_play: true,
            pathfinding_sequence: None,
        }
    }

    #[test]
    fn points_sorted_by_order() {
        let nav = PointNavigator::new(
            vec![
                point("b", 1, &[], RotationMode::Random),
                point("a", 0, &[], RotationMode::Random),
            ],
            "m",
            true,
        )
        .unwrap();
        assert_eq!(nav.current_point().name, "a");
    }

    #[test]
    fn advance_wraps_and_counts_cycles() {
        let mut nav = PointNavigator::new(
            vec![
                point("a", 0, &[], RotationMode::Random),
                point("b", 1, &[], RotationMode::Random),
            ],
            "m",
            true,
        )
        .unwrap();
        assert!(nav.advance());
        assert_eq!(nav.current_point().name, "b");
        assert!(nav.advance());
        assert_eq!(nav.current_point().name, "a");
        assert_eq!(nav.state().cycles_completed, 1);
    }

    #[test]
    fn non_looping_stops_at_the_end() {
        let mut nav =
            PointNavigator::new(vec![point("a", 0, &[], RotationMode::Random)], "m", false)
                .unwrap();
        assert!(!nav.advance());
    }

    #[test]
    fn sequential_mode_cycles_by_play_count() {
        let p = point("a", 0, &["r0", "r1", "r2"], RotationMode::Sequential);
        let mut nav = PointNavigator::new(vec![p.clone()], "m", true).unwrap();
        assert_eq!(nav.select_rotation(&p).as_deref(), Some("r0"));
        assert_eq!(nav.select_rotation(&p).as_deref(), Some("r1"));
        assert_eq!(nav.select_rotation(&p).as_deref(), Some("r2"));
        assert_eq!(nav.select_rotation(&p).as_deref(), Some("r0"));
    }

    #[test]
    fn single_mode_always_first() {
        let p = point("a", 0, &["r0", "r1"], RotationMode::Single);
        let mut nav = PointNavigator::new(vec![p.clone()], "m", true).unwrap();
        for _ in 0..3 {
            assert_eq!(nav.select_rotation(&p).as_deref(), Some("r0"));
        }
    }

    #[test]
    fn empty_rotation_list_selects_nothing() {
        let p = point("a", 0, &[], RotationMode::Random);
        let mut nav = PointNavigator::new(vec![p.clone()], "m", true).unwrap();
        assert!(nav.select_rotation(&p).is_none());
        assert_eq!(nav.state().rotations_played_count, 0);
    }

    #[test]
    fn reset_returns_to_first_point() {
        let mut nav = PointNavigator::new(
            vec![
                point("a", 0, &[], RotationMode::Random),
                point("b", 1, &[], RotationMode::Random),
            ],
            "m",
            true,
        )
        .unwrap();
        nav.advance();
        nav.reset();
        assert_eq!(nav.state().current_point_index, 0);
    }
}
