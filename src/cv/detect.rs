//! Minimap object detection: one yellow player dot, any number of red
//! other-player dots.
//!
//! Per frame: HSV → colour mask → open/close morphology (4×4) → external
//! contours → size/circularity/aspect(/contrast) filters → combined-score
//! selection for the player, dedup for the others. Coordinates are relative
//! to the cropped minimap. A single detection is expected in single-digit
//! milliseconds; anything over 15 ms logs a warning.

use std::time::Instant;

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

use super::imageops::{self, HsvImage, Mask};
use crate::util;

/// Edge clamp margin in pixels.
const POSITION_MARGIN: i32 = 2;
/// Centre distance under which two blobs count as duplicates.
const DEDUP_DISTANCE: f64 = 5.0;
/// Detection-time budget before a warning fires.
const SLOW_DETECTION_MS: f64 = 15.0;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub player_hsv_lower: [u8; 3],
    pub player_hsv_upper: [u8; 3],
    pub other_player_hsv_ranges: Vec<([u8; 3], [u8; 3])>,
    pub min_blob_size: f64,
    pub max_blob_size: f64,
    pub min_blob_size_other: f64,
    pub max_blob_size_other: f64,
    pub min_circularity: f64,
    pub min_circularity_other: f64,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub enable_contrast_validation: bool,
    pub min_contrast_ratio: f64,
    pub temporal_smoothing: bool,
    pub smoothing_alpha: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            player_hsv_lower: [20, 180, 180],
            player_hsv_upper: [40, 255, 255],
            // Red wraps at the hue seam, two ranges.
            other_player_hsv_ranges: vec![
                ([0, 100, 100], [10, 255, 255]),
                ([165, 100, 100], [179, 255, 255]),
            ],
            min_blob_size: 4.0,
            max_blob_size: 16.0,
            min_blob_size_other: 4.0,
            max_blob_size_other: 80.0,
            min_circularity: 0.71,
            min_circularity_other: 0.65,
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 2.0,
            enable_contrast_validation: false,
            min_contrast_ratio: 1.15,
            temporal_smoothing: true,
            smoothing_alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlayerPosition {
    pub detected: bool,
    pub x: i32,
    pub y: i32,
    /// Circularity of the winning blob.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OtherPlayers {
    pub detected: bool,
    pub count: usize,
    pub positions: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub player: PlayerPosition,
    pub other_players: OtherPlayers,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerfStats {
    pub avg_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
    pub count: u64,
}

#[derive(Debug, Clone)]
struct Blob {
    center: (i32, i32),
    radius: f64,
    diameter: f64,
    circularity: f64,
    saturation: f64,
    value: f64,
}

pub struct MinimapDetector {
    config: DetectorConfig,
    last_player_pos: Option<(i32, i32)>,
    count: u64,
    total_ms: f64,
    max_ms: f64,
    min_ms: f64,
}

impl MinimapDetector {
    pub fn new(config: DetectorConfig) -> Self {
        MinimapDetector {
            config,
            last_player_pos: None,
            count: 0,
            total_ms: 0.0,
            max_ms: 0.0,
            min_ms: f64::INFINITY,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Swap the configuration; smoothing state restarts.
    pub fn set_config(&mut self, config: DetectorConfig) {
        self.config = config;
        self.last_player_pos = None;
    }

    /// Run the full pipeline on a minimap crop.
    pub fn detect(&mut self, frame: &RgbImage) -> DetectionResult {
        let start = Instant::now();
        self.count += 1;

        let hsv = imageops::to_hsv(frame);
        let player = self.detect_player(frame, &hsv);
        let other_players = self.detect_other_players(frame, &hsv);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.total_ms += elapsed_ms;
        self.max_ms = self.max_ms.max(elapsed_ms);
        self.min_ms = self.min_ms.min(elapsed_ms);
        if elapsed_ms > SLOW_DETECTION_MS {
            warn!(elapsed_ms, "detection exceeded time budget");
        }

        DetectionResult {
            player,
            other_players,
            timestamp: util::unix_ts(),
        }
    }

    pub fn perf_stats(&self) -> PerfStats {
        if self.count == 0 {
            return PerfStats::default();
        }
        PerfStats {
            avg_ms: self.total_ms / self.count as f64,
            max_ms: self.max_ms,
            min_ms: if self.min_ms.is_finite() { self.min_ms } else { 0.0 },
            count: self.count,
        }
    }

    pub fn reset_perf_stats(&mut self) {
        self.count = 0;
        self.total_ms = 0.0;
        self.max_ms = 0.0;
        self.min_ms = f64::INFINITY;
    }

    fn colour_mask(&self, hsv: &HsvImage, lo: [u8; 3], hi: [u8; 3]) -> Mask {
        let raw = imageops::in_range(hsv, lo, hi);
        imageops::morph_close(&imageops::morph_open(&raw, 4), 4)
    }

    fn find_blobs(
        &self,
        mask: &Mask,
        frame: &RgbImage,
        hsv: &HsvImage,
        min_size: f64,
        max_size: f64,
        min_circularity: f64,
    ) -> Vec<Blob> {
        let mut blobs = Vec::new();
        for contour in imageops::find_external_contours(mask) {
            if contour.area == 0.0 || contour.perimeter == 0.0 {
                continue;
            }
            let circularity =
                4.0 * std::f64::consts::PI * contour.area / (contour.perimeter * contour.perimeter);
            if circularity < min_circularity {
                continue;
            }
            let radius = (contour.area / std::f64::consts::PI).sqrt();
            let diameter = radius * 2.0;
            if diameter < min_size || diameter > max_size {
                continue;
            }
            let (_, _, bw, bh) = contour.bbox;
            if bh == 0 {
                continue;
            }
            let aspect = bw as f64 / bh as f64;
            if aspect < self.config.min_aspect_ratio || aspect > self.config.max_aspect_ratio {
                debug!(aspect, "blob rejected by aspect ratio");
                continue;
            }
            let cx = contour.centroid.0.round() as i32;
            let cy = contour.centroid.1.round() as i32;
            if cx < 0 || cy < 0 || cx >= hsv.width as i32 || cy >= hsv.height as i32 {
                continue;
            }
            let [_, s, v] = hsv.at(cx as u32, cy as u32);

            if self.config.enable_contrast_validation
                && !self.validate_contrast(frame, cx, cy, radius)
            {
                debug!(cx, cy, "blob rejected by contrast validation");
                continue;
            }

            blobs.push(Blob {
                center: (cx, cy),
                radius,
                diameter,
                circularity,
                saturation: s as f64,
                value: v as f64,
            });
        }
        blobs
    }

    /// Preferred-size score: flat 1.0 in 4–10 px, linear decay below,
    /// inverse-proportional decay above, floored at 0.1.
    fn size_score(diameter: f64) -> f64 {
        const PREFERRED_MIN: f64 = 4.0;
        const PREFERRED_MAX: f64 = 10.0;
        if (PREFERRED_MIN..=PREFERRED_MAX).contains(&diameter) {
            1.0
        } else if diameter < PREFERRED_MIN {
            (diameter / PREFERRED_MIN).max(0.1)
        } else {
            let excess = diameter - PREFERRED_MAX;
            (1.0 / (1.0 + excess / PREFERRED_MAX)).max(0.1)
        }
    }

    /// Blob interior must be brighter than its surrounding annulus.
    fn validate_contrast(&self, frame: &RgbImage, cx: i32, cy: i32, radius: f64) -> bool {
        let gray = |x: i32, y: i32| -> Option<f64> {
            if x < 0 || y < 0 || x >= frame.width() as i32 || y >= frame.height() as i32 {
                return None;
            }
            let [r, g, b] = frame.get_pixel(x as u32, y as u32).0;
            Some(0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64)
        };
        let sample_ring = |radii: &[f64], angles: usize| -> Vec<f64> {
            let mut out = Vec::new();
            for a in 0..angles {
                let theta = a as f64 * 2.0 * std::f64::consts::PI / angles as f64;
                for &r in radii {
                    let x = cx + (r * theta.cos()).round() as i32;
                    let y = cy + (r * theta.sin()).round() as i32;
                    if let Some(v) = gray(x, y) {
                        out.push(v);
                    }
                }
            }
            out
        };

        let inner = sample_ring(&[0.0, radius / 2.0, radius], 8);
        let outer = sample_ring(&[radius + 2.0, radius + 3.5, radius + 5.0], 12);
        if inner.is_empty() || outer.is_empty() {
            return false;
        }
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let surround = mean(&outer);
        if surround < 1.0 {
            // Nearly black surround: anything qualifies.
            return true;
        }
        mean(&inner) / surround >= self.config.min_contrast_ratio
    }

    fn clamp_position(&self, x: i32, y: i32, width: u32, height: u32) -> (i32, i32) {
        let max_x = width as i32 - POSITION_MARGIN - 1;
        let max_y = height as i32 - POSITION_MARGIN - 1;
        (
            x.clamp(POSITION_MARGIN, max_x.max(POSITION_MARGIN)),
            y.clamp(POSITION_MARGIN, max_y.max(POSITION_MARGIN)),
        )
    }

    fn detect_player(&mut self, frame: &RgbImage, hsv: &HsvImage) -> PlayerPosition {
        let mask = self.colour_mask(hsv, self.config.player_hsv_lower, self.config.player_hsv_upper);
        let blobs = self.find_blobs(
            &mask,
            frame,
            hsv,
            self.config.min_blob_size,
            self.config.max_blob_size,
            self.config.min_circularity,
        );
        let Some(best) = blobs.into_iter().max_by(|a, b| {
            let score =
                |blob: &Blob| Self::size_score(blob.diameter) * blob.saturation * blob.value * blob.circularity;
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            self.last_player_pos = None;
            return PlayerPosition::default();
        };

        let (mut cx, mut cy) = self.clamp_position(
            best.center.0,
            best.center.1,
            frame.width(),
            frame.height(),
        );

        if self.config.temporal_smoothing {
            if let Some((px, py)) = self.last_player_pos {
                let a = self.config.smoothing_alpha;
                cx = (a * cx as f64 + (1.0 - a) * px as f64).round() as i32;
                cy = (a * cy as f64 + (1.0 - a) * py as f64).round() as i32;
            }
        }
        self.last_player_pos = Some((cx, cy));

        PlayerPosition {
            detected: true,
            x: cx,
            y: cy,
            confidence: best.circularity,
        }
    }

    fn detect_other_players(&mut self, frame: &RgbImage, hsv: &HsvImage) -> OtherPlayers {
        let mut all = Vec::new();
        for &(lo, hi) in &self.config.other_player_hsv_ranges {
            let mask = self.colour_mask(hsv, lo, hi);
            all.extend(self.find_blobs(
                &mask,
                frame,
                hsv,
                self.config.min_blob_size_other,
                self.config.max_blob_size_other,
                self.config.min_circularity_other,
            ));
        }

        // Dedup: best circularity wins within the distance threshold.
        all.sort_by(|a, b| {
            b.circularity
                .partial_cmp(&a.circularity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut unique: Vec<Blob> = Vec::new();
        for blob in all {
            let duplicate = unique.iter().any(|u| {
                let dx = (blob.center.0 - u.center.0) as f64;
                let dy = (blob.center.1 - u.center.1) as f64;
                (dx * dx + dy * dy).sqrt() < DEDUP_DISTANCE
            });
            if !duplicate {
                unique.push(blob);
            }
        }

        let positions: Vec<Point> = unique
            .iter()
            .map(|b| {
                let (x, y) = self.clamp_position(b.center.0, b.center.1, frame.width(), frame.height());
                Point { x, y }
            })
            .collect();

        OtherPlayers {
            detected: !positions.is_empty(),
            count: positions.len(),
            positions,
        }
    }
}

pub mod testing {
    //! Synthetic-frame helpers shared with integration tests.

    use image::{Rgb, RgbImage};

    /// Black frame with filled discs of the given colours.
    pub fn frame_with_discs(
        width: u32,
        height: u32,
        discs: &[(i32, i32, i32, [u8; 3])],
    ) -> RgbImage {
        let mut img = RgbImage::new(width, height);
        for (cx, cy, radius, colour) in discs {
            for y in (cy - radius).max(0)..=(cy + radius).min(height as i32 - 1) {
                for x in (cx - radius).max(0)..=(cx + radius).min(width as i32 - 1) {
                    let (dx, dy) = (x - cx, y - cy);
                    if dx * dx + dy * dy <= radius * radius {
                        img.put_pixel(x as u32, y as u32, Rgb(*colour));
                    }
                }
            }
        }
        img
    }
}
