//! Pixel-level operations for the minimap detector: HSV conversion,
//! colour-range masking, square-kernel morphology, and external-contour
//! extraction with area/perimeter/centroid measurements.
//!
//! Hue uses the 0..=179 convention so stored colour ranges are directly
//! comparable to the calibration tooling's values.

use image::RgbImage;

/// HSV planes of an RGB image, row-major `[h, s, v]` triples.
pub struct HsvImage {
    pub width: u32,
    pub height: u32,
    data: Vec<[u8; 3]>,
}

impl HsvImage {
    #[inline]
    pub fn at(&self, x: u32, y: u32) -> [u8; 3] {
        self.data[(y * self.width + x) as usize]
    }
}

/// Convert one RGB pixel to HSV with H in 0..=179.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = v - min;

    let s = if v > 0.0 { delta * 255.0 / v } else { 0.0 };
    let mut h = if delta == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / delta
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }
    [(h / 2.0).round().min(179.0) as u8, s.round() as u8, v.round() as u8]
}

pub fn to_hsv(img: &RgbImage) -> HsvImage {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity((width * height) as usize);
    for pixel in img.pixels() {
        let [r, g, b] = pixel.0;
        data.push(rgb_to_hsv(r, g, b));
    }
    HsvImage {
        width,
        height,
        data,
    }
}

/// Binary mask, one byte per pixel (0 or 255).
#[derive(Clone)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Mask {
    pub fn new(width: u32, height: u32) -> Self {
        Mask {
            width,
            height,
            data: vec![0; (width * height) as usize],
        }
    }

    #[inline]
    pub fn get(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return false;
        }
        self.data[(y as u32 * self.width + x as u32) as usize] != 0
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        self.data[(y * self.width + x) as usize] = if on { 255 } else { 0 };
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&b| b != 0).count()
    }

    /// Union in place.
    pub fn or_with(&mut self, other: &Mask) {
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            if *b != 0 {
                *a = 255;
            }
        }
    }
}

/// Inclusive HSV range test.
pub fn in_range(hsv: &HsvImage, lo: [u8; 3], hi: [u8; 3]) -> Mask {
    let mut mask = Mask::new(hsv.width, hsv.height);
    for y in 0..hsv.height {
        for x in 0..hsv.width {
            let [h, s, v] = hsv.at(x, y);
            let on = h >= lo[0] && h <= hi[0] && s >= lo[1] && s <= hi[1] && v >= lo[2] && v <= hi[2];
            mask.set(x, y, on);
        }
    }
    mask
}

/// Square-kernel offsets for a k×k kernel anchored at (1, 1).
fn kernel_offsets(k: i64) -> Vec<(i64, i64)> {
    let lo = -1i64;
    let hi = k - 1; // exclusive upper bound offset + 1
    let mut out = Vec::with_capacity((k * k) as usize);
    for dy in lo..hi {
        for dx in lo..hi {
            out.push((dx, dy));
        }
    }
    out
}

/// Erosion: out-of-bounds counts as foreground so blobs touching the border
/// are not eaten.
pub fn erode(mask: &Mask, k: i64) -> Mask {
    let offs = kernel_offsets(k);
    let mut out = Mask::new(mask.width, mask.height);
    for y in 0..mask.height as i64 {
        for x in 0..mask.width as i64 {
            let keep = offs.iter().all(|&(dx, dy)| {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= mask.width as i64 || ny >= mask.height as i64 {
                    true
                } else {
                    mask.get(nx, ny)
                }
            });
            out.set(x as u32, y as u32, keep);
        }
    }
    out
}

/// Dilation: out-of-bounds counts as background.
pub fn dilate(mask: &Mask, k: i64) -> Mask {
    let offs = kernel_offsets(k);
    let mut out = Mask::new(mask.width, mask.height);
    for y in 0..mask.height as i64 {
        for x in 0..mask.width as i64 {
            let hit = offs.iter().any(|&(dx, dy)| mask.get(x - dx, y - dy));
            out.set(x as u32, y as u32, hit);
        }
    }
    out
}

/// Open (erode then dilate): removes speckle noise.
pub fn morph_open(mask: &Mask, k: i64) -> Mask {
    dilate(&erode(mask, k), k)
}

/// Close (dilate then erode): fills pinholes.
pub fn morph_close(mask: &Mask, k: i64) -> Mask {
    erode(&dilate(mask, k), k)
}

/// One external contour with its measurements.
#[derive(Debug, Clone)]
pub struct Contour {
    /// Enclosed polygon area of the outer boundary (shoelace).
    pub area: f64,
    /// Closed boundary length.
    pub perimeter: f64,
    /// Pixel-mass centroid of the component.
    pub centroid: (f64, f64),
    /// Bounding rectangle (x, y, w, h).
    pub bbox: (u32, u32, u32, u32),
    /// Component pixel count.
    pub pixel_count: usize,
}

/// Moore-neighbour boundary trace, clockwise, 8-connectivity. `start` must
/// be the topmost-leftmost pixel of its component.
fn trace_boundary(mask: &Mask, start: (i64, i64)) -> Vec<(i64, i64)> {
    // Clockwise from West (y grows downward).
    const NBRS: [(i64, i64); 8] = [
        (-1, 0),
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
    ];
    let mut contour = vec![start];
    let mut cur = start;
    let mut backtrack = (start.0 - 1, start.1);
    let max_steps = (mask.width as usize * mask.height as usize) * 4 + 8;

    while contour.len() <= max_steps {
        let bidx = NBRS
            .iter()
            .position(|&(dx, dy)| (cur.0 + dx, cur.1 + dy) == backtrack)
            .unwrap_or(0);
        let mut advanced = false;
        for step in 1..=8 {
            let idx = (bidx + step) % 8;
            let cand = (cur.0 + NBRS[idx].0, cur.1 + NBRS[idx].1);
            if mask.get(cand.0, cand.1) {
                let prev = (bidx + step - 1) % 8;
                let new_backtrack = (cur.0 + NBRS[prev].0, cur.1 + NBRS[prev].1);
                if cand == start {
                    return contour;
                }
                contour.push(cand);
                backtrack = new_backtrack;
                cur = cand;
                advanced = true;
                break;
            }
        }
        if !advanced {
            // Isolated pixel.
            break;
        }
    }
    contour
}

fn shoelace(points: &[(i64, i64)]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0i64;
    for i in 0..points.len() {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % points.len()];
        sum += x0 * y1 - x1 * y0;
    }
    (sum.abs() as f64) / 2.0
}

fn boundary_length(points: &[(i64, i64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..points.len() {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % points.len()];
        let (dx, dy) = ((x1 - x0).abs(), (y1 - y0).abs());
        total += if dx + dy == 2 {
            std::f64::consts::SQRT_2
        } else {
            (dx + dy) as f64
        };
    }
    total
}

/// External contours of every 8-connected component, in scan order.
pub fn find_external_contours(mask: &Mask) -> Vec<Contour> {
    let (w, h) = (mask.width as i64, mask.height as i64);
    let mut visited = vec![false; (mask.width * mask.height) as usize];
    let idx = |x: i64, y: i64| (y as u32 * mask.width + x as u32) as usize;
    let mut contours = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if !mask.get(x, y) || visited[idx(x, y)] {
                continue;
            }

            // Flood-fill the component for mass statistics.
            let mut stack = vec![(x, y)];
            visited[idx(x, y)] = true;
            let mut pixel_count = 0usize;
            let (mut sum_x, mut sum_y) = (0f64, 0f64);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (x, y, x, y);
            while let Some((px, py)) = stack.pop() {
                pixel_count += 1;
                sum_x += px as f64;
                sum_y += py as f64;
                min_x = min_x.min(px);
                min_y = min_y.min(py);
                max_x = max_x.max(px);
                max_y = max_y.max(py);
                for dy in -1..=1i64 {
                    for dx in -1..=1i64 {
                        let (nx, ny) = (px + dx, py + dy);
                        if mask.get(nx, ny) && !visited[idx(nx, ny)] {
                            visited[idx(nx, ny)] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            let boundary = trace_boundary(mask, (x, y));
            contours.push(Contour {
                area: shoelace(&boundary),
                perimeter: boundary_length(&boundary),
                centroid: (sum_x / pixel_count as f64, sum_y / pixel_count as f64),
                bbox: (
                    min_x as u32,
                    min_y as u32,
                    (max_x - min_x + 1) as u32,
                    (max_y - min_y + 1) as u32,
                ),
                pixel_count,
            });
        }
    }
    contours
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(side: u32, size: u32) -> Mask {
        let mut m = Mask::new(side, side);
        let off = (side - size) / 2;
        for y in 0..size {
            for x in 0..size {
                m.set(off + x, off + y, true);
            }
        }
        m
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(rgb_to_hsv(255, 0, 0), [0, 255, 255]); // red
        assert_eq!(rgb_to_hsv(0, 255, 0), [60, 255, 255]); // green
        assert_eq!(rgb_to_hsv(0, 0, 255), [120, 255, 255]); // blue
        assert_eq!(rgb_to_hsv(255, 255, 0), [30, 255, 255]); // yellow
        assert_eq!(rgb_to_hsv(0, 0, 0), [0, 0, 0]);
        assert_eq!(rgb_to_hsv(255, 255, 255)[1], 0); // white has no saturation
    }

    #[test]
    fn in_range_masks_the_expected_pixels() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, image::Rgb([255, 255, 0]));
        img.put_pixel(1, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(2, 0, image::Rgb([0, 0, 0]));
        let hsv = to_hsv(&img);
        let mask = in_range(&hsv, [20, 180, 180], [40, 255, 255]);
        assert!(mask.get(0, 0));
        assert!(!mask.get(1, 0));
        assert!(!mask.get(2, 0));
    }

    #[test]
    fn open_removes_speckles_keeps_blobs() {
        let mut m = square_mask(20, 8);
        m.set(1, 1, true); // lone speckle
        let opened = morph_open(&m, 4);
        assert!(!opened.get(1, 1));
        // Blob centre survives.
        assert!(opened.get(10, 10));
    }

    #[test]
    fn close_fills_pinholes() {
        let mut m = square_mask(20, 8);
        let centre = 10u32;
        m.set(centre, centre, false);
        let closed = morph_close(&m, 4);
        assert!(closed.get(centre as i64, centre as i64));
    }

    #[test]
    fn square_contour_measurements() {
        let m = square_mask(20, 6);
        let contours = find_external_contours(&m);
        assert_eq!(contours.len(), 1);
        let c = &contours[0];
        assert_eq!(c.pixel_count, 36);
        assert_eq!(c.bbox.2, 6);
        assert_eq!(c.bbox.3, 6);
        // Boundary polygon of a 6×6 block is a 5×5 square of pixel centres.
        assert!((c.area - 25.0).abs() < 1e-9);
        assert!((c.perimeter - 20.0).abs() < 1e-9);
        // Centroid at the block centre.
        assert!((c.centroid.0 - 9.5).abs() < 1e-9);
        assert!((c.centroid.1 - 9.5).abs() < 1e-9);
    }

    #[test]
    fn two_components_two_contours() {
        let mut m = Mask::new(30, 10);
        for y in 2..5 {
            for x in 2..5 {
                m.set(x, y, true);
            }
        }
        for y in 2..5 {
            for x in 20..24 {
                m.set(x, y, true);
            }
        }
        let contours = find_external_contours(&m);
        assert_eq!(contours.len(), 2);
    }

    #[test]
    fn single_pixel_has_zero_area_and_perimeter() {
        let mut m = Mask::new(5, 5);
        m.set(2, 2, true);
        let contours = find_external_contours(&m);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].area, 0.0);
        assert_eq!(contours[0].perimeter, 0.0);
    }
}
