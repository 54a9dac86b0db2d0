//! Zone masks
//!
//! A zone is a polygon in percent coordinates. For the detector it becomes
//! an alpha PNG at frame resolution: pixels inside the polygon are opaque,
//! the rest transparent. `to_abs` is a one-shot percent-to-pixel
//! conversion; `create_mask` is pure.

use std::path::Path;

use image::{GrayAlphaImage, LumaA};

use crate::error::{Error, Result};

/// Point in `[x, y]` order.
pub type Point = [i64; 2];

/// Polygon as a list of points.
pub type Polygon = Vec<Point>;

/// Convert a percent polygon to absolute pixels for a `w`x`h` frame.
pub fn to_abs(polygon: &Polygon, w: u32, h: u32) -> Polygon {
    polygon
        .iter()
        .map(|point| {
            [
                (f64::from(w) * (point[0] as f64 / 100.0)) as i64,
                (f64::from(h) * (point[1] as f64 / 100.0)) as i64,
            ]
        })
        .collect()
}

/// Standard ray-cast point-in-polygon test.
pub fn inside_polygon(x: i64, y: i64, polygon: &Polygon) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i][0], polygon[i][1]);
        let (xj, yj) = (polygon[j][0], polygon[j][1]);
        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Build the alpha mask: for every `(x, y)` in `[0,w)x[0,h)`, opaque iff
/// inside the polygon.
pub fn create_mask(w: u32, h: u32, polygon: &Polygon) -> GrayAlphaImage {
    let mut img = GrayAlphaImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let alpha = if inside_polygon(i64::from(x), i64::from(y), polygon) {
                255
            } else {
                0
            };
            img.put_pixel(x, y, LumaA([255, alpha]));
        }
    }
    img
}

/// Write a mask PNG, replacing any previous file.
pub fn save_mask(path: &Path, mask: &GrayAlphaImage) -> Result<()> {
    let _ = std::fs::remove_file(path);
    mask.save(path)
        .map_err(|e| Error::Resource(format!("save mask {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_abs_is_one_shot() {
        let polygon: Polygon = vec![[0, 0], [100, 0], [100, 100], [0, 100]];
        let abs = to_abs(&polygon, 640, 480);
        assert_eq!(abs, vec![[0, 0], [640, 0], [640, 480], [0, 480]]);
    }

    #[test]
    fn test_inside_polygon() {
        // Square covering the middle of a 100x100 frame.
        let square: Polygon = vec![[25, 25], [75, 25], [75, 75], [25, 75]];
        assert!(inside_polygon(50, 50, &square));
        assert!(!inside_polygon(10, 50, &square));
        assert!(!inside_polygon(50, 90, &square));
        assert!(!inside_polygon(90, 10, &square));
    }

    #[test]
    fn test_create_mask_axis_orientation() {
        // A rectangle wide in x, thin in y: 0<=x<80, 0<=y<20 (percent of
        // a 100x50 frame => x<80, y<10 in pixels).
        let polygon = to_abs(&vec![[0, 0], [80, 0], [80, 20], [0, 20]], 100, 50);
        let mask = create_mask(100, 50, &polygon);

        assert_eq!(mask.width(), 100);
        assert_eq!(mask.height(), 50);
        // A point wide in x but shallow in y must be inside; the transposed
        // point must not. This pins the fill orientation.
        assert_eq!(mask.get_pixel(60, 5)[1], 255);
        assert_eq!(mask.get_pixel(5, 40)[1], 0);
    }

    #[test]
    fn test_create_mask_is_pure() {
        let polygon = to_abs(&vec![[10, 10], [90, 10], [50, 90]], 64, 64);
        let a = create_mask(64, 64, &polygon);
        let b = create_mask(64, 64, &polygon);
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_save_mask() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("zone0.png");
        let polygon = to_abs(&vec![[0, 0], [100, 0], [50, 100]], 32, 32);
        save_mask(&path, &create_mask(32, 32, &polygon)).unwrap();
        assert!(path.exists());
        // Overwrite succeeds.
        save_mask(&path, &create_mask(32, 32, &polygon)).unwrap();
    }
}
