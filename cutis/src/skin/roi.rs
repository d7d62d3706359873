//! Polygon rasterization for the region-of-interest mask.

use glam::Vec2;

/// Rasterizes a closed polygon to a per-pixel 0/1 mask using even-odd
/// scanline filling. Pixel centers decide membership.
///
/// Called once per vertex-list change, never per frame.
pub(crate) fn rasterize_polygon(vertices: &[Vec2], width: u32, height: u32) -> Vec<u32> {
    let mut mask = vec![0u32; (width * height) as usize];
    if vertices.len() < 3 {
        return mask;
    }

    let mut intersections: Vec<f32> = Vec::with_capacity(vertices.len());

    for y in 0..height {
        let fy = y as f32 + 0.5;

        intersections.clear();
        for i in 0..vertices.len() {
            let a = vertices[i];
            let b = vertices[(i + 1) % vertices.len()];
            if (a.y <= fy) != (b.y <= fy) {
                let t = (fy - a.y) / (b.y - a.y);
                intersections.push(a.x + t * (b.x - a.x));
            }
        }
        intersections.sort_by(|a, b| a.partial_cmp(b).expect("finite coordinates"));

        for span in intersections.chunks_exact(2) {
            let (x0, x1) = (span[0], span[1]);
            let start = (x0 - 0.5).ceil().max(0.0) as u32;
            let end = ((x1 - 0.5).floor() as i64).min(width as i64 - 1);
            for x in start as i64..=end {
                if x >= 0 {
                    mask[(y * width) as usize + x as usize] = 1;
                }
            }
        }
    }

    mask
}
