use nalgebra::{Point2, Point3};

pub type TagId = u32;

/// Tag-frame corners of a square tag, in detector winding order
/// (top-left, top-right, bottom-right, bottom-left).
pub fn tag_corners(side_length: f64) -> [Point3<f64>; 4] {
    let h = 0.5 * side_length;
    [
        Point3::new(-h, h, 0.0),
        Point3::new(h, h, 0.0),
        Point3::new(h, -h, 0.0),
        Point3::new(-h, -h, 0.0),
    ]
}

/// Unsigned area of an image quadrilateral (shoelace formula).
pub fn quad_area(corners: &[Point2<f64>; 4]) -> f64 {
    let mut twice = 0.0;
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        twice += a.x * b.y - b.x * a.y;
    }
    0.5 * twice.abs()
}

/// Smallest corner triangle of a quadrilateral relative to its area.
///
/// Each triangle drops one corner. A convex square scores 0.5; three
/// collinear corners score 0 regardless of the image scale.
pub fn corner_spread(corners: &[Point2<f64>; 4]) -> f64 {
    let area = quad_area(corners);
    if !(area > 0.0) {
        return 0.0;
    }
    let mut min = f64::INFINITY;
    for skip in 0..4 {
        let [a, b, c] = [1, 2, 3].map(|k| corners[(skip + k) % 4]);
        let tri = 0.5 * ((b - a).perp(&(c - a))).abs();
        min = min.min(tri);
    }
    min / area
}
