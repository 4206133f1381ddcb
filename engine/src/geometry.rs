/// Axis-aligned box in frame-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + 0.5 * self.width as f64,
            self.y as f64 + 0.5 * self.height as f64,
        )
    }

    /// Edges are inclusive.
    pub fn contains_point(&self, (px, py): (f64, f64)) -> bool {
        px >= self.x as f64
            && px <= self.right() as f64
            && py >= self.y as f64
            && py <= self.bottom() as f64
    }

    /// True when each box contains the other's center.
    pub fn mutually_contains(&self, other: &BoundingBox) -> bool {
        self.contains_point(other.center()) && other.contains_point(self.center())
    }

    pub fn center_distance_sq(&self, other: &BoundingBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        (ax - bx).powi(2) + (ay - by).powi(2)
    }

    /// Top edge above `row` and bottom edge below it (both strict).
    pub fn straddles_row(&self, row: u32) -> bool {
        self.y < row && self.bottom() > row
    }

    /// Whole box strictly below `row`.
    pub fn is_past_row(&self, row: u32) -> bool {
        self.y > row
    }

    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with a `width` x `height` frame, or `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let clamped = BoundingBox {
            x: self.x,
            y: self.y,
            width: self.right().min(width) - self.x,
            height: self.bottom().min(height) - self.y,
        };
        (!clamped.is_degenerate()).then_some(clamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_is_midpoint() {
        assert_eq!(BoundingBox::new(10, 20, 30, 40).center(), (25.0, 40.0));
    }

    #[test]
    fn containment_includes_edges() {
        let b = BoundingBox::new(0, 0, 10, 10);
        assert!(b.contains_point((10.0, 10.0)));
        assert!(b.contains_point((0.0, 5.0)));
        assert!(!b.contains_point((10.5, 5.0)));
    }

    #[test]
    fn mutual_containment_tolerates_size_drift() {
        let tracked = BoundingBox::new(100, 100, 50, 50);
        let detected = BoundingBox::new(95, 105, 70, 40);
        assert!(tracked.mutually_contains(&detected));
        assert!(detected.mutually_contains(&tracked));
    }

    #[test]
    fn containment_must_hold_both_ways() {
        // Small box sits inside the big one, but the big one's center is
        // outside the small box.
        let big = BoundingBox::new(0, 0, 100, 100);
        let small = BoundingBox::new(5, 5, 10, 10);
        assert!(big.contains_point(small.center()));
        assert!(!big.mutually_contains(&small));
    }

    #[test]
    fn straddle_and_past_are_strict() {
        let line = 250;
        assert!(BoundingBox::new(0, 240, 10, 20).straddles_row(line));
        assert!(!BoundingBox::new(0, 250, 10, 20).straddles_row(line));
        assert!(!BoundingBox::new(0, 230, 10, 20).straddles_row(line));
        assert!(!BoundingBox::new(0, 250, 10, 20).is_past_row(line));
        assert!(BoundingBox::new(0, 251, 10, 20).is_past_row(line));
    }

    #[test]
    fn clamp_trims_overhang() {
        let b = BoundingBox::new(600, 460, 80, 40);
        assert_eq!(b.clamp_to(640, 480), Some(BoundingBox::new(600, 460, 40, 20)));
    }

    #[test]
    fn clamp_outside_or_empty_is_none() {
        assert_eq!(BoundingBox::new(640, 0, 10, 10).clamp_to(640, 480), None);
        assert_eq!(BoundingBox::new(10, 10, 0, 10).clamp_to(640, 480), None);
    }
}
