use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box.
///
/// The empty envelope is represented with inverted bounds so that
/// `expand_to_include` works without a special first-point case.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn width(&self) -> f64 {
        if self.is_empty() { 0.0 } else { self.max_x - self.min_x }
    }

    pub fn height(&self) -> f64 {
        if self.is_empty() { 0.0 } else { self.max_y - self.min_y }
    }

    pub fn expand_to_include(&mut self, other: &Envelope) {
        if other.is_empty() {
            return;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut result = *self;
        result.expand_to_include(other);
        result
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }
}

/// Opaque geometry carried through the store.
///
/// The wire-level shape encoding lives outside this layer; the bounding
/// box is all the translator and aggregates need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    envelope: Envelope,
}

impl Shape {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Self {
            envelope: Envelope::new(x, y, x, y),
        }
    }

    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            envelope: Envelope::new(min_x, min_y, max_x, max_y),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_envelope() {
        let e = Envelope::empty();
        assert!(e.is_empty());
        assert_eq!(e.width(), 0.0);
        assert_eq!(e.height(), 0.0);
    }

    #[test]
    fn test_union() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(2.0, -1.0, 3.0, 0.5);
        let u = a.union(&b);
        assert_eq!(u, Envelope::new(0.0, -1.0, 3.0, 1.0));
    }

    #[test]
    fn test_union_with_empty_is_identity() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(a.union(&Envelope::empty()), a);

        let mut e = Envelope::empty();
        e.expand_to_include(&a);
        assert_eq!(e, a);
    }

    #[test]
    fn test_intersects() {
        let a = Envelope::new(0.0, 0.0, 2.0, 2.0);
        assert!(a.intersects(&Envelope::new(1.0, 1.0, 3.0, 3.0)));
        assert!(a.intersects(&Envelope::new(2.0, 2.0, 3.0, 3.0))); // touching
        assert!(!a.intersects(&Envelope::new(2.1, 0.0, 3.0, 1.0)));
        assert!(!a.intersects(&Envelope::empty()));
    }

    #[test]
    fn test_point_shape() {
        let s = Shape::point(5.0, -3.0);
        assert_eq!(*s.envelope(), Envelope::new(5.0, -3.0, 5.0, -3.0));
        assert!(!s.envelope().is_empty());
    }
}
