use opencv::core::{Point2f, Rect, Size2f};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Class tag of a detected object.
///
/// Multiple tags may share one appearance backend; compatibility between
/// tags during association is configured through
/// [`TrackerSettings::add_near_type`](crate::TrackerSettings::add_near_type).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum ObjectType {
    #[default]
    Unknown,
    Person,
    Face,
    Car,
    Bus,
    Truck,
    Bicycle,
    Motorbike,
    Cat,
    Dog,
}

/// An oriented rectangle: center, full size and rotation angle in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RRect {
    pub center: Point2f,
    pub size: Size2f,
    pub angle: f32,
}

impl RRect {
    /// Unit-normalized radial distance of `point` from the ellipse
    /// inscribed in this rectangle. Values `<= 1` are inside.
    pub fn radial_distance(&self, point: Point2f) -> f32 {
        let (sin, cos) = self.angle.to_radians().sin_cos();
        let dx = point.x - self.center.x;
        let dy = point.y - self.center.y;
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        let a = (self.size.width / 2.0).max(f32::EPSILON);
        let b = (self.size.height / 2.0).max(f32::EPSILON);
        ((u / a) * (u / a) + (v / b) * (v / b)).sqrt()
    }
}

impl From<Rect> for RRect {
    fn from(brect: Rect) -> Self {
        Self {
            center: Point2f::new(
                brect.x as f32 + brect.width as f32 / 2.0,
                brect.y as f32 + brect.height as f32 / 2.0,
            ),
            size: Size2f::new(brect.width as f32, brect.height as f32),
            angle: 0.0,
        }
    }
}

/// One detection inside one frame. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct Region {
    brect: Rect,
    rrect: RRect,
    object_type: ObjectType,
    confidence: f32,
}

impl Region {
    pub fn new(brect: Rect, object_type: ObjectType, confidence: f32) -> Self {
        Self {
            brect,
            rrect: RRect::from(brect),
            object_type,
            confidence,
        }
    }

    #[inline]
    pub fn brect(&self) -> Rect {
        self.brect
    }

    #[inline]
    pub fn rrect(&self) -> RRect {
        self.rrect
    }

    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    #[inline]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Appearance descriptors of one region in one frame.
///
/// Built by the extractors, consumed by the cost matrix and moved into
/// the track the region was assigned to. Either descriptor may be empty
/// when the matching distance term is disabled or no backend covers the
/// region's type.
#[derive(Clone, Debug, Default)]
pub struct RegionEmbedding {
    hist: Vec<f32>,
    embedding: Vec<f32>,
    embedding_dot: f32,
}

impl RegionEmbedding {
    pub fn new(hist: Vec<f32>, embedding: Vec<f32>) -> Self {
        let embedding_dot = dot(&embedding, &embedding);
        Self {
            hist,
            embedding,
            embedding_dot,
        }
    }

    #[inline]
    pub fn hist(&self) -> &[f32] {
        &self.hist
    }

    #[inline]
    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    /// Cached `<v, v>` of the embedding, the cosine denominator half.
    #[inline]
    pub fn embedding_dot(&self) -> f32 {
        self.embedding_dot
    }

    #[inline]
    pub fn has_hist(&self) -> bool {
        !self.hist.is_empty()
    }

    #[inline]
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<f32>, Vec<f32>, f32) {
        (self.hist, self.embedding, self.embedding_dot)
    }
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrect_derived_from_brect() {
        let region = Region::new(Rect::new(10, 20, 30, 40), ObjectType::Car, 0.9);
        let rrect = region.rrect();
        assert_eq!(rrect.center, Point2f::new(25.0, 40.0));
        assert_eq!(rrect.size, Size2f::new(30.0, 40.0));
        assert_eq!(rrect.angle, 0.0);
    }

    #[test]
    fn radial_distance_inside_and_outside() {
        let rrect = RRect {
            center: Point2f::new(0.0, 0.0),
            size: Size2f::new(20.0, 10.0),
            angle: 0.0,
        };
        assert!(rrect.radial_distance(Point2f::new(0.0, 0.0)) < f32::EPSILON);
        assert!((rrect.radial_distance(Point2f::new(10.0, 0.0)) - 1.0).abs() < 1e-5);
        assert!(rrect.radial_distance(Point2f::new(0.0, 10.0)) > 1.0);
    }

    #[test]
    fn radial_distance_follows_rotation() {
        let rrect = RRect {
            center: Point2f::new(0.0, 0.0),
            size: Size2f::new(20.0, 4.0),
            angle: 90.0,
        };
        // Major axis now points along y.
        assert!(rrect.radial_distance(Point2f::new(0.0, 9.0)) < 1.0);
        assert!(rrect.radial_distance(Point2f::new(9.0, 0.0)) > 1.0);
    }

    #[test]
    fn embedding_dot_cached() {
        let re = RegionEmbedding::new(Vec::new(), vec![1.0, 2.0, 2.0]);
        assert_eq!(re.embedding_dot(), 9.0);
        assert!(!re.has_hist());
        assert!(re.has_embedding());
    }
}
