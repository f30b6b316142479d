use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::region::ObjectType;

/// Assignment solver strategy.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
pub enum MatchType {
    /// Exact minimum-cost assignment on the square-padded matrix.
    #[default]
    Hungarian,
    /// Maximum matching on the graph of edges below the gating threshold.
    Bipart,
}

/// Motion filter flavor.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
pub enum KalmanType {
    #[default]
    Linear,
    /// Accepted for configuration compatibility; falls back to [`KalmanType::Linear`]
    /// with a warning because the unscented filter is not built into this crate.
    Unscented,
}

/// What the motion filter estimates per track.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
pub enum FilterGoal {
    /// Filter on the region center only; the size follows the measurements.
    Center,
    /// Filter on center and size together.
    #[default]
    Rect,
}

/// What an unassigned track does while it is lost.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
pub enum LostTrackType {
    /// Coast on the motion filter prediction alone.
    None,
    /// Search the new frame for the previous frame's crop of the track and
    /// feed a strong enough match back into the filter as a virtual measurement.
    #[default]
    TrackTemplate,
}

/// One weighted distance term of the cost matrix, in evaluation order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
pub enum DistType {
    Centers,
    Rects,
    Jaccard,
    Hist,
    FeatureCos,
}

/// Number of weighted distance terms.
pub const DIST_TYPE_COUNT: usize = 5;

/// Configuration of one appearance embedding backend.
///
/// Every object type listed in `object_types` routes to the same backend
/// instance once it has been initialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Path to the ONNX model.
    pub model: PathBuf,
    /// Network input size as `(width, height)`.
    pub input_size: (i32, i32),
    /// Name of the output tensor holding the embedding.
    #[serde(default = "embedding_output_name_default")]
    pub output_name: String,
    pub object_types: Vec<ObjectType>,
}

fn embedding_output_name_default() -> String {
    "output0".to_string()
}

/// Tracker configuration. Immutable after the tracker is constructed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub match_type: MatchType,
    /// Post-solve gate: assignments with a cost above this are voided.
    pub dist_threshold: f32,
    /// Non-negative weights indexed by [`DistType`]; zero disables a term.
    pub dist_weights: [f32; DIST_TYPE_COUNT],
    pub kalman_type: KalmanType,
    pub filter_goal: FilterGoal,
    /// Filter time step.
    pub dt: f32,
    /// Process noise magnitude of the filter.
    pub accel_noise_mag: f32,
    /// Extend the filter state with acceleration terms.
    pub use_acceleration: bool,
    /// Retained trace points per track.
    pub max_trace_length: usize,
    /// Frames without association before a track is retired.
    pub maximum_allowed_skipped_frames: usize,
    /// Seconds of near-zero motion before an object counts as abandoned.
    pub min_static_time: f32,
    /// Seconds of near-zero motion before a static track is retired.
    pub max_static_time: f32,
    /// Per-frame displacement below which a frame counts as static.
    pub max_speed_for_static: f32,
    /// Enables static-object detection. The static window spans
    /// `round(min_static_time * fps)` trace points, so `max_trace_length`
    /// must be at least that long for the window to ever fill.
    pub use_abandoned_detection: bool,
    /// Minimum prediction ellipse radius in pixels; negative selects
    /// [`TrackerSettings::min_area_radius_k`] instead.
    pub min_area_radius_pix: f32,
    /// Minimum prediction ellipse radius as a fraction of the region size.
    pub min_area_radius_k: f32,
    pub lost_track_type: LostTrackType,
    pub embeddings: Vec<EmbeddingConfig>,
    /// Distinct object types allowed to continue each other's tracks.
    /// Maintained through [`TrackerSettings::add_near_type`].
    pub near_types: HashMap<ObjectType, HashSet<ObjectType>>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            match_type: MatchType::default(),
            dist_threshold: 0.8,
            dist_weights: [0.25, 0.25, 0.5, 0.0, 0.0],
            kalman_type: KalmanType::default(),
            filter_goal: FilterGoal::default(),
            dt: 0.2,
            accel_noise_mag: 0.1,
            use_acceleration: false,
            max_trace_length: 10,
            maximum_allowed_skipped_frames: 25,
            min_static_time: 5.0,
            max_static_time: 25.0,
            max_speed_for_static: 10.0,
            use_abandoned_detection: false,
            min_area_radius_pix: -1.0,
            min_area_radius_k: 0.8,
            lost_track_type: LostTrackType::default(),
            embeddings: Vec::new(),
            near_types: HashMap::new(),
        }
    }
}

impl TrackerSettings {
    #[inline]
    pub fn dist_weight(&self, dist_type: DistType) -> f32 {
        self.dist_weights[dist_type as usize]
    }

    pub fn set_dist_weight(&mut self, dist_type: DistType, weight: f32) {
        self.dist_weights[dist_type as usize] = weight.max(0.0);
    }

    /// Permits association between two distinct object types.
    pub fn add_near_type(&mut self, a: ObjectType, b: ObjectType, both_directions: bool) {
        self.near_types.entry(a).or_default().insert(b);
        if both_directions {
            self.near_types.entry(b).or_default().insert(a);
        }
    }

    /// Whether a track of type `a` may be continued by a region of type `b`.
    pub fn check_type_compat(&self, a: ObjectType, b: ObjectType) -> bool {
        a == b || self.near_types.get(&a).is_some_and(|near| near.contains(&b))
    }

    /// Trace window, in frames, over which static motion is estimated.
    /// Zero when abandoned-object detection is disabled.
    pub(crate) fn abandoned_window_frames(&self, fps: f32) -> usize {
        if self.use_abandoned_detection {
            (self.min_static_time * fps).round() as usize
        } else {
            0
        }
    }

    /// Consecutive static frames after which a track is retired.
    pub(crate) fn static_timeout_frames(&self, fps: f32) -> usize {
        ((self.max_static_time - self.min_static_time) * fps).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_compat_same_type() {
        let settings = TrackerSettings::default();
        assert!(settings.check_type_compat(ObjectType::Car, ObjectType::Car));
        assert!(!settings.check_type_compat(ObjectType::Car, ObjectType::Truck));
    }

    #[test]
    fn type_compat_near_types() {
        let mut settings = TrackerSettings::default();
        settings.add_near_type(ObjectType::Car, ObjectType::Truck, true);
        assert!(settings.check_type_compat(ObjectType::Car, ObjectType::Truck));
        assert!(settings.check_type_compat(ObjectType::Truck, ObjectType::Car));

        settings.add_near_type(ObjectType::Bicycle, ObjectType::Motorbike, false);
        assert!(settings.check_type_compat(ObjectType::Bicycle, ObjectType::Motorbike));
        assert!(!settings.check_type_compat(ObjectType::Motorbike, ObjectType::Bicycle));
    }

    #[test]
    fn abandoned_window_disabled_by_default() {
        let settings = TrackerSettings::default();
        assert_eq!(settings.abandoned_window_frames(30.0), 0);

        let settings = TrackerSettings {
            use_abandoned_detection: true,
            ..TrackerSettings::default()
        };
        assert_eq!(settings.abandoned_window_frames(30.0), 150);
        assert_eq!(settings.static_timeout_frames(30.0), 600);
    }

    #[test]
    fn serde_round_trip() {
        let mut settings = TrackerSettings {
            match_type: MatchType::Bipart,
            dist_threshold: 0.5,
            embeddings: vec![EmbeddingConfig {
                model: PathBuf::from("person.onnx"),
                input_size: (128, 256),
                output_name: embedding_output_name_default(),
                object_types: vec![ObjectType::Person, ObjectType::Face],
            }],
            ..TrackerSettings::default()
        };
        settings.add_near_type(ObjectType::Car, ObjectType::Bus, true);

        let json = serde_json::to_string(&settings).unwrap();
        let parsed: TrackerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.match_type, MatchType::Bipart);
        assert_eq!(parsed.embeddings, settings.embeddings);
        assert!(parsed.check_type_compat(ObjectType::Bus, ObjectType::Car));
    }
}
