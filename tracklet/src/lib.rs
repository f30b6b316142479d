//! Frame-by-frame multi-object tracking.
//!
//! The tracker maintains a set of tracked objects and assimilates the
//! detections of each new frame into it: a cost matrix fuses geometric and
//! appearance distances between every track and detection, an assignment
//! solver picks the best pairing, and a per-track Kalman filter smooths the
//! surviving tracks. Detections nobody claimed become new tracks; tracks that
//! stay unmatched, leave the frame or sit still for too long are retired.
//!
//! Detection itself is not part of this crate; feed it [`Region`]s from any
//! detector along with the frame they came from.

mod assignment;
mod cost;
mod embedding;
mod histogram;
mod kalman_filter;
mod region;
mod settings;
mod track;
mod tracker;

pub use {
    assignment::CostMatrix,
    embedding::{EmbeddingBackend, EmbeddingRegistry, OrtEmbedding},
    histogram::region_histogram,
    kalman_filter::MotionFilter,
    region::{ObjectType, RRect, Region, RegionEmbedding},
    settings::{
        DIST_TYPE_COUNT, DistType, EmbeddingConfig, FilterGoal, KalmanType, LostTrackType,
        MatchType, TrackerSettings,
    },
    track::{Track, TrackId},
    tracker::Tracker,
};
