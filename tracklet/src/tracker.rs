use std::sync::Arc;

use log::{debug, warn};
use opencv::core::{Mat, MatTraitConst, Size};
use rayon::prelude::*;

use crate::{
    assignment,
    cost::build_cost_matrix,
    embedding::{EmbeddingBackend, EmbeddingRegistry},
    histogram::region_histogram,
    region::{ObjectType, Region, RegionEmbedding},
    settings::{DistType, KalmanType, LostTrackType, TrackerSettings},
    track::{FrameScope, Track, TrackId},
};

/// Frame-by-frame multi-object tracker.
///
/// Each [`Tracker::update`] assimilates the detections of one frame into the
/// tracked set: continuing tracks are matched through the cost matrix and the
/// assignment solver, unmatched detections are born as new tracks, and tracks
/// that stayed unmatched for too long, left the frame or sat still past the
/// static timeout are retired.
///
/// `update` is not reentrant; callers feed frames one at a time.
#[derive(Debug)]
pub struct Tracker {
    settings: TrackerSettings,
    tracks: Vec<Track>,
    next_track_id: TrackId,
    prev_frame: Mat,
    embeddings: EmbeddingRegistry,
}

impl Tracker {
    pub fn new(settings: TrackerSettings) -> Self {
        if settings.kalman_type == KalmanType::Unscented {
            warn!("unscented Kalman filter is not built in, falling back to the linear filter");
        }
        let embeddings = if settings.dist_weight(DistType::FeatureCos) > 0.0 {
            EmbeddingRegistry::from_configs(&settings.embeddings)
        } else {
            EmbeddingRegistry::default()
        };
        Self {
            settings,
            tracks: Vec::new(),
            next_track_id: TrackId(0),
            prev_frame: Mat::default(),
            embeddings,
        }
    }

    #[inline]
    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// The currently tracked objects.
    #[inline]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Routes `object_types` to a caller-provided appearance backend, in
    /// place of (or in addition to) the backends from the settings.
    pub fn register_embedding_backend(
        &mut self,
        object_types: &[ObjectType],
        backend: Arc<dyn EmbeddingBackend>,
    ) {
        self.embeddings.register(object_types, backend);
    }

    /// Assimilates one frame of detections.
    pub fn update(&mut self, regions: &[Region], curr_frame: &Mat, fps: f32) {
        let frame_size = curr_frame.size().unwrap_or_default();
        let mut region_embeddings = self.extract_embeddings(regions, curr_frame);

        if self.tracks.is_empty() {
            for (j, region) in regions.iter().enumerate() {
                let embedding = region_embeddings.get_mut(j).map(std::mem::take);
                self.spawn_track(region, embedding);
            }
        } else {
            self.assimilate(regions, &mut region_embeddings, curr_frame, frame_size, fps);
        }

        self.prev_frame = curr_frame.clone();
    }

    /// Appearance descriptors for every region, in region order.
    ///
    /// Skipped entirely while no appearance distance carries weight, and per
    /// descriptor while its term is disabled.
    fn extract_embeddings(&self, regions: &[Region], curr_frame: &Mat) -> Vec<RegionEmbedding> {
        let want_hist = self.settings.dist_weight(DistType::Hist) > 0.0;
        let want_embedding =
            self.settings.dist_weight(DistType::FeatureCos) > 0.0 && !self.embeddings.is_empty();
        if !want_hist && !want_embedding {
            return Vec::new();
        }

        regions
            .iter()
            .map(|region| {
                let hist = if want_hist {
                    region_histogram(curr_frame, region.brect()).unwrap_or_else(|err| {
                        debug!("histogram extraction failed: {err}");
                        Vec::new()
                    })
                } else {
                    Vec::new()
                };
                let embedding = if want_embedding {
                    self.embeddings
                        .extract(curr_frame, region.brect(), region.object_type())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                RegionEmbedding::new(hist, embedding)
            })
            .collect()
    }

    fn assimilate(
        &mut self,
        regions: &[Region],
        region_embeddings: &mut [RegionEmbedding],
        curr_frame: &Mat,
        frame_size: Size,
        fps: f32,
    ) {
        let cost = build_cost_matrix(
            &self.tracks,
            regions,
            region_embeddings,
            &self.settings,
            frame_size,
        );
        let mut assignment =
            assignment::solve(self.settings.match_type, &cost, self.settings.dist_threshold);

        // Void solved pairs above the gate; a voided frame counts as skipped,
        // exactly like an unmatched one.
        for (i, slot) in assignment.iter_mut().enumerate() {
            match *slot {
                Some(j) if cost.get(i, j) > self.settings.dist_threshold => {
                    *slot = None;
                    self.tracks[i].mark_skipped();
                }
                Some(_) => {}
                None => self.tracks[i].mark_skipped(),
            }
        }

        // Retire tracks and their assignment slots in lock-step.
        let static_timeout = self.settings.static_timeout_frames(fps);
        let mut i = 0;
        while i < self.tracks.len() {
            let track = &self.tracks[i];
            let retire = track.skipped_frames() > self.settings.maximum_allowed_skipped_frames
                || track.is_out_of_frame(frame_size)
                || (self.settings.use_abandoned_detection
                    && track.is_static_timeout(static_timeout));
            if retire {
                debug!(
                    "track {} retired after {} skipped frames",
                    track.id(),
                    track.skipped_frames()
                );
                self.tracks.remove(i);
                assignment.remove(i);
            } else {
                i += 1;
            }
        }

        // Unclaimed regions start new tracks.
        for (j, region) in regions.iter().enumerate() {
            if !assignment.contains(&Some(j)) {
                let embedding = region_embeddings.get_mut(j).map(std::mem::take);
                self.spawn_track(region, embedding);
            }
        }

        // Update the surviving pre-birth tracks in parallel. Measurements and
        // re-localizations are prepared sequentially so each parallel slot
        // only touches its own track.
        let n_old = assignment.len();
        let scope = FrameScope {
            frame_size,
            max_trace_length: self.settings.max_trace_length,
            abandoned_window_frames: self.settings.abandoned_window_frames(fps),
            max_speed_for_static: self.settings.max_speed_for_static,
        };
        let relocation = self.settings.lost_track_type == LostTrackType::TrackTemplate;
        let jobs: Vec<_> = self.tracks[..n_old]
            .iter()
            .zip(&assignment)
            .map(|(track, slot)| match slot {
                Some(j) => (
                    Some((
                        regions[*j].clone(),
                        region_embeddings.get_mut(*j).map(std::mem::take),
                    )),
                    None,
                ),
                None => (
                    None,
                    relocation
                        .then(|| track.relocate(&self.prev_frame, curr_frame))
                        .flatten(),
                ),
            })
            .collect();
        self.tracks[..n_old]
            .par_iter_mut()
            .zip(jobs)
            .for_each(|(track, (assigned, relocated))| track.update(assigned, relocated, &scope));
    }

    fn spawn_track(&mut self, region: &Region, embedding: Option<RegionEmbedding>) {
        let id = self.next_track_id;
        self.next_track_id = TrackId(id.0 + 1);
        debug!("track {id} born at {:?}", region.brect());
        self.tracks
            .push(Track::new(id, region.clone(), embedding, &self.settings));
    }
}
