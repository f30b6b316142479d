use std::fmt;

use log::debug;
use opencv::{
    core::{Mat, MatTraitConst, Point, Point2f, Rect, Size, Size2f, min_max_loc, no_array},
    imgproc::{TM_CCOEFF_NORMED, match_template},
};

use crate::{
    kalman_filter::MotionFilter,
    region::{Region, RegionEmbedding, RRect, dot},
    settings::TrackerSettings,
};

/// Blend factor folding a freshly extracted histogram into the stored one.
const HIST_EMA_ALPHA: f32 = 0.25;
/// Blend factor folding a freshly extracted embedding into the stored one.
const EMBEDDING_EMA_ALPHA: f32 = 0.1;
/// Minimum normalized correlation for template re-localization to count.
const RELOCATE_SCORE_THRESHOLD: f64 = 0.75;

/// Stable identity of one track.
///
/// Monotonic per tracker instance, starting at 0; a retired id is never
/// reissued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-frame parameters shared by every track update.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameScope {
    pub frame_size: Size,
    pub max_trace_length: usize,
    pub abandoned_window_frames: usize,
    pub max_speed_for_static: f32,
}

/// One tracked identity accumulating regions over time.
#[derive(Clone, Debug)]
pub struct Track {
    id: TrackId,
    filter: MotionFilter,
    last_region: Region,
    trace: Vec<Point2f>,
    skipped_frames: usize,
    static_frames: usize,
    stored_hist: Vec<f32>,
    stored_embedding: Vec<f32>,
    stored_embedding_dot: f32,
}

impl Track {
    pub(crate) fn new(
        id: TrackId,
        region: Region,
        embedding: Option<RegionEmbedding>,
        settings: &TrackerSettings,
    ) -> Self {
        let filter = MotionFilter::new(settings, region.brect());
        let (stored_hist, stored_embedding, stored_embedding_dot) =
            embedding.map(RegionEmbedding::into_parts).unwrap_or_default();
        let trace = vec![region.rrect().center];
        Self {
            id,
            filter,
            last_region: region,
            trace,
            skipped_frames: 0,
            static_frames: 0,
            stored_hist,
            stored_embedding,
            stored_embedding_dot,
        }
    }

    #[inline]
    pub fn id(&self) -> TrackId {
        self.id
    }

    /// The smoothed region emitted on the last update.
    #[inline]
    pub fn last_region(&self) -> &Region {
        &self.last_region
    }

    /// Past smoothed centers, oldest first.
    #[inline]
    pub fn trace(&self) -> &[Point2f] {
        &self.trace
    }

    #[inline]
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    #[inline]
    pub fn static_frames(&self) -> usize {
        self.static_frames
    }

    #[inline]
    pub fn object_type(&self) -> crate::region::ObjectType {
        self.last_region.object_type()
    }

    #[inline]
    pub fn stored_hist(&self) -> &[f32] {
        &self.stored_hist
    }

    #[inline]
    pub fn stored_embedding(&self) -> &[f32] {
        &self.stored_embedding
    }

    pub(crate) fn mark_skipped(&mut self) {
        self.skipped_frames += 1;
    }

    pub(crate) fn calc_prediction_ellipse(&self, min_radius: Size2f) -> RRect {
        self.filter.prediction_ellipse(min_radius)
    }

    /// Unit-normalized radial distance of `point` from the gating ellipse;
    /// `<= 1` is inside.
    pub(crate) fn is_inside_area(&self, point: Point2f, ellipse: &RRect) -> f32 {
        ellipse.radial_distance(point)
    }

    /// Center displacement normalized by the last region's diagonal.
    pub fn dist_center(&self, region: &Region) -> f32 {
        let a = self.last_region.rrect().center;
        let b = region.rrect().center;
        let size = self.last_region.rrect().size;
        let diag = (size.width * size.width + size.height * size.height).sqrt();
        let d = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();
        (d / diag.max(f32::EPSILON)).min(1.0)
    }

    /// Mean relative width/height mismatch.
    pub fn dist_rect(&self, region: &Region) -> f32 {
        let a = self.last_region.rrect().size;
        let b = region.rrect().size;
        1.0 - (size_similarity(a.width, b.width) + size_similarity(a.height, b.height)) / 2.0
    }

    /// `1 - IoU` of the bounding rectangles.
    pub fn dist_jaccard(&self, region: &Region) -> f32 {
        1.0 - iou(self.last_region.brect(), region.brect())
    }

    /// Bhattacharyya distance between the stored histogram and the
    /// candidate's. `None` when either histogram is empty.
    pub fn dist_hist(&self, embedding: &RegionEmbedding) -> Option<f32> {
        if self.stored_hist.is_empty() || !embedding.has_hist() {
            return None;
        }
        if self.stored_hist.len() != embedding.hist().len() {
            debug_assert!(false, "histogram dimension changed between frames");
            return None;
        }
        Some(bhattacharyya(&self.stored_hist, embedding.hist()))
    }

    /// Cosine distance between the stored embedding and the candidate's.
    /// `None` when either embedding is empty.
    pub fn dist_cosine(&self, embedding: &RegionEmbedding) -> Option<f32> {
        if self.stored_embedding.is_empty() || !embedding.has_embedding() {
            return None;
        }
        if self.stored_embedding.len() != embedding.embedding().len() {
            debug_assert!(false, "embedding dimension changed between frames");
            return None;
        }
        let denom = (self.stored_embedding_dot * embedding.embedding_dot()).sqrt();
        if denom <= f32::EPSILON {
            return None;
        }
        let sim = dot(&self.stored_embedding, embedding.embedding()) / denom;
        Some((1.0 - sim).clamp(0.0, 1.0))
    }

    /// Whether the smoothed region lies entirely outside the frame.
    pub fn is_out_of_frame(&self, frame_size: Size) -> bool {
        let r = self.last_region.brect();
        r.x + r.width <= 0
            || r.y + r.height <= 0
            || r.x >= frame_size.width
            || r.y >= frame_size.height
    }

    /// Whether the track has shown near-zero motion for at least
    /// `window_frames` consecutive frames.
    pub fn is_static_timeout(&self, window_frames: usize) -> bool {
        window_frames > 0 && self.static_frames >= window_frames
    }

    /// Searches `curr_frame` for the previous frame's crop of this track.
    ///
    /// Returns the matched rectangle when the normalized correlation peak is
    /// strong enough to serve as a virtual measurement.
    pub(crate) fn relocate(&self, prev_frame: &Mat, curr_frame: &Mat) -> Option<Rect> {
        let prev_size = prev_frame.size().ok()?;
        if prev_size.width == 0 || prev_size.height == 0 {
            return None;
        }
        let curr_size = curr_frame.size().ok()?;
        let templ_rect = clamp_to_frame(self.last_region.brect(), prev_size);
        if templ_rect.width < 2 || templ_rect.height < 2 {
            return None;
        }
        let search_rect = clamp_to_frame(
            Rect::new(
                templ_rect.x - templ_rect.width / 2,
                templ_rect.y - templ_rect.height / 2,
                templ_rect.width * 2,
                templ_rect.height * 2,
            ),
            curr_size,
        );
        if search_rect.width < templ_rect.width || search_rect.height < templ_rect.height {
            return None;
        }

        let templ = prev_frame.roi(templ_rect).ok()?;
        let search = curr_frame.roi(search_rect).ok()?;
        let mut result = Mat::default();
        if let Err(err) = match_template(&search, &templ, &mut result, TM_CCOEFF_NORMED, &no_array())
        {
            debug!("template relocation failed for track {}: {err}", self.id);
            return None;
        }

        let mut score = 0f64;
        let mut loc = Point::default();
        min_max_loc(
            &result,
            None,
            Some(&mut score),
            None,
            Some(&mut loc),
            &no_array(),
        )
        .ok()?;
        // Flat patches produce non-finite correlation scores.
        if !score.is_finite() || score < RELOCATE_SCORE_THRESHOLD {
            return None;
        }
        Some(Rect::new(
            search_rect.x + loc.x,
            search_rect.y + loc.y,
            templ_rect.width,
            templ_rect.height,
        ))
    }

    /// Advances the track by one frame.
    ///
    /// With an assigned region the filter ingests it as a measurement and the
    /// appearance descriptors are folded into the stored ones; without one the
    /// track coasts on its prediction, optionally corrected by a re-localized
    /// `relocated` rectangle. The smoothed center is appended to the trace.
    pub(crate) fn update(
        &mut self,
        assigned: Option<(Region, Option<RegionEmbedding>)>,
        relocated: Option<Rect>,
        scope: &FrameScope,
    ) {
        self.filter.predict();
        match assigned {
            Some((region, embedding)) => {
                self.filter.update(region.brect());
                self.skipped_frames = 0;
                if let Some(embedding) = embedding {
                    self.merge_embedding(embedding);
                }
                self.last_region = Region::new(
                    self.filter.last_rect(),
                    region.object_type(),
                    region.confidence(),
                );
            }
            None => {
                match relocated {
                    Some(rect) => self.filter.update(rect),
                    None => self.filter.update_skipped(),
                }
                self.last_region = Region::new(
                    self.filter.last_rect(),
                    self.last_region.object_type(),
                    self.last_region.confidence(),
                );
            }
        }

        self.trace.push(self.last_region.rrect().center);
        if self.trace.len() > scope.max_trace_length {
            let excess = self.trace.len() - scope.max_trace_length;
            self.trace.drain(..excess);
        }
        self.refresh_static(scope);
    }

    fn merge_embedding(&mut self, embedding: RegionEmbedding) {
        let (hist, embedding, _) = embedding.into_parts();
        if !hist.is_empty() {
            if self.stored_hist.is_empty() {
                self.stored_hist = hist;
            } else if self.stored_hist.len() == hist.len() {
                for (stored, new) in self.stored_hist.iter_mut().zip(&hist) {
                    *stored = (1.0 - HIST_EMA_ALPHA) * *stored + HIST_EMA_ALPHA * new;
                }
            } else {
                debug_assert!(false, "histogram dimension changed between frames");
            }
        }
        if !embedding.is_empty() {
            if self.stored_embedding.is_empty() {
                self.stored_embedding = embedding;
            } else if self.stored_embedding.len() == embedding.len() {
                for (stored, new) in self.stored_embedding.iter_mut().zip(&embedding) {
                    *stored = (1.0 - EMBEDDING_EMA_ALPHA) * *stored + EMBEDDING_EMA_ALPHA * new;
                }
            } else {
                debug_assert!(false, "embedding dimension changed between frames");
            }
            self.stored_embedding_dot = dot(&self.stored_embedding, &self.stored_embedding);
        }
    }

    fn refresh_static(&mut self, scope: &FrameScope) {
        let window = scope.abandoned_window_frames;
        if window < 2 || self.trace.len() < window {
            self.static_frames = 0;
            return;
        }
        let (kx, ky) = lin_regress(&self.trace[self.trace.len() - window..]);
        if kx.abs() < scope.max_speed_for_static && ky.abs() < scope.max_speed_for_static {
            self.static_frames += 1;
        } else {
            self.static_frames = 0;
        }
    }
}

#[inline]
fn size_similarity(a: f32, b: f32) -> f32 {
    let max = a.max(b);
    if max <= 0.0 { 1.0 } else { a.min(b) / max }
}

fn iou(a: Rect, b: Rect) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0) as f32;
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0) as f32;
    let inter = inter_w * inter_h;
    let union = (a.width * a.height + b.width * b.height) as f32 - inter;
    inter / (union + f32::EPSILON)
}

/// Bhattacharyya (Hellinger) distance between two histograms.
fn bhattacharyya(a: &[f32], b: &[f32]) -> f32 {
    let sum_a: f32 = a.iter().sum();
    let sum_b: f32 = b.iter().sum();
    let bc: f32 = a.iter().zip(b).map(|(x, y)| (x * y).sqrt()).sum();
    let denom = (sum_a * sum_b).sqrt();
    if denom <= f32::EPSILON {
        return 1.0;
    }
    (1.0 - bc / denom).max(0.0).sqrt()
}

/// Least-squares per-frame velocity of a trace window.
fn lin_regress(points: &[Point2f]) -> (f32, f32) {
    let n = points.len() as f32;
    let mean_t = (n - 1.0) / 2.0;
    let mut stt = 0.0;
    let mut stx = 0.0;
    let mut sty = 0.0;
    for (t, p) in points.iter().enumerate() {
        let dt = t as f32 - mean_t;
        stt += dt * dt;
        stx += dt * p.x;
        sty += dt * p.y;
    }
    (stx / stt.max(f32::EPSILON), sty / stt.max(f32::EPSILON))
}

pub(crate) fn clamp_to_frame(rect: Rect, frame_size: Size) -> Rect {
    let x1 = rect.x.max(0);
    let y1 = rect.y.max(0);
    let x2 = (rect.x + rect.width).min(frame_size.width);
    let y2 = (rect.y + rect.height).min(frame_size.height);
    Rect::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
}

#[cfg(test)]
mod tests {
    use opencv::core::{CV_8UC3, MatExprTraitConst, MatTrait, Scalar};

    use super::*;
    use crate::region::ObjectType;

    fn track_at(rect: Rect) -> Track {
        Track::new(
            TrackId(0),
            Region::new(rect, ObjectType::Person, 1.0),
            None,
            &TrackerSettings::default(),
        )
    }

    fn scope(frame: Size) -> FrameScope {
        FrameScope {
            frame_size: frame,
            max_trace_length: 10,
            abandoned_window_frames: 0,
            max_speed_for_static: 10.0,
        }
    }

    #[test]
    fn jaccard_bounds() {
        let track = track_at(Rect::new(0, 0, 10, 10));
        let same = Region::new(Rect::new(0, 0, 10, 10), ObjectType::Person, 1.0);
        let disjoint = Region::new(Rect::new(50, 50, 10, 10), ObjectType::Person, 1.0);
        assert!(track.dist_jaccard(&same) < 1e-5);
        assert!((track.dist_jaccard(&disjoint) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rect_distance_scales_with_mismatch() {
        let track = track_at(Rect::new(0, 0, 20, 20));
        let same = Region::new(Rect::new(5, 5, 20, 20), ObjectType::Person, 1.0);
        let half = Region::new(Rect::new(0, 0, 10, 20), ObjectType::Person, 1.0);
        assert_eq!(track.dist_rect(&same), 0.0);
        assert!((track.dist_rect(&half) - 0.25).abs() < 1e-5);
    }

    #[test]
    fn center_distance_normalized() {
        let track = track_at(Rect::new(0, 0, 30, 40));
        let near = Region::new(Rect::new(5, 0, 30, 40), ObjectType::Person, 1.0);
        let far = Region::new(Rect::new(500, 500, 30, 40), ObjectType::Person, 1.0);
        assert!((track.dist_center(&near) - 0.1).abs() < 1e-5);
        assert_eq!(track.dist_center(&far), 1.0);
    }

    #[test]
    fn hist_distance_skips_on_empty() {
        let track = track_at(Rect::new(0, 0, 10, 10));
        let re = RegionEmbedding::new(vec![1.0; 64], Vec::new());
        assert!(track.dist_hist(&re).is_none());
    }

    #[test]
    fn cosine_distance_from_stored_embedding() {
        let stored = RegionEmbedding::new(Vec::new(), vec![1.0, 0.0]);
        let track = Track::new(
            TrackId(0),
            Region::new(Rect::new(0, 0, 10, 10), ObjectType::Person, 1.0),
            Some(stored),
            &TrackerSettings::default(),
        );
        let same = RegionEmbedding::new(Vec::new(), vec![2.0, 0.0]);
        let orthogonal = RegionEmbedding::new(Vec::new(), vec![0.0, 3.0]);
        assert!(track.dist_cosine(&same).unwrap() < 1e-5);
        assert!((track.dist_cosine(&orthogonal).unwrap() - 1.0).abs() < 1e-5);
        assert!(track.dist_cosine(&RegionEmbedding::default()).is_none());
    }

    #[test]
    fn bhattacharyya_bounds() {
        assert!(bhattacharyya(&[1.0, 0.0], &[1.0, 0.0]) < 1e-3);
        assert!((bhattacharyya(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn trace_stays_bounded() {
        let mut track = track_at(Rect::new(0, 0, 10, 10));
        let scope = scope(Size::new(640, 480));
        for i in 0..20 {
            let region = Region::new(Rect::new(i, 0, 10, 10), ObjectType::Person, 1.0);
            track.update(Some((region, None)), None, &scope);
        }
        assert_eq!(track.trace().len(), 10);
    }

    #[test]
    fn assigned_update_resets_skipped() {
        let mut track = track_at(Rect::new(0, 0, 10, 10));
        track.mark_skipped();
        track.mark_skipped();
        assert_eq!(track.skipped_frames(), 2);
        let region = Region::new(Rect::new(1, 0, 10, 10), ObjectType::Person, 1.0);
        track.update(Some((region, None)), None, &scope(Size::new(640, 480)));
        assert_eq!(track.skipped_frames(), 0);
    }

    #[test]
    fn static_frames_accumulate_for_still_track() {
        let mut track = track_at(Rect::new(100, 100, 20, 20));
        let scope = FrameScope {
            frame_size: Size::new(640, 480),
            max_trace_length: 10,
            abandoned_window_frames: 3,
            max_speed_for_static: 1.0,
        };
        for _ in 0..6 {
            let region = Region::new(Rect::new(100, 100, 20, 20), ObjectType::Person, 1.0);
            track.update(Some((region, None)), None, &scope);
        }
        assert!(track.static_frames() >= 3);
        assert!(track.is_static_timeout(3));

        // A fast move resets the counter.
        let region = Region::new(Rect::new(400, 100, 20, 20), ObjectType::Person, 1.0);
        track.update(Some((region, None)), None, &scope);
        assert_eq!(track.static_frames(), 0);
    }

    #[test]
    fn out_of_frame_detection() {
        let frame = Size::new(640, 480);
        assert!(!track_at(Rect::new(0, 0, 10, 10)).is_out_of_frame(frame));
        assert!(track_at(Rect::new(-20, 0, 10, 10)).is_out_of_frame(frame));
        assert!(track_at(Rect::new(650, 0, 10, 10)).is_out_of_frame(frame));
    }

    #[test]
    fn relocate_finds_moved_patch() {
        // The tracked patch is a bright square on a dark background so the
        // normalized correlation has contrast to work with.
        let mut prev = Mat::zeros(100, 100, CV_8UC3).unwrap().to_mat().unwrap();
        prev.roi_mut(Rect::new(20, 20, 10, 10))
            .unwrap()
            .set_scalar(Scalar::all(255.0))
            .unwrap();
        let mut curr = Mat::zeros(100, 100, CV_8UC3).unwrap().to_mat().unwrap();
        curr.roi_mut(Rect::new(23, 22, 10, 10))
            .unwrap()
            .set_scalar(Scalar::all(255.0))
            .unwrap();

        let track = track_at(Rect::new(16, 16, 18, 18));
        let found = track.relocate(&prev, &curr).unwrap();
        assert!((found.x - 19).abs() <= 1);
        assert!((found.y - 18).abs() <= 1);

        // No relocation from an empty previous frame.
        assert!(track.relocate(&Mat::default(), &curr).is_none());
    }
}
