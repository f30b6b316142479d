use opencv::core::{Size, Size2f};
use strum::IntoEnumIterator;

use crate::{
    assignment::CostMatrix,
    region::{Region, RegionEmbedding},
    settings::{DistType, TrackerSettings},
    track::Track,
};

/// Fuses the weighted distance terms into the track-by-region cost matrix.
///
/// A pair failing the type-compatibility check costs `frame_w * frame_h`, a
/// guaranteed upper bound on any fused cost. The geometric terms are coupled
/// to the prediction-ellipse radial distance `e` so they degrade continuously
/// across the gate boundary.
pub(crate) fn build_cost_matrix(
    tracks: &[Track],
    regions: &[Region],
    embeddings: &[RegionEmbedding],
    settings: &TrackerSettings,
    frame_size: Size,
) -> CostMatrix {
    let max_possible_cost = (frame_size.width * frame_size.height) as f32;
    let mut matrix = CostMatrix::new(tracks.len(), regions.len());

    for (i, track) in tracks.iter().enumerate() {
        let ellipse = track.calc_prediction_ellipse(min_radius(track, settings));
        for (j, region) in regions.iter().enumerate() {
            if !settings.check_type_compat(track.object_type(), region.object_type()) {
                matrix.set(i, j, max_possible_cost);
                continue;
            }

            let e = track.is_inside_area(region.rrect().center, &ellipse);
            let mut cost = 0.0;
            for dist_type in DistType::iter() {
                let weight = settings.dist_weight(dist_type);
                if weight <= 0.0 {
                    continue;
                }
                match dist_type {
                    DistType::Centers => cost += weight * e.min(1.0),
                    DistType::Rects => {
                        cost += if e < 1.0 {
                            weight * (1.0 - (1.0 - e) * (1.0 - track.dist_rect(region)))
                        } else {
                            weight
                        };
                    }
                    DistType::Jaccard => cost += weight * track.dist_jaccard(region),
                    DistType::Hist => {
                        if let Some(dist) =
                            embeddings.get(j).and_then(|re| track.dist_hist(re))
                        {
                            cost += weight * dist;
                        }
                    }
                    DistType::FeatureCos => {
                        if region.object_type() == track.object_type() {
                            if let Some(dist) =
                                embeddings.get(j).and_then(|re| track.dist_cosine(re))
                            {
                                cost += weight * dist;
                            }
                        }
                    }
                }
            }
            matrix.set(i, j, cost);
        }
    }
    matrix
}

fn min_radius(track: &Track, settings: &TrackerSettings) -> Size2f {
    if settings.min_area_radius_pix < 0.0 {
        let size = track.last_region().rrect().size;
        Size2f::new(
            settings.min_area_radius_k * size.width,
            settings.min_area_radius_k * size.height,
        )
    } else {
        Size2f::new(settings.min_area_radius_pix, settings.min_area_radius_pix)
    }
}
