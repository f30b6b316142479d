use anyhow::Result;
use opencv::{
    core::{Mat, MatTraitConst, MatTraitConstManual, Rect, Vector, no_array},
    imgproc::calc_hist,
};

use crate::track::clamp_to_frame;

/// Number of bins per color channel.
const HIST_BINS: i32 = 64;

/// Computes the appearance histogram of `frame[brect]`.
///
/// One 64-bin histogram per channel over `[0, 256)`, concatenated across all
/// channels of the frame and min-max normalized to `[0, 1]`. A rectangle that
/// leaves no area inside the frame yields an empty histogram.
pub fn region_histogram(frame: &Mat, brect: Rect) -> Result<Vec<f32>> {
    let frame_size = frame.size()?;
    let roi_rect = clamp_to_frame(brect, frame_size);
    if roi_rect.width <= 0 || roi_rect.height <= 0 {
        return Ok(Vec::new());
    }

    let roi = frame.roi(roi_rect)?.try_clone()?;
    let channels = roi.channels();
    let images = Vector::<Mat>::from_iter([roi]);
    let mut bins = Vec::with_capacity((HIST_BINS * channels) as usize);
    for channel in 0..channels {
        let mut hist = Mat::default();
        calc_hist(
            &images,
            &Vector::from_slice(&[channel]),
            &no_array(),
            &mut hist,
            &Vector::from_slice(&[HIST_BINS]),
            &Vector::from_slice(&[0.0, 256.0]),
            false,
        )?;
        bins.extend_from_slice(hist.data_typed::<f32>()?);
    }

    normalize_min_max(&mut bins);
    Ok(bins)
}

fn normalize_min_max(bins: &mut [f32]) {
    let min = bins.iter().copied().fold(f32::INFINITY, f32::min);
    let max = bins.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > min {
        for bin in bins.iter_mut() {
            *bin = (*bin - min) / (max - min);
        }
    } else {
        bins.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use opencv::core::{CV_8UC3, MatExprTraitConst, MatTrait, Scalar};

    use super::*;

    #[test]
    fn histogram_shape_and_range() {
        let mut frame = Mat::zeros(100, 100, CV_8UC3).unwrap().to_mat().unwrap();
        frame
            .roi_mut(Rect::new(10, 10, 20, 20))
            .unwrap()
            .set_scalar(Scalar::new(200.0, 100.0, 50.0, 0.0))
            .unwrap();

        let hist = region_histogram(&frame, Rect::new(0, 0, 50, 50)).unwrap();
        assert_eq!(hist.len(), 64 * 3);
        assert!(hist.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(hist.iter().any(|&v| v == 1.0));
    }

    #[test]
    fn histogram_separates_colors() {
        let frame = Mat::zeros(50, 50, CV_8UC3).unwrap().to_mat().unwrap();
        let hist = region_histogram(&frame, Rect::new(0, 0, 50, 50)).unwrap();
        // Every pixel is black, so only the lowest bin of each channel fires.
        for channel in 0..3 {
            assert_eq!(hist[channel * 64], 1.0);
            assert!(hist[channel * 64 + 1..(channel + 1) * 64].iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn histogram_empty_outside_frame() {
        let frame = Mat::zeros(50, 50, CV_8UC3).unwrap().to_mat().unwrap();
        let hist = region_histogram(&frame, Rect::new(100, 100, 20, 20)).unwrap();
        assert!(hist.is_empty());
    }

    #[test]
    fn histogram_clamps_partial_overlap() {
        let frame = Mat::zeros(50, 50, CV_8UC3).unwrap().to_mat().unwrap();
        let hist = region_histogram(&frame, Rect::new(40, 40, 30, 30)).unwrap();
        assert_eq!(hist.len(), 64 * 3);
    }
}
