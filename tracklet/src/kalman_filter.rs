use nalgebra::{DMatrix, DVector};
use opencv::core::{Point2f, Rect, Size2f};

use crate::{
    region::RRect,
    settings::{FilterGoal, TrackerSettings},
};

/// Measurement noise variance, shared by all measured components.
const MEASUREMENT_NOISE: f32 = 0.1;
/// Initial variance of the unobserved velocity/acceleration components.
const DERIVATIVE_VAR_INIT: f32 = 10.0;
/// Below this directed speed (pix per step) the prediction ellipse stays
/// axis-aligned at its minimum radius.
const MIN_DIRECTED_SPEED: f32 = 4.0;

/// Linear Kalman filter driving one track's motion state.
///
/// The state is `[position, velocity]` or `[position, velocity, acceleration]`
/// per measured component; [`FilterGoal`] decides whether the size is part of
/// the measurement or carried alongside the filtered center.
#[derive(Clone, Debug)]
pub struct MotionFilter {
    goal: FilterGoal,
    meas_dim: usize,
    mean: DVector<f32>,
    covariance: DMatrix<f32>,
    motion_mat: DMatrix<f32>,
    update_mat: DMatrix<f32>,
    process_noise: DMatrix<f32>,
    measurement_noise: DMatrix<f32>,
    size: Size2f,
    output: [f32; 4],
}

impl MotionFilter {
    pub fn new(settings: &TrackerSettings, rect: Rect) -> Self {
        let meas_dim = match settings.filter_goal {
            FilterGoal::Center => 2,
            FilterGoal::Rect => 4,
        };
        let order = if settings.use_acceleration { 3 } else { 2 };
        let state_dim = meas_dim * order;
        let dt = settings.dt;

        let mut motion_mat = DMatrix::identity(state_dim, state_dim);
        for i in 0..meas_dim {
            motion_mat[(i, i + meas_dim)] = dt;
            if order == 3 {
                motion_mat[(i, i + 2 * meas_dim)] = dt * dt / 2.0;
                motion_mat[(i + meas_dim, i + 2 * meas_dim)] = dt;
            }
        }

        let mut update_mat = DMatrix::zeros(meas_dim, state_dim);
        for i in 0..meas_dim {
            update_mat[(i, i)] = 1.0;
        }

        // Piecewise-constant acceleration process noise per component.
        let q = match order {
            2 => vec![
                vec![dt.powi(4) / 4.0, dt.powi(3) / 2.0],
                vec![dt.powi(3) / 2.0, dt * dt],
            ],
            _ => vec![
                vec![dt.powi(4) / 4.0, dt.powi(3) / 2.0, dt * dt / 2.0],
                vec![dt.powi(3) / 2.0, dt * dt, dt],
                vec![dt * dt / 2.0, dt, 1.0],
            ],
        };
        let mut process_noise = DMatrix::zeros(state_dim, state_dim);
        for i in 0..meas_dim {
            for a in 0..order {
                for b in 0..order {
                    process_noise[(i + a * meas_dim, i + b * meas_dim)] =
                        settings.accel_noise_mag * q[a][b];
                }
            }
        }

        let measurement_noise = DMatrix::identity(meas_dim, meas_dim) * MEASUREMENT_NOISE;

        let mut covariance = DMatrix::identity(state_dim, state_dim);
        for i in meas_dim..state_dim {
            covariance[(i, i)] = DERIVATIVE_VAR_INIT;
        }

        let rrect = RRect::from(rect);
        let mut mean = DVector::zeros(state_dim);
        mean[0] = rrect.center.x;
        mean[1] = rrect.center.y;
        if meas_dim == 4 {
            mean[2] = rrect.size.width;
            mean[3] = rrect.size.height;
        }

        Self {
            goal: settings.filter_goal,
            meas_dim,
            mean,
            covariance,
            motion_mat,
            update_mat,
            process_noise,
            measurement_noise,
            size: rrect.size,
            output: [rrect.center.x, rrect.center.y, rrect.size.width, rrect.size.height],
        }
    }

    /// Advances the state to the current time step.
    pub fn predict(&mut self) {
        self.mean = &self.motion_mat * &self.mean;
        self.covariance =
            &self.motion_mat * &self.covariance * self.motion_mat.transpose() + &self.process_noise;
    }

    /// Ingests an observed region and refreshes the smoothed output.
    pub fn update(&mut self, rect: Rect) {
        let rrect = RRect::from(rect);
        let mut z = DVector::zeros(self.meas_dim);
        z[0] = rrect.center.x;
        z[1] = rrect.center.y;
        if self.meas_dim == 4 {
            z[2] = rrect.size.width;
            z[3] = rrect.size.height;
        }

        let projected_mean = &self.update_mat * &self.mean;
        let projected_cov = &self.update_mat * &self.covariance * self.update_mat.transpose()
            + &self.measurement_noise;
        let chol = projected_cov
            .clone()
            .cholesky()
            .expect("innovation covariance is SPD");
        let gain = &self.covariance * self.update_mat.transpose() * chol.inverse();
        let innovation = z - projected_mean;

        self.mean += &gain * innovation;
        self.covariance -= &gain * projected_cov * gain.transpose();
        if self.goal == FilterGoal::Center {
            self.size = rrect.size;
        }
        self.sync_output();
    }

    /// Advances the output with no measurement; the prediction becomes the
    /// smoothed result.
    pub fn update_skipped(&mut self) {
        self.sync_output();
    }

    fn sync_output(&mut self) {
        self.output[0] = self.mean[0];
        self.output[1] = self.mean[1];
        let (w, h) = if self.meas_dim == 4 {
            (self.mean[2], self.mean[3])
        } else {
            (self.size.width, self.size.height)
        };
        self.output[2] = w.max(1.0);
        self.output[3] = h.max(1.0);
    }

    #[inline]
    pub fn predicted_center(&self) -> Point2f {
        Point2f::new(self.mean[0], self.mean[1])
    }

    /// Estimated velocity of the center, in pixels per filter step.
    #[inline]
    pub fn velocity(&self) -> (f32, f32) {
        (self.mean[self.meas_dim], self.mean[self.meas_dim + 1])
    }

    /// The last smoothed rectangle.
    pub fn last_rect(&self) -> Rect {
        let [cx, cy, w, h] = self.output;
        Rect::new(
            (cx - w / 2.0).round() as i32,
            (cy - h / 2.0).round() as i32,
            w.round() as i32,
            h.round() as i32,
        )
    }

    /// Gating ellipse around the predicted center.
    ///
    /// A track moving fast enough gets an ellipse stretched along its
    /// velocity; otherwise the ellipse stays axis-aligned with half-axes at
    /// `min_radius`.
    pub fn prediction_ellipse(&self, min_radius: Size2f) -> RRect {
        let center = self.predicted_center();
        let (vx, vy) = self.velocity();
        let dx = 3.0 * vx;
        let dy = 3.0 * vy;
        if dx.abs() + dy.abs() > MIN_DIRECTED_SPEED {
            let speed = (dx * dx + dy * dy).sqrt();
            RRect {
                center,
                size: Size2f::new(
                    2.0 * min_radius.width.max(speed),
                    2.0 * min_radius.height.max(speed / 2.0),
                ),
                angle: dy.atan2(dx).to_degrees(),
            }
        } else {
            RRect {
                center,
                size: Size2f::new(2.0 * min_radius.width, 2.0 * min_radius.height),
                angle: 0.0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_settings() -> TrackerSettings {
        TrackerSettings::default()
    }

    fn center_settings() -> TrackerSettings {
        TrackerSettings {
            filter_goal: FilterGoal::Center,
            ..TrackerSettings::default()
        }
    }

    #[test]
    fn stationary_track_converges_to_measurement() {
        let rect = Rect::new(10, 10, 20, 20);
        let mut filter = MotionFilter::new(&rect_settings(), rect);
        for _ in 0..10 {
            filter.predict();
            filter.update(rect);
        }
        let out = filter.last_rect();
        assert!((out.x - rect.x).abs() <= 1);
        assert!((out.y - rect.y).abs() <= 1);
        assert!((out.width - rect.width).abs() <= 1);
        assert!((out.height - rect.height).abs() <= 1);
    }

    #[test]
    fn velocity_follows_motion() {
        let mut filter = MotionFilter::new(&rect_settings(), Rect::new(0, 0, 20, 20));
        for step in 1..12 {
            filter.predict();
            filter.update(Rect::new(5 * step, 0, 20, 20));
        }
        let (vx, vy) = filter.velocity();
        assert!(vx > 0.0);
        assert!(vy.abs() < vx / 10.0);
    }

    #[test]
    fn center_goal_keeps_measured_size() {
        let mut filter = MotionFilter::new(&center_settings(), Rect::new(0, 0, 20, 20));
        filter.predict();
        filter.update(Rect::new(1, 0, 30, 40));
        let out = filter.last_rect();
        assert_eq!(out.width, 30);
        assert_eq!(out.height, 40);
    }

    #[test]
    fn skipped_update_outputs_prediction() {
        let mut filter = MotionFilter::new(&rect_settings(), Rect::new(0, 0, 20, 20));
        for step in 1..12 {
            filter.predict();
            filter.update(Rect::new(5 * step, 0, 20, 20));
        }
        let before = filter.last_rect();
        filter.predict();
        filter.update_skipped();
        let after = filter.last_rect();
        // A moving track keeps moving without a measurement.
        assert!(after.x > before.x);
    }

    #[test]
    fn prediction_ellipse_respects_min_radius() {
        let filter = MotionFilter::new(&rect_settings(), Rect::new(10, 10, 20, 20));
        let ellipse = filter.prediction_ellipse(Size2f::new(16.0, 16.0));
        assert_eq!(ellipse.size, Size2f::new(32.0, 32.0));
        assert_eq!(ellipse.angle, 0.0);
        assert_eq!(ellipse.center, Point2f::new(20.0, 20.0));
    }

    #[test]
    fn prediction_ellipse_stretches_along_velocity() {
        let mut filter = MotionFilter::new(&rect_settings(), Rect::new(0, 0, 20, 20));
        for step in 1..12 {
            filter.predict();
            filter.update(Rect::new(8 * step, 0, 20, 20));
        }
        let ellipse = filter.prediction_ellipse(Size2f::new(1.0, 1.0));
        assert!(ellipse.size.width > ellipse.size.height);
        assert!(ellipse.angle.abs() < 10.0);
    }

    #[test]
    fn acceleration_state_is_larger_but_tracks() {
        let settings = TrackerSettings {
            use_acceleration: true,
            ..TrackerSettings::default()
        };
        let rect = Rect::new(10, 10, 20, 20);
        let mut filter = MotionFilter::new(&settings, rect);
        for _ in 0..10 {
            filter.predict();
            filter.update(rect);
        }
        let out = filter.last_rect();
        assert!((out.x - rect.x).abs() <= 1);
        assert!((out.y - rect.y).abs() <= 1);
    }
}
