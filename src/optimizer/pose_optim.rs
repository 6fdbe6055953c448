//! Pose-only optimization weighted by moving probabilities.
//!
//! Refines the camera pose of a single keyframe against its map point
//! observations, keeping every map point fixed. Points whose moving
//! probability classifies them as dynamic are rejected; the remaining ones
//! contribute with weight `1 − p`, so points that look increasingly dynamic
//! pull on the pose less and less.
//!
//! # Theory
//!
//! ```text
//! E(ξ) = Σ_i w_i ||u_i − π(exp(ξ) · T_cw · X_i)||²
//! ```
//!
//! `ξ = [ω, v]` is a left increment on the world-to-camera pose. Each solve is
//! followed by a χ² test (5.991, 2 DoF, 95%) on the unweighted reprojection
//! error; observations failing it are excluded from the next round.
//!
//! The solve follows the three-phase pattern: the problem is collected under
//! the atlas read lock, solved with no lock held, and the pose is written back
//! under the write lock.

use anyhow::{Context, Result};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Dyn, Matrix2x6, OMatrix, Owned, Vector2, Vector3, Vector6, U6};
use tracing::{debug, warn};

use crate::atlas::map::KeyFrameId;
use crate::geometry::{CameraModel, SE3};
use crate::semantic::probability::DynamicClassifier;
use crate::system::SharedState;

use super::{PoseOptimizationReport, PoseOptimizer};

/// Configuration for pose-only optimization.
#[derive(Debug, Clone)]
pub struct PoseOptimConfig {
    /// Number of solve + outlier classification rounds.
    pub rounds: usize,
    /// LM patience (evaluations = patience × (params + 1)).
    pub patience: usize,
    /// χ² threshold for 2 DoF at 95%.
    pub chi2_threshold: f64,
    /// Fewer usable observations than this skips the keyframe.
    pub min_observations: usize,
    /// Predecessors refined together with the keyframe by
    /// `optimize_with_semantics`.
    pub semantic_window: usize,
}

impl Default for PoseOptimConfig {
    fn default() -> Self {
        Self {
            rounds: 4,
            patience: 20,
            chi2_threshold: 5.991,
            min_observations: 3,
            semantic_window: 2,
        }
    }
}

/// One observation of a fixed map point.
#[derive(Debug, Clone)]
struct PoseObservation {
    point_world: Vector3<f64>,
    observed_uv: Vector2<f64>,
    /// sqrt of the observation weight, applied to the residual.
    sqrt_weight: f64,
}

/// Snapshot of everything the solver needs for one keyframe.
#[derive(Debug, Clone)]
struct PoseProblemData {
    kf_id: KeyFrameId,
    pose_cw: SE3,
    observations: Vec<PoseObservation>,
    rejected_dynamic: usize,
}

/// Pose-only LM problem over a left increment of `T_cw`.
struct PoseProblem<'a> {
    camera: &'a CameraModel,
    base_cw: SE3,
    observations: Vec<&'a PoseObservation>,
    xi: Vector6<f64>,
}

impl<'a> PoseProblem<'a> {
    fn current_pose(&self) -> SE3 {
        SE3::exp(&self.xi).compose(&self.base_cw)
    }

    /// Unweighted reprojection error (observed − projected).
    fn error(&self, pose_cw: &SE3, obs: &PoseObservation) -> Vector2<f64> {
        let p_cam = pose_cw.transform_point(&obs.point_world);
        match self.camera.project(&p_cam) {
            Some(uv) => Vector2::new(obs.observed_uv.x - uv.x, obs.observed_uv.y - uv.y),
            // Behind the camera
            None => Vector2::new(100.0, 100.0),
        }
    }

    /// Jacobian of the error w.r.t. the left increment, g2o column order
    /// [rot_x, rot_y, rot_z, trans_x, trans_y, trans_z].
    fn jacobian_pose(&self, pose_cw: &SE3, point_world: &Vector3<f64>) -> Matrix2x6<f64> {
        let p_cam = pose_cw.transform_point(point_world);
        let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
        if z.abs() < 1e-6 {
            return Matrix2x6::zeros();
        }
        let invz = 1.0 / z;
        let invz2 = invz * invz;
        let fx = self.camera.fx;
        let fy = self.camera.fy;

        Matrix2x6::new(
            x * y * invz2 * fx,
            -(1.0 + x * x * invz2) * fx,
            y * invz * fx,
            -invz * fx,
            0.0,
            x * invz2 * fx,
            (1.0 + y * y * invz2) * fy,
            -x * y * invz2 * fy,
            -x * invz * fy,
            0.0,
            -invz * fy,
            y * invz2 * fy,
        )
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, U6> for PoseProblem<'a> {
    type JacobianStorage = Owned<f64, Dyn, U6>;
    type ParameterStorage = Owned<f64, U6>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &Vector6<f64>) {
        self.xi = *x;
    }

    fn params(&self) -> Vector6<f64> {
        self.xi
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let pose = self.current_pose();
        let mut r = DVector::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let e = self.error(&pose, obs) * obs.sqrt_weight;
            r[2 * i] = e.x;
            r[2 * i + 1] = e.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U6>> {
        let pose = self.current_pose();
        let mut j = OMatrix::<f64, Dyn, U6>::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let jp = self.jacobian_pose(&pose, &obs.point_world) * obs.sqrt_weight;
            for c in 0..6 {
                j[(2 * i, c)] = jp[(0, c)];
                j[(2 * i + 1, c)] = jp[(1, c)];
            }
        }
        Some(j)
    }
}

/// Reference [`PoseOptimizer`]: weighted pose-only Levenberg-Marquardt.
#[derive(Debug, Clone)]
pub struct WeightedPoseOptimizer {
    camera: CameraModel,
    classifier: DynamicClassifier,
    config: PoseOptimConfig,
}

impl WeightedPoseOptimizer {
    pub fn new(camera: CameraModel, classifier: DynamicClassifier) -> Self {
        Self::with_config(camera, classifier, PoseOptimConfig::default())
    }

    pub fn with_config(
        camera: CameraModel,
        classifier: DynamicClassifier,
        config: PoseOptimConfig,
    ) -> Self {
        Self {
            camera,
            classifier,
            config,
        }
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Phase 1: snapshot pose and observations under the read lock.
    fn collect(
        &self,
        store: &SharedState,
        kf_id: KeyFrameId,
        weight_by_moving_probability: bool,
    ) -> Result<PoseProblemData> {
        let atlas = store.atlas.read();
        let kf = atlas
            .keyframe(kf_id)
            .with_context(|| format!("{} not found for pose optimization", kf_id))?;

        let mut observations = Vec::with_capacity(kf.num_map_points());
        let mut rejected_dynamic = 0;
        for (idx, mp_id) in kf.observed_map_points() {
            let Some(mp) = atlas.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            let Some(uv) = kf.keypoints.get(idx) else {
                continue;
            };

            let weight = if weight_by_moving_probability {
                if self.classifier.is_dynamic(Some(mp)) {
                    rejected_dynamic += 1;
                    continue;
                }
                (1.0 - mp.moving_probability() as f64).max(1e-3)
            } else {
                1.0
            };

            observations.push(PoseObservation {
                point_world: mp.position,
                observed_uv: Vector2::new(uv.x, uv.y),
                sqrt_weight: weight.sqrt(),
            });
        }

        Ok(PoseProblemData {
            kf_id,
            pose_cw: kf.pose.inverse(),
            observations,
            rejected_dynamic,
        })
    }

    /// Phase 2: robust solve without any lock. Returns the refined T_cw.
    fn solve(&self, data: &PoseProblemData, report: &mut PoseOptimizationReport) -> SE3 {
        let mut pose_cw = data.pose_cw.clone();
        let mut inlier = vec![true; data.observations.len()];

        let scorer = PoseProblem {
            camera: &self.camera,
            base_cw: pose_cw.clone(),
            observations: data.observations.iter().collect(),
            xi: Vector6::zeros(),
        };
        report.initial_error = mean_error(&scorer, &pose_cw, &data.observations, &inlier);

        for round in 0..self.config.rounds {
            let active: Vec<&PoseObservation> = data
                .observations
                .iter()
                .zip(&inlier)
                .filter_map(|(obs, &ok)| ok.then_some(obs))
                .collect();
            if active.len() < self.config.min_observations {
                debug!(
                    "{}: only {} inliers left in round {}, stopping",
                    data.kf_id,
                    active.len(),
                    round
                );
                break;
            }

            let problem = PoseProblem {
                camera: &self.camera,
                base_cw: pose_cw.clone(),
                observations: active,
                xi: Vector6::zeros(),
            };
            let (problem, lm_report) = LevenbergMarquardt::new()
                .with_patience(self.config.patience)
                .minimize(problem);
            if !lm_report.termination.was_successful() {
                debug!("{}: LM round {} ended with {:?}", data.kf_id, round, lm_report.termination);
            }
            let candidate = problem.current_pose();
            if candidate.translation.iter().all(|v| v.is_finite())
                && candidate.rotation.coords.iter().all(|v| v.is_finite())
            {
                pose_cw = candidate;
            }
            report.iterations += lm_report.number_of_evaluations;

            // Reclassify every observation against the new pose
            for (obs, ok) in data.observations.iter().zip(inlier.iter_mut()) {
                *ok = scorer.error(&pose_cw, obs).norm_squared() <= self.config.chi2_threshold;
            }
        }

        report.num_outliers = inlier.iter().filter(|&&ok| !ok).count();
        report.final_error = mean_error(&scorer, &pose_cw, &data.observations, &inlier);
        pose_cw
    }

    fn optimize_one(
        &self,
        store: &SharedState,
        kf_id: KeyFrameId,
        weight_by_moving_probability: bool,
    ) -> Result<PoseOptimizationReport> {
        let data = self.collect(store, kf_id, weight_by_moving_probability)?;

        let mut report = PoseOptimizationReport {
            num_observations: data.observations.len(),
            num_rejected_dynamic: data.rejected_dynamic,
            ..PoseOptimizationReport::default()
        };
        if data.observations.len() < self.config.min_observations {
            debug!(
                "{}: {} usable observations, pose optimization skipped",
                kf_id,
                data.observations.len()
            );
            return Ok(report);
        }

        let pose_cw = self.solve(&data, &mut report);

        // Phase 3: write back
        let mut atlas = store.atlas.write();
        match atlas.keyframe_mut(kf_id) {
            Some(kf) => {
                kf.pose = pose_cw.inverse();
                report.keyframes_optimized = 1;
            }
            None => warn!("{} erased during pose optimization, result dropped", kf_id),
        }
        Ok(report)
    }
}

/// Mean unweighted reprojection error (pixels) over the inliers.
fn mean_error(
    problem: &PoseProblem<'_>,
    pose_cw: &SE3,
    observations: &[PoseObservation],
    inlier: &[bool],
) -> f64 {
    let (sum, n) = observations
        .iter()
        .zip(inlier)
        .filter(|(_, ok)| **ok)
        .fold((0.0, 0usize), |(sum, n), (obs, _)| {
            (sum + problem.error(pose_cw, obs).norm(), n + 1)
        });
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

impl PoseOptimizer for WeightedPoseOptimizer {
    fn optimize_pose(
        &self,
        store: &SharedState,
        kf: KeyFrameId,
        weight_by_moving_probability: bool,
    ) -> Result<PoseOptimizationReport> {
        self.optimize_one(store, kf, weight_by_moving_probability)
    }

    fn optimize_with_semantics(
        &self,
        store: &SharedState,
        kf: KeyFrameId,
    ) -> Result<PoseOptimizationReport> {
        // The keyframe itself plus its temporal predecessors
        let mut chain = vec![kf];
        {
            let atlas = store.atlas.read();
            let mut cursor = atlas.keyframe(kf).and_then(|k| k.prev_kf);
            while let Some(prev) = cursor {
                if chain.len() > self.config.semantic_window {
                    break;
                }
                chain.push(prev);
                cursor = atlas.keyframe(prev).and_then(|k| k.prev_kf);
            }
        }

        let mut total = self.optimize_one(store, kf, true)?;
        for &prev in chain.iter().skip(1) {
            match self.optimize_one(store, prev, true) {
                Ok(report) => total.merge(&report),
                Err(e) => warn!("Semantic refinement of {} failed: {:#}", prev, e),
            }
        }
        Ok(total)
    }

    fn dynamic_threshold(&self) -> Option<f32> {
        Some(self.classifier.threshold())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::RgbImage;
    use nalgebra::{Point2, UnitQuaternion};

    use super::*;
    use crate::atlas::map::MapPointId;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0)
    }

    fn world_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                points.push(Vector3::new(
                    -1.0 + 0.5 * i as f64,
                    -0.75 + 0.5 * j as f64,
                    4.0 + 0.3 * ((i + j) % 3) as f64,
                ));
            }
        }
        points
    }

    /// Keyframe observing `points` from `true_wc`, stored with `stored_wc`.
    fn setup(
        true_wc: &SE3,
        stored_wc: SE3,
        points: &[Vector3<f64>],
    ) -> (Arc<SharedState>, KeyFrameId, Vec<MapPointId>) {
        let cam = camera();
        let true_cw = true_wc.inverse();
        let keypoints: Vec<Point2<f64>> = points
            .iter()
            .map(|p| cam.project(&true_cw.transform_point(p)).unwrap())
            .collect();

        let shared = SharedState::new();
        let kf = shared
            .create_keyframe(0, stored_wc, Arc::new(RgbImage::new(640, 480)), keypoints)
            .unwrap();
        let mps = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mp = shared.create_map_point(*p, kf).unwrap();
                assert!(shared.associate(kf, i, mp));
                mp
            })
            .collect();
        (shared, kf, mps)
    }

    fn optimizer() -> WeightedPoseOptimizer {
        WeightedPoseOptimizer::new(camera(), DynamicClassifier::new(0.5))
    }

    #[test]
    fn test_recovers_perturbed_pose() {
        let truth = SE3::identity();
        let perturbed = SE3::from_rt(
            UnitQuaternion::from_euler_angles(0.01, -0.015, 0.005),
            Vector3::new(0.03, -0.02, 0.04),
        );
        let (shared, kf, _) = setup(&truth, perturbed, &world_points());

        let report = optimizer().optimize_pose(&shared, kf, true).unwrap();
        assert_eq!(report.keyframes_optimized, 1);
        assert!(report.final_error < report.initial_error);
        assert!(report.final_error < 0.5, "final error {}", report.final_error);

        let pose = shared.atlas.read().keyframe(kf).unwrap().pose.clone();
        assert!((pose.translation - truth.translation).norm() < 1e-2);
    }

    #[test]
    fn test_dynamic_points_rejected() {
        let truth = SE3::identity();
        let (shared, kf, mps) = setup(&truth, truth.clone(), &world_points());
        {
            let mut atlas = shared.atlas.write();
            for mp in &mps[..4] {
                atlas.map_point_mut(*mp).unwrap().set_moving_probability(0.9);
            }
            // Corrupt the dynamic observations; they must not move the pose
            let frame = atlas.keyframe_mut(kf).unwrap();
            for uv in frame.keypoints.iter_mut().take(4) {
                uv.x += 40.0;
            }
        }

        let report = optimizer().optimize_pose(&shared, kf, true).unwrap();
        assert_eq!(report.num_rejected_dynamic, 4);
        assert_eq!(report.num_observations, mps.len() - 4);

        let pose = shared.atlas.read().keyframe(kf).unwrap().pose.clone();
        assert!((pose.translation - truth.translation).norm() < 1e-3);
    }

    #[test]
    fn test_too_few_observations_skipped() {
        let truth = SE3::identity();
        let points = world_points();
        let (shared, kf, _) = setup(&truth, truth.clone(), &points[..2]);

        let report = optimizer().optimize_pose(&shared, kf, false).unwrap();
        assert_eq!(report.keyframes_optimized, 0);
        assert_eq!(report.num_observations, 2);
    }

    #[test]
    fn test_missing_keyframe_is_error() {
        let shared = SharedState::new();
        assert!(optimizer()
            .optimize_pose(&shared, KeyFrameId::new(42), true)
            .is_err());
    }

    #[test]
    fn test_semantic_refinement_covers_predecessors() {
        let truth = SE3::identity();
        let points = world_points();
        let (shared, kf0, mps) = setup(&truth, truth.clone(), &points);

        let keypoints = shared.atlas.read().keyframe(kf0).unwrap().keypoints.clone();
        let kf1 = shared
            .create_keyframe(1, truth.clone(), Arc::new(RgbImage::new(640, 480)), keypoints)
            .unwrap();
        for (i, mp) in mps.iter().enumerate() {
            assert!(shared.associate(kf1, i, *mp));
        }

        let report = optimizer().optimize_with_semantics(&shared, kf1).unwrap();
        assert_eq!(report.keyframes_optimized, 2);
    }
}
