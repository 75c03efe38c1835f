//! Pipeline-level behaviour of the fusion stages against the synthetic
//! scene: self-alignment, small-motion tracking, tracking loss, the
//! fusion → raycast round trip, and buffer-reuse invariance.

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::{Matrix3, Matrix4, Vector3};

use rust_kinfu::compute::CommandQueue;
use rust_kinfu::fusion::FusionConfig;
use rust_kinfu::geometry::{rotation_of, translation_of, VertexNormalMap};
use rust_kinfu::io::{DepthFrame, DepthFrameSource, SyntheticDepthSource};
use rust_kinfu::measurement::{BilateralMeasurement, MeasurementStage};
use rust_kinfu::system::{FusionPipeline, PipelineConfig};
use rust_kinfu::tracking::{IcpConfig, IcpPoseEstimation, PoseEstimationStage, TrackingState};

const WIDTH: usize = 160;
const HEIGHT: usize = 120;

fn bootstrap_pose() -> Matrix4<f32> {
    let mut t = Matrix4::identity();
    t[(0, 3)] = 1.5;
    t[(1, 3)] = 1.5;
    t[(2, 3)] = 1.5;
    t
}

fn icp_config() -> IcpConfig {
    IcpConfig {
        initial_pose: bootstrap_pose(),
        group_size: 64,
        ..IcpConfig::default()
    }
}

fn pipeline_config(source: &SyntheticDepthSource) -> PipelineConfig {
    PipelineConfig {
        width: WIDTH,
        height: HEIGHT,
        k: source.k(),
        bilateral_window: 4,
        icp: icp_config(),
        fusion: FusionConfig {
            dims: (64, 64, 64),
            ..FusionConfig::default()
        },
        ..PipelineConfig::default()
    }
}

/// Render trajectory frame `index` and run it through measurement.
fn measured_map(
    queue: &Arc<CommandQueue>,
    source: &SyntheticDepthSource,
    index: usize,
) -> VertexNormalMap {
    let mut frame = DepthFrame::new(WIDTH, HEIGHT);
    source.render(&source.pose_of_frame(index), &mut frame);

    let mut stage = BilateralMeasurement::new(queue.clone(), 4, 2.0, 1.0);
    stage.measure(&frame, &source.k(), None).read_back(queue)
}

/// Express a camera-frame map in the global frame under `pose`, the way
/// surface prediction output is expressed.
fn to_global(map: &VertexNormalMap, pose: &Matrix4<f32>) -> VertexNormalMap {
    let rot = rotation_of(pose);
    let trans = translation_of(pose);

    let mut out = VertexNormalMap::new(map.width(), map.height());
    for y in 0..map.height() {
        for x in 0..map.width() {
            let p = map.at(x, y);
            if p.is_valid() {
                let q = out.at_mut(x, y);
                q.vertex = rot * p.vertex + trans;
                q.normal = rot * p.normal;
            }
        }
    }
    out
}

#[test]
fn self_alignment_stays_at_the_bootstrap_pose() {
    let queue = Arc::new(CommandQueue::new());
    let source = SyntheticDepthSource::new(WIDTH, HEIGHT, 2);
    let live = measured_map(&queue, &source, 0);
    let predicted = to_global(&live, &bootstrap_pose());

    let mut stage = IcpPoseEstimation::new(queue.clone(), icp_config(), WIDTH, HEIGHT).unwrap();
    let seed = stage.estimate(&live, None, &source.k(), None).unwrap();
    assert_eq!(*seed.get(&queue), bootstrap_pose());

    let pose = stage
        .estimate(&live, Some(&predicted), &source.k(), Some(seed))
        .unwrap();
    let pose = pose.read_back(&queue);

    assert_relative_eq!(pose, bootstrap_pose(), epsilon = 1e-5);
}

#[test]
fn consecutive_frames_report_a_small_rigid_motion() {
    let queue = Arc::new(CommandQueue::new());
    let source = SyntheticDepthSource::new(WIDTH, HEIGHT, 2);
    let live = measured_map(&queue, &source, 0);
    let next = measured_map(&queue, &source, 1);
    let predicted = to_global(&next, &bootstrap_pose());

    let mut stage = IcpPoseEstimation::new(queue.clone(), icp_config(), WIDTH, HEIGHT).unwrap();
    let seed = stage.estimate(&live, None, &source.k(), None).unwrap();
    let pose = stage
        .estimate(&live, Some(&predicted), &source.k(), Some(seed))
        .unwrap();
    let pose = pose.read_back(&queue);

    // Not simply the bootstrap pose...
    assert_ne!(pose, bootstrap_pose());

    // ...but close to it: translation within a few centimetres.
    let t = translation_of(&pose);
    for axis in 0..3 {
        assert!(
            (t[axis] - 1.5).abs() < 0.05,
            "translation axis {} drifted: {}",
            axis,
            t[axis]
        );
    }

    // Bottom row is exactly [0 0 0 1].
    assert_eq!(pose[(3, 0)], 0.0);
    assert_eq!(pose[(3, 1)], 0.0);
    assert_eq!(pose[(3, 2)], 0.0);
    assert_eq!(pose[(3, 3)], 1.0);

    // The rotation block is a small rotation, with no scaling.
    let rot = rotation_of(&pose);
    assert_relative_eq!(rot * rot.transpose(), Matrix3::identity(), epsilon = 1e-4);
    let angle = ((rot.trace() - 1.0) / 2.0).clamp(-1.0, 1.0).acos().to_degrees();
    assert!(angle < 5.0, "rotation too large: {}°", angle);
}

#[test]
fn frames_without_overlap_lose_tracking() {
    let queue = Arc::new(CommandQueue::new());
    // Violent per-frame pitch: two frames apart, every surface normal has
    // rotated far past the ICP angle threshold.
    let source = SyntheticDepthSource::new(WIDTH, HEIGHT, 5).with_motion(
        Vector3::new(0.3, 0.0, 0.0),
        Vector3::x(),
        30.0,
    );
    let live = measured_map(&queue, &source, 0);
    let far = measured_map(&queue, &source, 2);
    let predicted = to_global(&far, &bootstrap_pose());

    let mut stage = IcpPoseEstimation::new(queue.clone(), icp_config(), WIDTH, HEIGHT).unwrap();
    let seed = stage.estimate(&live, None, &source.k(), None).unwrap();
    let result = stage.estimate(&live, Some(&predicted), &source.k(), Some(seed));

    assert!(result.is_err(), "expected tracking to be lost");
}

#[test]
fn fusion_then_raycast_round_trips_the_scene() {
    let mut source = SyntheticDepthSource::new(WIDTH, HEIGHT, 2);
    let mut pipeline = FusionPipeline::new(pipeline_config(&source)).unwrap();

    let frame = source.next_frame(None).unwrap().unwrap();
    let result = pipeline.process_frame(&frame);
    assert_eq!(result.state, TrackingState::Ok);

    let predicted = pipeline.prediction().unwrap();
    assert!(predicted.valid_count() > 0);

    let zero = Vector3::zeros();
    let mut checked = 0usize;
    for pixel in predicted.pixels() {
        if pixel.has_normal() {
            // Valid normals are never the exact zero vector.
            assert_ne!(pixel.normal, zero);
        }
        if pixel.is_valid() {
            // Predicted vertices lie near an actual scene surface.
            let err = SyntheticDepthSource::scene_distance(&pixel.vertex);
            assert!(err < 0.15, "predicted vertex {} m off the surface", err);
            checked += 1;
        }
    }
    assert!(checked > 0);
}

#[test]
fn gentle_motion_tracks_across_several_frames() {
    let mut source = SyntheticDepthSource::new(WIDTH, HEIGHT, 4);
    let mut pipeline = FusionPipeline::new(pipeline_config(&source)).unwrap();

    let mut slot = None;
    let mut processed = 0usize;
    while let Some(frame) = source.next_frame(slot.take()).unwrap() {
        let result = pipeline.process_frame(&frame);
        assert_eq!(result.state, TrackingState::Ok, "frame {} lost", processed);
        if processed > 0 {
            assert!(
                result.metrics.delta_rotation_deg < 5.0,
                "frame {}: rotation jump {}°",
                processed,
                result.metrics.delta_rotation_deg
            );
            assert!(
                result.metrics.delta_translation_m < 0.05,
                "frame {}: translation jump {} m",
                processed,
                result.metrics.delta_translation_m
            );
        }
        processed += 1;
        slot = Some(frame);
    }
    assert_eq!(processed, 4);
    assert_eq!(pipeline.frame_count(), 4);
}

#[test]
fn reusing_the_pose_buffer_does_not_change_the_estimate() {
    let queue = Arc::new(CommandQueue::new());
    let source = SyntheticDepthSource::new(WIDTH, HEIGHT, 2);
    let live = measured_map(&queue, &source, 0);
    let next = measured_map(&queue, &source, 1);
    let predicted = to_global(&next, &bootstrap_pose());

    // Fresh buffer every call.
    let mut fresh = IcpPoseEstimation::new(queue.clone(), icp_config(), WIDTH, HEIGHT).unwrap();
    let _ = fresh.estimate(&live, None, &source.k(), None).unwrap();
    let without_reuse = fresh
        .estimate(&live, Some(&predicted), &source.k(), None)
        .unwrap()
        .read_back(&queue);

    // Same sequence, passing each returned buffer back in.
    let mut reusing = IcpPoseEstimation::new(queue.clone(), icp_config(), WIDTH, HEIGHT).unwrap();
    let seed = reusing.estimate(&live, None, &source.k(), None).unwrap();
    let with_reuse = reusing
        .estimate(&live, Some(&predicted), &source.k(), Some(seed))
        .unwrap()
        .read_back(&queue);

    assert_eq!(without_reuse, with_reuse);
}
