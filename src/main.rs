use anyhow::Result;
use nalgebra::Vector3;

use rust_kinfu::geometry::translation_of;
use rust_kinfu::io::{DepthFrameSource, RawDepthDirectory, SyntheticDepthSource};
use rust_kinfu::system::{FusionPipeline, PipelineConfig};
use rust_kinfu::tracking::TrackingState;

const WIDTH: usize = 640;
const HEIGHT: usize = 480;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = PipelineConfig {
        width: WIDTH,
        height: HEIGHT,
        ..PipelineConfig::default()
    };

    // A directory of raw u16 depth frames if given, the built-in
    // synthetic scene otherwise.
    let mut source: Box<dyn DepthFrameSource> = match std::env::args().nth(1) {
        Some(path) => {
            println!("Loading depth frames from: {}", path);
            let dir = RawDepthDirectory::new(&path, WIDTH, HEIGHT)?;
            println!("Indexed {} frames", dir.len());
            Box::new(dir)
        }
        None => {
            println!("No dataset path given, rendering the synthetic scene");
            let synthetic = SyntheticDepthSource::new(WIDTH, HEIGHT, 60);
            config.k = synthetic.k();
            config.icp.initial_pose = synthetic.initial_pose();
            Box::new(synthetic)
        }
    };

    let mut pipeline = FusionPipeline::new(config)?;

    let mut frame_slot = None;
    let mut index = 0usize;
    let mut lost = 0usize;
    while let Some(frame) = source.next_frame(frame_slot.take())? {
        let result = pipeline.process_frame(&frame);

        let t: Vector3<f32> = translation_of(&result.pose);
        match result.state {
            TrackingState::Lost => {
                lost += 1;
                println!("Frame {:4}  LOST  (pose held at [{:.3} {:.3} {:.3}])", index, t.x, t.y, t.z);
            }
            _ => {
                println!(
                    "Frame {:4}  OK    t=[{:.3} {:.3} {:.3}]  matched={:6}  d_rot={:5.2}°  d_t={:.4} m  {:6.1} ms",
                    index,
                    t.x,
                    t.y,
                    t.z,
                    result.metrics.matched_correspondences,
                    result.metrics.delta_rotation_deg,
                    result.metrics.delta_translation_m,
                    result.timing.total_ms,
                );
            }
        }

        index += 1;
        frame_slot = Some(frame);
    }

    println!(
        "Processed {} frames ({} lost); final pose translation [{:.3} {:.3} {:.3}]",
        index,
        lost,
        translation_of(&pipeline.current_pose()).x,
        translation_of(&pipeline.current_pose()).y,
        translation_of(&pipeline.current_pose()).z,
    );

    if let Some(volume) = pipeline.volume() {
        let observed = volume.voxels().iter().filter(|v| v.weight > 0.0).count();
        println!(
            "Volume: {}/{} voxels observed",
            observed,
            volume.voxels().len()
        );
    }

    Ok(())
}
