#![allow(dead_code)]

use glam::{Quat, Vec3};
use image::{Rgb, Rgb32FImage};
use splatforge_train::config::ScheduleConfig;
use splatforge_train::density::FrameFeedback;
use splatforge_train::driver::{ImageGradient, RasterGradients, Rasterizer, RenderedFrame};
use splatforge_train::error::RenderError;
use splatforge_train::ingest::TrainingView;
use splatforge_train::optim::PointGradients;
use splatforge_train::store::{Attribute, SceneView};
use splatforge_train::{PointBatch, PointRow, TrainConfig, TrainingEngine};

/// Deterministic stand-in for a GPU rasterizer.
///
/// Renders a flat image of the mean opacity, reports every point as visible
/// with a fixed gradient norm, and returns gradients that depend on the view
/// so data-parallel reductions are observable.
#[derive(Debug, Clone)]
pub struct MockRasterizer {
    pub grad_norm: f32,
    pub screen_radius: f32,
}

impl MockRasterizer {
    pub fn new(grad_norm: f32) -> Self {
        Self {
            grad_norm,
            screen_radius: 2.0,
        }
    }
}

impl Rasterizer for MockRasterizer {
    fn forward(&self, scene: &SceneView<'_>, view: &TrainingView) -> Result<RenderedFrame, RenderError> {
        let (width, height) = view.dimensions();
        let mean = if scene.is_empty() {
            0.0
        } else {
            (0..scene.len()).map(|i| scene.opacity(i)).sum::<f32>() / scene.len() as f32
        };
        Ok(RenderedFrame {
            image: Rgb32FImage::from_pixel(width, height, Rgb([mean; 3])),
            inverse_depth: None,
        })
    }

    fn backward(
        &self,
        scene: &SceneView<'_>,
        view: &TrainingView,
        _frame: &RenderedFrame,
        gradient: &ImageGradient,
    ) -> Result<RasterGradients, RenderError> {
        let points = scene.len();
        let upstream = gradient.image.iter().sum::<f32>();
        let mut gradients = PointGradients::zeros(scene.sh_stride, points);
        for i in 0..points {
            let offset = scene.position(i) - view.position;
            gradients
                .column_mut(Attribute::Position)
                .row_mut(i)
                .copy_from_slice(&(offset * 1e-3).to_array());
            gradients.column_mut(Attribute::Opacity).row_mut(i)[0] = upstream;
        }
        Ok(RasterGradients {
            points: gradients,
            feedback: FrameFeedback {
                visible: (0..points).collect(),
                grad_norms: vec![self.grad_norm; points],
                screen_radii: vec![self.screen_radius; points],
            },
        })
    }
}

/// A 4x4 view looking at the origin from `position`, filled with `value`.
pub fn view_at(position: Vec3, value: f32) -> TrainingView {
    TrainingView::new(
        Rgb32FImage::from_pixel(4, 4, Rgb([value; 3])),
        position,
        Quat::IDENTITY,
        10.0,
        10.0,
    )
}

pub fn ring_of_views(count: usize) -> Vec<TrainingView> {
    (0..count)
        .map(|i| {
            let angle = i as f32 / count as f32 * std::f32::consts::TAU;
            view_at(Vec3::new(angle.cos() * 3.0, angle.sin() * 3.0, 1.0), 0.25)
        })
        .collect()
}

/// Densification from iteration 10 to 1000 every 10 iterations.
pub fn test_config() -> TrainConfig {
    let mut config = TrainConfig::default()
        .with_max_sh_degree(1)
        .with_schedule(ScheduleConfig {
            densify_from: 10,
            densify_until: 1000,
            densify_interval: 10,
            opacity_reset_interval: 3000,
        });
    config.densify.grad_threshold = 0.2;
    config.checkpoint_interval = 0;
    config
}

/// `count` small points on a line, all at opacity 0.5.
pub fn line_of_points(count: usize, sh_degree: u32) -> PointBatch {
    let rows: Vec<PointRow> = (0..count)
        .map(|i| PointRow::new(Vec3::new(i as f32 * 0.01, 0.0, 0.0), 0.01, 0.5, sh_degree))
        .collect();
    PointBatch::from_rows(sh_degree, &rows).unwrap()
}

/// Scene extent 10 puts the clone/split boundary at 0.1, well above 0.01.
pub const SCENE_EXTENT: f32 = 10.0;

pub fn engine_with(config: TrainConfig, batch: PointBatch) -> TrainingEngine {
    TrainingEngine::new(config, batch, SCENE_EXTENT).unwrap()
}

/// Run empty iterations until `iteration`; density passes along the way see
/// no evidence and change nothing.
pub fn advance(engine: &mut TrainingEngine, iteration: u64) {
    while engine.iteration() < iteration {
        engine.end_iteration().unwrap();
    }
}

pub fn feedback(visible: Vec<usize>, grad_norm: f32) -> FrameFeedback {
    let len = visible.len();
    FrameFeedback {
        visible,
        grad_norms: vec![grad_norm; len],
        screen_radii: vec![1.0; len],
    }
}
