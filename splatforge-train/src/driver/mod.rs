//! Optimization driver.
//!
//! The rasterizer, the loss and conditioning modules are external; this
//! module fixes the contracts they implement and the order in which one
//! iteration calls them.

pub mod loss;
pub mod trainer;

pub use loss::PhotometricLoss;
pub use trainer::{RunSummary, StepReport, Trainer};

use crate::density::FrameFeedback;
use crate::engine::TrainingEngine;
use crate::error::{EngineError, RenderError};
use crate::ingest::TrainingView;
use crate::optim::PointGradients;
use crate::store::{IndexRemap, SceneView};
use image::Rgb32FImage;
use splatforge_data::camera_extent;

/// Output of a forward render.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub image: Rgb32FImage,
    /// Rendered inverse depth, when the rasterizer produces it.
    pub inverse_depth: Option<Vec<f32>>,
}

/// Loss gradient with respect to a rendered frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageGradient {
    /// Same layout as `RenderedFrame::image` (row-major rgb).
    pub image: Vec<f32>,
    pub inverse_depth: Option<Vec<f32>>,
}

/// Result of a backward pass.
#[derive(Debug, Clone)]
pub struct RasterGradients {
    /// Parameter gradients keyed by point index.
    pub points: PointGradients,
    /// Densification signal for the visible points.
    pub feedback: FrameFeedback,
}

/// A differentiable Gaussian rasterizer.
///
/// Shared across replicas, hence `Send + Sync`.
pub trait Rasterizer: Send + Sync {
    fn forward(&self, scene: &SceneView<'_>, view: &TrainingView) -> Result<RenderedFrame, RenderError>;

    fn backward(
        &self,
        scene: &SceneView<'_>,
        view: &TrainingView,
        frame: &RenderedFrame,
        gradient: &ImageGradient,
    ) -> Result<RasterGradients, RenderError>;
}

/// Per-view modification of point attributes applied before rasterization
/// (appearance embeddings, deformation fields).
pub trait Conditioning: Send + Sync {
    /// Replace attributes for this view. Implementations write through
    /// `SceneView::positions_mut` / `sh_mut`, which copy on first write.
    fn condition<'a>(&self, scene: SceneView<'a>, _view: &TrainingView) -> Result<SceneView<'a>, RenderError> {
        Ok(scene)
    }

    /// Turn gradients w.r.t. conditioned attributes into gradients w.r.t.
    /// the base attributes.
    fn chain_gradients(&self, _view: &TrainingView, _gradients: &mut PointGradients) -> Result<(), RenderError> {
        Ok(())
    }

    /// Point indices changed; rewrite any per-point tables.
    fn on_points_remapped(&mut self, _remap: &IndexRemap) {}
}

/// Conditioning that changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConditioning;

impl Conditioning for IdentityConditioning {}

/// Posed training views.
pub trait ViewSource: Sync {
    fn len(&self) -> usize;

    fn view(&self, index: usize) -> Option<&TrainingView>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Radius of the camera rig, used as the scene extent.
    fn camera_extent(&self) -> f32 {
        let centers: Vec<_> = (0..self.len())
            .filter_map(|i| self.view(i))
            .map(|view| view.position)
            .collect();
        camera_extent(&centers)
    }
}

impl ViewSource for Vec<TrainingView> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn view(&self, index: usize) -> Option<&TrainingView> {
        self.get(index)
    }
}

/// Scalar loss and its gradient for one rendered view.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    pub gradient: ImageGradient,
}

pub trait LossFunction: Send + Sync {
    fn evaluate(
        &self,
        frame: &RenderedFrame,
        view: &TrainingView,
        iteration: u64,
    ) -> Result<LossOutput, RenderError>;
}

/// Forward and backward results for one view, before any state changes.
#[derive(Debug, Clone)]
pub struct ViewGradients {
    pub loss: f32,
    pub gradients: PointGradients,
    pub feedback: FrameFeedback,
}

/// Condition, render, evaluate the loss, backpropagate and chain gradients
/// through conditioning. Reads the engine only.
pub fn compute_view_gradients<R, L, C>(
    engine: &TrainingEngine,
    view: &TrainingView,
    rasterizer: &R,
    loss: &L,
    conditioning: &C,
) -> Result<ViewGradients, EngineError>
where
    R: Rasterizer + ?Sized,
    L: LossFunction + ?Sized,
    C: Conditioning + ?Sized,
{
    let scene = conditioning.condition(engine.view(), view)?;
    let frame = rasterizer.forward(&scene, view)?;
    let output = loss.evaluate(&frame, view, engine.iteration())?;
    let raster = rasterizer.backward(&scene, view, &frame, &output.gradient)?;

    let mut gradients = raster.points;
    conditioning.chain_gradients(view, &mut gradients)?;
    gradients.check_shape(engine.store().sh_stride(), engine.len())?;
    Ok(ViewGradients {
        loss: output.value,
        gradients,
        feedback: raster.feedback,
    })
}
