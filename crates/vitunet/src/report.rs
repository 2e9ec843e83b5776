//! Model construction and smoke-run reports for the CLI.

use core::fmt;

use anyhow::Result;
use burn::{
    prelude::*,
    tensor::{Distribution, ElementConversion},
};
use vitunet_model::{DoubleViTUNetConfig, ModelConfig, ShapePlan, StageOutputs};

/// Structure of a built model.
#[derive(Debug, Clone)]
pub struct ModelSummary {
    /// Module tree as rendered by Burn.
    pub structure: String,
    /// Number of trainable parameters.
    pub num_params: usize,
    /// Resolved shape plan.
    pub plan: ShapePlan,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.structure)?;
        writeln!(f, "parameters: {}", self.num_params)?;
        write!(f, "{}", self.plan)
    }
}

/// Build the model described by `config` and summarize it.
///
/// # Errors
///
/// Returns an error if the configuration does not produce a valid shape plan.
pub fn summarize<B: Backend>(config: &ModelConfig, device: &Device<B>) -> Result<ModelSummary> {
    let plan = config.plan()?;
    let model = DoubleViTUNetConfig::new(config.clone()).init::<B>(device)?;

    Ok(ModelSummary {
        structure: model.to_string(),
        num_params: model.num_params(),
        plan,
    })
}

/// Value range of a mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskStats {
    pub dims: [usize; 4],
    pub min: f32,
    pub max: f32,
}

impl MaskStats {
    fn of<B: Backend>(mask: Tensor<B, 4>) -> Self {
        Self {
            dims: mask.dims(),
            min: mask.clone().min().into_scalar().elem(),
            max: mask.max().into_scalar().elem(),
        }
    }

    /// Whether every value is a probability.
    pub fn is_probability(&self) -> bool {
        (0.0..=1.0).contains(&self.min) && (0.0..=1.0).contains(&self.max)
    }
}

impl fmt::Display for MaskStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in [{:.4}, {:.4}]", self.dims, self.min, self.max)
    }
}

/// Masks of a forward pass on random input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardReport {
    pub coarse: MaskStats,
    pub refined: MaskStats,
}

/// Run one forward pass on a uniform random batch.
///
/// # Errors
///
/// Returns an error if the model cannot be built or the forward pass fails.
pub fn run_forward<B: Backend>(
    config: &ModelConfig,
    batch_size: usize,
    device: &Device<B>,
) -> Result<ForwardReport> {
    let model = DoubleViTUNetConfig::new(config.clone()).init::<B>(device)?;

    let [channels, height, width] = config.input.chw();
    let input = Tensor::<B, 4>::random(
        [batch_size, channels, height, width],
        Distribution::Uniform(0.0, 1.0),
        device,
    );
    tracing::info!(dims = ?input.dims(), "running forward pass");

    let StageOutputs { coarse, refined } = model.forward_stages(input)?;

    Ok(ForwardReport {
        coarse: MaskStats::of(coarse),
        refined: MaskStats::of(refined),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use vitunet_model::{InputShape, InterpolationStrategy, RefineStage};

    use super::*;
    use crate::tests::TestBackend;

    fn config() -> ModelConfig {
        ModelConfig::new(InputShape::new(32, 32), InterpolationStrategy::Bilinear)
    }

    #[rstest]
    #[case::vit(RefineStage::Vit, "stage B (vit)")]
    #[case::conv(RefineStage::Conv, "stage B (conv)")]
    fn summary_lists_parameters_and_plan(#[case] refine: RefineStage, #[case] stage: &str) {
        let config = config().with_refine(refine);
        let summary = summarize::<TestBackend>(&config, &Default::default()).unwrap();

        assert!(summary.num_params > 0);
        let rendered = summary.to_string();
        assert!(rendered.contains("parameters:"));
        assert!(rendered.contains(stage));
        assert!(rendered.contains("block5_conv4"));
    }

    #[rstest]
    fn forward_report_holds_probabilities(
        #[values(RefineStage::Vit, RefineStage::Conv)] refine: RefineStage,
        #[values(1, 2)] batch_size: usize,
    ) {
        let config = config().with_refine(refine);
        let report = run_forward::<TestBackend>(&config, batch_size, &Default::default()).unwrap();

        assert_eq!(report.refined.dims, [batch_size, 1, 32, 32]);
        assert_eq!(report.coarse.dims, [batch_size, 1, 32, 32]);
        assert!(report.refined.is_probability());
        assert!(report.coarse.is_probability());
    }

    #[rstest]
    #[case(40, 40, "40x40x3")]
    #[case(32, 20, "32x20x3")]
    fn invalid_shape_is_reported(#[case] height: usize, #[case] width: usize, #[case] shown: &str) {
        let config = ModelConfig::new(InputShape::new(height, width), InterpolationStrategy::Bilinear);

        let error = summarize::<TestBackend>(&config, &Default::default()).unwrap_err();

        assert!(error.to_string().contains(shown));
    }
}
