//! Atrous Spatial Pyramid Pooling (ASPP) bottleneck.
//!
//! Four dilated convolution branches and one image-level pooling branch look
//! at the bottleneck features at different receptive fields. Their outputs are
//! concatenated and projected back to `filters` channels.

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

use super::utils::intelligent_interpolate;
use crate::config::{AsppPlan, BlockConfig, InterpolationStrategy};

fn batch_norm<B: Backend>(
    channels: usize,
    epsilon: f64,
    momentum: f64,
    device: &Device<B>,
) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_epsilon(epsilon)
        .with_momentum(momentum)
        .init(device)
}

/// Configuration for a single dilated ASPP branch.
#[derive(Config, Debug)]
pub struct AsppBranchConfig {
    in_channels: usize,
    planes: usize,
    kernel_size: usize,
    padding: usize,
    dilation: usize,
    #[config(default = "1e-3")]
    norm_epsilon: f64,
    #[config(default = "0.01")]
    norm_momentum: f64,
}

impl AsppBranchConfig {
    /// Branch with a `1x1` kernel for dilation 1 and a padded `3x3` kernel otherwise.
    pub fn dilated(in_channels: usize, planes: usize, dilation: usize) -> Self {
        if dilation == 1 {
            Self::new(in_channels, planes, 1, 0, 1)
        } else {
            Self::new(in_channels, planes, 3, dilation, dilation)
        }
    }

    /// Initializes a new `AsppBranch`.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> AsppBranch<B> {
        let atrous_conv = Conv2dConfig::new(
            [self.in_channels, self.planes],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([1, 1])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .with_bias(false)
        .init(device);

        AsppBranch {
            atrous_conv,
            bn: batch_norm(self.planes, self.norm_epsilon, self.norm_momentum, device),
            relu: Relu::new(),
        }
    }
}

/// Dilated `conv -> batch norm -> ReLU` branch.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, planes, height, width]`
#[derive(Module, Debug)]
pub struct AsppBranch<B: Backend> {
    atrous_conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> AsppBranch<B> {
    /// Conv, batch norm and ReLU at the input resolution.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.atrous_conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Image-level branch: global pooling, `1x1` conv, batch norm, ReLU.
///
/// The `1x1` output is broadcast back by [`Aspp`] with the configured interpolation.
#[derive(Module, Debug)]
pub struct GlobalAvgPool<B: Backend> {
    pool: AdaptiveAvgPool2d,
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> GlobalAvgPool<B> {
    /// Pooled branch producing `out_channels` from `in_channels`.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        settings: &BlockConfig,
        device: &Device<B>,
    ) -> Self {
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_stride([1, 1])
            .init(device);
        let bn = batch_norm(
            out_channels,
            settings.norm_epsilon,
            settings.norm_momentum,
            device,
        );

        Self {
            pool,
            conv,
            bn,
            relu: Relu::new(),
        }
    }

    /// Pools to `[batch_size, out_channels, 1, 1]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pool.forward(x);
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Configuration for the [`Aspp`] module.
#[derive(Config, Debug)]
pub struct AsppConfig {
    /// Number of input channels.
    in_channels: usize,
    /// Channels of every branch and of the projected output.
    #[config(default = "64")]
    filters: usize,
    /// Dilation rates of the four convolutional branches.
    #[config(default = "[1, 6, 12, 18]")]
    dilations: [usize; 4],
    /// Batch norm settings shared by every branch.
    #[config(default = "BlockConfig::new()")]
    norm: BlockConfig,
    /// Interpolation strategy for broadcasting the pooled branch.
    interpolation_strategy: InterpolationStrategy,
}

impl AsppConfig {
    /// Configuration for a planned bottleneck.
    pub fn from_plan(
        plan: &AsppPlan,
        settings: &BlockConfig,
        interpolation: &InterpolationStrategy,
    ) -> Self {
        Self::new(plan.in_channels, interpolation.clone())
            .with_filters(plan.out_channels)
            .with_dilations(plan.dilations)
            .with_norm(settings.clone())
    }

    /// Initializes a new `Aspp` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Aspp<B> {
        let branches = self
            .dilations
            .iter()
            .map(|&dilation| {
                AsppBranchConfig::dilated(self.in_channels, self.filters, dilation)
                    .with_norm_epsilon(self.norm.norm_epsilon)
                    .with_norm_momentum(self.norm.norm_momentum)
                    .init(device)
            })
            .collect();

        let global_avg_pool = GlobalAvgPool::new(self.in_channels, self.filters, &self.norm, device);

        let conv1 = Conv2dConfig::new([self.filters * (self.dilations.len() + 1), self.filters], [1, 1])
            .with_bias(false)
            .init(device);
        let bn1 = batch_norm(
            self.filters,
            self.norm.norm_epsilon,
            self.norm.norm_momentum,
            device,
        );

        Aspp {
            global_avg_pool,
            branches,
            conv1,
            bn1,
            relu: Relu::new(),
            interpolation_strategy: Ignored(self.interpolation_strategy.clone()),
        }
    }
}

/// Atrous Spatial Pyramid Pooling.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, filters, height, width]`
#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    global_avg_pool: GlobalAvgPool<B>,
    branches: Vec<AsppBranch<B>>,
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    interpolation_strategy: Ignored<InterpolationStrategy>,
}

impl<B: Backend> Aspp<B> {
    /// # Shapes
    ///   - input: `[batch_size, in_channels, height, width]`
    ///   - output: `[batch_size, filters, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();

        let pooled = self.global_avg_pool.forward(x.clone());
        let pooled = intelligent_interpolate(pooled, [height, width], &self.interpolation_strategy.0);

        // Pooled branch first, then the branches in dilation order.
        let mut features = Vec::with_capacity(self.branches.len() + 1);
        features.push(pooled);
        features.extend(self.branches.iter().map(|branch| branch.forward(x.clone())));
        let x = Tensor::cat(features, 1);

        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        self.relu.forward(x)
    }
}
