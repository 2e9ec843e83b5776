//! Pre-norm transformer blocks over patch tokens.

use burn::{
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    prelude::*,
};

use crate::config::VitConfig;

/// Configuration for the transformer [`Mlp`].
#[derive(Config, Debug)]
pub struct MlpConfig {
    in_features: usize,
    /// Width of every dense layer, in order.
    hidden_units: Vec<usize>,
    #[config(default = "0.1")]
    drop: f64,
}

impl MlpConfig {
    /// Initializes a new `Mlp` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Mlp<B> {
        let mut in_features = self.in_features;
        let layers = self
            .hidden_units
            .iter()
            .map(|&units| {
                let layer = LinearConfig::new(in_features, units).init(device);
                in_features = units;
                layer
            })
            .collect();

        Mlp {
            layers,
            act: Gelu::new(),
            drop: DropoutConfig::new(self.drop).init(),
        }
    }
}

/// Stack of `Linear -> GELU -> Dropout` layers.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
    act: Gelu,
    drop: Dropout,
}

impl<B: Backend> Mlp<B> {
    /// # Shapes
    ///   - input: `[batch_size, sequence_length, in_features]`
    ///   - output: `[batch_size, sequence_length, last hidden unit]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.layers.iter().fold(x, |x, layer| {
            self.drop.forward(self.act.forward(layer.forward(x)))
        })
    }
}

fn layer_norm<B: Backend>(settings: &VitConfig, device: &Device<B>) -> LayerNorm<B> {
    LayerNormConfig::new(settings.projection_dim)
        .with_epsilon(settings.layer_norm_epsilon)
        .init(device)
}

fn attention<B: Backend>(settings: &VitConfig, device: &Device<B>) -> MultiHeadAttention<B> {
    MultiHeadAttentionConfig::new(settings.projection_dim, settings.num_heads)
        .with_dropout(settings.dropout)
        .init(device)
}

fn mlp<B: Backend>(settings: &VitConfig, device: &Device<B>) -> Mlp<B> {
    MlpConfig::new(settings.projection_dim, settings.transformer_units().to_vec())
        .with_drop(settings.dropout)
        .init(device)
}

/// Configuration for the [`TransformerEncoderBlock`].
#[derive(Config, Debug)]
pub struct TransformerEncoderBlockConfig {
    #[config(default = "VitConfig::new()")]
    settings: VitConfig,
}

impl TransformerEncoderBlockConfig {
    /// Initializes a new `TransformerEncoderBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> TransformerEncoderBlock<B> {
        TransformerEncoderBlock {
            norm1: layer_norm(&self.settings, device),
            attn: attention(&self.settings, device),
            norm2: layer_norm(&self.settings, device),
            mlp: mlp(&self.settings, device),
        }
    }
}

/// Self-attention and MLP, each behind a layer norm and a residual connection.
///
/// # Shapes
///   - input: `[batch_size, num_patches, projection_dim]`
///   - output: `[batch_size, num_patches, projection_dim]`
#[derive(Module, Debug)]
pub struct TransformerEncoderBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: MultiHeadAttention<B>,
    norm2: LayerNorm<B>,
    mlp: Mlp<B>,
}

impl<B: Backend> TransformerEncoderBlock<B> {
    /// Pre-norm self-attention and MLP, each with a residual; the shape is unchanged.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let attended = self
            .attn
            .forward(MhaInput::self_attn(self.norm1.forward(x.clone())))
            .context;
        let x = x + attended;

        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }
}

/// Configuration for the [`TransformerDecoderBlock`].
#[derive(Config, Debug)]
pub struct TransformerDecoderBlockConfig {
    #[config(default = "VitConfig::new()")]
    settings: VitConfig,
}

impl TransformerDecoderBlockConfig {
    /// Initializes a new `TransformerDecoderBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> TransformerDecoderBlock<B> {
        TransformerDecoderBlock {
            norm1: layer_norm(&self.settings, device),
            self_attn: attention(&self.settings, device),
            norm2: layer_norm(&self.settings, device),
            cross_attn: attention(&self.settings, device),
            norm3: layer_norm(&self.settings, device),
            mlp: mlp(&self.settings, device),
        }
    }
}

/// Self-attention over the decoded tokens, cross-attention into skip tokens, then an MLP.
///
/// Queries come from the decoded tokens, keys and values from the skip.
///
/// # Shapes
///   - x: `[batch_size, num_patches, projection_dim]`
///   - skip: `[batch_size, num_patches, projection_dim]`
///   - output: `[batch_size, num_patches, projection_dim]`
#[derive(Module, Debug)]
pub struct TransformerDecoderBlock<B: Backend> {
    norm1: LayerNorm<B>,
    self_attn: MultiHeadAttention<B>,
    norm2: LayerNorm<B>,
    cross_attn: MultiHeadAttention<B>,
    norm3: LayerNorm<B>,
    mlp: Mlp<B>,
}

impl<B: Backend> TransformerDecoderBlock<B> {
    /// Self-attention over `x`, then cross-attention with `skip` as keys and values.
    ///
    /// # Shapes
    ///   - x, skip: `[batch_size, num_patches, projection_dim]`
    ///   - output: `[batch_size, num_patches, projection_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, skip: Tensor<B, 3>) -> Tensor<B, 3> {
        let attended = self
            .self_attn
            .forward(MhaInput::self_attn(self.norm1.forward(x.clone())))
            .context;
        let x = x + attended;

        let query = self.norm2.forward(x.clone());
        let attended = self
            .cross_attn
            .forward(MhaInput::new(query, skip.clone(), skip))
            .context;
        let x = x + attended;

        x.clone() + self.mlp.forward(self.norm3.forward(x))
    }
}
