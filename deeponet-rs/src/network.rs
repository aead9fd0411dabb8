//! Feed-forward network block used for both branch and trunk.
//!
//! Parameters are candle [`Var`]s so gradients flow through `loss.backward()`.
//! Initialization draws from an explicit [`ChaCha8Rng`]; candle's global
//! generator is never touched.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeepOnetError, Result};

/// Hidden-layer activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// max(0, x)
    #[default]
    Relu,
    /// tanh(x)
    Tanh,
    /// Gaussian error linear unit.
    Gelu,
    /// sin(x), useful for oscillatory fields.
    Sin,
}

impl Activation {
    /// Apply the activation element-wise.
    pub fn apply(self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Tanh => x.tanh(),
            Self::Gelu => x.gelu(),
            Self::Sin => x.sin(),
        }
    }
}

/// Uniform Kaiming (He) initialization for a `(rows, cols)` matrix.
///
/// Bound is `sqrt(6 / fan_in)` with `fan_in = cols`.
pub fn kaiming_uniform(
    rows: usize,
    cols: usize,
    dtype: DType,
    device: &Device,
    rng: &mut ChaCha8Rng,
) -> Result<Tensor> {
    if cols == 0 {
        return Err(DeepOnetError::config("kaiming_uniform needs fan_in > 0"));
    }
    let bound = (6.0 / cols as f64).sqrt();
    let data: Vec<f64> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

fn glorot_uniform(
    fan_out: usize,
    fan_in: usize,
    dtype: DType,
    device: &Device,
    rng: &mut ChaCha8Rng,
) -> Result<Tensor> {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let data: Vec<f64> = (0..fan_out * fan_in)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(data, (fan_out, fan_in), device)?.to_dtype(dtype)?)
}

/// One dense layer: a candle [`Linear`] over the weight and bias [`Var`]s.
///
/// The `Linear` holds the same storage as the vars, so optimizer steps on
/// the vars are seen by the forward pass.
struct Dense {
    linear: Linear,
    weight: Var,
    bias: Var,
}

impl Dense {
    fn new(weight: Var, bias: Var) -> Self {
        let linear = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Self {
            linear,
            weight,
            bias,
        }
    }
}

/// Multi-layer perceptron with activations between layers and a linear head.
///
/// `layer_sizes = [in, h1, ..., out]`; the activation is applied after every
/// layer except the last.
pub struct Mlp {
    layers: Vec<Dense>,
    layer_sizes: Vec<usize>,
    activation: Activation,
    trainable: bool,
}

impl std::fmt::Debug for Mlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mlp")
            .field("layer_sizes", &self.layer_sizes)
            .field("activation", &self.activation)
            .field("trainable", &self.trainable)
            .finish()
    }
}

impl Mlp {
    /// Build a network with Glorot-uniform weights and zero biases.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two layer sizes are given or any size is zero.
    pub fn new(
        layer_sizes: &[usize],
        activation: Activation,
        dtype: DType,
        device: &Device,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        if layer_sizes.len() < 2 {
            return Err(DeepOnetError::config(format!(
                "network needs at least an input and an output size, got {layer_sizes:?}"
            )));
        }
        if layer_sizes.contains(&0) {
            return Err(DeepOnetError::config(format!(
                "layer sizes must be positive, got {layer_sizes:?}"
            )));
        }

        let mut layers = Vec::with_capacity(layer_sizes.len() - 1);
        for pair in layer_sizes.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let w = glorot_uniform(fan_out, fan_in, dtype, device, rng)?;
            layers.push(Dense::new(
                Var::from_tensor(&w)?,
                Var::zeros(fan_out, dtype, device)?,
            ));
        }

        Ok(Self {
            layers,
            layer_sizes: layer_sizes.to_vec(),
            activation,
            trainable: true,
        })
    }

    /// Forward pass: `(batch, in) → (batch, out)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(Module::forward(self, x)?)
    }

    /// All parameters, weights first then biases per layer.
    #[must_use]
    pub fn vars(&self) -> Vec<Var> {
        self.layers
            .iter()
            .flat_map(|l| [l.weight.clone(), l.bias.clone()])
            .collect()
    }

    /// Parameters that should receive optimizer updates.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        if self.trainable {
            self.vars()
        } else {
            Vec::new()
        }
    }

    /// Mark the block trainable or frozen.
    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Whether the block currently receives updates.
    #[must_use]
    pub const fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Input feature count.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.layer_sizes[0]
    }

    /// Output feature count.
    #[must_use]
    pub fn output_size(&self) -> usize {
        self.layer_sizes[self.layer_sizes.len() - 1]
    }

    /// Layer sizes including input and output.
    #[must_use]
    pub fn layer_sizes(&self) -> &[usize] {
        &self.layer_sizes
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.linear.forward(&h)?;
            if i < last {
                h = self.activation.apply(&h)?;
            }
        }
        Ok(h)
    }
}
