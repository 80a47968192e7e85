//! Linear projection with an optional, unmerged LoRA adapter.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::types::LoraAdapter;

/// ```text
/// output = base_linear(x) + scale * (x @ lora_a.T @ lora_b.T)
/// ```
///
/// The base weight is never modified; detaching the adapter restores the
/// base model exactly.
#[derive(Debug, Clone)]
pub struct LinearWithLora {
    base: Linear,
    adapter: Option<LoraAdapter>,
}

impl LinearWithLora {
    pub fn from_linear(base: Linear) -> Self {
        Self {
            base,
            adapter: None,
        }
    }

    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let base = linear_no_bias(in_features, out_features, vb)?;
        Ok(Self::from_linear(base))
    }

    pub fn in_features(&self) -> usize {
        self.base.weight().dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.base.weight().dims()[0]
    }

    /// Attach an adapter, replacing any previous one. Dimensions must match
    /// the base weight.
    pub fn set_adapter(&mut self, adapter: LoraAdapter) -> Result<()> {
        if adapter.input_dim() != self.in_features() || adapter.output_dim() != self.out_features()
        {
            candle_core::bail!(
                "LoRA adapter [{} -> {}] does not fit linear [{} -> {}]",
                adapter.input_dim(),
                adapter.output_dim(),
                self.in_features(),
                self.out_features()
            );
        }
        let adapter = LoraAdapter {
            lora_a: adapter.lora_a.to_dtype(self.base.weight().dtype())?,
            lora_b: adapter.lora_b.to_dtype(self.base.weight().dtype())?,
            ..adapter
        };
        self.adapter = Some(adapter);
        Ok(())
    }

    pub fn take_adapter(&mut self) -> Option<LoraAdapter> {
        self.adapter.take()
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn weight(&self) -> &Tensor {
        self.base.weight()
    }

    /// scale * (x @ lora_a.T @ lora_b.T), for 2D or 3D `x`.
    fn apply_lora(x: &Tensor, adapter: &LoraAdapter) -> Result<Tensor> {
        let x_dims = x.dims().to_vec();
        let in_features = x_dims[x_dims.len() - 1];
        let rows: usize = x_dims[..x_dims.len() - 1].iter().product();
        let x_2d = x.reshape((rows, in_features))?;

        let intermediate = x_2d.matmul(&adapter.lora_a.t()?)?;
        let lora_output = intermediate.matmul(&adapter.lora_b.t()?)?;

        let scaled = if (adapter.scale - 1.0).abs() > f32::EPSILON {
            lora_output.affine(adapter.scale as f64, 0.0)?
        } else {
            lora_output
        };

        let mut out_dims = x_dims;
        if let Some(last) = out_dims.last_mut() {
            *last = adapter.output_dim();
        }
        scaled.reshape(out_dims)
    }
}

impl Module for LinearWithLora {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let output = self.base.forward(x)?;
        match &self.adapter {
            Some(adapter) => output.add(&Self::apply_lora(x, adapter)?),
            None => Ok(output),
        }
    }
}
