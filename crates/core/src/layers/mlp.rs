use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::lora::LinearWithLora;

/// SwiGLU MLP with LoRA-capable projections.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    pub(crate) gate_proj: LinearWithLora,
    pub(crate) up_proj: LinearWithLora,
    pub(crate) down_proj: LinearWithLora,
}

impl SwiGluMlp {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let gate_proj = LinearWithLora::new(hidden_size, intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = LinearWithLora::new(hidden_size, intermediate_size, vb.pp("up_proj"))?;
        let down_proj = LinearWithLora::new(intermediate_size, hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Projection by its PEFT module name (`gate_proj`, `up_proj`, `down_proj`).
    pub fn projection_mut(&mut self, name: &str) -> Option<&mut LinearWithLora> {
        match name {
            "gate_proj" => Some(&mut self.gate_proj),
            "up_proj" => Some(&mut self.up_proj),
            "down_proj" => Some(&mut self.down_proj),
            _ => None,
        }
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self
            .gate_proj
            .forward(xs)?
            .apply(&candle_nn::Activation::Silu)?;
        let up = self.up_proj.forward(xs)?;
        (gate * up)?.apply(&self.down_proj)
    }
}
