pub mod attention;
pub mod mask;
pub mod mlp;
pub mod rotary;

pub use attention::{grouped_attention, repeat_kv, KvCache};
pub use mask::causal_mask;
pub use mlp::SwiGluMlp;
pub use rotary::RotaryEmbedding;
