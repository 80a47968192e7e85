//! Core of the huanchat persona chat: a Llama 3.1 base model with an
//! unmerged PEFT LoRA adapter, the persona prompt, and greedy or sampled
//! generation. Transports live in `huanchat-server`.

pub mod chat;
pub mod config;
pub mod engine;
pub mod layers;
pub mod loader;
pub mod lora;
pub mod models;
pub mod prompt;
pub mod sampling;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use chat::{ChatError, ChatService, DEFAULT_MAX_NEW_TOKENS};
pub use loader::{load_chat_model, DeviceSpec, LoadError, LoadOptions, LoadedModel};
pub use prompt::{PromptFormatter, DEFAULT_PERSONA};
