//! Shared test utilities for huanchat-core.
//!
//! Model-free stand-ins for every seam of the chat pipeline: a scripted
//! model for the engine, stub generators for the chat service, and a tiny
//! Llama config plus chat template for zero-weight runs, and writers that put
//! a complete zero-weight model and adapter on disk for the loader.

mod fixtures;
mod generators;
mod scripted_model;
mod tiny_config;

pub use fixtures::{write_tiny_adapter, write_tiny_model_dir, TINY_BASE_MODEL};
pub use generators::{FailingGenerator, RecordingGenerator, StaticGenerator};
pub use scripted_model::{ForwardCall, ScriptedModel};
pub use tiny_config::{test_chat_template, tiny_llama_config, LLAMA3_CHAT_TEMPLATE};
