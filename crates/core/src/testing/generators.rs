use std::sync::{Arc, Mutex};

use crate::engine::{
    EngineError, FinishReason, GenerationRequest, GenerationResult, TextGenerator,
};

/// Always answers with the same text.
pub struct StaticGenerator {
    reply: String,
}

impl StaticGenerator {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl TextGenerator for StaticGenerator {
    fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResult, EngineError> {
        Ok(GenerationResult {
            generated_text: self.reply.clone(),
            generated_token_ids: Vec::new(),
            prompt_len: 0,
            finish_reason: FinishReason::Eos,
        })
    }
}

/// Records every request it receives and answers with a fixed reply.
#[derive(Clone)]
pub struct RecordingGenerator {
    reply: String,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl RecordingGenerator {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl TextGenerator for RecordingGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, EngineError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        Ok(GenerationResult {
            generated_text: self.reply.clone(),
            generated_token_ids: Vec::new(),
            prompt_len: 0,
            finish_reason: FinishReason::Eos,
        })
    }
}

/// Fails every call with a model error.
pub struct FailingGenerator {
    message: String,
}

impl FailingGenerator {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl TextGenerator for FailingGenerator {
    fn generate(&self, _request: &GenerationRequest) -> Result<GenerationResult, EngineError> {
        Err(EngineError::Model(self.message.clone()))
    }
}
