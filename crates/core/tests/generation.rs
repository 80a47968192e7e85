//! End-to-end chat pipeline tests: prompt formatting, generation and decoding
//! against scripted and zero-weight models. CPU-only, tiny configurations.

use std::sync::Arc;

use candle_core::DType;
use huanchat_core::engine::{FinishReason, GenerationRequest, LlmEngine, TextGenerator};
use huanchat_core::loader::{load_chat_model, DeviceSpec, LoadOptions};
use huanchat_core::sampling::SamplingParams;
use huanchat_core::testing::{
    test_chat_template, write_tiny_adapter, write_tiny_model_dir, RecordingGenerator,
    ScriptedModel,
};
use huanchat_core::tokenizer::TokenizerWrapper;
use huanchat_core::{ChatService, PromptFormatter, DEFAULT_MAX_NEW_TOKENS};

const EOT: u32 = 32;

fn scripted_chat(script: Vec<u32>) -> ChatService {
    let tokenizer = Arc::new(TokenizerWrapper::for_testing(32));
    let engine = LlmEngine::new(ScriptedModel::new(33, script), tokenizer, vec![EOT]);
    ChatService::new(
        PromptFormatter::new(Arc::new(test_chat_template())),
        Arc::new(engine),
    )
}

#[test]
fn reply_contains_only_new_tokens() {
    let chat = scripted_chat(vec![7, 8, 9, EOT]);
    let reply = chat.reply("t1 t2 t3").unwrap();
    assert_eq!(reply, "t7 t8 t9");
    for echoed in ["t1", "t2", "t3", "system", "user"] {
        assert!(!reply.contains(echoed), "reply echoed {echoed}: {reply}");
    }
}

#[test]
fn stop_token_is_not_decoded() {
    let chat = scripted_chat(vec![EOT]);
    assert_eq!(chat.reply("t4").unwrap(), "");
}

#[test]
fn engine_reports_prompt_length_and_finish_reason() {
    let tokenizer = Arc::new(TokenizerWrapper::for_testing(32));
    let engine = LlmEngine::new(ScriptedModel::new(33, vec![5, 6]), tokenizer, vec![EOT]);

    let result = engine
        .generate(&GenerationRequest::new("t1 t2 t3 t4", 3, SamplingParams::greedy()))
        .unwrap();
    assert_eq!(result.prompt_len, 4);
    assert_eq!(result.generated_token_ids, vec![5, 6, 6]);
    assert_eq!(result.finish_reason, FinishReason::Length);
}

#[test]
fn token_budget_is_independent_of_prompt_length() {
    let recorder = RecordingGenerator::new("嗯");
    let chat = ChatService::new(
        PromptFormatter::new(Arc::new(test_chat_template())),
        Arc::new(recorder.clone()),
    );

    chat.reply("短").unwrap();
    chat.reply(&"很长的输入".repeat(2000)).unwrap();

    let requests = recorder.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.max_new_tokens == DEFAULT_MAX_NEW_TOKENS));
    assert_eq!(DEFAULT_MAX_NEW_TOKENS, 512);
}

#[test]
fn zero_weight_model_replies_deterministically() {
    let model_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    write_tiny_model_dir(model_dir.path()).unwrap();
    write_tiny_adapter(adapter_dir.path(), &[0, 1]).unwrap();

    let opts = LoadOptions {
        model: model_dir.path().to_string_lossy().into_owned(),
        adapter: adapter_dir.path().to_path_buf(),
        chat_template_path: None,
        dtype: DType::F32,
        device: DeviceSpec::Cpu,
    };
    let chat = load_chat_model(&opts)
        .unwrap()
        .into_chat_service("假设你是皇帝身边的女人--甄嬛。", 16, Some(0));

    let first = chat.reply("t1 t2").unwrap();
    let second = chat.reply("t1 t2").unwrap();
    assert_eq!(first, second);
}
