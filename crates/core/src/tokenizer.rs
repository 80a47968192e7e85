use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::Tokenizer;

/// Text ↔ token-id codec backed by a HuggingFace `tokenizer.json`.
pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    /// Word-level tokenizer over `t0 .. t{vocab_size-1}` plus one special
    /// end-of-turn token `<|eot_id|>` with id `vocab_size`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;
        use tokenizers::AddedToken;

        let mut vocab = ahash::AHashMap::new();
        for i in 0..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer.add_special_tokens(&[AddedToken::from("<|eot_id|>", true)]);
        Self { inner: tokenizer }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.inner
            .save(path, false)
            .map_err(|e| anyhow::anyhow!("tokenizer save: {e}"))
    }

    /// Encode without adding special tokens; chat templates already emit BOS.
    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode with special tokens suppressed.
    pub fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

// ─── Chat Template ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Renders role-tagged messages through a model's Jinja chat template.
#[derive(Debug, Clone)]
pub struct ChatTemplateEngine {
    template_source: String,
    bos_token: String,
    eos_token: String,
}

#[derive(Deserialize)]
struct TokenizerConfig {
    chat_template: Option<String>,
    #[serde(default)]
    bos_token: SpecialToken,
    #[serde(default)]
    eos_token: SpecialToken,
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Dict {
        content: String,
    },
    #[default]
    None,
}

impl SpecialToken {
    fn as_str(&self) -> &str {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Dict { content } => content,
            SpecialToken::None => "",
        }
    }
}

impl ChatTemplateEngine {
    pub fn new(template_source: String, bos_token: String, eos_token: String) -> Self {
        Self {
            template_source,
            bos_token,
            eos_token,
        }
    }

    /// Read special tokens and the chat template from `tokenizer_config.json`.
    /// A `template_override` replaces the file's template, which may then be
    /// absent.
    pub fn from_tokenizer_config(
        path: &Path,
        template_override: Option<String>,
    ) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TokenizerConfig = serde_json::from_str(&content)?;
        let template_source = template_override
            .or(config.chat_template)
            .ok_or_else(|| anyhow::anyhow!("no chat_template field in tokenizer_config.json"))?;
        Ok(Self {
            template_source,
            bos_token: config.bos_token.as_str().to_string(),
            eos_token: config.eos_token.as_str().to_string(),
        })
    }

    pub fn bos_token(&self) -> &str {
        &self.bos_token
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> anyhow::Result<String> {
        let mut env = minijinja::Environment::new();
        env.add_function("raise_exception", raise_exception);
        env.add_template("chat", &self.template_source)?;
        let tmpl = env.get_template("chat")?;
        let rendered = tmpl.render(minijinja::context! {
            messages => messages,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(rendered)
    }
}

fn raise_exception(message: String) -> Result<String, minijinja::Error> {
    Err(minijinja::Error::new(
        minijinja::ErrorKind::InvalidOperation,
        message,
    ))
}
