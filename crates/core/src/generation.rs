use crate::config::Settings;
use crate::error::ProviderError;
use crate::models::TokenUsage;
use crate::providers::{endpoint, http_client, read_json, require_api_key};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

const TEMPERATURE: f32 = 0.1;

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub instruction: String,
}

/// A retrieved excerpt together with the citation marker the model must quote.
#[derive(Debug, Clone)]
pub struct ContextPassage {
    pub marker: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(
        &self,
        prompt: &Prompt,
        context: &[ContextPassage],
    ) -> Result<Generation, ProviderError>;
}

/// Renders prompt and context into chat messages; every backend sends the same shape.
pub fn chat_messages(prompt: &Prompt, context: &[ContextPassage]) -> Vec<Value> {
    let mut user = String::new();
    if !context.is_empty() {
        user.push_str("Contract excerpts:\n");
        for passage in context {
            user.push_str(&passage.marker);
            user.push('\n');
            user.push_str(passage.text.trim());
            user.push_str("\n\n");
        }
    }
    user.push_str(&prompt.instruction);

    vec![
        json!({ "role": "system", "content": prompt.system }),
        json!({ "role": "user", "content": user }),
    ]
}

fn non_empty(text: String) -> Result<String, ProviderError> {
    if text.trim().is_empty() {
        Err(ProviderError::InvalidResponse(
            "model returned an empty completion".to_string(),
        ))
    } else {
        Ok(text)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

/// Self-hosted Ollama daemon (`POST /api/chat`).
pub struct LocalGenerationProvider {
    client: Client,
    url: Url,
    model: String,
}

impl LocalGenerationProvider {
    pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
        let local = &settings.providers.local;
        Ok(Self {
            client: http_client(settings)?,
            url: endpoint(&local.generation_url, "api/chat")?,
            model: local.generation_model.clone(),
        })
    }
}

#[async_trait]
impl GenerationProvider for LocalGenerationProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        context: &[ContextPassage],
    ) -> Result<Generation, ProviderError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "model": self.model,
                "messages": chat_messages(prompt, context),
                "stream": false,
                "options": { "temperature": TEMPERATURE },
            }))
            .send()
            .await?;

        let parsed: OllamaChatResponse = read_json(response).await?;
        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (Some(prompt_tokens), Some(completion_tokens)) => Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
            }),
            _ => None,
        };

        Ok(Generation {
            text: non_empty(parsed.message.content)?,
            usage,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Hosted OpenAI-compatible chat completions API.
pub struct RemoteGenerationProvider {
    client: Client,
    url: Url,
    api_key: String,
    model: String,
}

impl RemoteGenerationProvider {
    pub fn new(settings: &Settings) -> Result<Self, ProviderError> {
        let remote = &settings.providers.remote;
        Ok(Self {
            client: http_client(settings)?,
            url: endpoint(&remote.base_url, "chat/completions")?,
            api_key: require_api_key(settings)?,
            model: remote.generation_model.clone(),
        })
    }
}

#[async_trait]
impl GenerationProvider for RemoteGenerationProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        context: &[ContextPassage],
    ) -> Result<Generation, ProviderError> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": chat_messages(prompt, context),
                "temperature": TEMPERATURE,
            }))
            .send()
            .await?;

        let parsed: CompletionResponse = read_json(response).await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(Generation {
            text: non_empty(text)?,
            usage: parsed.usage.map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }),
        })
    }
}
