//! Generation adapters.
//!
//! | Config Value | Adapter |
//! |-------------|---------|
//! | `"none"` | [`ExtractiveGenerator`]: returns the best passages verbatim |
//! | `"ollama"` | [`OllamaGenerator`]: `POST /api/generate` on a local Ollama |
//!
//! Both receive the question and the already-budgeted context blocks from
//! the query orchestrator; neither sees the index.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use localrag_core::query::{render_context, ContextBlock, Generator};

use crate::config::GenerationConfig;

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "none" => Ok(Arc::new(ExtractiveGenerator::default())),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Build the prompt sent to a language model.
pub fn build_prompt(question: &str, context: &[ContextBlock]) -> String {
    format!(
        "Context from documents:\n{}\n\nQuestion: {}\n\nAnswer based on the context above:",
        render_context(context),
        question.trim()
    )
}

// ============ Extractive ============

/// Answers with the top passages themselves.
pub struct ExtractiveGenerator {
    max_passages: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self { max_passages: 3 }
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, _question: &str, context: &[ContextBlock]) -> Result<String> {
        let take = context.len().min(self.max_passages);
        Ok(render_context(&context[..take]))
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    name: String,
    model: String,
    url: String,
    system_prompt: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            name: format!("ollama:{}", model),
            model,
            url: url.trim_end_matches('/').to_string(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, question: &str, context: &[ContextBlock]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "system": self.system_prompt,
            "prompt": build_prompt(question, context),
            "stream": false,
            "options": {
                "num_predict": self.max_tokens,
                "temperature": self.temperature,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Ollama connection error (is it running at {}?)", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let answer = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))?;
        debug!(model = %self.model, chars = answer.len(), "generated answer");
        Ok(answer.trim().to_string())
    }
}
