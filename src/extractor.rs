//! LLM-backed structured extractor.
//!
//! Calls an OpenAI-compatible chat-completions endpoint and parses the
//! model's JSON reply into an [`ExtractorOutput`]. The chat engine treats
//! every error here as recoverable, so this module just propagates them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::schema;
use crate::traits::Extractor;
use crate::types::{ChatMessage, ExtractorOutput, Task, TaskDraft, TaskKind};

pub struct LlmExtractor {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

/// HTTPS is required for remote endpoints so the API key is never sent in
/// cleartext; plain HTTP is allowed only for localhost LLM servers.
fn validate_base_url(base_url: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| anyhow::anyhow!("Invalid base_url '{}': {}", base_url, e))?;
    let host = parsed.host_str().unwrap_or("");
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if host == "localhost" || host == "127.0.0.1" || host == "[::1]" => {
            warn!("Using unencrypted HTTP for local LLM server at '{}'", base_url);
            Ok(())
        }
        scheme => anyhow::bail!(
            "Unsupported scheme '{}' in base_url '{}': use https (or http for localhost)",
            scheme,
            base_url
        ),
    }
}

impl LlmExtractor {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        validate_base_url(&config.base_url)?;
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    fn system_prompt(draft: &TaskDraft, reference: Option<&Task>) -> String {
        let mut prompt = String::from(
            "You turn a task-planning conversation into one JSON object and nothing else.\n\
             Fields: kind (todo|event|habit|reminder), title, summary, data (object),\n\
             is_update (bool), reply (short acknowledgement),\n\
             missing_fields (array of {field, reason, question}), validation_errors (array of strings).\n\
             All datetimes are RFC3339 UTC. Omit fields you cannot fill.\n\n\
             Schema per kind:\n",
        );
        for kind in [
            TaskKind::Todo,
            TaskKind::Event,
            TaskKind::Habit,
            TaskKind::Reminder,
        ] {
            prompt.push_str(&format!(
                "- {}: required [{}], optional [{}]\n",
                kind,
                schema::required_fields(kind).join(", "),
                schema::optional_fields(kind).join(", "),
            ));
        }
        if !draft.data.is_empty() || !draft.title.is_empty() {
            prompt.push_str(&format!(
                "\nCurrent draft (merge into, do not restate): {}\n",
                serde_json::to_string(draft).unwrap_or_default()
            ));
        }
        if let Some(task) = reference {
            prompt.push_str(&format!(
                "\nThe user recently created this task. If the new message modifies it \
                 rather than describing something new, set is_update to true and put only \
                 the changed fields in data:\n{}\n",
                serde_json::to_string(task).unwrap_or_default()
            ));
        }
        prompt
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        history: &[ChatMessage],
        draft: &TaskDraft,
        reference: Option<&Task>,
    ) -> anyhow::Result<ExtractorOutput> {
        let mut messages = vec![json!({
            "role": "system",
            "content": Self::system_prompt(draft, reference),
        })];
        for msg in history {
            messages.push(json!({"role": msg.role, "content": msg.content}));
        }

        let body = json!({
            "model": self.model,
            "messages": messages,
            "response_format": {"type": "json_object"},
        });

        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %self.model, turns = history.len(), "Calling extractor LLM");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            anyhow::bail!("Extractor API error ({}): {}", status, text);
        }

        let data: Value = serde_json::from_str(&text)?;
        let content = data["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| anyhow::anyhow!("No content in extractor response"))?;

        debug!("Extractor raw output: {}", content);
        parse_output(content)
    }
}

/// Parse the model's reply, tolerating markdown code fences around the JSON.
fn parse_output(content: &str) -> anyhow::Result<ExtractorOutput> {
    let trimmed = strip_code_fences(content);
    serde_json::from_str(trimmed)
        .map_err(|e| anyhow::anyhow!("Extractor returned unparseable JSON: {}", e))
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
