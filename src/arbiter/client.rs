use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{ArbiterError, Arbiter, ArbitrationRequest, ArbitrationVerdict};

const INSTRUCTIONS: &str = "You match sports fixtures reported by a data vendor to games in \
a prediction league. For each request decide which candidate game, if any, is the same fixture. \
Team names may be abbreviated, translated, nicknamed or listed in the other order. \
Answer with JSON only, shaped as \
{\"verdicts\":[{\"key\":\"...\",\"game_id\":123,\"confidence\":0.0,\
\"home_confidence\":0.0,\"away_confidence\":0.0}]}. \
Use game_id null when no candidate fits. Confidence is your probability, between 0 and 1, \
that the pairing is right; be conservative.";

/// Arbiter backed by an Ollama-compatible `/api/generate` endpoint.
pub struct LlmArbiter {
    endpoint: String,
    model: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct VerdictEnvelope {
    #[serde(default)]
    verdicts: Vec<ArbitrationVerdict>,
}

impl LlmArbiter {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build arbiter HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        })
    }

    fn build_prompt(requests: &[ArbitrationRequest]) -> Result<String, ArbiterError> {
        let body = serde_json::to_string_pretty(requests)
            .map_err(|e| ArbiterError::ParseError(e.to_string()))?;
        Ok(format!("{}\n\nRequests:\n{}\n", INSTRUCTIONS, body))
    }

    async fn generate(&self, prompt: String) -> Result<String, ArbiterError> {
        let url = format!("{}/api/generate", self.endpoint);
        debug!("Sending arbitration prompt (model: {})", self.model);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt,
            stream: false,
            format: "json",
            options: Some(GenerateOptions {
                temperature: 0.0,
                top_p: 0.9,
                num_predict: Some(2000),
            }),
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ArbiterError::ApiError(format!("{}: {}", status, error_text)));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ArbiterError::ParseError(e.to_string()))?;
        debug!("Arbiter replied ({} chars)", generated.response.len());
        Ok(generated.response)
    }
}

/// Pull the verdict list out of a model reply. Models wrap JSON in prose or
/// code fences, so only the outermost object is parsed.
pub(crate) fn parse_verdicts(reply: &str) -> Result<Vec<ArbitrationVerdict>, ArbiterError> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(ArbiterError::ParseError("no JSON object in reply".into()));
    };
    if end < start {
        return Err(ArbiterError::ParseError("no JSON object in reply".into()));
    }
    let envelope: VerdictEnvelope = serde_json::from_str(&reply[start..=end])
        .map_err(|e| ArbiterError::ParseError(e.to_string()))?;
    Ok(envelope.verdicts)
}

#[async_trait]
impl Arbiter for LlmArbiter {
    fn name(&self) -> &str {
        &self.model
    }

    async fn arbitrate(
        &self,
        requests: &[ArbitrationRequest],
    ) -> Result<Vec<ArbitrationVerdict>, ArbiterError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = Self::build_prompt(requests)?;
        let reply = self.generate(prompt).await?;
        parse_verdicts(&reply)
    }
}
