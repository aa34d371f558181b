use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ModelHealth, ReviewClient};
use crate::error::{ReviewError, Service};
use crate::settings::ModelSettings;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Native Ollama API request for a single non-streamed completion.
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Client for a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(settings: &ModelSettings) -> Result<Self, ReviewError> {
        let http = Client::builder()
            .user_agent(concat!("llm-review/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .map_err(|err| ReviewError::Config(format!("failed to build model client: {err}")))?;
        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, err: reqwest::Error) -> ReviewError {
        if err.is_timeout() {
            ReviewError::Timeout(format!("model request to {}", self.base_url))
        } else if err.is_connect() {
            ReviewError::ServiceUnavailable(format!(
                "cannot reach Ollama at {} ({err}); start it with `ollama serve`",
                self.base_url
            ))
        } else {
            ReviewError::Network(format!("model request to {}: {err}", self.base_url))
        }
    }

    fn status_error(&self, status: StatusCode, body: String) -> ReviewError {
        if status == StatusCode::NOT_FOUND {
            return ReviewError::NotFound(format!(
                "model `{}`; pull it with `ollama pull {}`",
                self.model, self.model
            ));
        }
        ReviewError::Api {
            service: Service::Model,
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl ReviewClient for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Result<ModelHealth, ReviewError> {
        let response = self
            .http
            .get(self.url("/api/tags"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|err| match self.transport_error(err) {
                ReviewError::Timeout(msg) | ReviewError::Network(msg) => {
                    ReviewError::ServiceUnavailable(msg)
                }
                other => other,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReviewError::ServiceUnavailable(format!(
                "Ollama at {} answered {status} to the model list request",
                self.base_url
            )));
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| ReviewError::Decode(format!("Ollama model list: {err}")))?;
        Ok(ModelHealth {
            available_models: tags.models.into_iter().map(|entry| entry.name).collect(),
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String, ReviewError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: 0.1,
                top_p: 0.9,
            },
        };
        debug!(model = %self.model, prompt_chars = prompt.len(), "model request");
        let response = self
            .http
            .post(self.url("/api/generate"))
            .json(&request)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, body));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ReviewError::Decode(format!("model response: {err}")))?;
        let text = body.response.trim();
        if text.is_empty() {
            return Err(ReviewError::Decode("model response: empty text".into()));
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn settings(url: String) -> ModelSettings {
        ModelSettings {
            url,
            model: "codellama".into(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn generate_sends_native_request() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate").json_body_partial(
                    r#"{"model": "codellama", "stream": false, "options": {"temperature": 0.1}}"#,
                );
                then.status(200)
                    .json_body(json!({ "response": "  looks good  ", "done": true }));
            })
            .await;
        let client = OllamaClient::new(&settings(server.base_url())).unwrap();
        let text = client.generate("review this").await.unwrap();
        assert_eq!(text, "looks good");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_missing_model_is_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate").body_contains("first");
                then.status(503).body("loading");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate").body_contains("second");
                then.status(404).json_body(json!({ "error": "model not found" }));
            })
            .await;
        let client = OllamaClient::new(&settings(server.base_url())).unwrap();

        let err = client.generate("first").await.unwrap_err();
        assert!(err.is_transient());
        let err = client.generate("second").await.unwrap_err();
        assert!(matches!(err, ReviewError::NotFound(ref msg) if msg.contains("ollama pull")));
    }

    #[tokio::test]
    async fn empty_response_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).json_body(json!({ "response": "" }));
            })
            .await;
        let client = OllamaClient::new(&settings(server.base_url())).unwrap();
        assert!(matches!(
            client.generate("x").await,
            Err(ReviewError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn health_lists_models() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/tags");
                then.status(200).json_body(json!({
                    "models": [{ "name": "codellama:latest" }, { "name": "llama3:8b" }]
                }));
            })
            .await;
        let client = OllamaClient::new(&settings(format!("{}/", server.base_url()))).unwrap();
        let health = client.health().await.unwrap();
        assert!(health.has_model("codellama"));
        assert!(health.has_model("llama3:8b"));
        assert!(!health.has_model("mistral"));
    }

    #[tokio::test]
    async fn unreachable_server_is_service_unavailable() {
        let client = OllamaClient::new(&settings("http://127.0.0.1:9".into())).unwrap();
        assert!(matches!(
            client.health().await,
            Err(ReviewError::ServiceUnavailable(_))
        ));
        let err = client.generate("x").await.unwrap_err();
        assert!(err.is_terminal());
    }
}
