//! Connectivity checks behind `--test`.

use serde::Serialize;
use tracing::{debug, warn};

use crate::review::ReviewClient;
use crate::settings::RunConfig;
use crate::source::GitHubClient;

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl CheckOutcome {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Check the token, GitHub access, the model server and the configured model.
///
/// Checks that depend on an earlier failed one are still reported, as failed,
/// so the caller always sees the full list.
pub async fn check_connectivity(config: &RunConfig, client: &dyn ReviewClient) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::with_capacity(4);

    match config.github_token() {
        Ok(_) => outcomes.push(CheckOutcome::pass("configuration", "GITHUB_TOKEN is set")),
        Err(err) => outcomes.push(CheckOutcome::fail("configuration", err.to_string())),
    }

    let github = match GitHubClient::from_settings(&config.github) {
        Ok(github) => match github.current_user().await {
            Ok(login) => CheckOutcome::pass("GitHub API", format!("authenticated as {login}")),
            Err(err) => {
                warn!(error = %err, "GitHub check failed");
                CheckOutcome::fail("GitHub API", err.to_string())
            }
        },
        Err(err) => CheckOutcome::fail("GitHub API", err.to_string()),
    };
    outcomes.push(github);

    let model = client.model();
    match client.health().await {
        Ok(health) => {
            debug!(models = ?health.available_models, "model server answered");
            outcomes.push(CheckOutcome::pass(
                "model server",
                format!("{} model(s) installed", health.available_models.len()),
            ));
            if health.has_model(model) {
                outcomes.push(CheckOutcome::pass("model", format!("`{model}` is available")));
            } else {
                outcomes.push(CheckOutcome::fail(
                    "model",
                    format!("`{model}` is not installed; run `ollama pull {model}`"),
                ));
            }
        }
        Err(err) => {
            warn!(error = %err, "model server check failed");
            outcomes.push(CheckOutcome::fail(
                "model server",
                format!("{err}; start it with `ollama serve`"),
            ));
            outcomes.push(CheckOutcome::fail("model", "model server unreachable"));
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::OllamaClient;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config(github_url: String, model_url: String, token: Option<&str>) -> RunConfig {
        let mut config = RunConfig::default();
        config.github.api_url = github_url;
        config.github.token = token.map(str::to_string);
        config.model.url = model_url;
        config
    }

    #[tokio::test]
    async fn all_checks_pass() {
        let github = MockServer::start_async().await;
        github
            .mock_async(|when, then| {
                when.method(GET).path("/user").header("authorization", "Bearer t0k");
                then.status(200).json_body(json!({ "login": "octocat" }));
            })
            .await;
        let ollama = MockServer::start_async().await;
        ollama
            .mock_async(|when, then| {
                when.method(GET).path("/api/tags");
                then.status(200)
                    .json_body(json!({ "models": [{ "name": "codellama:latest" }] }));
            })
            .await;

        let config = config(github.base_url(), ollama.base_url(), Some("t0k"));
        let client = OllamaClient::new(&config.model).unwrap();
        let outcomes = check_connectivity(&config, &client).await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|outcome| outcome.ok), "{outcomes:?}");
        assert_eq!(outcomes[1].detail, "authenticated as octocat");
    }

    #[tokio::test]
    async fn missing_model_and_token_are_reported() {
        let ollama = MockServer::start_async().await;
        ollama
            .mock_async(|when, then| {
                when.method(GET).path("/api/tags");
                then.status(200).json_body(json!({ "models": [{ "name": "llama3:8b" }] }));
            })
            .await;

        let config = config("http://127.0.0.1:9".into(), ollama.base_url(), None);
        let client = OllamaClient::new(&config.model).unwrap();
        let outcomes = check_connectivity(&config, &client).await;

        let failed: Vec<_> = outcomes
            .iter()
            .filter(|outcome| !outcome.ok)
            .map(|outcome| outcome.name.as_str())
            .collect();
        assert_eq!(failed, vec!["configuration", "GitHub API", "model"]);
        assert!(outcomes[3].detail.contains("ollama pull codellama"));
    }

    #[tokio::test]
    async fn unreachable_model_server_fails_both_model_checks() {
        let github = MockServer::start_async().await;
        github
            .mock_async(|when, then| {
                when.method(GET).path("/user");
                then.status(401).body("Bad credentials");
            })
            .await;
        let config = config(github.base_url(), "http://127.0.0.1:9".into(), Some("bad"));
        let client = OllamaClient::new(&config.model).unwrap();
        let outcomes = check_connectivity(&config, &client).await;

        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert!(outcomes[2].detail.contains("ollama serve"));
        assert!(!outcomes[3].ok);
    }
}
