//! Configuration for the orchestrator, the judge and the registry bridge.

use std::time::Duration;

/// Container naming and workload defaults
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Name of the single workload container on each VM
    pub container_name: String,
    /// Image tag built from the Dockerfile
    pub image_name: String,
    /// Remote directory (relative to the login home) holding the Dockerfile
    pub work_dir: String,
    /// Port exposed when the caller does not pick one
    pub default_port: u16,
    /// Token spliced into `git clone https://github.com/` lines of uploaded Dockerfiles
    pub github_token: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            container_name: "my-ubuntu-container".to_string(),
            image_name: "my-ubuntu-image".to_string(),
            work_dir: "ubuntu-docker".to_string(),
            default_port: 3000,
            github_token: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        OrchestratorConfig {
            github_token: std::env::var("GITHUB_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            ..Self::default()
        }
    }

    pub fn with_github_token(mut self, token: &str) -> Self {
        self.github_token = Some(token.to_string());
        self
    }

    pub fn with_work_dir(mut self, dir: &str) -> Self {
        self.work_dir = dir.to_string();
        self
    }

    /// Remote path of the uploaded Dockerfile.
    pub fn remote_dockerfile(&self) -> String {
        format!("~/{}/Dockerfile", self.work_dir.trim_matches('/'))
    }
}

/// OpenAI-compatible chat-completions judge
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Full chat-completions endpoint URL
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Hard limit for one judge call; expiry falls back to the heuristics
    pub timeout: Duration,
}

impl JudgeConfig {
    /// Judge settings from the environment, or `None` when no endpoint is set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("MINERPOOL_JUDGE_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())?;
        let mut config = Self::new(&url);
        config.api_key = std::env::var("MINERPOOL_JUDGE_API_KEY").ok();
        if let Ok(model) = std::env::var("MINERPOOL_JUDGE_MODEL") {
            config.model = model;
        }
        Some(config)
    }

    pub fn new(url: &str) -> Self {
        JudgeConfig {
            url: url.to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(8),
        }
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// External registry endpoint and topic ids
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub base_url: String,
    /// Topic receiving allocation and termination records
    pub allocation_topic: String,
    /// Topic receiving score batches
    pub score_topic: String,
    pub request_timeout: Duration,
}

impl RegistryConfig {
    /// Registry settings from the environment, or `None` when no endpoint is set.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("MINERPOOL_REGISTRY_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())?;
        let mut config = Self::new(&base_url);
        if let Ok(topic) = std::env::var("MINERPOOL_ALLOCATION_TOPIC") {
            config.allocation_topic = topic;
        }
        if let Ok(topic) = std::env::var("MINERPOOL_SCORE_TOPIC") {
            config.score_topic = topic;
        }
        Some(config)
    }

    pub fn new(base_url: &str) -> Self {
        RegistryConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            allocation_topic: "0.0.6917106".to_string(),
            score_topic: "0.0.6916998".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_topics(mut self, allocation_topic: &str, score_topic: &str) -> Self {
        self.allocation_topic = allocation_topic.to_string();
        self.score_topic = score_topic.to_string();
        self
    }
}
