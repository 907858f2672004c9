use std::time::Duration;

/// Upstream workflow service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Base URL of the workflow service (default: `http://localhost:5001`).
    pub base_url: String,
    /// Bearer API key (default: empty).
    pub api_key: String,
    /// `user` sent upstream when a job carries no user id.
    pub default_user: String,
    /// TCP connect timeout (default: `10` seconds).
    pub connect_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001".into(),
            api_key: String::new(),
            default_user: "research-worker".into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkflowConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `DIFY_URL`                    | `http://localhost:5001` |
    /// | `DIFY_API_KEY`                | (empty)                 |
    /// | `WORKFLOW_CONNECT_TIMEOUT_SECS` | `10`                  |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = std::env::var("DIFY_URL").unwrap_or(defaults.base_url);

        let api_key = std::env::var("DIFY_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("DIFY_API_KEY is not set; upstream requests will be unauthenticated");
        }

        let connect_timeout_secs: u64 = std::env::var("WORKFLOW_CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".into())
            .parse()
            .expect("WORKFLOW_CONNECT_TIMEOUT_SECS must be a valid u64");

        Self {
            base_url,
            api_key,
            default_user: defaults.default_user,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        }
    }
}
