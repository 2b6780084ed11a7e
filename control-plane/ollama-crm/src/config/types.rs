use std::time::Duration;

use envconfig::Envconfig;

use crate::templates::DEFAULT_SERVER_IMAGE;

#[derive(Envconfig, Clone, Debug)]
pub struct CrmConfig {
    /// Container image for the model server. Falls back to the built-in
    /// default when unset or empty.
    /// Env: OLLAMA_CONTAINER_IMAGE
    #[envconfig(from = "OLLAMA_CONTAINER_IMAGE")]
    pub server_image_override: Option<String>,

    /// Restrict watches to one namespace; all namespaces when unset.
    /// Env: OLLAMA_CRM_K8S_NAMESPACE
    #[envconfig(from = "OLLAMA_CRM_K8S_NAMESPACE")]
    pub k8s_namespace: Option<String>,

    #[envconfig(nested)]
    pub backoff: BackoffConfig,

    /// Max reconciliations in flight across distinct keys (0 = unbounded).
    /// Env: OLLAMA_CRM_CONCURRENCY
    #[envconfig(from = "OLLAMA_CRM_CONCURRENCY", default = "0")]
    pub concurrency: u16,
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackoffConfig {
    /// First retry delay after a failed reconciliation.
    /// Env: OLLAMA_CRM_BACKOFF_BASE_MS
    #[envconfig(from = "OLLAMA_CRM_BACKOFF_BASE_MS", default = "500")]
    pub base_ms: u64,
    /// Upper bound for the retry delay.
    /// Env: OLLAMA_CRM_BACKOFF_MAX_SECS
    #[envconfig(from = "OLLAMA_CRM_BACKOFF_MAX_SECS", default = "300")]
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_secs: 300,
        }
    }
}

impl BackoffConfig {
    /// Delay before the next attempt after `failures` consecutive failures
    /// (1-based). Doubles per failure and saturates at `max_secs`.
    pub fn delay(&self, failures: u32) -> Duration {
        let max = Duration::from_secs(self.max_secs);
        let exp = failures.saturating_sub(1).min(31);
        let delay = Duration::from_millis(self.base_ms)
            .checked_mul(1u32 << exp)
            .unwrap_or(max);
        delay.min(max)
    }
}

impl CrmConfig {
    pub fn server_image(&self) -> &str {
        self.server_image_override
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVER_IMAGE)
    }
}
