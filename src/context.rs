//! Application state, built once at startup and shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, GuardConfig, LegacyConfig};
use crate::guard::ContentGuardClient;
use crate::router::{BudgetManager, ComplexityScorer, HeuristicScorer, QuotaTracker, RouterConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the smart router needs, bundled once the config document is
/// known to have parsed successfully.
pub struct RouterState {
    pub config: RouterConfig,
    pub budget: BudgetManager,
    pub quota: QuotaTracker,
    /// Falls back to the heuristic length/shape scorer when no external ML
    /// classifier library is wired in — see `router::classifier`.
    pub scorer: Box<dyn ComplexityScorer>,
}

pub struct AppContext {
    pub legacy: LegacyConfig,
    pub guard: GuardConfig,
    pub guard_client: Option<ContentGuardClient>,
    pub router: Option<RouterState>,
    pub http_client: reqwest::Client,
}

impl AppContext {
    /// Builds the shared application context from a loaded [`AppConfig`].
    /// Falls back to legacy (unrouted) operation, logging a warning,
    /// whenever the router is enabled but its config document doesn't
    /// load — a malformed router document must never take the whole proxy
    /// down.
    pub fn build(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        if config.legacy.api_key.is_none() {
            tracing::warn!("LLM_API_KEY is not set; legacy forwarding will fail until a router tier supplies credentials");
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let router = if config.router_enabled {
            let path = config
                .router_config_path
                .as_ref()
                .expect("validated present in AppConfig::from_env");
            match RouterConfig::load_from_path(std::path::Path::new(path))? {
                Some(router_config) => {
                    let budget = BudgetManager::new(router_config.budgets.clone());
                    let quota = QuotaTracker::new(router_config.budgets.max_push_within_minutes);
                    Some(RouterState {
                        config: router_config,
                        budget,
                        quota,
                        scorer: Box::new(HeuristicScorer),
                    })
                }
                None => {
                    tracing::warn!(path, "smart router enabled but config document did not load; falling back to legacy mode");
                    None
                }
            }
        } else {
            None
        };

        let guard_client = match (config.guard.enabled, config.guard.url.clone()) {
            (true, Some(url)) => Some(ContentGuardClient::new(
                http_client.clone(),
                url,
                config.guard.threshold,
            )),
            (true, None) => {
                tracing::warn!("guard enabled but GUARD_URL is unset; external content guard disabled");
                None
            }
            (false, _) => None,
        };

        Ok(Arc::new(Self {
            legacy: config.legacy,
            guard: config.guard,
            guard_client,
            router,
            http_client,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            legacy: LegacyConfig {
                api_base: "https://api.anthropic.com".to_string(),
                api_key: Some("sk-ant-test".to_string()),
                provider: "anthropic".to_string(),
            },
            guard: GuardConfig {
                url: None,
                enabled: false,
                threshold: 0.8,
                hidden_unicode_mode: crate::guard::GuardMode::Strip,
            },
            router_enabled: false,
            router_config_path: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }

    #[test]
    fn builds_in_legacy_only_mode() {
        let ctx = AppContext::build(base_config()).unwrap();
        assert!(ctx.router.is_none());
        assert!(ctx.guard_client.is_none());
    }

    #[test]
    fn router_enabled_with_missing_file_falls_back_to_legacy() {
        let mut config = base_config();
        config.router_enabled = true;
        config.router_config_path = Some("/nonexistent/router.yaml".to_string());
        let ctx = AppContext::build(config).unwrap();
        assert!(ctx.router.is_none());
    }

    #[test]
    fn guard_enabled_without_url_disables_guard_client() {
        let mut config = base_config();
        config.guard.enabled = true;
        let ctx = AppContext::build(config).unwrap();
        assert!(ctx.guard_client.is_none());
    }

    #[test]
    fn guard_enabled_with_url_builds_client() {
        let mut config = base_config();
        config.guard.enabled = true;
        config.guard.url = Some("http://127.0.0.1:9/guard".to_string());
        let ctx = AppContext::build(config).unwrap();
        assert!(ctx.guard_client.is_some());
    }
}
