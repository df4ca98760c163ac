//! Typed router configuration: providers, ordered tiers, classifier
//! thresholds, and budgets, loaded from a YAML document with `${VAR}`
//! environment substitution.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde::Deserialize;

use super::budget::BudgetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::Anthropic => write!(f, "anthropic"),
            ProviderType::OpenAi => write!(f, "openai"),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ProviderConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Base URL with any trailing slash removed.
    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierModel {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub extra_params: Option<serde_json::Map<String, serde_json::Value>>,
}

pub type Tier = Vec<TierModel>;

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_router")]
    pub router: String,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<f64>,
    #[serde(default = "default_heuristic_bypass")]
    pub heuristic_bypass: bool,
}

fn default_router() -> String {
    "mf".to_string()
}

fn default_thresholds() -> Vec<f64> {
    vec![0.7, 0.3]
}

fn default_heuristic_bypass() -> bool {
    true
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            router: default_router(),
            thresholds: default_thresholds(),
            heuristic_bypass: default_heuristic_bypass(),
        }
    }
}

/// Raw document shape, deserialized straight off `serde_yaml::Value` after
/// `${VAR}` interpolation. `tiers` loses insertion order through
/// `serde_yaml`'s map representation, so `tier_order` is derived separately
/// by walking the raw mapping before this struct is built.
#[derive(Debug, Clone, Deserialize)]
struct RawRouterConfig {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    default_tier: String,
    #[serde(default)]
    providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    classifier: ClassifierConfig,
    #[serde(default)]
    tiers: HashMap<String, Tier>,
    #[serde(default)]
    budgets: BudgetConfig,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub enabled: bool,
    pub providers: HashMap<String, ProviderConfig>,
    pub classifier: ClassifierConfig,
    pub tiers: HashMap<String, Tier>,
    pub tier_order: Vec<String>,
    pub budgets: BudgetConfig,
    pub default_tier: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterConfigError {
    #[error("failed to read router config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse router config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("router config document root is not a mapping")]
    NotAMapping,
}

fn interpolate_env(value: &str) -> String {
    // ${VAR} substitution; unset vars become empty string, with a warning.
    let re = Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid");
    re.replace_all(value, |caps: &regex::Captures| {
        let var = &caps[1];
        match std::env::var(var) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var, "router config references unset environment variable");
                String::new()
            }
        }
    })
    .into_owned()
}

fn interpolate_recursive(value: serde_yaml::Value) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::String(s) => serde_yaml::Value::String(interpolate_env(&s)),
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                out.insert(interpolate_recursive(k), interpolate_recursive(v));
            }
            serde_yaml::Value::Mapping(out)
        }
        serde_yaml::Value::Sequence(seq) => {
            serde_yaml::Value::Sequence(seq.into_iter().map(interpolate_recursive).collect())
        }
        other => other,
    }
}

fn derive_tier_order(root: &serde_yaml::Value) -> Vec<String> {
    root.get("tiers")
        .and_then(|v| v.as_mapping())
        .map(|mapping| {
            mapping
                .keys()
                .filter_map(|k| k.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

impl RouterConfig {
    /// Loads and validates a config document from `path`. Returns `Ok(None)`
    /// (not an error) when the document is missing, unparseable, or not a
    /// mapping at the root — the proxy degrades to legacy mode rather than
    /// failing to start.
    pub fn load_from_path(path: &std::path::Path) -> Result<Option<Self>, RouterConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RouterConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        Ok(Self::parse(&contents))
    }

    /// Parses a YAML document already read into memory. Returns `None`
    /// (with a logged error) on any parse failure or non-mapping root,
    /// matching the original's `load_config` degrade-gracefully contract.
    pub fn parse(raw_yaml: &str) -> Option<Self> {
        let root: serde_yaml::Value = match serde_yaml::from_str(raw_yaml) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to parse router config document");
                return None;
            }
        };
        if !root.is_mapping() {
            tracing::error!("router config document root is not a mapping");
            return None;
        }

        let tier_order = derive_tier_order(&root);
        let interpolated = interpolate_recursive(root);

        let raw: RawRouterConfig = match serde_yaml::from_value(interpolated) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "failed to deserialize router config document");
                return None;
            }
        };

        let config = RouterConfig {
            enabled: raw.enabled,
            providers: raw.providers,
            classifier: raw.classifier,
            tiers: raw.tiers,
            tier_order,
            budgets: raw.budgets,
            default_tier: raw.default_tier,
        };

        config.validate();
        Some(config)
    }

    /// Non-fatal validation: logs warnings but never prevents startup.
    fn validate(&self) {
        if !self.tier_order.is_empty() && self.classifier.thresholds.len() != self.tier_order.len() - 1 {
            tracing::warn!(
                thresholds = self.classifier.thresholds.len(),
                tiers = self.tier_order.len(),
                "classifier threshold count does not match tier_order length - 1"
            );
        }
        for (tier_name, models) in &self.tiers {
            for model in models {
                if !self.providers.contains_key(&model.provider) {
                    tracing::warn!(
                        tier = tier_name,
                        provider = model.provider,
                        "tier references unknown provider"
                    );
                }
            }
        }
    }

    /// Picks the first `TierModel` in `tier`'s list whose provider is not in
    /// `excluded` and whose provider has a non-empty API key.
    pub fn resolve_target(
        &self,
        tier: &str,
        excluded: &[String],
    ) -> Option<(&ProviderConfig, &str, Option<&serde_json::Map<String, serde_json::Value>>)> {
        let models = self.tiers.get(tier)?;
        for model in models {
            if excluded.iter().any(|p| p == &model.provider) {
                continue;
            }
            let provider = self.providers.get(&model.provider)?;
            if provider.has_credentials() {
                return Some((provider, model.model.as_str(), model.extra_params.as_ref()));
            }
        }
        None
    }

    /// Clamps `tier_order.indexOf(tier) + steps` to the lowest tier; an
    /// unknown tier name is returned unchanged.
    pub fn downgrade_tier(&self, tier: &str, steps: usize) -> String {
        match self.tier_order.iter().position(|t| t == tier) {
            Some(idx) => {
                let new_idx = (idx + steps).min(self.tier_order.len().saturating_sub(1));
                self.tier_order[new_idx].clone()
            }
            None => tier.to_string(),
        }
    }

    /// The last entry in `tier_order`, or `default_tier` if the order is
    /// empty.
    pub fn lowest_tier(&self) -> String {
        self.tier_order
            .last()
            .cloned()
            .unwrap_or_else(|| self.default_tier.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
enabled: true
default_tier: tier2
providers:
  anthropic_main:
    type: anthropic
    base_url: https://api.anthropic.com
    api_key: ${TEST_ANTHROPIC_KEY}
  openai_main:
    type: openai
    base_url: https://api.openai.com
    api_key: sk-test
classifier:
  router: mf
  thresholds: [0.7, 0.3]
  heuristic_bypass: true
tiers:
  tier1:
    - provider: anthropic_main
      model: claude-opus-4-1-20250805
  tier2:
    - provider: anthropic_main
      model: claude-sonnet-4-5-20250929
  tier3:
    - provider: openai_main
      model: gpt-4o-mini
budgets:
  hourly:
    limit_usd: 1.0
    warn_at_pct: 80
    downgrade_at_pct: 90
  downgrade_steps: 1
  over_budget_action: allow
"#;

    #[test]
    fn tier_order_follows_document_order() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let config = RouterConfig::parse(DOC).expect("valid document");
        assert_eq!(config.tier_order, vec!["tier1", "tier2", "tier3"]);
    }

    #[test]
    fn env_interpolation_fills_api_key() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let config = RouterConfig::parse(DOC).expect("valid document");
        assert_eq!(
            config.providers["anthropic_main"].api_key.as_deref(),
            Some("sk-ant-test")
        );
    }

    #[test]
    fn resolve_target_skips_excluded_and_keyless_providers() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "");
        let config = RouterConfig::parse(DOC).expect("valid document");
        // tier1 uses anthropic_main, whose key interpolates to empty here.
        assert!(config.resolve_target("tier1", &[]).is_none());
        let (provider, model, _) = config.resolve_target("tier3", &[]).unwrap();
        assert_eq!(provider.name, "openai_main");
        assert_eq!(model, "gpt-4o-mini");
    }

    #[test]
    fn downgrade_tier_clamps_at_lowest() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let config = RouterConfig::parse(DOC).expect("valid document");
        assert_eq!(config.downgrade_tier("tier2", 1), "tier3");
        assert_eq!(config.downgrade_tier("tier2", 5), "tier3");
    }

    #[test]
    fn downgrade_composition_matches_single_step_sum() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let config = RouterConfig::parse(DOC).expect("valid document");
        let two_step = config.downgrade_tier(&config.downgrade_tier("tier1", 1), 1);
        let combined = config.downgrade_tier("tier1", 2);
        assert_eq!(two_step, combined);
    }

    #[test]
    fn downgrade_unknown_tier_unchanged() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let config = RouterConfig::parse(DOC).expect("valid document");
        assert_eq!(config.downgrade_tier("not-a-tier", 1), "not-a-tier");
    }

    #[test]
    fn lowest_tier_is_last_in_order() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let config = RouterConfig::parse(DOC).expect("valid document");
        assert_eq!(config.lowest_tier(), "tier3");
    }

    #[test]
    fn malformed_document_yields_none() {
        assert!(RouterConfig::parse("not: [valid: yaml: at all").is_none());
    }

    #[test]
    fn non_mapping_root_yields_none() {
        assert!(RouterConfig::parse("- just\n- a\n- list\n").is_none());
    }

    #[test]
    fn load_from_path_reads_a_real_file() {
        std::env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-test");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("router.yaml");
        std::fs::write(&path, DOC).expect("write router config");
        let config = RouterConfig::load_from_path(&path)
            .expect("load succeeds")
            .expect("document parses");
        assert_eq!(config.default_tier, "tier2");
    }

    #[test]
    fn load_from_path_missing_file_yields_none_not_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("does-not-exist.yaml");
        assert!(RouterConfig::load_from_path(&path).expect("not an error").is_none());
    }
}
