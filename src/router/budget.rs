//! Rolling-window budget tracking.
//!
//! Holds a FIFO log of [`CostEntry`] guarded by a mutex: one writer, readers
//! contend on the same lock. All derived sums are computed over the window
//! on demand; nothing is pre-aggregated.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::cost;

const MAX_ENTRY_AGE: Duration = Duration::from_secs(31 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Spend limit and warning/downgrade thresholds for one rolling window.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetWindow {
    pub limit_usd: f64,
    #[serde(default = "default_warn_at_pct")]
    pub warn_at_pct: u8,
    #[serde(default = "default_downgrade_at_pct")]
    pub downgrade_at_pct: u8,
}

fn default_warn_at_pct() -> u8 {
    80
}

fn default_downgrade_at_pct() -> u8 {
    90
}

/// What to do when every configured window is over its hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverBudgetAction {
    Allow,
    Reject,
}

impl Default for OverBudgetAction {
    fn default() -> Self {
        OverBudgetAction::Allow
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub hourly: Option<BudgetWindow>,
    #[serde(default)]
    pub daily: Option<BudgetWindow>,
    #[serde(default)]
    pub monthly: Option<BudgetWindow>,
    #[serde(default = "default_downgrade_steps")]
    pub downgrade_steps: usize,
    #[serde(default)]
    pub over_budget_action: OverBudgetAction,
    #[serde(default = "default_max_push_within_minutes")]
    pub max_push_within_minutes: u32,
    #[serde(default)]
    pub max_push_tier: Option<String>,
}

fn default_downgrade_steps() -> usize {
    1
}

fn default_max_push_within_minutes() -> u32 {
    15
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hourly: None,
            daily: None,
            monthly: None,
            downgrade_steps: default_downgrade_steps(),
            over_budget_action: OverBudgetAction::default(),
            max_push_within_minutes: default_max_push_within_minutes(),
            max_push_tier: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WindowStatus {
    pub spend_usd: f64,
    pub limit_usd: f64,
    pub percent: f64,
    pub warning: bool,
    pub downgrade: bool,
    pub over_budget: bool,
}

#[derive(Debug, Serialize)]
pub struct BudgetStatus {
    pub hourly: Option<WindowStatus>,
    pub daily: Option<WindowStatus>,
    pub monthly: Option<WindowStatus>,
    pub is_warning: bool,
    pub should_downgrade: bool,
    pub is_over_budget: bool,
    pub over_budget_action: OverBudgetAction,
}

pub struct BudgetManager {
    config: BudgetConfig,
    log: Mutex<VecDeque<CostEntry>>,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Records a cost entry for `model` given observed token counts, pruning
    /// anything older than the hard 31-day cap, and returns the cost in USD.
    pub async fn record(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost_usd = cost::cost(model, input_tokens, output_tokens);
        let entry = CostEntry {
            timestamp: Utc::now(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
        };
        let mut log = self.log.lock().await;
        log.push_back(entry);
        prune(&mut log);
        cost_usd
    }

    /// Sum of `cost_usd` for entries newer than `now - dur`.
    pub async fn window_spend(&self, dur: Duration) -> f64 {
        let mut log = self.log.lock().await;
        prune(&mut log);
        window_sum(&log, dur)
    }

    pub async fn is_warning(&self) -> bool {
        self.any_window_hits(|w| w.warn_at_pct).await
    }

    pub async fn should_downgrade(&self) -> bool {
        self.any_window_hits(|w| w.downgrade_at_pct).await
    }

    pub async fn is_over_budget(&self) -> bool {
        self.any_window_hits(|_| 100).await
    }

    async fn any_window_hits(&self, pct_of: impl Fn(&BudgetWindow) -> u8) -> bool {
        let mut log = self.log.lock().await;
        prune(&mut log);
        for (window, dur) in self.configured_windows() {
            let spend = window_sum(&log, dur);
            let threshold = window.limit_usd * pct_of(window) as f64 / 100.0;
            if spend >= threshold {
                return true;
            }
        }
        false
    }

    fn configured_windows(&self) -> Vec<(&BudgetWindow, Duration)> {
        let mut out = Vec::with_capacity(3);
        if let Some(w) = &self.config.hourly {
            out.push((w, Duration::from_secs(60 * 60)));
        }
        if let Some(w) = &self.config.daily {
            out.push((w, Duration::from_secs(24 * 60 * 60)));
        }
        if let Some(w) = &self.config.monthly {
            out.push((w, Duration::from_secs(30 * 24 * 60 * 60)));
        }
        out
    }

    pub async fn status(&self) -> BudgetStatus {
        let mut log = self.log.lock().await;
        prune(&mut log);

        let build = |window: &Option<BudgetWindow>, dur: Duration| {
            window.as_ref().map(|w| {
                let spend = window_sum(&log, dur);
                let percent = if w.limit_usd > 0.0 {
                    spend / w.limit_usd * 100.0
                } else {
                    0.0
                };
                WindowStatus {
                    spend_usd: spend,
                    limit_usd: w.limit_usd,
                    percent,
                    warning: spend >= w.limit_usd * w.warn_at_pct as f64 / 100.0,
                    downgrade: spend >= w.limit_usd * w.downgrade_at_pct as f64 / 100.0,
                    over_budget: spend >= w.limit_usd,
                }
            })
        };

        let hourly = build(&self.config.hourly, Duration::from_secs(60 * 60));
        let daily = build(&self.config.daily, Duration::from_secs(24 * 60 * 60));
        let monthly = build(&self.config.monthly, Duration::from_secs(30 * 24 * 60 * 60));

        let is_warning = [&hourly, &daily, &monthly]
            .iter()
            .any(|w| w.as_ref().map(|w| w.warning).unwrap_or(false));
        let should_downgrade = [&hourly, &daily, &monthly]
            .iter()
            .any(|w| w.as_ref().map(|w| w.downgrade).unwrap_or(false));
        let is_over_budget = [&hourly, &daily, &monthly]
            .iter()
            .any(|w| w.as_ref().map(|w| w.over_budget).unwrap_or(false));

        BudgetStatus {
            hourly,
            daily,
            monthly,
            is_warning,
            should_downgrade,
            is_over_budget,
            over_budget_action: self.config.over_budget_action,
        }
    }
}

fn prune(log: &mut VecDeque<CostEntry>) {
    let cutoff = Utc::now() - chrono::Duration::from_std(MAX_ENTRY_AGE).unwrap();
    while let Some(front) = log.front() {
        if front.timestamp < cutoff {
            log.pop_front();
        } else {
            break;
        }
    }
}

fn window_sum(log: &VecDeque<CostEntry>, dur: Duration) -> f64 {
    let cutoff = Utc::now() - chrono::Duration::from_std(dur).unwrap();
    log.iter()
        .filter(|e| e.timestamp >= cutoff)
        .map(|e| e.cost_usd)
        .sum()
}
