//! Billing engine configuration.
//!
//! Loaded once at startup into an immutable object and handed to every
//! service constructor; nothing reads the environment after that.

use std::collections::{HashMap, HashSet};
use std::env;

use serde::Deserialize;
use thiserror::Error;
use time::Duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Setup and renewal prices for one resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CategoryCost {
    pub setup: i64,
    pub renewal: i64,
}

/// Immutable engine configuration.
///
/// Category costs are a typed map keyed by the category tag; resources with
/// no category (or an unknown one) fall back to the global defaults.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Length of one renewal cycle.
    pub renewal_cycle: Duration,
    /// Setup cost for resources with no category entry.
    pub default_setup_cost: i64,
    /// Renewal cost for resources with no category entry.
    pub default_renewal_cost: i64,
    /// Per-category price table.
    pub category_costs: HashMap<String, CategoryCost>,
    /// Setup cost multiplier applied when the premium add-on is requested.
    pub premium_addon_multiplier: f64,
    /// Paid credits granted when an account is opened.
    pub signup_bonus: i64,
    /// Paid balance at or under which a low_balance notification fires.
    pub low_balance_threshold: i64,
    /// Pre-expiry warning window.
    pub warning_window: Duration,
    /// Purposes the free pool may be spent on.
    pub free_credit_purposes: HashSet<String>,
    /// Cron cadence for the hourly renewal sweep.
    pub renewal_sweep_schedule: String,
    /// Cron cadence for the daily expiry-only sweep.
    pub expiry_sweep_schedule: String,
    /// Cron cadence for the daily pre-expiry warning sweep.
    pub warning_sweep_schedule: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        let mut free_credit_purposes = HashSet::new();
        free_credit_purposes.insert("training".to_string());

        Self {
            renewal_cycle: Duration::days(30),
            default_setup_cost: 10,
            default_renewal_cost: 10,
            category_costs: HashMap::new(),
            premium_addon_multiplier: 1.2,
            signup_bonus: 20,
            low_balance_threshold: 5,
            warning_window: Duration::days(3),
            free_credit_purposes,
            renewal_sweep_schedule: "0 0 * * * *".to_string(),
            expiry_sweep_schedule: "0 30 3 * * *".to_string(),
            warning_sweep_schedule: "0 45 8 * * *".to_string(),
        }
    }
}

impl BillingConfig {
    /// Load configuration from `PAGEMINT_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// `PAGEMINT_CATEGORY_COSTS` is a JSON object mapping category tags to
    /// `{"setup": N, "renewal": N}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(days) = read_i64("PAGEMINT_RENEWAL_CYCLE_DAYS")? {
            config.renewal_cycle = Duration::days(days);
        }
        if let Some(v) = read_i64("PAGEMINT_DEFAULT_SETUP_COST")? {
            config.default_setup_cost = v;
        }
        if let Some(v) = read_i64("PAGEMINT_DEFAULT_RENEWAL_COST")? {
            config.default_renewal_cost = v;
        }
        if let Some(v) = read_f64("PAGEMINT_PREMIUM_ADDON_MULTIPLIER")? {
            config.premium_addon_multiplier = v;
        }
        if let Some(v) = read_i64("PAGEMINT_SIGNUP_BONUS")? {
            config.signup_bonus = v;
        }
        if let Some(v) = read_i64("PAGEMINT_LOW_BALANCE_THRESHOLD")? {
            config.low_balance_threshold = v;
        }
        if let Some(days) = read_i64("PAGEMINT_WARNING_WINDOW_DAYS")? {
            config.warning_window = Duration::days(days);
        }

        if let Ok(raw) = env::var("PAGEMINT_CATEGORY_COSTS") {
            config.category_costs =
                serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                    var: "PAGEMINT_CATEGORY_COSTS",
                    message: e.to_string(),
                })?;
        }
        if let Ok(raw) = env::var("PAGEMINT_FREE_CREDIT_PURPOSES") {
            config.free_credit_purposes =
                raw.split(',').map(|p| p.trim().to_string()).collect();
        }
        if let Ok(raw) = env::var("PAGEMINT_RENEWAL_SWEEP_SCHEDULE") {
            config.renewal_sweep_schedule = raw;
        }
        if let Ok(raw) = env::var("PAGEMINT_EXPIRY_SWEEP_SCHEDULE") {
            config.expiry_sweep_schedule = raw;
        }
        if let Ok(raw) = env::var("PAGEMINT_WARNING_SWEEP_SCHEDULE") {
            config.warning_sweep_schedule = raw;
        }

        Ok(config)
    }

    /// Base renewal cost for a category, falling back to the global default.
    pub fn renewal_cost(&self, category: Option<&str>) -> i64 {
        category
            .and_then(|c| self.category_costs.get(c))
            .map(|c| c.renewal)
            .unwrap_or(self.default_renewal_cost)
    }

    /// Setup cost for a category, scaled (and rounded up) by the premium
    /// add-on multiplier when the add-on is requested.
    pub fn setup_cost(&self, category: Option<&str>, premium_addon: bool) -> i64 {
        let base = category
            .and_then(|c| self.category_costs.get(c))
            .map(|c| c.setup)
            .unwrap_or(self.default_setup_cost);
        if premium_addon {
            (base as f64 * self.premium_addon_multiplier).ceil() as i64
        } else {
            base
        }
    }

    /// Whether the free pool may be spent on the given purpose.
    pub fn is_free_credit_purpose(&self, purpose: &str) -> bool {
        self.free_credit_purposes.contains(purpose)
    }
}

fn read_i64(var: &'static str) -> Result<Option<i64>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn read_f64(var: &'static str) -> Result<Option<f64>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
