//! Cost accounting: per-model USD rates, per-block accumulation, and a
//! per-user daily total backing budget enforcement.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use mnemo_core::config::CostConfig;
use mnemo_core::error::MnemoError;
use mnemo_core::types::UserId;
use mnemo_provider::Usage;

/// USD per million tokens, by token class.
#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

/// Per-user overrides of the global cost policy. `None` falls back to the
/// configured default.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserCostSettings {
    pub daily_budget_usd: Option<f64>,
    pub per_session_threshold_usd: Option<f64>,
}

fn default_rates() -> HashMap<String, ModelRate> {
    let mut rates = HashMap::new();
    rates.insert(
        "claude-sonnet-4-6".to_string(),
        ModelRate {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_per_mtok: 0.30,
            cache_write_per_mtok: 3.75,
        },
    );
    rates.insert(
        "claude-haiku-4-5".to_string(),
        ModelRate {
            input_per_mtok: 1.0,
            output_per_mtok: 5.0,
            cache_read_per_mtok: 0.10,
            cache_write_per_mtok: 1.25,
        },
    );
    rates
}

const FALLBACK_RATE: ModelRate = ModelRate {
    input_per_mtok: 3.0,
    output_per_mtok: 15.0,
    cache_read_per_mtok: 0.30,
    cache_write_per_mtok: 3.75,
};

/// Tracks spend. Daily totals live in memory keyed by UTC day and are
/// flushed to SQLite on shutdown so budgets survive restarts.
///
/// Budget semantics: the daily budget, once met, rejects new chats with a
/// typed error; the per-session threshold only surfaces a warning event.
pub struct CostAccountant {
    db: Mutex<Connection>,
    rates: HashMap<String, ModelRate>,
    /// (user_id, yyyy-mm-dd) → USD spent.
    daily: DashMap<(i64, String), f64>,
    /// Per-user policy overrides, cached over the settings table.
    settings: DashMap<i64, UserCostSettings>,
    config: CostConfig,
}

impl CostAccountant {
    pub fn new(conn: Connection, config: CostConfig) -> Result<Self, MnemoError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cost_daily (
                user_id  INTEGER NOT NULL,
                day      TEXT NOT NULL,
                cost_usd REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day)
            );
            CREATE TABLE IF NOT EXISTS user_cost_settings (
                user_id                   INTEGER PRIMARY KEY,
                daily_budget_usd          REAL,
                per_session_threshold_usd REAL
            );",
        )
        .map_err(|e| MnemoError::Database(e.to_string()))?;
        Ok(Self {
            db: Mutex::new(conn),
            rates: default_rates(),
            daily: DashMap::new(),
            settings: DashMap::new(),
            config,
        })
    }

    /// USD cost of one LLM response.
    pub fn cost_of(&self, model: &str, usage: &Usage) -> f64 {
        let rate = self.rates.get(model).copied().unwrap_or(FALLBACK_RATE);
        (usage.input_tokens as f64 * rate.input_per_mtok
            + usage.output_tokens as f64 * rate.output_per_mtok
            + usage.cache_read_tokens as f64 * rate.cache_read_per_mtok
            + usage.cache_write_tokens as f64 * rate.cache_write_per_mtok)
            / 1_000_000.0
    }

    /// Add a finished call's cost to the user's running daily total.
    pub fn charge(&self, user_id: UserId, model: &str, usage: &Usage) -> f64 {
        let cost = self.cost_of(model, usage);
        let key = (user_id.as_i64(), today());
        let loaded = self.load_day(key.0, &key.1);
        let mut entry = self.daily.entry(key).or_insert(loaded);
        *entry += cost;
        debug!(user = user_id.as_i64(), cost, total = *entry, "cost charged");
        cost
    }

    /// Today's running total for a user.
    pub fn daily_total(&self, user_id: UserId) -> f64 {
        let key = (user_id.as_i64(), today());
        match self.daily.get(&key) {
            Some(v) => *v,
            None => {
                let loaded = self.load_day(key.0, &key.1);
                self.daily.insert(key, loaded);
                loaded
            }
        }
    }

    /// Store per-user overrides; they take effect immediately.
    pub fn set_user_settings(
        &self,
        user_id: UserId,
        settings: UserCostSettings,
    ) -> Result<(), MnemoError> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO user_cost_settings (user_id, daily_budget_usd, per_session_threshold_usd)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
               daily_budget_usd = excluded.daily_budget_usd,
               per_session_threshold_usd = excluded.per_session_threshold_usd",
            rusqlite::params![
                user_id.as_i64(),
                settings.daily_budget_usd,
                settings.per_session_threshold_usd
            ],
        )
        .map_err(|e| MnemoError::Database(e.to_string()))?;
        drop(db);
        self.settings.insert(user_id.as_i64(), settings);
        Ok(())
    }

    fn user_settings(&self, user_id: UserId) -> UserCostSettings {
        if let Some(s) = self.settings.get(&user_id.as_i64()) {
            return *s;
        }
        let db = self.db.lock().unwrap();
        let loaded = db
            .query_row(
                "SELECT daily_budget_usd, per_session_threshold_usd
                 FROM user_cost_settings WHERE user_id = ?1",
                rusqlite::params![user_id.as_i64()],
                |row| {
                    Ok(UserCostSettings {
                        daily_budget_usd: row.get(0)?,
                        per_session_threshold_usd: row.get(1)?,
                    })
                },
            )
            .optional()
            .ok()
            .flatten()
            .unwrap_or_default();
        drop(db);
        self.settings.insert(user_id.as_i64(), loaded);
        loaded
    }

    /// Reject new chats once the effective daily budget is met or passed.
    pub fn check_budget(&self, user_id: UserId) -> Result<(), MnemoError> {
        let budget = self
            .user_settings(user_id)
            .daily_budget_usd
            .or(self.config.daily_budget_usd);
        let Some(budget) = budget else {
            return Ok(());
        };
        let spent = self.daily_total(user_id);
        if spent >= budget {
            return Err(MnemoError::BudgetExceeded {
                spent_usd: spent,
                budget_usd: budget,
            });
        }
        Ok(())
    }

    /// Sessions past the soft threshold get a warning event, never a block.
    pub fn over_session_threshold(&self, user_id: UserId, session_cost_usd: f64) -> bool {
        let threshold = self
            .user_settings(user_id)
            .per_session_threshold_usd
            .unwrap_or(self.config.per_session_threshold_usd);
        session_cost_usd >= threshold
    }

    /// Persist in-memory daily totals. Called from the shutdown drain.
    pub fn flush(&self) {
        let db = self.db.lock().unwrap();
        for entry in self.daily.iter() {
            let ((user_id, day), cost) = (entry.key().clone(), *entry.value());
            let result = db.execute(
                "INSERT INTO cost_daily (user_id, day, cost_usd) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, day) DO UPDATE SET cost_usd = excluded.cost_usd",
                rusqlite::params![user_id, day, cost],
            );
            if let Err(e) = result {
                warn!(user = user_id, err = %e, "cost flush failed");
            }
        }
    }

    fn load_day(&self, user_id: i64, day: &str) -> f64 {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT cost_usd FROM cost_daily WHERE user_id = ?1 AND day = ?2",
            rusqlite::params![user_id, day],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
        .unwrap_or(0.0)
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accountant(budget: Option<f64>) -> CostAccountant {
        CostAccountant::new(
            Connection::open_in_memory().unwrap(),
            CostConfig {
                daily_budget_usd: budget,
                per_session_threshold_usd: 1.0,
            },
        )
        .unwrap()
    }

    fn usage(input: u32, output: u32) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }
    }

    #[test]
    fn cost_uses_per_model_rates() {
        let a = accountant(None);
        let cost = a.cost_of("claude-sonnet-4-6", &usage(1_000_000, 0));
        assert!((cost - 3.0).abs() < 1e-9);
        let cheap = a.cost_of("claude-haiku-4-5", &usage(1_000_000, 0));
        assert!((cheap - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_use_the_fallback_rate() {
        let a = accountant(None);
        let cost = a.cost_of("mystery-model", &usage(0, 1_000_000));
        assert!((cost - 15.0).abs() < 1e-9);
    }

    #[test]
    fn cache_tokens_are_billed_at_their_own_rates() {
        let a = accountant(None);
        let u = Usage {
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 1_000_000,
            cache_write_tokens: 1_000_000,
        };
        let cost = a.cost_of("claude-sonnet-4-6", &u);
        assert!((cost - (0.30 + 3.75)).abs() < 1e-9);
    }

    #[test]
    fn budget_exactly_met_rejects_next_request() {
        let a = accountant(Some(3.0));
        assert!(a.check_budget(UserId(1)).is_ok());
        a.charge(UserId(1), "claude-sonnet-4-6", &usage(1_000_000, 0));
        let err = a.check_budget(UserId(1)).unwrap_err();
        assert!(matches!(err, MnemoError::BudgetExceeded { .. }));
        // Other users are unaffected.
        assert!(a.check_budget(UserId(2)).is_ok());
    }

    #[test]
    fn per_user_budget_overrides_the_default() {
        let a = accountant(None);
        a.set_user_settings(
            UserId(1),
            UserCostSettings {
                daily_budget_usd: Some(1.0),
                per_session_threshold_usd: None,
            },
        )
        .unwrap();
        a.charge(UserId(1), "claude-sonnet-4-6", &usage(1_000_000, 0));
        assert!(a.check_budget(UserId(1)).is_err());
        // No override, no global budget: unlimited.
        a.charge(UserId(2), "claude-sonnet-4-6", &usage(10_000_000, 0));
        assert!(a.check_budget(UserId(2)).is_ok());
    }

    #[test]
    fn session_threshold_is_a_soft_warning() {
        let a = accountant(None);
        assert!(!a.over_session_threshold(UserId(1), 0.5));
        assert!(a.over_session_threshold(UserId(1), 1.0));
        a.set_user_settings(
            UserId(1),
            UserCostSettings {
                daily_budget_usd: None,
                per_session_threshold_usd: Some(0.2),
            },
        )
        .unwrap();
        assert!(a.over_session_threshold(UserId(1), 0.5));
    }

    #[test]
    fn flush_persists_and_reloads() {
        let a = accountant(None);
        a.charge(UserId(1), "claude-sonnet-4-6", &usage(1_000_000, 0));
        a.flush();
        // Emulate a restart by clearing the memory map and reloading.
        a.daily.clear();
        assert!((a.daily_total(UserId(1)) - 3.0).abs() < 1e-9);
    }
}
