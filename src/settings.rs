use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment};
use serde::Deserialize;

use crate::checkpoint::CheckpointSchedule;
use crate::retry::{Backoff, RetryPolicy};
use crate::scheduler::MAX_POOL_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Constant,
    Exponential,
}

/// Run configuration, from defaults overlaid by `ENRICH_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub openai_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub pool_size: usize,
    pub price_max_attempts: u32,
    pub translate_max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
    pub checkpoint_every: u64,
    pub checkpoint_secs: Option<u64>,
    pub raw_input: PathBuf,
    pub price_output: PathBuf,
    pub final_output: PathBuf,
    pub db_path: PathBuf,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_env(Environment::with_prefix("ENRICH").try_parsing(true))
    }

    fn from_env(env: Environment) -> Result<Self> {
        let mut settings: Settings = Config::builder()
            .set_default("api_base", "https://api.openai.com/v1")?
            .set_default("model", "gpt-3.5-turbo-1106")?
            .set_default("pool_size", 25)?
            .set_default("price_max_attempts", 10)?
            .set_default("translate_max_attempts", 100)?
            .set_default("retry_delay_ms", 1000)?
            .set_default("backoff", "constant")?
            .set_default("max_backoff_ms", 30_000)?
            .set_default("call_timeout_secs", 60)?
            .set_default("checkpoint_every", 100)?
            .set_default("raw_input", "product_details_all.csv")?
            .set_default("price_output", "product_details_price.csv")?
            .set_default("final_output", "product_details_final.csv")?
            .set_default("db_path", "data/enrich.sqlite")?
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if settings.openai_key.is_none() {
            settings.openai_key = ["OPENAI_API_KEY", "openai_key"]
                .iter()
                .find_map(|k| std::env::var(k).ok())
                .filter(|k| !k.is_empty());
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.pool_size > MAX_POOL_SIZE {
            bail!(
                "pool_size {} is above the maximum of {}",
                self.pool_size,
                MAX_POOL_SIZE
            );
        }
        if self.price_max_attempts == 0 || self.translate_max_attempts == 0 {
            bail!("max attempts must be at least 1");
        }
        if self.checkpoint_every == 0 {
            bail!("checkpoint_every must be at least 1");
        }
        if self.call_timeout_secs == 0 {
            bail!("call_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<String> {
        self.openai_key
            .clone()
            .context("No API key: set ENRICH_OPENAI_KEY (or OPENAI_API_KEY)")
    }

    pub fn retry_policy(&self, max_attempts: u32) -> RetryPolicy {
        let base = Duration::from_millis(self.retry_delay_ms);
        RetryPolicy {
            max_attempts,
            backoff: match self.backoff {
                BackoffKind::Constant => Backoff::Constant(base),
                BackoffKind::Exponential => Backoff::Exponential {
                    base,
                    cap: Duration::from_millis(self.max_backoff_ms),
                },
            },
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn checkpoint_schedule(&self) -> CheckpointSchedule {
        CheckpointSchedule {
            every: self.checkpoint_every,
            interval: self.checkpoint_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix("ENRICH")
            .try_parsing(true)
            .source(Some(source))
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let s = Settings::from_env(env(&[])).unwrap();
        assert_eq!(s.pool_size, 25);
        assert_eq!(s.price_max_attempts, 10);
        assert_eq!(s.translate_max_attempts, 100);
        assert_eq!(s.checkpoint_every, 100);
        assert_eq!(s.checkpoint_secs, None);
        assert_eq!(
            s.retry_policy(10).backoff,
            Backoff::Constant(Duration::from_secs(1))
        );
    }

    #[test]
    fn environment_overrides() {
        let s = Settings::from_env(env(&[
            ("ENRICH_POOL_SIZE", "4"),
            ("ENRICH_BACKOFF", "exponential"),
            ("ENRICH_CHECKPOINT_SECS", "30"),
            ("ENRICH_FINAL_OUTPUT", "out/final.csv"),
        ]))
        .unwrap();
        assert_eq!(s.pool_size, 4);
        assert_eq!(s.backoff, BackoffKind::Exponential);
        assert_eq!(
            s.checkpoint_schedule().interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(s.final_output, PathBuf::from("out/final.csv"));
    }

    #[test]
    fn rejects_zero_pool() {
        assert!(Settings::from_env(env(&[("ENRICH_POOL_SIZE", "0")])).is_err());
    }

    #[test]
    fn rejects_oversized_pool() {
        let err = Settings::from_env(env(&[("ENRICH_POOL_SIZE", "100000")])).unwrap_err();
        assert!(err.to_string().contains("maximum"));
        let s = Settings::from_env(env(&[("ENRICH_POOL_SIZE", "1024")])).unwrap();
        assert_eq!(s.pool_size, MAX_POOL_SIZE);
    }
}
