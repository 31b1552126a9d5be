use anyhow::{bail, Context, Result};
use clap::Parser;
use helpdesk_engine::EngineConfig;
use helpdesk_lifecycle::LifecycleConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ENV_PREFIX: &str = "HELPDESK_";
const MAX_HOURS: u64 = 24 * 365;
const MAX_MINUTES: u64 = MAX_HOURS * 60;

#[derive(Parser, Debug, Default)]
#[command(name = "helpdesk-bot")]
pub struct Args {
    /// TOML file with base settings; env vars and flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long)]
    pub listen_addr: Option<String>,
    #[arg(long)]
    pub db_path: Option<PathBuf>,
    #[arg(long)]
    pub tree_path: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<String>,
    #[arg(long)]
    pub bridge_url: Option<String>,
    #[arg(long)]
    pub watched_tag: Option<String>,
    #[arg(long)]
    pub inactivity_hours: Option<u64>,
    #[arg(long)]
    pub scan_interval_minutes: Option<u64>,
    #[arg(long)]
    pub max_steps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BotConfig {
    pub listen_addr: String,
    pub db_path: PathBuf,
    pub tree_path: PathBuf,
    pub log_dir: String,
    pub bridge_url: String,
    pub debug: bool,
    pub watched_tag: String,
    pub ongoing_tag: String,
    pub done_tag: String,
    pub inactivity_hours: u64,
    pub scan_interval_minutes: u64,
    pub triage_delay_seconds: u64,
    pub max_steps: u32,
    pub session_idle_minutes: u64,
    pub closed_session_retention_minutes: u64,
    pub record_attempts: u32,
    pub record_backlog_limit: usize,
    pub archive_lease_seconds: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8088".to_string(),
            db_path: PathBuf::from("helpdesk.db"),
            tree_path: PathBuf::from("tree.yaml"),
            log_dir: String::new(),
            bridge_url: "http://127.0.0.1:8089".to_string(),
            debug: false,
            watched_tag: "bug".to_string(),
            ongoing_tag: "ongoing".to_string(),
            done_tag: "done".to_string(),
            inactivity_hours: 24,
            scan_interval_minutes: 30,
            triage_delay_seconds: 2,
            max_steps: 64,
            session_idle_minutes: 30,
            closed_session_retention_minutes: 60,
            record_attempts: 3,
            record_backlog_limit: 10_000,
            archive_lease_seconds: 120,
        }
    }
}

impl BotConfig {
    /// File, then `HELPDESK_*` environment, then command-line flags.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = var("LISTEN_ADDR") {
            self.listen_addr = value;
        }
        if let Some(value) = var("DB_PATH") {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = var("TREE_PATH") {
            self.tree_path = PathBuf::from(value);
        }
        if let Some(value) = var("LOG_DIR") {
            self.log_dir = value;
        }
        if let Some(value) = var("BRIDGE_URL") {
            self.bridge_url = value;
        }
        if let Some(value) = var("DEBUG") {
            self.debug = is_truthy(&value);
        }
        if let Some(value) = var("WATCHED_TAG") {
            self.watched_tag = value;
        }
        if let Some(value) = var("ONGOING_TAG") {
            self.ongoing_tag = value;
        }
        if let Some(value) = var("DONE_TAG") {
            self.done_tag = value;
        }
        parse_into(&var, "INACTIVITY_HOURS", &mut self.inactivity_hours)?;
        parse_into(&var, "SCAN_INTERVAL_MINUTES", &mut self.scan_interval_minutes)?;
        parse_into(&var, "TRIAGE_DELAY_SECONDS", &mut self.triage_delay_seconds)?;
        parse_into(&var, "MAX_STEPS", &mut self.max_steps)?;
        parse_into(&var, "SESSION_IDLE_MINUTES", &mut self.session_idle_minutes)?;
        parse_into(
            &var,
            "CLOSED_SESSION_RETENTION_MINUTES",
            &mut self.closed_session_retention_minutes,
        )?;
        parse_into(&var, "RECORD_ATTEMPTS", &mut self.record_attempts)?;
        parse_into(&var, "RECORD_BACKLOG_LIMIT", &mut self.record_backlog_limit)?;
        parse_into(&var, "ARCHIVE_LEASE_SECONDS", &mut self.archive_lease_seconds)?;
        Ok(())
    }

    pub fn apply_args(&mut self, args: &Args) {
        if args.debug {
            self.debug = true;
        }
        if let Some(value) = &args.listen_addr {
            self.listen_addr = value.clone();
        }
        if let Some(value) = &args.db_path {
            self.db_path = value.clone();
        }
        if let Some(value) = &args.tree_path {
            self.tree_path = value.clone();
        }
        if let Some(value) = &args.log_dir {
            self.log_dir = value.clone();
        }
        if let Some(value) = &args.bridge_url {
            self.bridge_url = value.clone();
        }
        if let Some(value) = &args.watched_tag {
            self.watched_tag = value.clone();
        }
        if let Some(value) = args.inactivity_hours {
            self.inactivity_hours = value;
        }
        if let Some(value) = args.scan_interval_minutes {
            self.scan_interval_minutes = value;
        }
        if let Some(value) = args.max_steps {
            self.max_steps = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.watched_tag.trim().is_empty() {
            bail!("watched_tag must not be empty");
        }
        if !(1..=MAX_HOURS).contains(&self.inactivity_hours) {
            bail!("inactivity_hours must be between 1 and {MAX_HOURS}");
        }
        if !(1..=MAX_MINUTES).contains(&self.scan_interval_minutes) {
            bail!("scan_interval_minutes must be between 1 and {MAX_MINUTES}");
        }
        if !(1..=MAX_MINUTES).contains(&self.session_idle_minutes) {
            bail!("session_idle_minutes must be between 1 and {MAX_MINUTES}");
        }
        if self.closed_session_retention_minutes > MAX_MINUTES {
            bail!("closed_session_retention_minutes must be at most {MAX_MINUTES}");
        }
        if self.triage_delay_seconds > 3_600 {
            bail!("triage_delay_seconds must be at most 3600");
        }
        if !(1..=86_400).contains(&self.archive_lease_seconds) {
            bail!("archive_lease_seconds must be between 1 and 86400");
        }
        if self.record_backlog_limit == 0 {
            bail!("record_backlog_limit must be positive");
        }
        if self.max_steps == 0 {
            bail!("max_steps must be positive");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_steps: self.max_steps,
            idle_timeout: chrono::Duration::minutes(clamp_i64(self.session_idle_minutes)),
            closed_retention: chrono::Duration::minutes(clamp_i64(
                self.closed_session_retention_minutes,
            )),
            record_attempts: self.record_attempts.max(1),
            backlog_limit: self.record_backlog_limit,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            watched_tag: self.watched_tag.clone(),
            ongoing_tag: self.ongoing_tag.clone(),
            done_tag: self.done_tag.clone(),
            inactivity_threshold: chrono::Duration::hours(clamp_i64(self.inactivity_hours)),
            lease_ttl: chrono::Duration::seconds(clamp_i64(self.archive_lease_seconds)),
            ..LifecycleConfig::default()
        }
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_interval_minutes.saturating_mul(60))
    }

    pub fn triage_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.triage_delay_seconds)
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_into<T, V>(var: &V, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = raw
            .parse()
            .map_err(|err| anyhow::anyhow!("{ENV_PREFIX}{name}={raw:?}: {err}"))?;
    }
    Ok(())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BotConfig::default();
        assert_eq!(config.inactivity_hours, 24);
        assert_eq!(config.scan_interval_minutes, 30);
        assert_eq!(config.triage_delay_seconds, 2);
        assert_eq!(config.max_steps, 64);
        assert_eq!(config.record_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_then_env_then_flags() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "watched_tag = \"Crash\"\ninactivity_hours = 48\nmax_steps = 10\nlog_dir = \"logs\""
        )
        .expect("write");

        let mut config = BotConfig::from_file(file.path()).expect("parse");
        assert_eq!(config.watched_tag, "Crash");
        assert_eq!(config.done_tag, "done");

        config
            .apply_env(env(&[
                ("HELPDESK_INACTIVITY_HOURS", "72"),
                ("HELPDESK_DONE_TAG", "Resolved"),
                ("HELPDESK_MAX_STEPS", " "),
            ]))
            .expect("env");
        assert_eq!(config.inactivity_hours, 72);
        assert_eq!(config.done_tag, "Resolved");
        assert_eq!(config.max_steps, 10);

        config.apply_args(&Args {
            max_steps: Some(20),
            debug: true,
            ..Args::default()
        });
        assert_eq!(config.max_steps, 20);
        assert!(config.debug);
        assert_eq!(config.inactivity_hours, 72);
        assert_eq!(config.log_dir, "logs");
    }

    #[test]
    fn shipped_config_parses() {
        let config: BotConfig =
            toml::from_str(include_str!("../../../config/helpdesk.toml")).expect("shipped config");
        assert_eq!(config, BotConfig {
            tree_path: PathBuf::from("config/tree.yaml"),
            log_dir: "logs".to_string(),
            ..BotConfig::default()
        });
    }

    #[test]
    fn bad_env_number_is_reported() {
        let mut config = BotConfig::default();
        let err = config
            .apply_env(env(&[("HELPDESK_SCAN_INTERVAL_MINUTES", "soon")]))
            .expect_err("invalid number");
        assert!(err.to_string().contains("HELPDESK_SCAN_INTERVAL_MINUTES"));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "inactivity = 5").expect("write");
        assert!(BotConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn validation_rejects_zero_threshold() {
        let config = BotConfig {
            inactivity_hours: 0,
            ..BotConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_runtime_configs_carry_settings() {
        let config = BotConfig {
            inactivity_hours: 72,
            max_steps: 12,
            archive_lease_seconds: 30,
            record_backlog_limit: 500,
            ..BotConfig::default()
        };
        let lifecycle = config.lifecycle_config();
        assert_eq!(lifecycle.inactivity_threshold, chrono::Duration::hours(72));
        assert_eq!(lifecycle.lease_ttl, chrono::Duration::seconds(30));
        assert_eq!(config.engine_config().max_steps, 12);
        assert_eq!(config.engine_config().backlog_limit, 500);
        assert_eq!(config.scan_interval(), std::time::Duration::from_secs(1_800));
    }
}
