use crate::components::pipeline::PipelineTimeouts;
use crate::components::trust_resolver::WhitelistSet;
use crate::inbound::ReplySettings;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SystemConfig {
    pub model_path: String,
    /// Defaults to the model file stem or the version inside the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub database_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WhitelistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_builtin: bool,
    #[serde(default)]
    pub domains: Vec<String>,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_builtin: true,
            domains: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_classifier_ms")]
    pub classifier_ms: u64,
    #[serde(default = "default_store_ms")]
    pub store_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            classifier_ms: default_classifier_ms(),
            store_ms: default_store_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReplyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reply_from")]
    pub from_address: String,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from_address: default_reply_from(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_classifier_ms() -> u64 {
    5000
}

fn default_store_ms() -> u64 {
    2000
}

fn default_reply_from() -> String {
    "phishing-scanner@localhost".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemConfig {
                model_path: "/var/lib/phish-sieve/model.json".to_string(),
                model_version: None,
                database_path: "/var/lib/phish-sieve/phish-sieve.db".to_string(),
            },
            whitelist: WhitelistConfig::default(),
            timeouts: TimeoutsConfig::default(),
            reply: ReplyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "/etc/phish-sieve.toml"
    }

    /// Write the defaults to `path`.
    pub fn generate<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
        let rendered = toml::to_string_pretty(&Config::default()).context("Failed to render default config")?;
        std::fs::write(path.as_ref(), rendered)
            .with_context(|| format!("Failed to write config file {}", path.as_ref().display()))?;
        Ok(())
    }

    fn normalize(&mut self) {
        self.whitelist.domains = self
            .whitelist
            .domains
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self.logging.level = self.logging.level.trim().to_lowercase();
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeouts.classifier_ms == 0 || self.timeouts.store_ms == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.system.model_path.trim().is_empty() {
            anyhow::bail!("system.model_path must not be empty");
        }
        if self.system.database_path.trim().is_empty() {
            anyhow::bail!("system.database_path must not be empty");
        }
        self.log_level_filter()?;
        Ok(())
    }

    pub fn log_level_filter(&self) -> anyhow::Result<log::LevelFilter> {
        self.logging
            .level
            .parse::<log::LevelFilter>()
            .map_err(|_| anyhow::anyhow!("Invalid logging.level '{}'", self.logging.level))
    }

    /// Whitelist built from the config, with extra CLI domains on top.
    /// Disabled whitelisting wins over everything else.
    pub fn whitelist(&self, extra: &[String]) -> WhitelistSet {
        if !self.whitelist.enabled {
            return WhitelistSet::disabled();
        }
        let base = if self.whitelist.use_builtin {
            WhitelistSet::builtin()
        } else {
            WhitelistSet::disabled()
        };
        base.with_extra(&self.whitelist.domains).with_extra(extra)
    }

    pub fn timeouts(&self) -> PipelineTimeouts {
        PipelineTimeouts {
            classifier: Duration::from_millis(self.timeouts.classifier_ms),
            store: Duration::from_millis(self.timeouts.store_ms),
        }
    }

    pub fn reply_settings(&self) -> ReplySettings {
        ReplySettings {
            enabled: self.reply.enabled,
            from_address: self.reply.from_address.clone(),
        }
    }

    pub fn model_path(&self) -> PathBuf {
        PathBuf::from(&self.system.model_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::trust_resolver::BUILTIN_WHITELIST;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"[system]\nmodel_path = \"/tmp/model.json\"\ndatabase_path = \"/tmp/db.sqlite\"\n",
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert!(config.whitelist.enabled);
        assert_eq!(config.timeouts(), PipelineTimeouts::default());
        assert_eq!(config.reply_settings(), ReplySettings::default());
        assert_eq!(config.log_level_filter().unwrap(), log::LevelFilter::Info);
        assert_eq!(config.whitelist(&[]).len(), BUILTIN_WHITELIST.len());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phish-sieve.toml");
        Config::generate(&path).unwrap();
        assert_eq!(Config::load_from_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_whitelist_sections() {
        let config: Config = toml::from_str(
            r#"
            [system]
            model_path = "m.json"
            database_path = "d.db"

            [whitelist]
            use_builtin = false
            domains = ["Corp.Example"]

            [timeouts]
            classifier_ms = 750
            "#,
        )
        .unwrap();

        let whitelist = config.whitelist(&["partner.example".to_string()]);
        assert_eq!(whitelist.domains(), vec!["corp.example", "partner.example"]);
        assert_eq!(config.timeouts().classifier, Duration::from_millis(750));
        assert_eq!(config.timeouts().store, Duration::from_millis(2000));

        let mut disabled = config.clone();
        disabled.whitelist.enabled = false;
        assert!(disabled.whitelist(&["partner.example".to_string()]).is_empty());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.timeouts.store_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());

        assert!(Config::load_from_file("/nonexistent/phish-sieve.toml").is_err());
    }
}
