use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::window::HOUR_MS;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub logging: Logging,
    #[serde(default)]
    pub shield: ShieldConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

/// Wszystkie progi, okna i czasy silnika. Czasy w milisekundach.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ShieldConfig {
    pub rate_limit: RateLimitConfig,
    pub spam: SpamConfig,
    pub raid: RaidConfig,
    pub orchestrator: OrchestratorConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per scope, suma po wszystkich tożsamościach.
    pub global_requests_per_minute: u32,
    pub user_requests_per_minute: u32,
    pub user_requests_per_hour: u32,
    pub burst_limit: u32,
    pub burst_window_ms: u64,
    /// Cooldown dla komend bez wpisu w `command_cooldowns`. None = bez cooldownu.
    pub default_command_cooldown_ms: Option<u64>,
    pub command_cooldowns: HashMap<String, u64>,
    pub warning_threshold: u32,
    pub temp_ban_threshold: u32,
    pub perma_ban_threshold: u32,
    pub temp_ban_duration_ms: u64,
    pub perma_ban_duration_ms: u64,
    /// Górny limit kluczy identity+komenda trzymanych w pamięci.
    pub max_tracked_command_keys: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_requests_per_minute: 300,
            user_requests_per_minute: 20,
            user_requests_per_hour: 300,
            burst_limit: 5,
            burst_window_ms: 2_000,
            default_command_cooldown_ms: None,
            command_cooldowns: HashMap::new(),
            warning_threshold: 3,
            temp_ban_threshold: 5,
            perma_ban_threshold: 10,
            temp_ban_duration_ms: 10 * 60 * 1000,
            perma_ban_duration_ms: 24 * 60 * 60 * 1000,
            max_tracked_command_keys: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SpamConfig {
    pub max_messages_per_window: u32,
    pub message_window_ms: u64,

    pub max_duplicates: u32,
    pub duplicate_window_ms: u64,
    pub similarity_threshold: f64,

    pub max_mentions_per_message: u32,
    pub max_mentions_per_window: u32,
    pub mention_window_ms: u64,

    pub max_links_per_message: u32,
    pub max_links_per_window: u32,
    pub link_window_ms: u64,
    pub shortener_domains: Vec<String>,

    /// Procent liter (1..=100).
    pub caps_percentage_threshold: u32,
    pub min_caps_length: u32,
    pub max_emojis_per_message: u32,
    pub max_message_length: u32,

    pub repeated_char_run: u32,
    pub repeated_word_run: u32,
    pub max_combining_marks: u32,
    pub detect_personal_info: bool,

    pub max_warnings: u32,
    pub mute_duration_ms: u64,
    pub warning_decay_ms: u64,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            max_messages_per_window: 5,
            message_window_ms: 5_000,
            max_duplicates: 3,
            duplicate_window_ms: 30_000,
            similarity_threshold: 0.8,
            max_mentions_per_message: 5,
            max_mentions_per_window: 10,
            mention_window_ms: 30_000,
            max_links_per_message: 3,
            max_links_per_window: 5,
            link_window_ms: 30_000,
            shortener_domains: [
                "bit.ly", "tinyurl.com", "goo.gl", "t.co", "ow.ly", "is.gd", "buff.ly",
                "cutt.ly", "rb.gy", "shorturl.at", "tiny.cc", "rebrand.ly",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            caps_percentage_threshold: 70,
            min_caps_length: 10,
            max_emojis_per_message: 10,
            max_message_length: 2_000,
            repeated_char_run: 5,
            repeated_word_run: 4,
            max_combining_marks: 5,
            detect_personal_info: true,
            max_warnings: 3,
            mute_duration_ms: 10 * 60 * 1000,
            warning_decay_ms: 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RaidConfig {
    pub suspicious_join_window_ms: u64,
    pub suspicious_join_count: u32,
    pub max_joins_per_minute: u32,
    pub max_joins_per_hour: u32,
    pub lockdown_duration_ms: u64,

    pub new_account_threshold_ms: u64,
    pub new_account_window_ms: u64,
    pub new_account_max_joins: u32,

    pub check_similarity_window_ms: u64,
    pub similarity_threshold: f64,
    pub similar_name_min_joins: u32,
    pub generic_name_min_joins: u32,

    pub suspicion_threshold: u32,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            suspicious_join_window_ms: 10_000,
            suspicious_join_count: 10,
            max_joins_per_minute: 15,
            max_joins_per_hour: 100,
            lockdown_duration_ms: 10 * 60 * 1000,
            new_account_threshold_ms: 7 * 24 * 60 * 60 * 1000,
            new_account_window_ms: 5 * 60 * 1000,
            new_account_max_joins: 3,
            check_similarity_window_ms: 5 * 60 * 1000,
            similarity_threshold: 0.8,
            similar_name_min_joins: 2,
            generic_name_min_joins: 3,
            suspicion_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_log_size: usize,
    pub admin_ids: Vec<String>,
    pub emergency_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_log_size: 1_000,
            admin_ids: vec![],
            emergency_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_ms: u64,
    /// Wpisy okien starsze niż to wylatują.
    pub retention_ms: u64,
    /// Tożsamości bez aktywności przez tyle czasu (i bez aktywnego bana) zapominamy.
    pub identity_idle_ms: u64,
    pub violation_decay_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            retention_ms: 60 * 60 * 1000,
            identity_idle_ms: 24 * 60 * 60 * 1000,
            violation_decay_ms: 60 * 60 * 1000,
        }
    }
}

fn positive(field: &'static str, v: u64) -> Result<(), ConfigurationError> {
    if v == 0 {
        return Err(ConfigurationError::NonPositive { field });
    }
    Ok(())
}

fn ratio(field: &'static str, v: f64) -> Result<(), ConfigurationError> {
    if !(v > 0.0 && v <= 1.0) {
        return Err(ConfigurationError::OutOfRange {
            field,
            value: v.to_string(),
        });
    }
    Ok(())
}

fn ordered(
    lower: &'static str,
    lower_value: u64,
    upper: &'static str,
    upper_value: u64,
) -> Result<(), ConfigurationError> {
    if lower_value > upper_value {
        return Err(ConfigurationError::Ordering {
            lower,
            lower_value,
            upper,
            upper_value,
        });
    }
    Ok(())
}

impl ShieldConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let r = &self.rate_limit;
        positive("rate_limit.global_requests_per_minute", r.global_requests_per_minute as u64)?;
        positive("rate_limit.user_requests_per_minute", r.user_requests_per_minute as u64)?;
        positive("rate_limit.user_requests_per_hour", r.user_requests_per_hour as u64)?;
        positive("rate_limit.burst_limit", r.burst_limit as u64)?;
        positive("rate_limit.burst_window_ms", r.burst_window_ms)?;
        if let Some(ms) = r.default_command_cooldown_ms {
            positive("rate_limit.default_command_cooldown_ms", ms)?;
        }
        if let Some((command, _)) = r.command_cooldowns.iter().find(|(_, ms)| **ms == 0) {
            return Err(ConfigurationError::ZeroCooldown {
                command: command.clone(),
            });
        }
        positive("rate_limit.warning_threshold", r.warning_threshold as u64)?;
        positive("rate_limit.temp_ban_threshold", r.temp_ban_threshold as u64)?;
        positive("rate_limit.perma_ban_threshold", r.perma_ban_threshold as u64)?;
        ordered(
            "rate_limit.warning_threshold",
            r.warning_threshold as u64,
            "rate_limit.temp_ban_threshold",
            r.temp_ban_threshold as u64,
        )?;
        ordered(
            "rate_limit.temp_ban_threshold",
            r.temp_ban_threshold as u64,
            "rate_limit.perma_ban_threshold",
            r.perma_ban_threshold as u64,
        )?;
        positive("rate_limit.temp_ban_duration_ms", r.temp_ban_duration_ms)?;
        positive("rate_limit.perma_ban_duration_ms", r.perma_ban_duration_ms)?;
        positive("rate_limit.max_tracked_command_keys", r.max_tracked_command_keys)?;

        let s = &self.spam;
        positive("spam.max_messages_per_window", s.max_messages_per_window as u64)?;
        positive("spam.message_window_ms", s.message_window_ms)?;
        positive("spam.max_duplicates", s.max_duplicates as u64)?;
        positive("spam.duplicate_window_ms", s.duplicate_window_ms)?;
        ratio("spam.similarity_threshold", s.similarity_threshold)?;
        positive("spam.max_mentions_per_message", s.max_mentions_per_message as u64)?;
        positive("spam.max_mentions_per_window", s.max_mentions_per_window as u64)?;
        positive("spam.mention_window_ms", s.mention_window_ms)?;
        positive("spam.max_links_per_message", s.max_links_per_message as u64)?;
        positive("spam.max_links_per_window", s.max_links_per_window as u64)?;
        positive("spam.link_window_ms", s.link_window_ms)?;
        positive("spam.caps_percentage_threshold", s.caps_percentage_threshold as u64)?;
        ordered(
            "spam.caps_percentage_threshold",
            s.caps_percentage_threshold as u64,
            "100%",
            100,
        )?;
        positive("spam.min_caps_length", s.min_caps_length as u64)?;
        positive("spam.max_emojis_per_message", s.max_emojis_per_message as u64)?;
        positive("spam.max_message_length", s.max_message_length as u64)?;
        positive("spam.repeated_char_run", s.repeated_char_run as u64)?;
        positive("spam.repeated_word_run", s.repeated_word_run as u64)?;
        positive("spam.max_combining_marks", s.max_combining_marks as u64)?;
        positive("spam.max_warnings", s.max_warnings as u64)?;
        positive("spam.mute_duration_ms", s.mute_duration_ms)?;
        positive("spam.warning_decay_ms", s.warning_decay_ms)?;

        let j = &self.raid;
        positive("raid.suspicious_join_window_ms", j.suspicious_join_window_ms)?;
        positive("raid.suspicious_join_count", j.suspicious_join_count as u64)?;
        positive("raid.max_joins_per_minute", j.max_joins_per_minute as u64)?;
        positive("raid.max_joins_per_hour", j.max_joins_per_hour as u64)?;
        positive("raid.lockdown_duration_ms", j.lockdown_duration_ms)?;
        positive("raid.new_account_threshold_ms", j.new_account_threshold_ms)?;
        positive("raid.new_account_window_ms", j.new_account_window_ms)?;
        positive("raid.new_account_max_joins", j.new_account_max_joins as u64)?;
        positive("raid.check_similarity_window_ms", j.check_similarity_window_ms)?;
        ratio("raid.similarity_threshold", j.similarity_threshold)?;
        positive("raid.similar_name_min_joins", j.similar_name_min_joins as u64)?;
        positive("raid.generic_name_min_joins", j.generic_name_min_joins as u64)?;
        positive("raid.suspicion_threshold", j.suspicion_threshold as u64)?;

        positive("orchestrator.max_log_size", self.orchestrator.max_log_size as u64)?;

        let w = &self.sweep;
        positive("sweep.interval_ms", w.interval_ms)?;
        positive("sweep.retention_ms", w.retention_ms)?;
        positive("sweep.identity_idle_ms", w.identity_idle_ms)?;
        positive("sweep.violation_decay_ms", w.violation_decay_ms)?;
        Ok(())
    }

    /// Najdłuższe okno czytane przez detektory. Horyzont sweepa nie schodzi poniżej.
    pub fn longest_window_ms(&self) -> u64 {
        [
            HOUR_MS,
            self.rate_limit.burst_window_ms,
            self.spam.message_window_ms,
            self.spam.duplicate_window_ms,
            self.spam.mention_window_ms,
            self.spam.link_window_ms,
            self.raid.suspicious_join_window_ms,
            self.raid.new_account_window_ms,
            self.raid.check_similarity_window_ms,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Które środowisko?
        let env = std::env::var("TSS_ENV").unwrap_or_else(|_| "development".to_string());

        // najpierw .env.<env>, potem .env (oba opcjonalne)
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        Self::figment(&env, Toml::file(format!("config/{}.toml", env)))
    }

    /// Te same warstwy co [`Settings::load`], z jawnie podanym plikiem TOML.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let env = std::env::var("TSS_ENV").unwrap_or_else(|_| "development".to_string());
        Self::figment(&env, Toml::file(path.as_ref()))
    }

    fn figment(env: &str, file: figment::providers::Data<Toml>) -> Result<Self> {
        let defaults = Settings {
            env: env.to_string(),
            app: App {
                name: "Tigris Shield".into(),
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            shield: ShieldConfig::default(),
        };

        // domyślne -> plik TOML -> env TSS_* (TSS_SHIELD__SPAM__MAX_WARNINGS => shield.spam.max_warnings)
        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(file)
            .merge(Env::prefixed("TSS_").split("__"));

        let mut s: Settings = figment.extract()?;
        s.env = env.to_string();
        s.shield.validate()?;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        ShieldConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut cfg = ShieldConfig::default();
        cfg.spam.duplicate_window_ms = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigurationError::NonPositive {
                field: "spam.duplicate_window_ms"
            })
        );
    }

    #[test]
    fn escalation_thresholds_must_be_ordered() {
        let mut cfg = ShieldConfig::default();
        cfg.rate_limit.temp_ban_threshold = 20;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigurationError::Ordering { .. })
        ));
    }

    #[test]
    fn similarity_outside_unit_interval_is_rejected() {
        let mut cfg = ShieldConfig::default();
        cfg.raid.similarity_threshold = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigurationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn zero_command_cooldown_is_rejected() {
        let mut cfg = ShieldConfig::default();
        cfg.rate_limit.command_cooldowns.insert("ping".into(), 0);
        assert_eq!(
            cfg.validate(),
            Err(ConfigurationError::ZeroCooldown {
                command: "ping".into()
            })
        );
    }

    #[test]
    fn load_from_merges_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "debug"

[shield.rate_limit]
user_requests_per_minute = 10

[shield.rate_limit.command_cooldowns]
ticket = 30000

[shield.raid]
suspicious_join_count = 5
"#
        )
        .unwrap();

        let s = Settings::load_from(file.path()).unwrap();
        assert_eq!(s.logging.level.as_deref(), Some("debug"));
        assert_eq!(s.shield.rate_limit.user_requests_per_minute, 10);
        assert_eq!(s.shield.rate_limit.command_cooldowns.get("ticket"), Some(&30_000));
        assert_eq!(s.shield.raid.suspicious_join_count, 5);
        // nieruszone klucze zostają domyślne
        assert_eq!(s.shield.spam.max_duplicates, 3);
    }

    #[test]
    fn load_from_rejects_invalid_thresholds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[shield.spam]\nmax_warnings = 0").unwrap();
        assert!(Settings::load_from(file.path()).is_err());
    }
}
