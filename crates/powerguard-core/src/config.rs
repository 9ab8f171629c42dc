use crate::action::{ActionConfiguration, ActionParams};
use crate::auth::AuthLimits;
use crate::error::{GuardError, Result};
use crate::machine::GuardSettings;
use crate::signal::{TrustedLocation, TrustedNetworks};
use crate::types::{ActionKind, AfterTrigger};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "POWERGUARD_CONFIG";

/// Upper bound for every configured duration (one year).
pub const MAX_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_seconds: u64,
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    #[serde(default = "default_cache")]
    pub cache_seconds: u64,
    /// Refuse the password fallback; biometrics only.
    #[serde(default)]
    pub biometric_only: bool,
    #[serde(default = "default_true")]
    pub require_for_arm: bool,
    /// Hex SHA-256 of the passphrase used by the password fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_sha256: Option<String>,
}

fn default_max_failures() -> u32 {
    3
}

fn default_failure_window() -> u64 {
    30
}

fn default_retention() -> u64 {
    3600
}

fn default_cache() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            failure_window_seconds: default_failure_window(),
            retention_seconds: default_retention(),
            cache_seconds: default_cache(),
            biometric_only: false,
            require_for_arm: true,
            passphrase_sha256: None,
        }
    }
}

impl AuthConfig {
    pub fn limits(&self) -> AuthLimits {
        AuthLimits {
            max_failures: self.max_failures,
            failure_window: Duration::from_secs(self.failure_window_seconds),
            retention: Duration::from_secs(self.retention_seconds),
            cache_window: Duration::from_secs(self.cache_seconds),
            ..AuthLimits::default()
        }
    }
}

// ---------------------------------------------------------------------------
// AutoArmConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoArmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub on_location_exit: bool,
    #[serde(default = "default_true")]
    pub on_untrusted_network: bool,
    #[serde(default = "default_auto_arm_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_warning_delay")]
    pub warning_delay_seconds: u64,
    #[serde(default, skip_serializing_if = "TrustedNetworks::is_empty")]
    pub trusted_networks: TrustedNetworks,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_locations: Vec<TrustedLocation>,
}

fn default_auto_arm_cooldown() -> u64 {
    30
}

fn default_warning_delay() -> u64 {
    2
}

impl Default for AutoArmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            on_location_exit: true,
            on_untrusted_network: true,
            cooldown_seconds: default_auto_arm_cooldown(),
            warning_delay_seconds: default_warning_delay(),
            trusted_networks: TrustedNetworks::default(),
            trusted_locations: Vec::new(),
        }
    }
}

impl AutoArmConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn warning_delay(&self) -> Duration {
        Duration::from_secs(self.warning_delay_seconds)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Seconds between power loss and the trigger. `0` triggers immediately.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,
    /// Power-loss events within this window after a trigger are ignored.
    #[serde(default = "default_post_trigger_cooldown")]
    pub post_trigger_cooldown_seconds: u64,
    #[serde(default)]
    pub after_trigger: AfterTrigger,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub auto_arm: AutoArmConfig,
    #[serde(default)]
    pub actions: ActionConfiguration,
}

fn default_version() -> u32 {
    1
}

fn default_grace_period() -> u64 {
    10
}

fn default_post_trigger_cooldown() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            grace_period_seconds: default_grace_period(),
            post_trigger_cooldown_seconds: default_post_trigger_cooldown(),
            after_trigger: AfterTrigger::default(),
            auth: AuthConfig::default(),
            auto_arm: AutoArmConfig::default(),
            actions: ActionConfiguration::default(),
        }
    }
}

impl Config {
    /// `~/.config/powerguard/config.yaml`
    pub fn default_path() -> Result<PathBuf> {
        let home = home::home_dir().ok_or(GuardError::HomeNotFound)?;
        Ok(home.join(".config").join("powerguard").join("config.yaml"))
    }

    /// Resolve the config location: explicit path, then `POWERGUARD_CONFIG`,
    /// then the default under the home directory.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(p) = explicit {
            return Ok(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            if !p.trim().is_empty() {
                return Ok(PathBuf::from(p));
            }
        }
        Self::default_path()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GuardError::ConfigNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load the file if present, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(GuardError::ConfigNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn guard_settings(&self) -> GuardSettings {
        GuardSettings {
            grace_period: self.grace_period(),
            post_trigger_cooldown: Duration::from_secs(self.post_trigger_cooldown_seconds),
            after_trigger: self.after_trigger,
            require_auth_for_arm: self.auth.require_for_arm,
            biometric_only: self.auth.biometric_only,
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Something must happen when the trigger fires
        if self.actions.plan().is_empty() {
            warnings.push(ConfigWarning::warning(
                "no enabled actions: a trigger would do nothing",
            ));
        }

        // 2. Per-action checks
        let mut seen = HashSet::new();
        for spec in &self.actions.items {
            let kind = spec.kind();
            if !seen.insert(kind) {
                warnings.push(ConfigWarning::warning(format!(
                    "action '{kind}' is configured more than once"
                )));
            }
            match &spec.params {
                ActionParams::SoundAlarm { volume, .. } if *volume > 100 => {
                    warnings.push(ConfigWarning::error(format!(
                        "alarm volume {volume} is out of range (0-100)"
                    )));
                }
                ActionParams::RunCustomScript { path, .. } if path.as_os_str().is_empty() => {
                    warnings.push(ConfigWarning::error(
                        "run_custom_script action has an empty path",
                    ));
                }
                ActionParams::RunCustomScript {
                    timeout_seconds, ..
                } if *timeout_seconds == 0 => {
                    warnings.push(ConfigWarning::warning(
                        "run_custom_script has timeout_seconds=0 and will always time out",
                    ));
                }
                _ => {}
            }
            if kind == ActionKind::StopAlarm && spec.enabled {
                warnings.push(ConfigWarning::warning(
                    "stop_alarm as a trigger action silences the alarm it follows",
                ));
            }
        }

        // 3. Timing
        if self.grace_period_seconds > 600 {
            warnings.push(ConfigWarning::warning(format!(
                "grace_period_seconds={} (>600 gives a thief a long head start)",
                self.grace_period_seconds
            )));
        }

        // 4. Authentication
        if self.auth.max_failures == 0 {
            warnings.push(ConfigWarning::warning(
                "auth.max_failures=0 disables authentication rate limiting",
            ));
        }
        if self.auth.failure_window_seconds == 0 {
            warnings.push(ConfigWarning::warning(
                "auth.failure_window_seconds=0 disables authentication rate limiting",
            ));
        }
        if let Some(hash) = &self.auth.passphrase_sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                warnings.push(ConfigWarning::error(
                    "auth.passphrase_sha256 must be 64 hex characters",
                ));
            }
        }

        // 5. Auto-arm
        let auto = &self.auto_arm;
        if auto.enabled && !auto.on_location_exit && !auto.on_untrusted_network {
            warnings.push(ConfigWarning::warning(
                "auto_arm is enabled but no trigger (location exit, untrusted network) is on",
            ));
        }
        if auto.enabled && auto.on_untrusted_network && auto.trusted_networks.is_empty() {
            warnings.push(ConfigWarning::warning(
                "auto_arm.trusted_networks is empty: every network join will arm",
            ));
        }
        for loc in &auto.trusted_locations {
            if !(-90.0..=90.0).contains(&loc.latitude) || !(-180.0..=180.0).contains(&loc.longitude)
            {
                warnings.push(ConfigWarning::error(format!(
                    "trusted location '{}' has out-of-range coordinates",
                    loc.name
                )));
            }
            if loc.radius_meters <= 0.0 {
                warnings.push(ConfigWarning::error(format!(
                    "trusted location '{}' has a non-positive radius",
                    loc.name
                )));
            }
        }

        // 6. Duration bounds
        let durations = [
            ("grace_period_seconds", self.grace_period_seconds),
            (
                "post_trigger_cooldown_seconds",
                self.post_trigger_cooldown_seconds,
            ),
            ("actions.pre_delay_seconds", self.actions.pre_delay_seconds),
            (
                "auth.failure_window_seconds",
                self.auth.failure_window_seconds,
            ),
            ("auth.retention_seconds", self.auth.retention_seconds),
            ("auth.cache_seconds", self.auth.cache_seconds),
            ("auto_arm.cooldown_seconds", auto.cooldown_seconds),
            ("auto_arm.warning_delay_seconds", auto.warning_delay_seconds),
        ];
        for (name, value) in durations {
            if value > MAX_DURATION_SECONDS {
                warnings.push(ConfigWarning::error(format!(
                    "{name}={value} is out of range (at most {MAX_DURATION_SECONDS})"
                )));
            }
        }

        warnings
    }

    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
