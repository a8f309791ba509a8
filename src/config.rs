//! Runtime configuration.
//!
//! Values come from `config.yaml` in the data directory, then `.env` in the
//! same directory, then the process environment (highest precedence).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::load_env_value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Resolved at load time, never read from the file.
    #[serde(skip)]
    pub data_dir: PathBuf,
    pub bind_addr: String,
    /// Required for `/api/jobs/*`. Admin routes answer 404 when unset.
    pub admin_key: Option<String>,
    pub worker_poll_seconds: u64,
    /// 0 disables the scheduled sweep.
    pub scheduled_sweep_minutes: u64,
    pub trigger: TriggerConfig,
    pub auth: AuthConfig,
    pub merge: MergeConfig,
    pub cutter: CutterConfig,
    pub classifier: ClassifierConfig,
    pub whisper: WhisperConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            bind_addr: "127.0.0.1:5001".to_string(),
            admin_key: None,
            worker_poll_seconds: 10,
            scheduled_sweep_minutes: 0,
            trigger: TriggerConfig::default(),
            auth: AuthConfig::default(),
            merge: MergeConfig::default(),
            cutter: CutterConfig::default(),
            classifier: ClassifierConfig::default(),
            whisper: WhisperConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub cooldown_minutes: i64,
    pub accepted_retry_seconds: u64,
    pub in_progress_retry_seconds: u64,
    pub read_only_retry_seconds: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 10,
            accepted_retry_seconds: 60,
            in_progress_retry_seconds: 120,
            read_only_retry_seconds: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Failures tolerated before a client is locked out.
    pub free_failures: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    /// A client with no failure for this long starts over with a clean record.
    pub failure_window_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            free_failures: 5,
            backoff_base_seconds: 2,
            backoff_max_seconds: 300,
            failure_window_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub gap_epsilon_seconds: f64,
    pub min_ad_segment_seconds: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            gap_epsilon_seconds: 1.0,
            min_ad_segment_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CutterConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub fade_seconds: f64,
    pub max_filtergraph_intervals: usize,
    pub min_keep_seconds: f64,
}

impl Default for CutterConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            fade_seconds: 0.5,
            max_filtergraph_intervals: 48,
            min_keep_seconds: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub ollama_url: String,
    pub model: String,
    pub batch_size: usize,
    pub retry_budget: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_seconds: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            batch_size: 30,
            retry_budget: 2,
            retry_delay_ms: 2000,
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub cli_path: PathBuf,
    pub model_path: PathBuf,
    /// Reruns of whisper-cli after a failed first attempt.
    pub retry_budget: u32,
    pub retry_delay_ms: u64,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        let bin = dirs::home_dir()
            .unwrap_or_default()
            .join("bin")
            .join("whisper-cpp");
        Self {
            cli_path: bin.join("whisper-cli"),
            model_path: bin.join("models").join("ggml-base.en.bin"),
            retry_budget: 1,
            retry_delay_ms: 5000,
        }
    }
}

impl AppConfig {
    /// `<platform data dir>/podcast-adstrip`, used when `--data-dir` is absent.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("podcast-adstrip")
    }

    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.yaml");
        let mut config: AppConfig = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {:?}", config_path))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("Failed to parse {:?}", config_path))?
        } else {
            log::info!("No config.yaml in {:?}, using defaults", data_dir);
            AppConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_overrides(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| load_env_value(data_dir, key))
        });
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ADSTRIP_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("ADSTRIP_ADMIN_KEY") {
            self.admin_key = Some(v);
        }
        if let Some(v) = lookup("OLLAMA_URL") {
            self.classifier.ollama_url = v;
        }
        if let Some(v) = lookup("OLLAMA_MODEL") {
            self.classifier.model = v;
        }
        if let Some(v) = lookup("WHISPER_CLI_PATH") {
            self.whisper.cli_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WHISPER_MODEL_PATH") {
            self.whisper.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.cutter.ffmpeg_path = v;
        }
        if let Some(v) = lookup("FFPROBE_PATH") {
            self.cutter.ffprobe_path = v;
        }
        if let Some(v) = lookup("ADSTRIP_COOLDOWN_MINUTES").and_then(|v| v.parse().ok()) {
            self.trigger.cooldown_minutes = v;
        }
        if let Some(v) = lookup("ADSTRIP_SWEEP_MINUTES").and_then(|v| v.parse().ok()) {
            self.scheduled_sweep_minutes = v;
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("adstrip.db")
    }

    pub fn episodes_dir(&self) -> PathBuf {
        self.data_dir.join("episodes")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.trigger.cooldown_minutes)
    }
}
