/// Configuration module for codemesh.
///
/// Handles loading, validating, and providing default configuration
/// values for the store path, the AI tiers and the evolution gate.
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extract::PipelineConfig;
use crate::llm::HttpProviderConfig;
use crate::trust::HealthThresholds;

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./mesh.db".to_string()
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_llm() -> usize {
    4
}

fn default_tier3_threshold() -> f64 {
    0.6
}

fn default_max_file_size_kb() -> usize {
    512
}

fn default_max_concurrent_files() -> usize {
    8
}

fn default_sample_seed() -> u64 {
    0x5eed
}

fn default_low_trust_threshold() -> f64 {
    0.7
}

fn default_correction_rate() -> f64 {
    0.1
}

fn default_rejection_rate() -> f64 {
    0.05
}

fn default_min_samples() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub evolution: EvolutionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AiConfig {
    /// Tier-2 and Tier-3 only run when this is true and a provider is
    /// reachable; Tier-1 works regardless.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_concurrent_llm")]
    pub max_concurrent: usize,

    /// Files whose mean confidence stays below this after Tier-2 go to
    /// Tier-3 discovery.
    #[serde(default = "default_tier3_threshold")]
    pub tier3_threshold: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: usize,

    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    #[serde(default = "default_sample_seed")]
    pub sample_seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EvolutionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_low_trust_threshold")]
    pub low_trust_threshold: f64,

    #[serde(default = "default_correction_rate")]
    pub correction_rate: f64,

    #[serde(default = "default_rejection_rate")]
    pub rejection_rate: f64,

    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ai: AiConfig::default(),
            extraction: ExtractionConfig::default(),
            evolution: EvolutionConfig::default(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_concurrent: default_max_concurrent_llm(),
            tier3_threshold: default_tier3_threshold(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            max_file_size_kb: default_max_file_size_kb(),
            max_concurrent_files: default_max_concurrent_files(),
            sample_seed: default_sample_seed(),
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_trust_threshold: default_low_trust_threshold(),
            correction_rate: default_correction_rate(),
            rejection_rate: default_rejection_rate(),
            min_samples: default_min_samples(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"codemesh.json"`. A
    /// missing file yields the default config; an unreadable one is
    /// reported.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "codemesh.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.extraction.max_file_size_kb > 0,
            "extraction.max_file_size_kb must be positive"
        );
        anyhow::ensure!(
            self.extraction.max_concurrent_files > 0,
            "extraction.max_concurrent_files must be positive"
        );
        anyhow::ensure!(
            self.ai.max_concurrent > 0,
            "ai.max_concurrent must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.ai.tier3_threshold),
            "ai.tier3_threshold must be in [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.evolution.correction_rate)
                && (0.0..=1.0).contains(&self.evolution.rejection_rate),
            "evolution rates must be in [0, 1]"
        );
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            ai_enabled: self.ai.enabled,
            max_concurrent_files: self.extraction.max_concurrent_files,
            max_concurrent_llm: self.ai.max_concurrent,
            llm_timeout_secs: self.ai.timeout_secs,
            tier3_threshold: self.ai.tier3_threshold,
            sample_seed: self.extraction.sample_seed,
        }
    }

    pub fn provider_config(&self) -> HttpProviderConfig {
        HttpProviderConfig {
            base_url: self.ai.base_url.clone(),
            api_key: self.ai.api_key.clone(),
            model: self.ai.model.clone(),
            max_retries: self.ai.max_retries,
            timeout_secs: self.ai.timeout_secs,
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            low_trust: self.evolution.low_trust_threshold,
            correction_rate: self.evolution.correction_rate,
            rejection_rate: self.evolution.rejection_rate,
            min_samples: self.evolution.min_samples,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.db_path, "./mesh.db");
        assert!(!config.ai.enabled);
        assert_eq!(config.ai.model, "qwen2.5-coder:7b");
        assert_eq!(config.ai.tier3_threshold, 0.6);
        assert_eq!(config.extraction.max_file_size_kb, 512);
        assert_eq!(config.evolution.min_samples, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"db_path": "./test.db", "ai": {"enabled": true, "model": "llama3"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.db_path, "./test.db");
        assert!(config.ai.enabled);
        assert_eq!(config.ai.model, "llama3");
        // Other fields should have defaults
        assert_eq!(config.ai.base_url, "http://localhost:11434/v1");
        assert_eq!(config.extraction.max_concurrent_files, 8);
    }

    #[test]
    fn test_validate_bad_threshold() {
        let mut config = Config::default();
        config.ai.tier3_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = Config::default();
        config.extraction.max_concurrent_files = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pipeline_config_mapping() {
        let mut config = Config::default();
        config.ai.enabled = true;
        config.ai.max_concurrent = 2;
        let pc = config.pipeline_config();
        assert!(pc.ai_enabled);
        assert_eq!(pc.max_concurrent_llm, 2);
        assert_eq!(pc.tier3_threshold, 0.6);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.db_path, config.db_path);
        assert_eq!(parsed.ai.model, config.ai.model);
        assert_eq!(parsed.evolution.min_samples, config.evolution.min_samples);
    }
}
