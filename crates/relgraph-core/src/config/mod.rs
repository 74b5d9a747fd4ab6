//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::domain::relationships::RelationshipType;

/// Relgraph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub gate: GateConfig,
    pub identity: IdentityConfig,
    pub extraction: ExtractionConfig,
    pub semantic: SemanticConfig,
    pub oracle: OracleConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub backfill: BackfillConfig,
    pub graph: GraphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file; `None` uses the platform default
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

/// Confidence bands for the gate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub accept_threshold: f32,
    pub review_threshold: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub auto_merge_threshold: f32,
    pub suggestion_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Version of the extraction rule set; bumping it makes documents stale for backfill
    pub rule_version: u32,
    /// Ticket key prefix (e.g. `LIN`) to source type
    pub key_prefixes: BTreeMap<String, String>,
    pub default_ticket_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub min_similarity: f32,
    /// Run the semantic stage even when structural references were found
    pub always_run: bool,
    pub vector_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_per_workspace: usize,
    /// Per-attempt limit for extracting and applying one document
    pub extraction_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub boost_weight: f32,
    /// Decay per hop distance, index 0 is hop 1
    pub hop_decay: Vec<f32>,
    pub max_hops: u32,
    /// Relationship types followed when boosting; empty means all
    pub type_allowlist: Vec<RelationshipType>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            gate: GateConfig::default(),
            identity: IdentityConfig::default(),
            extraction: ExtractionConfig::default(),
            semantic: SemanticConfig::default(),
            oracle: OracleConfig::default(),
            retry: RetryConfig::default(),
            pipeline: PipelineConfig::default(),
            backfill: BackfillConfig::default(),
            graph: GraphConfig::default(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.80,
            review_threshold: 0.60,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.98,
            suggestion_threshold: 0.60,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        let mut key_prefixes = BTreeMap::new();
        key_prefixes.insert("LIN".to_string(), "linear".to_string());
        Self {
            rule_version: crate::domain::extraction::EXTRACTION_RULE_VERSION,
            key_prefixes,
            default_ticket_source: "jira".to_string(),
        }
    }
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 20,
            min_similarity: 0.6,
            always_run: false,
            vector_timeout_ms: 5_000,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            temperature: 0.0,
            max_tokens: 4096,
            timeout_secs: 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_workspace: 4,
            extraction_timeout_secs: 30,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            inter_batch_delay_ms: 250,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            boost_weight: 0.2,
            hop_decay: vec![1.0, 0.6],
            max_hops: 2,
            type_allowlist: Vec::new(),
        }
    }
}

impl OracleConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("RELGRAPH_ORACLE_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| {
                if key.len() <= 4 {
                    "***".to_string()
                } else {
                    let suffix = &key[key.len() - 4..];
                    format!("***{}", suffix)
                }
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "Oracle API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

impl GraphConfig {
    /// Decay applied at a hop distance; distances past the curve get zero
    pub fn decay_for(&self, hop: u32) -> f32 {
        if hop == 0 {
            return 1.0;
        }
        self.hop_decay
            .get(hop as usize - 1)
            .copied()
            .unwrap_or(0.0)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("RELGRAPH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("relgraph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.oracle.enforce_env_only()?;

        let gate = &self.gate;
        if !(0.0..=1.0).contains(&gate.review_threshold)
            || !(0.0..=1.0).contains(&gate.accept_threshold)
            || gate.review_threshold > gate.accept_threshold
        {
            return Err(anyhow!(
                "Gate thresholds must satisfy 0 <= review ({}) <= accept ({}) <= 1",
                gate.review_threshold,
                gate.accept_threshold
            ));
        }

        let identity = &self.identity;
        if identity.suggestion_threshold > identity.auto_merge_threshold
            || identity.auto_merge_threshold > 1.0
        {
            return Err(anyhow!(
                "Identity thresholds must satisfy suggestion <= auto_merge <= 1"
            ));
        }

        if !(15..=30).contains(&self.semantic.top_k) {
            return Err(anyhow!(
                "semantic.top_k must be between 15 and 30 (got {})",
                self.semantic.top_k
            ));
        }

        if self.graph.max_hops == 0 || self.graph.max_hops > 2 {
            return Err(anyhow!(
                "graph.max_hops must be 1 or 2 (got {})",
                self.graph.max_hops
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }

        if self.pipeline.max_concurrent_per_workspace == 0 || self.backfill.batch_size == 0 {
            return Err(anyhow!(
                "pipeline.max_concurrent_per_workspace and backfill.batch_size must be positive"
            ));
        }

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "gate.accept_threshold" => Ok(self.gate.accept_threshold.to_string()),
            "gate.review_threshold" => Ok(self.gate.review_threshold.to_string()),
            "identity.auto_merge_threshold" => Ok(self.identity.auto_merge_threshold.to_string()),
            "extraction.rule_version" => Ok(self.extraction.rule_version.to_string()),
            "extraction.default_ticket_source" => Ok(self.extraction.default_ticket_source.clone()),
            "semantic.enabled" => Ok(self.semantic.enabled.to_string()),
            "semantic.top_k" => Ok(self.semantic.top_k.to_string()),
            "semantic.min_similarity" => Ok(self.semantic.min_similarity.to_string()),
            "oracle.endpoint" => Ok(self.oracle.endpoint.clone()),
            "oracle.model" => Ok(self.oracle.model.clone()),
            "oracle.timeout_secs" => Ok(self.oracle.timeout_secs.to_string()),
            "retry.max_attempts" => Ok(self.retry.max_attempts.to_string()),
            "pipeline.max_concurrent_per_workspace" => {
                Ok(self.pipeline.max_concurrent_per_workspace.to_string())
            }
            "pipeline.extraction_timeout_secs" => {
                Ok(self.pipeline.extraction_timeout_secs.to_string())
            }
            "backfill.batch_size" => Ok(self.backfill.batch_size.to_string()),
            "backfill.inter_batch_delay_ms" => Ok(self.backfill.inter_batch_delay_ms.to_string()),
            "graph.boost_weight" => Ok(self.graph.boost_weight.to_string()),
            "graph.hop_decay" => Ok(self
                .graph
                .hop_decay
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")),

            "oracle.api_key" | "api_key" => match self.oracle.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok(
                    "(not set - use RELGRAPH_ORACLE_API_KEY or OPENROUTER_API_KEY env var)"
                        .to_string(),
                ),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `relgraph config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "gate.accept_threshold" => {
                self.gate.accept_threshold = parse_unit(key, value)?;
            }
            "gate.review_threshold" => {
                self.gate.review_threshold = parse_unit(key, value)?;
            }
            "identity.auto_merge_threshold" => {
                self.identity.auto_merge_threshold = parse_unit(key, value)?;
            }
            "extraction.rule_version" => {
                self.extraction.rule_version = value
                    .parse()
                    .with_context(|| format!("Invalid rule_version value: {}", value))?;
            }
            "extraction.default_ticket_source" => {
                self.extraction.default_ticket_source = value.trim().to_lowercase();
            }
            "semantic.enabled" => {
                self.semantic.enabled = value
                    .parse()
                    .with_context(|| format!("Invalid boolean value: {}", value))?;
            }
            "semantic.top_k" => {
                self.semantic.top_k = value
                    .parse()
                    .with_context(|| format!("Invalid top_k value: {}", value))?;
            }
            "semantic.min_similarity" => {
                self.semantic.min_similarity = parse_unit(key, value)?;
            }
            "oracle.endpoint" => {
                self.oracle.endpoint = value.trim_end_matches('/').to_string();
            }
            "oracle.model" => {
                self.oracle.model = value.to_string();
            }
            "oracle.timeout_secs" => {
                self.oracle.timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout_secs value: {}", value))?;
            }
            "retry.max_attempts" => {
                self.retry.max_attempts = value
                    .parse()
                    .with_context(|| format!("Invalid max_attempts value: {}", value))?;
            }
            "pipeline.max_concurrent_per_workspace" => {
                self.pipeline.max_concurrent_per_workspace = value
                    .parse()
                    .with_context(|| format!("Invalid concurrency value: {}", value))?;
            }
            "pipeline.extraction_timeout_secs" => {
                self.pipeline.extraction_timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout value: {}", value))?;
            }
            "backfill.batch_size" => {
                self.backfill.batch_size = value
                    .parse()
                    .with_context(|| format!("Invalid batch_size value: {}", value))?;
            }
            "backfill.inter_batch_delay_ms" => {
                self.backfill.inter_batch_delay_ms = value
                    .parse()
                    .with_context(|| format!("Invalid inter_batch_delay_ms value: {}", value))?;
            }
            "graph.boost_weight" => {
                self.graph.boost_weight = parse_unit(key, value)?;
            }
            "graph.hop_decay" => {
                let decay = value
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| parse_unit(key, s))
                    .collect::<anyhow::Result<Vec<f32>>>()?;
                if decay.is_empty() {
                    return Err(anyhow!("graph.hop_decay needs at least one value"));
                }
                self.graph.hop_decay = decay;
            }

            "oracle.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the RELGRAPH_ORACLE_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `relgraph config list` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = vec![
            "gate.accept_threshold",
            "gate.review_threshold",
            "identity.auto_merge_threshold",
            "extraction.rule_version",
            "extraction.default_ticket_source",
            "semantic.enabled",
            "semantic.top_k",
            "semantic.min_similarity",
            "oracle.endpoint",
            "oracle.model",
            "oracle.timeout_secs",
            "oracle.api_key",
            "retry.max_attempts",
            "pipeline.max_concurrent_per_workspace",
            "pipeline.extraction_timeout_secs",
            "backfill.batch_size",
            "backfill.inter_batch_delay_ms",
            "graph.boost_weight",
            "graph.hop_decay",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_unit(key: &str, value: &str) -> anyhow::Result<f32> {
    let parsed: f32 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(anyhow!("{} must be between 0.0 and 1.0", key));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.gate.accept_threshold, 0.80);
        assert_eq!(config.gate.review_threshold, 0.60);
        assert_eq!(config.graph.hop_decay, vec![1.0, 0.6]);
        assert_eq!(config.identity.auto_merge_threshold, 0.98);
    }

    #[test]
    fn test_decay_for() {
        let graph = GraphConfig::default();
        assert_eq!(graph.decay_for(1), 1.0);
        assert_eq!(graph.decay_for(2), 0.6);
        assert_eq!(graph.decay_for(3), 0.0);
    }

    #[test]
    fn test_set_rejects_inverted_gate() {
        let mut config = Config::default();
        assert!(config.set("gate.review_threshold", "0.9").is_err());
    }

    #[test]
    fn test_set_rejects_out_of_range_top_k() {
        let mut config = Config::default();
        assert!(config.set("semantic.top_k", "5").is_err());
        config.set("semantic.top_k", "25").unwrap();
        assert_eq!(config.semantic.top_k, 25);
    }

    #[test]
    fn test_set_hop_decay() {
        let mut config = Config::default();
        config.set("graph.hop_decay", "1.0, 0.5").unwrap();
        assert_eq!(config.graph.hop_decay, vec![1.0, 0.5]);
        assert!(config.set("graph.hop_decay", "1.5").is_err());
    }

    #[test]
    fn test_api_key_cannot_be_set() {
        let mut config = Config::default();
        assert!(config.set("oracle.api_key", "secret").is_err());

        config.oracle.api_key = Some("secret".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_with_partial_file() {
        let parsed: Config = toml::from_str(
            r#"
            [gate]
            accept_threshold = 0.85

            [graph]
            hop_decay = [1.0, 0.5]
            type_allowlist = ["resolves", "references"]
            "#,
        )
        .unwrap();

        assert_eq!(parsed.gate.accept_threshold, 0.85);
        assert_eq!(parsed.gate.review_threshold, 0.60);
        assert_eq!(parsed.graph.type_allowlist.len(), 2);
        parsed.validate().unwrap();
    }

    #[test]
    fn test_list_contains_all_keys() {
        let config = Config::default();
        let listed = config.list().unwrap();
        assert!(listed.iter().any(|(k, _)| k == "graph.hop_decay"));
        assert!(listed.iter().any(|(k, _)| k == "oracle.api_key"));
    }

    #[test]
    fn test_unknown_key() {
        let config = Config::default();
        assert!(config.get("nope").is_err());
    }
}
