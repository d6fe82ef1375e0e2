use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::graph::{BuildOptions, SearchMode, SearchOptions};
use crate::search::RetrievalMode;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub kgrag: KgragConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub extraction: BuildOptions,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Storage and process settings
#[derive(Debug, Clone, Deserialize)]
pub struct KgragConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// OpenAI-compatible chat completions endpoint used for extraction
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

/// Graph search and result ranking defaults
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default)]
    pub default_mode: SearchMode,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            default_mode: SearchMode::default(),
            min_score: 0.0,
            hybrid_alpha: default_hybrid_alpha(),
            max_results: default_max_results(),
            retrieval_mode: RetrievalMode::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_top_k() -> usize {
    10
}

fn default_hybrid_alpha() -> f64 {
    0.7
}

fn default_max_results() -> usize {
    10
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in KGRAG_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("KGRAG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::from_file(&config_path)
    }

    /// Load and validate a specific config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            anyhow::bail!("llm.model must not be empty");
        }

        if self.llm.base_url.trim().is_empty() {
            anyhow::bail!("llm.base_url must not be empty");
        }

        if self.llm.timeout_secs == 0 {
            anyhow::bail!("llm.timeout_secs must be greater than 0");
        }

        let extraction = &self.extraction.settings;
        if extraction.min_triples == 0 {
            anyhow::bail!("extraction.min_triples must be greater than 0");
        }

        if extraction.max_triples < extraction.min_triples {
            anyhow::bail!("extraction.max_triples must be at least extraction.min_triples");
        }

        if extraction.triples_per_k_tokens.is_nan() || extraction.triples_per_k_tokens <= 0.0 {
            anyhow::bail!("extraction.triples_per_k_tokens must be greater than 0");
        }

        if extraction.entity_types.is_empty() {
            anyhow::bail!("extraction.entity_types must list at least one type");
        }

        if self.extraction.chunk_size_chars == 0 {
            anyhow::bail!("extraction.chunk_size_chars must be greater than 0");
        }

        if self.search.default_top_k == 0 {
            anyhow::bail!("search.default_top_k must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.search.min_score) {
            anyhow::bail!("search.min_score must be between 0.0 and 1.0");
        }

        if !(0.0..=1.0).contains(&self.search.hybrid_alpha) {
            anyhow::bail!("search.hybrid_alpha must be between 0.0 and 1.0");
        }

        if self.search.max_results == 0 {
            anyhow::bail!("search.max_results must be greater than 0");
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.kgrag.db_path
    }

    /// Read the LLM API key from the environment variable named in `llm.api_key_env`.
    /// Checked on use rather than at load, so commands that never call the model
    /// work without a key.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.llm.api_key_env).with_context(|| {
            format!(
                "Environment variable {} not set. Set it in your .env file or as an environment variable.",
                self.llm.api_key_env
            )
        })
    }

    /// Build options with the `[llm]` provider, model and timeout filled in
    /// where `[extraction]` leaves them unset.
    pub fn build_options(&self) -> BuildOptions {
        let mut options = self.extraction.clone();
        let settings = &mut options.settings;
        if settings.provider.is_none() {
            settings.provider = Some(self.llm.provider.clone());
        }
        if settings.model.is_none() {
            settings.model = Some(self.llm.model.clone());
        }
        settings.timeout_secs = self.llm.timeout_secs;
        options
    }

    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            mode: self.search.default_mode,
            top_k: self.search.default_top_k,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExtractionFormat;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide cwd and env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    const TEST_CONFIG: &str = r#"
[kgrag]
db_path = "./kg.db"
log_level = "debug"

[llm]
model = "gpt-4o-mini"
api_key_env = "KGRAG_TEST_API_KEY"
timeout_secs = 30

[extraction]
min_triples = 3
max_triples = 20
format = "tuples"
chunk_size_chars = 2000
entity_types = ["Person", "Organization"]

[search]
default_top_k = 5
default_mode = "global"
min_score = 0.25
hybrid_alpha = 0.5
retrieval_mode = "hybrid"
"#;

    /// Restores cwd when dropped (e.g. on panic).
    struct CwdGuard(PathBuf);
    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.0);
        }
    }

    fn write_config(temp_dir: &TempDir, content: &str) -> PathBuf {
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path.canonicalize().unwrap()
    }

    fn with_config_env(config_path: &Path, f: impl FnOnce()) {
        let original = std::env::var("KGRAG_CONFIG").ok();
        std::env::set_var("KGRAG_CONFIG", config_path);
        f();
        std::env::remove_var("KGRAG_CONFIG");
        if let Some(val) = original {
            std::env::set_var("KGRAG_CONFIG", val);
        }
    }

    #[test]
    fn test_config_load_success() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = write_config(&temp_dir, TEST_CONFIG);
        with_config_env(&config_path, || {
            let config = Config::load();
            assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
            let config = config.unwrap();
            assert_eq!(config.kgrag.log_level, "debug");
            assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
            assert_eq!(config.extraction.settings.min_triples, 3);
            assert_eq!(config.extraction.settings.format, ExtractionFormat::Tuples);
            assert_eq!(config.extraction.chunk_size_chars, 2000);
            assert_eq!(config.search.default_mode, SearchMode::Global);
            assert_eq!(config.search.retrieval_mode, RetrievalMode::Hybrid);
            assert_eq!(config.search.max_results, 10);
        });
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = write_config(
            &temp_dir,
            "[kgrag]\ndb_path = \"kg.db\"\n\n[llm]\nmodel = \"gpt-4o-mini\"\n",
        );
        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.extraction.settings.min_triples, 5);
        assert_eq!(config.extraction.settings.max_triples, 50);
        assert_eq!(config.extraction.settings.entity_types.len(), 11);
        assert_eq!(config.search.default_top_k, 10);
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_build_options_take_llm_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::from_file(&write_config(&temp_dir, TEST_CONFIG)).unwrap();
        let options = config.build_options();
        assert_eq!(options.settings.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(options.settings.provider.as_deref(), Some("openai"));
        assert_eq!(options.settings.timeout_secs, 30);
        assert_eq!(config.search_options().top_k, 5);
    }

    #[test]
    fn test_config_rejects_inconsistent_values() {
        let temp_dir = TempDir::new().unwrap();
        for (bad, needle) in [
            (TEST_CONFIG.replace("max_triples = 20", "max_triples = 2"), "max_triples"),
            (TEST_CONFIG.replace("hybrid_alpha = 0.5", "hybrid_alpha = 1.5"), "hybrid_alpha"),
            (TEST_CONFIG.replace("min_score = 0.25", "min_score = -0.1"), "min_score"),
            (TEST_CONFIG.replace("default_top_k = 5", "default_top_k = 0"), "default_top_k"),
            (TEST_CONFIG.replace("chunk_size_chars = 2000", "chunk_size_chars = 0"), "chunk_size_chars"),
        ] {
            let err = Config::from_file(&write_config(&temp_dir, &bad)).unwrap_err();
            assert!(err.to_string().contains(needle), "expected {} error, got {}", needle, err);
        }
    }

    #[test]
    fn test_api_key_from_env_file() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = write_config(&temp_dir, TEST_CONFIG);
        fs::write(temp_dir.path().join(".env"), "KGRAG_TEST_API_KEY=test-key-from-env-file\n").unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let _cwd = CwdGuard(original_dir);
        std::env::set_current_dir(temp_dir.path()).unwrap();
        std::env::remove_var("KGRAG_TEST_API_KEY");
        with_config_env(&config_path, || {
            let config = Config::load().unwrap();
            assert_eq!(config.api_key().unwrap(), "test-key-from-env-file");
        });
        std::env::remove_var("KGRAG_TEST_API_KEY");
    }

    #[test]
    fn test_missing_api_key_names_variable() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config = Config::from_file(&write_config(&temp_dir, TEST_CONFIG)).unwrap();
        std::env::remove_var("KGRAG_TEST_API_KEY");
        let err = config.api_key().unwrap_err();
        assert!(err.to_string().contains("KGRAG_TEST_API_KEY"));
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        with_config_env(Path::new("nonexistent.toml"), || {
            assert!(Config::load().is_err());
        });
    }
}
