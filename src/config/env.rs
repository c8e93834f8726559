// src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingProviderName {
    /// Local deterministic hashing embedder; no key needed.
    #[default]
    Hash,
    /// OpenAI embeddings API (requires OPENAI_API_KEY).
    OpenAi,
}

impl EmbeddingProviderName {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hash" | "local" => Some(Self::Hash),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

/// Chunking strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkingStrategyName {
    #[default]
    Sentence,
    SlidingWindow,
    Paragraph,
}

impl ChunkingStrategyName {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sentence" => Some(Self::Sentence),
            "sliding_window" | "sliding-window" | "window" => Some(Self::SlidingWindow),
            "paragraph" => Some(Self::Paragraph),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sentence => "sentence",
            Self::SlidingWindow => "sliding_window",
            Self::Paragraph => "paragraph",
        }
    }
}

/// Hybrid rerank settings (MNEMO_RERANK, MNEMO_VECTOR_WEIGHT, MNEMO_RRF_K).
#[derive(Debug, Clone)]
pub struct RerankConfig {
    pub enabled: bool,
    pub vector_weight: f64,
    pub rrf_k: f64,
    pub overlap_boost: f64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_weight: 0.7,
            rrf_k: 60.0,
            overlap_boost: 1.2,
        }
    }
}

impl RerankConfig {
    pub fn fts_weight(&self) -> f64 {
        1.0 - self.vector_weight
    }
}

/// Auto-reindex settings.
#[derive(Debug, Clone)]
pub struct AutoIndexConfig {
    pub cooldown_ms: u64,
}

impl Default for AutoIndexConfig {
    fn default() -> Self {
        Self { cooldown_ms: 60_000 }
    }
}

/// Process-wide configuration - all env vars read in one place, once.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Primary database file (MNEMO_DB_PATH).
    pub db_path: PathBuf,
    /// Claude Code transcripts root (MNEMO_CLAUDE_PROJECTS_ROOT).
    pub projects_root: PathBuf,
    /// Codex transcripts root (MNEMO_CODEX_ROOT).
    pub codex_root: PathBuf,
    /// SQLite mmap size in bytes (MNEMO_MMAP_SIZE).
    pub mmap_size: u64,
    pub rerank: RerankConfig,
    /// Chunking (MNEMO_CHUNKING, MNEMO_CHUNKING_STRATEGY,
    /// MNEMO_CHUNKING_TARGET_TOKENS, MNEMO_CHUNKING_OVERLAP).
    pub chunking_enabled: bool,
    pub chunking_strategy: ChunkingStrategyName,
    pub chunking_target_tokens: usize,
    pub chunking_overlap: f64,
    /// Query expansion (MNEMO_EXPANSION, MNEMO_EXPANSION_MAX_VARIANTS).
    pub expansion_enabled: bool,
    pub expansion_max_variants: usize,
    /// Embeddings (MNEMO_EMBEDDING_PROVIDER, MNEMO_EMBEDDING_MODEL,
    /// OPENAI_API_KEY, MNEMO_EMBEDDING_DIMENSIONS).
    pub embedding_provider: EmbeddingProviderName,
    pub embedding_model: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_dimensions: Option<usize>,
    pub auto_index: AutoIndexConfig,
    /// Surface thinking blocks in retrieval (MNEMO_INCLUDE_THINKING).
    /// Off unless explicitly set to true.
    pub include_thinking: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mnemo");
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: data_dir.join("mnemo.db"),
            projects_root: home.join(".claude/projects"),
            codex_root: home.join(".codex"),
            mmap_size: 256 * 1024 * 1024,
            rerank: RerankConfig::default(),
            chunking_enabled: true,
            chunking_strategy: ChunkingStrategyName::default(),
            chunking_target_tokens: 400,
            chunking_overlap: 0.15,
            expansion_enabled: false,
            expansion_max_variants: 3,
            embedding_provider: EmbeddingProviderName::default(),
            embedding_model: None,
            embedding_api_key: None,
            embedding_dimensions: None,
            auto_index: AutoIndexConfig::default(),
            include_thinking: false,
        }
    }
}

impl EnvConfig {
    /// Load all environment configuration (call once at startup).
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(p) = read_var("MNEMO_DB_PATH") {
            cfg.db_path = PathBuf::from(p);
        }
        if let Some(p) = read_var("MNEMO_CLAUDE_PROJECTS_ROOT") {
            cfg.projects_root = PathBuf::from(p);
        }
        if let Some(p) = read_var("MNEMO_CODEX_ROOT") {
            cfg.codex_root = PathBuf::from(p);
        }
        if let Some(v) = read_parsed::<u64>("MNEMO_MMAP_SIZE") {
            cfg.mmap_size = v;
        }

        if let Some(v) = parse_bool_env("MNEMO_RERANK") {
            cfg.rerank.enabled = v;
        }
        if let Some(v) = read_parsed::<f64>("MNEMO_VECTOR_WEIGHT") {
            if (0.0..=1.0).contains(&v) {
                cfg.rerank.vector_weight = v;
            } else {
                warn!(value = v, "MNEMO_VECTOR_WEIGHT out of [0,1], ignoring");
            }
        }
        if let Some(v) = read_parsed::<f64>("MNEMO_RRF_K") {
            cfg.rerank.rrf_k = v;
        }

        if let Some(v) = parse_bool_env("MNEMO_CHUNKING") {
            cfg.chunking_enabled = v;
        }
        if let Some(s) = read_var("MNEMO_CHUNKING_STRATEGY") {
            match ChunkingStrategyName::parse(&s) {
                Some(strategy) => cfg.chunking_strategy = strategy,
                None => warn!(value = %s, "Unknown MNEMO_CHUNKING_STRATEGY, using default"),
            }
        }
        if let Some(v) = read_parsed::<usize>("MNEMO_CHUNKING_TARGET_TOKENS") {
            cfg.chunking_target_tokens = v;
        }
        if let Some(v) = read_parsed::<f64>("MNEMO_CHUNKING_OVERLAP") {
            cfg.chunking_overlap = v.clamp(0.0, 0.9);
        }

        if let Some(v) = parse_bool_env("MNEMO_EXPANSION") {
            cfg.expansion_enabled = v;
        }
        if let Some(v) = read_parsed::<usize>("MNEMO_EXPANSION_MAX_VARIANTS") {
            cfg.expansion_max_variants = v.max(1);
        }

        if let Some(s) = read_var("MNEMO_EMBEDDING_PROVIDER") {
            match EmbeddingProviderName::parse(&s) {
                Some(p) => cfg.embedding_provider = p,
                None => warn!(value = %s, "Unknown MNEMO_EMBEDDING_PROVIDER, using default"),
            }
        }
        cfg.embedding_model = read_var("MNEMO_EMBEDDING_MODEL");
        cfg.embedding_api_key = read_var("OPENAI_API_KEY");
        cfg.embedding_dimensions = read_parsed::<usize>("MNEMO_EMBEDDING_DIMENSIONS");

        if let Some(v) = read_parsed::<u64>("MNEMO_AUTO_INDEX_COOLDOWN_MS") {
            cfg.auto_index.cooldown_ms = v;
        }

        cfg.include_thinking = parse_bool_env("MNEMO_INCLUDE_THINKING").unwrap_or(false);

        info!(
            db = %cfg.db_path.display(),
            provider = ?cfg.embedding_provider,
            "Environment configuration loaded"
        );
        cfg
    }

    /// Validate the configuration, producing warnings/errors without failing.
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.embedding_provider == EmbeddingProviderName::OpenAi
            && self.embedding_api_key.is_none()
        {
            validation.add_error(
                "MNEMO_EMBEDDING_PROVIDER=openai requires OPENAI_API_KEY; \
                 falling back to the local hash embedder",
            );
        }
        if let Some(dims) = self.embedding_dimensions {
            if dims == 0 || dims > 8192 {
                validation.add_error(format!("MNEMO_EMBEDDING_DIMENSIONS out of range: {dims}"));
            }
        }
        if !self.projects_root.exists() {
            validation.add_warning(format!(
                "Claude projects root does not exist: {}",
                self.projects_root.display()
            ));
        }
        if !self.codex_root.exists() {
            validation.add_warning(format!(
                "Codex root does not exist: {}",
                self.codex_root.display()
            ));
        }
        debug!(errors = validation.errors.len(), warnings = validation.warnings.len(), "config validated");
        validation
    }
}

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {err}"));
            }
        }
        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {warn}"));
            }
        }
        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    read_var(name).and_then(|v| v.parse().ok())
}

pub fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
