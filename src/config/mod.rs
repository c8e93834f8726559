// src/config/mod.rs
// Configuration loading

mod env;

pub use env::{
    AutoIndexConfig, ChunkingStrategyName, ConfigValidation, EmbeddingProviderName, EnvConfig,
    RerankConfig, parse_bool_env,
};
