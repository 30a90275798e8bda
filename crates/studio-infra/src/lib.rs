//! Infrastructure implementations for Studio.
//!
//! Implements the ports defined in `studio-core`: SQLite persistence for
//! workflow threads, approvals, and agents; the Anthropic streaming LLM
//! provider; and the TOML configuration loader.

pub mod config;
pub mod llm;
pub mod sqlite;

use std::path::PathBuf;

/// Resolve the data directory: `STUDIO_DATA_DIR`, else `~/.studio`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STUDIO_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".studio")
}
