//! Project-wide constants.

use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default hosted vision model (Together, OpenAI-compatible API).
pub const DEFAULT_TOGETHER_MODEL: &str = "Qwen/Qwen2-VL-72B-Instruct";

/// Default local vision model served by Ollama.
pub const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5vl:7b";

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Environment variable consulted when no Together key is stored.
pub const TOGETHER_API_KEY_ENV: &str = "TOGETHER_API_KEY";

/// Default database path: `~/.tally/tally.db`.
/// Single DB for tasks and credentials.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".tally")
        .join("tally.db")
}
