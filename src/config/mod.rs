//! Runtime configuration for the HTTP server.
//!
//! The binary fills a [`ServerConfig`] from CLI flags and `TALLY_*`
//! environment variables; the library only ever sees the plain struct.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use crate::consts::{DEFAULT_BIND, default_db_path};

/// Where extraction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    /// Hosted vision model on Together's OpenAI-compatible API.
    Together,
    /// Vision model on a local Ollama server.
    Ollama,
}

/// How the hosted model gets to see the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImageDelivery {
    /// Embed the bytes in the request as a base64 `data:` URL.
    Inline,
    /// Upload to tmpfiles.org and pass the public link.
    Tmpfiles,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub db_path: PathBuf,
    pub provider: Provider,
    /// Provider-specific model name; `None` picks the provider default.
    pub model: Option<String>,
    pub image_delivery: ImageDelivery,
    pub ollama_url: Option<String>,
    pub prompt_file: Option<PathBuf>,
    /// Maximum concurrent extractions.
    pub workers: usize,
    /// Upper bound on a single extraction call.
    pub extraction_timeout: Duration,
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            db_path: default_db_path(),
            provider: Provider::Together,
            model: None,
            image_delivery: ImageDelivery::Inline,
            ollama_url: None,
            prompt_file: None,
            workers: 4,
            extraction_timeout: Duration::from_secs(120),
            max_upload_mb: 20,
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    /// Database path as the string rusqlite expects.
    pub fn db_path_str(&self) -> String {
        self.db_path.to_string_lossy().into_owned()
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.max_upload_mb == 0 {
            anyhow::bail!("max upload size must be at least 1 MB");
        }
        if self.extraction_timeout.is_zero() {
            anyhow::bail!("extraction timeout must be positive");
        }
        self.bind
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid bind address {:?}: {}", self.bind, e))?;
        Ok(())
    }
}
