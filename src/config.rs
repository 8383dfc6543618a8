use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Smallest chunk the output ring will use
pub const MIN_CHUNK_SIZE: usize = 8;

/// Largest chunk the output ring will use
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Which transport backend upgraded connections run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Channel,
    Pipeline,
}

/// Per-connection engine settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub backend: Backend,
    /// 0 disables the read timeout
    pub read_timeout_ms: u64,
    /// 0 disables the write timeout
    pub write_timeout_ms: u64,
    /// Buffered bytes that trigger an automatic flush
    pub amount_to_buffer: usize,
    /// Explicit ring chunk size; derived from `amount_to_buffer` when unset
    pub chunk_size: Option<usize>,
    /// Deliver the first `on_write_possible` on the registering thread
    pub run_inline: bool,
    /// Upper bound for the pipeline backend's emulated zero-wait read
    pub probe_wait_ms: u64,
    /// Largest buffer a single blocking read acquires
    pub max_read_chunk: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Pipeline,
            read_timeout_ms: 0,
            write_timeout_ms: 30_000,
            amount_to_buffer: 32 * 1024,
            chunk_size: None,
            run_inline: false,
            probe_wait_ms: 10,
            max_read_chunk: 64 * 1024,
        }
    }
}

impl StreamSettings {
    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }

    /// Write threshold, never below one byte
    pub fn threshold(&self) -> usize {
        self.amount_to_buffer.max(1)
    }

    /// Ring chunk size: half the threshold, clamped, and never larger than
    /// the threshold itself
    pub fn chunk_size(&self) -> usize {
        let threshold = self.threshold();
        let derived = self
            .chunk_size
            .unwrap_or_else(|| (threshold / 2).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE));
        derived.clamp(1, threshold)
    }
}

impl Config {
    /// Load configuration
    ///
    /// Reads the YAML file named by `SLUICE_CONFIG` when set, then applies
    /// the `LISTEN` override.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("SLUICE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }

        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg = serde_yaml::from_str(raw)?;
        Ok(cfg)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
