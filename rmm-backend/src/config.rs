//! Configuration for the backend.

use std::path::{Path, PathBuf};

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the backend.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Defaults applied to load and generation requests that omit a value.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub llama_server: LlamaServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Filesystem layout. Everything lives under `base_dir` unless overridden.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Directory scanned for GGUF models (defaults to `base_dir`).
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,
    #[serde(default)]
    pub chats_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            models_dir: None,
            prompts_dir: None,
            chats_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn models_dir(&self) -> PathBuf {
        self.models_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.clone())
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.prompts_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("prompts"))
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.chats_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("chats"))
    }

    /// Create every configured directory that does not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.models_dir(), self.prompts_dir(), self.chats_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Layers offloaded to the GPU. -1 = all of them.
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Recorded for compatibility with existing settings files. Not enforced:
    /// loads are never rejected based on how many models are resident.
    #[serde(default = "default_max_models_loaded")]
    pub max_models_loaded: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            context_size: default_context_size(),
            gpu_layers: default_gpu_layers(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_models_loaded: default_max_models_loaded(),
        }
    }
}

/// llama-server runtime configuration.
///
/// Every loaded model runs in its own llama-server process.
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaServerConfig {
    /// Path to the llama-server binary or wrapper command (e.g., "toolbox").
    #[serde(default = "default_server_binary")]
    pub binary: String,
    /// Extra arguments inserted BEFORE the model args.
    /// Example: `["run", "-c", "llamacpp", "llama-server"]`
    #[serde(default)]
    pub server_args: Vec<String>,
    /// Extra arguments appended AFTER the standard flags.
    /// Example: `["--flash-attn", "on", "--no-mmap"]`
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Base port for server allocation. If not set, the OS picks free ports.
    #[serde(default)]
    pub base_port: Option<u16>,
    /// CPU threads per server (-t flag). Unset lets llama-server decide.
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Pass llama-server stdout/stderr through (default: false).
    #[serde(default)]
    pub log_server_output: bool,
}

impl Default for LlamaServerConfig {
    fn default() -> Self {
        Self {
            binary: default_server_binary(),
            server_args: vec![],
            extra_args: vec![],
            base_port: None,
            threads: None,
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            log_server_output: false,
        }
    }
}

/// Prompt architect session expiry.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Flat settings file written by earlier releases (`<base_dir>/config.json`).
#[derive(Debug, Clone, Deserialize, Default)]
struct LegacySettings {
    max_models_loaded: Option<usize>,
    default_context_size: Option<u32>,
    default_temperature: Option<f32>,
    default_top_p: Option<f32>,
    default_top_k: Option<u32>,
    gpu_layers: Option<i32>,
    threads: Option<usize>,
}

impl LegacySettings {
    fn read(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(settings) => Some(settings),
            Err(e) => {
                tracing::warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
                None
            }
        }
    }
}

// Default values
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_base_dir() -> PathBuf {
    match directories::UserDirs::new() {
        Some(dirs) => dirs
            .document_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.home_dir().join("Documents"))
            .join("rmm"),
        None => PathBuf::from("rmm"),
    }
}
fn default_context_size() -> u32 {
    4096
}
fn default_gpu_layers() -> i32 {
    -1
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> u32 {
    40
}
fn default_max_models_loaded() -> usize {
    2
}
fn default_server_binary() -> String {
    "llama-server".to_string()
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (RMM__SECTION__KEY format)
    /// 2. config.toml file in the working directory (if present)
    /// 3. `<base_dir>/config.json` legacy settings (if present)
    /// 4. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let initial: Config = Self::builder(None)?.build()?.try_deserialize()?;

        match LegacySettings::read(&initial.paths.base_dir.join("config.json")) {
            Some(legacy) => Self::builder(Some(&legacy))?.build()?.try_deserialize(),
            None => Ok(initial),
        }
    }

    fn builder(
        legacy: Option<&LegacySettings>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let mut builder = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default(
                "paths.base_dir",
                default_base_dir().to_string_lossy().to_string(),
            )?;

        if let Some(legacy) = legacy {
            if let Some(v) = legacy.max_models_loaded {
                builder = builder.set_default("defaults.max_models_loaded", v as i64)?;
            }
            if let Some(v) = legacy.default_context_size {
                builder = builder.set_default("defaults.context_size", i64::from(v))?;
            }
            if let Some(v) = legacy.default_temperature {
                builder = builder.set_default("defaults.temperature", f64::from(v))?;
            }
            if let Some(v) = legacy.default_top_p {
                builder = builder.set_default("defaults.top_p", f64::from(v))?;
            }
            if let Some(v) = legacy.default_top_k {
                builder = builder.set_default("defaults.top_k", i64::from(v))?;
            }
            if let Some(v) = legacy.gpu_layers {
                builder = builder.set_default("defaults.gpu_layers", i64::from(v))?;
            }
            if let Some(v) = legacy.threads {
                builder = builder.set_default("llama_server.threads", v as i64)?;
            }
        }

        Ok(builder
            // Load from config.toml if exists
            .add_source(File::with_name("config").required(false))
            // Override with environment variables (RMM__SECTION__KEY format)
            .add_source(
                Environment::with_prefix("RMM")
                    .separator("__")
                    .try_parsing(true),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 5000);
    }

    #[test]
    fn test_default_generation_settings() {
        let defaults = DefaultsConfig::default();
        assert_eq!(defaults.context_size, 4096);
        assert_eq!(defaults.gpu_layers, -1);
        assert_eq!(defaults.max_tokens, 512);
        assert!((defaults.temperature - 0.7).abs() < f32::EPSILON);
        assert!((defaults.top_p - 0.9).abs() < f32::EPSILON);
        assert_eq!(defaults.top_k, 40);
        assert_eq!(defaults.max_models_loaded, 2);
    }

    #[test]
    fn test_paths_derive_from_base_dir() {
        let paths = PathsConfig {
            base_dir: PathBuf::from("/data/rmm"),
            models_dir: None,
            prompts_dir: None,
            chats_dir: None,
        };
        assert_eq!(paths.models_dir(), PathBuf::from("/data/rmm"));
        assert_eq!(paths.prompts_dir(), PathBuf::from("/data/rmm/prompts"));
        assert_eq!(paths.chats_dir(), PathBuf::from("/data/rmm/chats"));
    }

    #[test]
    fn test_paths_explicit_override() {
        let paths = PathsConfig {
            base_dir: PathBuf::from("/data/rmm"),
            models_dir: Some(PathBuf::from("/mnt/models")),
            prompts_dir: None,
            chats_dir: None,
        };
        assert_eq!(paths.models_dir(), PathBuf::from("/mnt/models"));
    }

    #[test]
    fn test_ensure_dirs_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            base_dir: tmp.path().join("rmm"),
            models_dir: None,
            prompts_dir: None,
            chats_dir: None,
        };
        paths.ensure_dirs().unwrap();
        assert!(paths.prompts_dir().is_dir());
        assert!(paths.chats_dir().is_dir());
    }

    #[test]
    fn test_legacy_settings_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"max_models_loaded": 4, "default_context_size": 8192, "gpu_layers": 20}"#,
        )
        .unwrap();

        let legacy = LegacySettings::read(&path).unwrap();
        assert_eq!(legacy.max_models_loaded, Some(4));
        assert_eq!(legacy.default_context_size, Some(8192));
        assert_eq!(legacy.gpu_layers, Some(20));
        assert!(legacy.default_top_k.is_none());
    }

    #[test]
    fn test_legacy_settings_corrupt_file_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(LegacySettings::read(&path).is_none());
    }

    #[test]
    fn test_legacy_settings_become_defaults() {
        let legacy = LegacySettings {
            default_context_size: Some(2048),
            default_top_k: Some(7),
            ..Default::default()
        };
        let config: Config = Config::builder(Some(&legacy))
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.defaults.context_size, 2048);
        assert_eq!(config.defaults.top_k, 7);
        assert_eq!(config.defaults.max_tokens, 512);
    }
}
