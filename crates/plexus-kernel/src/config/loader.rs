//! Multi-format configuration loading
//!
//! - Auto-detection of format from file extension
//! - Environment variable substitution (`${VAR}` and `$VAR` syntax)
//! - Configuration merging from multiple sources

use std::path::Path;

use config::builder::{ConfigBuilder, DefaultState};
use config::{Config as Cfg, Environment, File};
use regex::Regex;
use serde::de::DeserializeOwned;

pub use config::FileFormat;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
///
/// `.yaml`/`.yml`, `.toml`, `.json`, `.ini`, `.ron`, `.json5`.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// `${VAR_NAME}` is replaced first, then bare `$VAR_NAME`. References to
/// unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let result = braced.replace_all(content, expand).into_owned();
    Ok(simple.replace_all(&result, expand).into_owned())
}

fn expand(caps: &regex::Captures<'_>) -> String {
    std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
}

fn finish<T: DeserializeOwned>(builder: ConfigBuilder<DefaultState>) -> ConfigResult<T> {
    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

fn read_source(path: &str) -> ConfigResult<File<config::FileSourceString, FileFormat>> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    Ok(File::from_str(&substitute_env_vars(&content)?, format))
}

/// Load configuration from a file
///
/// ```rust,ignore
/// use plexus_kernel::{KernelConfig, config::load_config};
///
/// let config: KernelConfig = load_config("plexus.toml")?;
/// ```
pub fn load_config<T: DeserializeOwned>(path: &str) -> ConfigResult<T> {
    finish(Cfg::builder().add_source(read_source(path)?))
}

/// Load configuration from a string with explicit format
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    let substituted = substitute_env_vars(content)?;
    finish(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Merge multiple configuration sources; later sources override earlier ones.
///
/// ```rust,ignore
/// let config: KernelConfig = merge_configs(&[
///     (defaults, FileFormat::Toml),
///     (r#"{ "shutdown_timeout": 5000 }"#, FileFormat::Json),
/// ])?;
/// ```
pub fn merge_configs<T: DeserializeOwned>(sources: &[(&str, FileFormat)]) -> ConfigResult<T> {
    let mut builder = Cfg::builder();
    for (content, format) in sources {
        let substituted = substitute_env_vars(content)?;
        builder = builder.add_source(File::from_str(&substituted, *format));
    }
    finish(builder)
}

/// Load configuration from multiple files with later files overriding earlier ones
pub fn load_merged<T: DeserializeOwned>(paths: &[&str]) -> ConfigResult<T> {
    let mut builder = Cfg::builder();
    for path in paths {
        builder = builder.add_source(read_source(path)?);
    }
    finish(builder)
}

/// Load configuration with environment variable overrides
///
/// Variables are prefixed with `env_prefix` and use `__` for nesting, so
/// `PLEXUS_LOGGER__LEVEL=debug` overrides `logger.level`.
pub fn load_with_env<T: DeserializeOwned>(path: &str, env_prefix: &str) -> ConfigResult<T> {
    finish(
        Cfg::builder()
            .add_source(read_source(path)?)
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}
