use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "E6TUI";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            user_agent: default_user_agent(),
            page_limit: default_page_limit(),
            timeout: default_timeout(),
        }
    }
}

fn default_endpoint() -> String {
    "https://e621.net/posts.json".to_string()
}

pub fn default_user_agent() -> String {
    format!("e6tui/{} (terminal catalog browser)", crate::VERSION)
}

fn default_page_limit() -> u32 {
    75
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RendererConfig {
    #[serde(default = "default_renderer_program")]
    pub program: String,
    /// Argument template. `%PLACE%` expands to `WxH@XxY`, `%FILE%` to the
    /// downloaded image path.
    #[serde(default = "default_renderer_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub download_timeout: Duration,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: default_renderer_program(),
            args: default_renderer_args(),
            download_timeout: default_timeout(),
            temp_dir: None,
        }
    }
}

fn default_renderer_program() -> String {
    "kitty".into()
}

fn default_renderer_args() -> Vec<String> {
    [
        "+kitten",
        "icat",
        "-z",
        "-5",
        "--align=center",
        "--scale-up",
        "--stdin=no",
        "--place=%PLACE%",
        "%FILE%",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_file() -> PathBuf {
    PathBuf::from("e6tui.log")
}

fn default_log_filter() -> String {
    "info".into()
}

/// Address and identity of the built-in SSH server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host_key")]
    pub host_key: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            host_key: default_host_key(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    2222
}

fn default_host_key() -> PathBuf {
    PathBuf::from(".ssh").join("e6tui_ed25519")
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        let from_file = read_config_file(path)?;
        cfg = merge_config(cfg, from_file);
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.catalog.endpoint.is_empty() {
        base.catalog.endpoint = other.catalog.endpoint;
    }
    if !other.catalog.user_agent.trim().is_empty() {
        base.catalog.user_agent = other.catalog.user_agent;
    }
    if other.catalog.page_limit != 0 {
        base.catalog.page_limit = other.catalog.page_limit;
    }
    if !other.catalog.timeout.is_zero() {
        base.catalog.timeout = other.catalog.timeout;
    }

    if !other.renderer.program.is_empty() {
        base.renderer.program = other.renderer.program;
    }
    if !other.renderer.args.is_empty() {
        base.renderer.args = other.renderer.args;
    }
    if !other.renderer.download_timeout.is_zero() {
        base.renderer.download_timeout = other.renderer.download_timeout;
    }
    if other.renderer.temp_dir.is_some() {
        base.renderer.temp_dir = other.renderer.temp_dir;
    }

    if !other.log.file.as_os_str().is_empty() {
        base.log.file = other.log.file;
    }
    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    if !other.server.listen.trim().is_empty() {
        base.server.listen = other.server.listen;
    }
    if other.server.port != 0 {
        base.server.port = other.server.port;
    }
    if !other.server.host_key.as_os_str().is_empty() {
        base.server.host_key = other.server.host_key;
    }

    base
}

/// Environment keys look like `E6TUI_CATALOG__ENDPOINT`; `__` separates the
/// section from the field.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "catalog.endpoint" => cfg.catalog.endpoint = value,
        "catalog.user_agent" => {
            if !value.trim().is_empty() {
                cfg.catalog.user_agent = value;
            }
        }
        "catalog.page_limit" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.catalog.page_limit = parsed;
            }
        }
        "catalog.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.catalog.timeout = duration;
            }
        }
        "renderer.program" => cfg.renderer.program = value,
        "renderer.args" => {
            cfg.renderer.args = value
                .split_whitespace()
                .map(|s| s.to_string())
                .collect();
        }
        "renderer.download_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.renderer.download_timeout = duration;
            }
        }
        "renderer.temp_dir" => cfg.renderer.temp_dir = Some(PathBuf::from(value)),
        "log.file" => cfg.log.file = PathBuf::from(value),
        "log.filter" => cfg.log.filter = value,
        "server.listen" => {
            if !value.trim().is_empty() {
                cfg.server.listen = value;
            }
        }
        "server.port" => {
            if let Ok(parsed) = value.parse::<u16>() {
                cfg.server.port = parsed;
            }
        }
        "server.host_key" => cfg.server.host_key = PathBuf::from(value),
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("e6tui").join("config.yaml"))
}
