#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_WWW_ROOT: &str = "./www";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_RETENTION_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_HISTORY: usize = 20;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_EXTRACTORS: &[&str] = &["yt-dlp", "youtube-dl"];

const DOWNLOADS_SUBDIR: &str = "downloads";
const HISTORY_SUBDIR: &str = "history";
const COOKIES_FILE: &str = "cookies.txt";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_root: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub retention: Duration,
    pub max_history: usize,
    pub sweep_interval: Duration,
    pub extractors: Vec<String>,
    /// Take the caller's identity from the user header. Only safe behind an
    /// auth proxy that sets or strips it.
    pub trust_user_header: bool,
}

impl RuntimeSettings {
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_root)
    }
}

/// Locations derived from the data root.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub downloads: PathBuf,
    pub history: PathBuf,
    pub cookies: PathBuf,
}

impl DataPaths {
    pub fn new(data_root: &Path) -> Self {
        Self {
            downloads: data_root.join(DOWNLOADS_SUBDIR),
            history: data_root.join(HISTORY_SUBDIR),
            cookies: data_root.join(COOKIES_FILE),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.downloads, &self.history] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Values supplied on the command line; they win over the environment and the
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
    pub trust_user_header: Option<bool>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("GRABTUBE_DATA_ROOT"))
        .ok_or_else(|| anyhow!("GRABTUBE_DATA_ROOT not set"))?;
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup("GRABTUBE_WWW_ROOT"))
        .unwrap_or_else(|| DEFAULT_WWW_ROOT.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("GRABTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("GRABTUBE_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let retention_secs = lookup("GRABTUBE_RETENTION_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_SECS);
    let max_history = lookup("GRABTUBE_MAX_HISTORY")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_HISTORY);
    let sweep_secs = lookup("GRABTUBE_SWEEP_INTERVAL_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let extractors = lookup("GRABTUBE_EXTRACTORS")
        .map(|value| parse_list(&value))
        .filter(|list| !list.is_empty())
        .unwrap_or_else(|| DEFAULT_EXTRACTORS.iter().map(|name| name.to_string()).collect());
    let trust_user_header = overrides
        .trust_user_header
        .or_else(|| lookup("GRABTUBE_TRUST_USER_HEADER").and_then(|value| parse_flag(&value)))
        .unwrap_or(false);

    Ok(RuntimeSettings {
        data_root: PathBuf::from(data_root),
        www_root: PathBuf::from(www_root),
        port,
        host,
        retention: Duration::from_secs(retention_secs),
        max_history,
        sweep_interval: Duration::from_secs(sweep_secs),
        extractors,
        trust_user_header,
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a dotenv-style file. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
