//! Central configuration: environment variables (§6) plus an optional
//! `~/.context-cleaner/config` key=value override file, in the same spirit
//! as the teacher's `~/.vigilo/config` (`models::load_config`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Minimal,
    Standard,
    Strict,
}

impl std::str::FromStr for PrivacyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minimal" => Ok(PrivacyLevel::Minimal),
            "standard" => Ok(PrivacyLevel::Standard),
            "strict" => Ok(PrivacyLevel::Strict),
            other => Err(Error::configuration(format!(
                "unknown privacy level '{other}' (expected minimal|standard|strict)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub privacy_level: PrivacyLevel,
    pub store_url: String,
    pub port_range: (u16, u16),
}

impl Config {
    /// Loads configuration from the environment, falling back to an
    /// optional override file under `data_dir/config`. Invalid values are
    /// `Error::Configuration` and fatal at startup per spec §7.
    pub fn from_env() -> Result<Self, Error> {
        let overrides = load_overrides_default();

        let data_dir = resolve_path_var("CONTEXT_CLEANER_DATA_DIR", &overrides, "DATA_DIR")
            .unwrap_or_else(default_data_dir);

        let projects_dir = resolve_path_var("CONTEXT_CLEANER_PROJECTS_DIR", &overrides, "PROJECTS_DIR")
            .unwrap_or_else(|| default_data_dir().join("projects"));

        let privacy_level = std::env::var("CONTEXT_CLEANER_PRIVACY_LEVEL")
            .ok()
            .or_else(|| overrides.get("PRIVACY_LEVEL").cloned())
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(PrivacyLevel::Standard);

        let store_url = std::env::var("CONTEXT_CLEANER_STORE_URL")
            .ok()
            .or_else(|| overrides.get("STORE_URL").cloned())
            .unwrap_or_else(|| "http://127.0.0.1:8123".to_string());

        let port_range = std::env::var("CONTEXT_CLEANER_PORT_RANGE")
            .ok()
            .or_else(|| overrides.get("PORT_RANGE").cloned())
            .map(|s| parse_port_range(&s))
            .transpose()?
            .unwrap_or((9000, 9100));

        if port_range.0 >= port_range.1 {
            return Err(Error::configuration(format!(
                "port range {}-{} is empty or inverted",
                port_range.0, port_range.1
            )));
        }

        Ok(Config {
            data_dir,
            projects_dir,
            privacy_level,
            store_url,
            port_range,
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }

    pub fn ports_path(&self) -> PathBuf {
        self.data_dir.join("ports.json")
    }

    pub fn cursors_path(&self) -> PathBuf {
        self.data_dir.join("cursors.enc")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn resolve_path_var(env_key: &str, overrides: &HashMap<String, String>, override_key: &str) -> Option<PathBuf> {
    std::env::var(env_key)
        .ok()
        .or_else(|| overrides.get(override_key).cloned())
        .map(PathBuf::from)
}

fn parse_port_range(s: &str) -> Result<(u16, u16), Error> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| Error::configuration(format!("invalid port range '{s}' (expected LOW-HIGH)")))?;
    let lo: u16 = lo
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid port range '{s}'")))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid port range '{s}'")))?;
    Ok((lo, hi))
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".context-cleaner")
}

/// Loads the `~/.context-cleaner/config` override file, a flat
/// `KEY=value` file ignoring blank lines and `#` comments — identical
/// shape to the teacher's `models::load_config`.
pub fn load_overrides(path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| {
            let (k, v) = l.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn load_overrides_default() -> HashMap<String, String> {
    load_overrides(&default_data_dir().join("config"))
}
