use std::path::{Path, PathBuf};

use {serde_json::Value, tracing::debug};

use crate::{
    env_subst::substitute_env_in_value,
    error::{Error, Result},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "napgate.json",
    "napgate.toml",
    "napgate.yaml",
    "napgate.yml",
];

/// Load a config document with `${ENV}` placeholders resolved.
pub fn load_config_value(path: &Path) -> Result<Value> {
    let mut value = load_raw_config_value(path)?;
    substitute_env_in_value(&mut value);
    Ok(value)
}

/// Load a config document exactly as written on disk.
///
/// A missing file is an empty document.
pub fn load_raw_config_value(path: &Path) -> Result<Value> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, starting empty");
        return Ok(Value::Object(Default::default()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_value(&raw, path)
}

/// Write a config document in the format implied by the file extension.
///
/// Creates parent directories if needed.
pub fn save_config_value(path: &Path, value: &Value) -> Result<()> {
    if !value.is_object() {
        return Err(Error::NotAnObject);
    }
    let text = serialize_config_value(value, path)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| Error::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, text).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

/// Find the first config file in standard locations.
///
/// Search order: `./napgate.*`, then `~/.config/napgate/napgate.*`.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/napgate/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "napgate").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default JSON path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("napgate.json")
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("json")
}

fn parse_config_value(raw: &str, path: &Path) -> Result<Value> {
    let parse_err = |message: String| Error::Parse {
        path: path.to_path_buf(),
        message,
    };
    let value = match extension(path) {
        "json" => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string()))?,
        "toml" => {
            let v: toml::Value = toml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
            serde_json::to_value(v).map_err(|e| parse_err(e.to_string()))?
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value =
                serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
            serde_json::to_value(v).map_err(|e| parse_err(e.to_string()))?
        },
        other => return Err(Error::UnsupportedFormat(other.to_string())),
    };
    match value {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(_) => Ok(value),
        _ => Err(Error::NotAnObject),
    }
}

fn serialize_config_value(value: &Value, path: &Path) -> Result<String> {
    match extension(path) {
        "json" => serde_json::to_string_pretty(value).map_err(|e| Error::Serialize(e.to_string())),
        "toml" => toml::to_string_pretty(value).map_err(|e| Error::Serialize(e.to_string())),
        "yaml" | "yml" => serde_yaml::to_string(value).map_err(|e| Error::Serialize(e.to_string())),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}
