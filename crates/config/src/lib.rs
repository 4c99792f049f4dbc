//! Host config document handling.
//!
//! Config files: `napgate.json`, `napgate.toml`, `napgate.yaml` or `napgate.yml`,
//! searched in `./` then `~/.config/napgate/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod provider;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, find_config_file, find_or_default_config_path, load_config_value,
        load_raw_config_value, save_config_value,
    },
    provider::{ConfigProvider, FileConfigProvider, MemoryConfigProvider},
};
