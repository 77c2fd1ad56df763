//! Locations of certificates and ACL files
//!
//! Resolved once at startup, from an explicit directory or `$HOME/.replog`.
use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't determine the home directory")]
    NoHomeDir,
    #[error("can't read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("invalid policy at {}:{line}: {msg}", path.display())]
    Policy {
        path: PathBuf,
        line: usize,
        msg: String,
    },
}

impl ConfigError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFiles {
    pub ca_file: PathBuf,
    pub server_cert_file: PathBuf,
    pub server_key_file: PathBuf,
    pub root_client_cert_file: PathBuf,
    pub root_client_key_file: PathBuf,
    pub nobody_client_cert_file: PathBuf,
    pub nobody_client_key_file: PathBuf,
    pub acl_model_file: PathBuf,
    pub acl_policy_file: PathBuf,
}

impl ConfigFiles {
    /// Directory under `$HOME` used when no directory was given
    pub const DEFAULT_DIR_NAME: &'static str = ".replog";

    /// All the files, in `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            ca_file: dir.join("ca.pem"),
            server_cert_file: dir.join("server.pem"),
            server_key_file: dir.join("server-key.pem"),
            root_client_cert_file: dir.join("root-client.pem"),
            root_client_key_file: dir.join("root-client-key.pem"),
            nobody_client_cert_file: dir.join("nobody-client.pem"),
            nobody_client_key_file: dir.join("nobody-client-key.pem"),
            acl_model_file: dir.join("model.conf"),
            acl_policy_file: dir.join("policy.csv"),
        }
    }

    /// Use `config_dir` if given, otherwise `home_dir/.replog`
    pub fn resolve(config_dir: Option<&Path>, home_dir: Option<&Path>) -> ConfigResult<Self> {
        match (config_dir, home_dir) {
            (Some(dir), _) => Ok(Self::in_dir(dir)),
            (None, Some(home)) => Ok(Self::in_dir(home.join(Self::DEFAULT_DIR_NAME))),
            (None, None) => Err(ConfigError::NoHomeDir),
        }
    }

    /// Are the files needed to serve TLS there
    pub fn has_server_tls(&self) -> bool {
        [&self.ca_file, &self.server_cert_file, &self.server_key_file]
            .iter()
            .all(|path| path.exists())
    }

    /// Are the ACL files there
    pub fn has_acl(&self) -> bool {
        self.acl_model_file.exists() && self.acl_policy_file.exists()
    }
}
