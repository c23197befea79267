//! Configuration lookup
//!
//! `up` accepts three kinds of source string:
//!
//! - configuration text (anything containing `[Interface]`)
//! - a path to an existing configuration file; the interface is named after
//!   the file stem
//! - an interface name, looked up as `<name>.conf` in the search path

use crate::error::ContextError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable holding a platform path list of directories
pub const CONFIG_PATH_ENV: &str = "LBV_CONFIG_PATH";

const INLINE_MARKER: &str = "[Interface]";

/// Directories searched for `<interface>.conf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Parse a platform path list (`:` separated on Unix, `;` on Windows)
    pub fn parse(paths: &str) -> Result<Self, ContextError> {
        let dirs: Vec<PathBuf> = std::env::split_paths(paths)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        if dirs.is_empty() || paths.contains('\0') {
            return Err(ContextError::InvalidSearchPath(paths.to_string()));
        }
        Ok(Self { dirs })
    }

    /// The environment's search path, or the platform default
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var_os(CONFIG_PATH_ENV))
    }

    /// Search path for a given value of [`CONFIG_PATH_ENV`]
    pub fn from_env_value(value: Option<OsString>) -> Self {
        let dirs: Vec<PathBuf> = value
            .map(|v| {
                std::env::split_paths(&v)
                    .filter(|p| !p.as_os_str().is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if dirs.is_empty() {
            Self::platform_default()
        } else {
            Self { dirs }
        }
    }

    pub fn platform_default() -> Self {
        let dir = if cfg!(target_os = "windows") {
            r"C:\Program Data\LogonBox\VPN\conf.d"
        } else if cfg!(target_os = "macos") {
            "/Library/LogonBox VPN/conf"
        } else {
            "/etc/logonbox-vpn"
        };
        Self {
            dirs: vec![PathBuf::from(dir)],
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First `<name>.conf` that exists
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let file = format!("{}.conf", name);
        self.dirs
            .iter()
            .map(|dir| dir.join(&file))
            .find(|path| path.is_file())
    }
}

/// Configuration text plus where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    pub text: String,
    /// Interface name, when loaded from a file
    pub name: Option<String>,
    pub path: Option<PathBuf>,
}

/// Interface name for a configuration file: the name without its extension
pub fn interface_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

fn load_file(path: &Path) -> Result<LoadedSource, ContextError> {
    let text = std::fs::read_to_string(path).map_err(|e| ContextError::ConfigurationLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(LoadedSource {
        text,
        name: interface_name(path),
        path: Some(path.to_path_buf()),
    })
}

/// Turn a source string into configuration text
pub fn load_source(source: &str, search: &SearchPath) -> Result<LoadedSource, ContextError> {
    if source.contains(INLINE_MARKER) {
        return Ok(LoadedSource {
            text: source.to_string(),
            name: None,
            path: None,
        });
    }

    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(ContextError::ConfigurationNotFound(source.to_string()));
    }

    let as_path = Path::new(trimmed);
    if as_path.is_file() {
        debug!(path = %as_path.display(), "Loading configuration file");
        return load_file(as_path);
    }

    match search.find(trimmed) {
        Some(path) => {
            debug!(interface = trimmed, path = %path.display(), "Found configuration in search path");
            load_file(&path)
        }
        None => Err(ContextError::ConfigurationNotFound(trimmed.to_string())),
    }
}
