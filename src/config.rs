use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::authorize::USERNAME_PLACEHOLDER;
use crate::codec::DEFAULT_MAX_BLOB_BYTES;

const DEFAULT_USER_ROOT: &str = "/var/lib/callgate/users/{username}";
const DEFAULT_UPLOAD_ROOT: &str = "/var/lib/callgate/classpath";

/// Where predicate evaluation for a listing runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Same process, guarded by the stack-witness sandbox only.
    #[default]
    InProcess,
    /// Forked child under a seccomp filter, in addition to the sandbox.
    Seccomp,
}

impl Isolation {
    pub fn as_str(self) -> &'static str {
        match self {
            Isolation::InProcess => "in_process",
            Isolation::Seccomp => "seccomp",
        }
    }
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_process" | "in-process" => Ok(Isolation::InProcess),
            "seccomp" => Ok(Isolation::Seccomp),
            other => Err(anyhow!(
                "isolation must be \"in_process\" or \"seccomp\", got {other:?}"
            )),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    roots: Option<RootsConfigFile>,
    isolation: Option<Isolation>,
    max_blob_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RootsConfigFile {
    user_home: Option<String>,
    classpath_upload: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Per-user home root; `{username}` is replaced with the caller's name.
    pub user_root_template: String,
    pub classpath_upload_root: PathBuf,
    pub isolation: Isolation,
    pub max_blob_bytes: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from_file(GateConfigFile::default())
    }
}

impl GateConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CALLGATE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GateConfigFile) -> Self {
        let user_root_template = file
            .roots
            .as_ref()
            .and_then(|roots| roots.user_home.clone())
            .unwrap_or_else(|| DEFAULT_USER_ROOT.to_string());
        let classpath_upload_root = file
            .roots
            .and_then(|roots| roots.classpath_upload)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_ROOT));
        Self {
            user_root_template,
            classpath_upload_root,
            isolation: file.isolation.unwrap_or_default(),
            max_blob_bytes: file.max_blob_bytes.unwrap_or(DEFAULT_MAX_BLOB_BYTES),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("CALLGATE_USER_ROOT") {
            if !root.trim().is_empty() {
                self.user_root_template = root;
            }
        }
        if let Ok(root) = std::env::var("CALLGATE_UPLOAD_ROOT") {
            if !root.trim().is_empty() {
                self.classpath_upload_root = PathBuf::from(root);
            }
        }
        if let Ok(isolation) = std::env::var("CALLGATE_ISOLATION") {
            if !isolation.trim().is_empty() {
                self.isolation = isolation.parse()?;
            }
        }
        if let Ok(max) = std::env::var("CALLGATE_MAX_BLOB_BYTES") {
            if !max.trim().is_empty() {
                self.max_blob_bytes = max.trim().parse().map_err(|_| {
                    anyhow!("CALLGATE_MAX_BLOB_BYTES must be an integer byte count")
                })?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !Path::new(&self.user_root_template).is_absolute() {
            return Err(anyhow!(
                "user root {:?} must be an absolute path",
                self.user_root_template
            ));
        }
        if self.user_root_template.matches(USERNAME_PLACEHOLDER).count() > 1 {
            return Err(anyhow!(
                "user root may contain {USERNAME_PLACEHOLDER} at most once"
            ));
        }
        if !self.classpath_upload_root.is_absolute() {
            return Err(anyhow!(
                "classpath upload root {} must be an absolute path",
                self.classpath_upload_root.display()
            ));
        }
        if self.max_blob_bytes == 0 {
            return Err(anyhow!("max_blob_bytes must be greater than zero"));
        }
        if self.isolation == Isolation::Seccomp && !crate::sandbox::seccomp::available() {
            return Err(anyhow!(
                "seccomp isolation is not available on this platform"
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<GateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
