//! Remote-call allow-list.
//!
//! A class is callable only if it declares one of the two marker interfaces
//! and its code was not loaded from a place users can upload to. Every call
//! is evaluated from scratch; a class's container can change between
//! deployments.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::{ClassDescriptor, CodeOrigin, GateConfig, GateError, Interface};

/// Why a call was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenialReason {
    InvalidUsername,
    /// The locator could not place the class's code.
    UnresolvableOrigin,
    /// Code lives under the calling user's home root.
    UserHomeContainment(PathBuf),
    /// Code lives under the classpath upload root.
    UploadRootContainment(PathBuf),
    /// Neither marker interface is declared.
    Unmarked,
    /// A server hook refused the call.
    Vetoed(String),
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::InvalidUsername => f.write_str("username is not acceptable"),
            DenialReason::UnresolvableOrigin => f.write_str("code origin cannot be resolved"),
            DenialReason::UserHomeContainment(root) => {
                write!(f, "code was loaded from user home root {}", root.display())
            }
            DenialReason::UploadRootContainment(root) => {
                write!(f, "code was loaded from upload root {}", root.display())
            }
            DenialReason::Unmarked => f.write_str("class declares no remote-call marker"),
            DenialReason::Vetoed(why) => write!(f, "vetoed: {why}"),
        }
    }
}

// -------------------- Collaborators --------------------

/// Supplies the roots under which uploaded code lives.
pub trait RootProvider: Send + Sync {
    fn user_home_root(&self, username: &str) -> PathBuf;

    fn classpath_upload_root(&self) -> PathBuf;
}

/// Tells where a class's code was loaded from.
pub trait ClassLocator: Send + Sync {
    fn locate(&self, class: &ClassDescriptor) -> CodeOrigin;
}

/// Trusts the origin recorded on the descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct DescriptorLocator;

impl ClassLocator for DescriptorLocator {
    fn locate(&self, class: &ClassDescriptor) -> CodeOrigin {
        class.origin().clone()
    }
}

pub const USERNAME_PLACEHOLDER: &str = "{username}";

/// Roots derived from configuration: a per-user template and a fixed upload
/// root.
#[derive(Clone, Debug)]
pub struct ConfiguredRoots {
    user_root_template: String,
    upload_root: PathBuf,
}

impl ConfiguredRoots {
    pub fn new(user_root_template: &str, upload_root: impl Into<PathBuf>) -> Self {
        Self {
            user_root_template: user_root_template.to_string(),
            upload_root: upload_root.into(),
        }
    }

    pub fn from_config(cfg: &GateConfig) -> Self {
        Self::new(&cfg.user_root_template, cfg.classpath_upload_root.clone())
    }
}

impl RootProvider for ConfiguredRoots {
    fn user_home_root(&self, username: &str) -> PathBuf {
        PathBuf::from(self.user_root_template.replace(USERNAME_PLACEHOLDER, username))
    }

    fn classpath_upload_root(&self) -> PathBuf {
        self.upload_root.clone()
    }
}

// -------------------- Path Handling --------------------

/// Lexically normalizes `path`: drops `.` and resolves `..` without touching
/// the filesystem. `..` never climbs above the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str())
            }
            Component::CurDir => {}
            Component::ParentDir => {
                let at_parent = matches!(out.components().next_back(), Some(Component::ParentDir));
                if at_parent || (!out.pop() && !path.has_root()) {
                    out.push("..");
                }
            }
        }
    }
    out
}

fn is_filesystem_root(path: &Path) -> bool {
    path.has_root() && path.parent().is_none()
}

/// Usernames become path segments, so they are held to a strict allowlist.
pub fn validate_username(username: &str) -> Result<(), GateError> {
    static USERNAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = USERNAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9._@-]{1,64}$").expect("username pattern compiles")
    });
    if !re.is_match(username) || username == "." || username == ".." {
        return Err(GateError::InvalidArgument(format!(
            "username {username:?} must match ^[A-Za-z0-9._@-]{{1,64}}$"
        )));
    }
    Ok(())
}

// -------------------- Authorizer --------------------

#[derive(Clone)]
pub struct CallAuthorizer {
    roots: Arc<dyn RootProvider>,
    locator: Arc<dyn ClassLocator>,
}

impl CallAuthorizer {
    pub fn new(roots: Arc<dyn RootProvider>) -> Self {
        Self {
            roots,
            locator: Arc::new(DescriptorLocator),
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn ClassLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn is_callable(&self, class: &ClassDescriptor, username: &str) -> bool {
        self.check_callable(class, username).is_ok()
    }

    /// Authorizes a remote call of `class` by `username`.
    pub fn check_callable(&self, class: &ClassDescriptor, username: &str) -> Result<(), GateError> {
        let deny = |reason: DenialReason| {
            log::warn!(
                "remote call of {} by {:?} denied: {}",
                class.name(),
                username,
                reason
            );
            Err(GateError::AuthorizationDenied {
                class: class.name().to_string(),
                reason,
            })
        };

        if validate_username(username).is_err() {
            return deny(DenialReason::InvalidUsername);
        }

        match self.locator.locate(class) {
            CodeOrigin::Unresolvable => return deny(DenialReason::UnresolvableOrigin),
            CodeOrigin::Builtin => {}
            CodeOrigin::Archive(path) | CodeOrigin::ClassFile(path) => {
                if !path.is_absolute() {
                    return deny(DenialReason::UnresolvableOrigin);
                }
                if let Some(reason) = self.containment(&normalize(&path), username) {
                    return deny(reason);
                }
            }
        }

        if class.declares(&Interface::NoAuthRequired) {
            log::debug!("{} callable without authentication", class.name());
            return Ok(());
        }
        if class.declares(&Interface::RequiresAuth) {
            log::debug!("{} callable by authenticated user {:?}", class.name(), username);
            return Ok(());
        }
        deny(DenialReason::Unmarked)
    }

    fn containment(&self, container: &Path, username: &str) -> Option<DenialReason> {
        let home = normalize(&self.roots.user_home_root(username));
        if is_filesystem_root(&home) {
            // No containment configured.
            return None;
        }
        if container.starts_with(&home) {
            return Some(DenialReason::UserHomeContainment(home));
        }
        let upload = normalize(&self.roots.classpath_upload_root());
        if container.starts_with(&upload) {
            return Some(DenialReason::UploadRootContainment(upload));
        }
        None
    }
}
