//! Remote call gate
//!
//! This crate decides which server-side classes a remote caller may invoke and
//! contains client-supplied directory-listing predicates once they run inside
//! the server process.
//!
//! # Architecture
//!
//! Components, leaves first:
//!
//! 1. **Predicate classifier** (`predicate`): pure inspection of a class's
//!    directly declared interfaces.
//! 2. **Dispatcher** (`dispatch`): invokes a named method on an instance or
//!    its ancestors, returning `None` when nothing implements it.
//! 3. **Blob codec** (`codec`): predicate filters <-> base64 text blobs.
//! 4. **Call authorizer** (`authorize`): marker interfaces plus path
//!    containment against uploaded code.
//! 5. **Execution sandbox** (`sandbox`): denies sensitive operations while a
//!    predicate frame is on the calling thread's stack.
//!
//! `gate::CallGate` wires them in request order; `listing` runs rebuilt
//! predicates over a directory under the sandbox.
//!
//! There is no runtime reflection in Rust, so server classes are described
//! explicitly by [`ClassDescriptor`] and registered in a
//! [`dispatch::ClassRegistry`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::OnceLock;

pub mod authorize;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod listing;
pub mod predicate;
pub mod sandbox;

pub use authorize::{CallAuthorizer, ClassLocator, ConfiguredRoots, DenialReason, RootProvider};
pub use codec::{FilterSpec, PredicateRegistry};
pub use config::{GateConfig, Isolation};
pub use dispatch::{Arg, ClassBuilder, ClassRegistry, Dispatcher, GateHooks, Instance, ParamType};
pub use error::{ClientStatus, GateError};
pub use gate::CallGate;
pub use predicate::{FilePredicate, FilenamePredicate, Predicate};
pub use sandbox::{Operation, OperationKind, Sandbox, StackWitness, Violation};

// -------------------- Interfaces --------------------

/// Interfaces a class may declare. Only the first four carry meaning for the
/// gate; anything else is kept by name so descriptors stay faithful.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Interface {
    /// "accept one path" predicate capability.
    FilePredicate,
    /// "accept (directory, name)" predicate capability.
    FilenamePredicate,
    /// Marker: remotely callable by authenticated users.
    RequiresAuth,
    /// Marker: remotely callable without authentication.
    NoAuthRequired,
    Other(String),
}

// -------------------- Code Origin --------------------

/// Where a class's code was loaded from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CodeOrigin {
    /// Loaded from an archive (plugin bundle).
    Archive(PathBuf),
    /// Loaded from a loose class file.
    ClassFile(PathBuf),
    /// Compiled into the server binary.
    Builtin,
    /// The locator could not tell.
    Unresolvable,
}

impl CodeOrigin {
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            CodeOrigin::Archive(path) | CodeOrigin::ClassFile(path) => Some(path),
            CodeOrigin::Builtin | CodeOrigin::Unresolvable => None,
        }
    }
}

// -------------------- Class Descriptors --------------------

/// A conforming class name is a dotted sequence of identifiers.
///
/// Allowed: "Greeter", "org.acme.files.ListService", "org.acme.Outer$Inner"
/// Disallowed: empty, leading/trailing dots, whitespace, slashes.
pub fn validate_class_name(name: &str) -> Result<(), GateError> {
    static CLASS_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CLASS_NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)*$")
            .expect("class name pattern compiles")
    });
    if !re.is_match(name) {
        return Err(GateError::InvalidArgument(format!(
            "class name {name:?} is not a dotted identifier"
        )));
    }
    Ok(())
}

/// Static metadata for a server-side class.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassDescriptor {
    name: String,
    /// Directly declared interfaces only; nothing inherited.
    interfaces: BTreeSet<Interface>,
    superclass: Option<String>,
    origin: CodeOrigin,
}

impl ClassDescriptor {
    pub fn new(name: &str) -> Result<Self, GateError> {
        validate_class_name(name)?;
        Ok(Self {
            name: name.to_string(),
            interfaces: BTreeSet::new(),
            superclass: None,
            origin: CodeOrigin::Builtin,
        })
    }

    pub fn implementing(mut self, interface: Interface) -> Self {
        self.interfaces.insert(interface);
        self
    }

    pub fn extending(mut self, superclass: &str) -> Result<Self, GateError> {
        validate_class_name(superclass)?;
        self.superclass = Some(superclass.to_string());
        Ok(self)
    }

    pub fn loaded_from(mut self, origin: CodeOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    pub fn origin(&self) -> &CodeOrigin {
        &self.origin
    }

    pub fn declares(&self, interface: &Interface) -> bool {
        self.interfaces.contains(interface)
    }

    pub fn declared_interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter()
    }
}

impl std::fmt::Display for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
