//! Predicate classification and the predicate traits.
//!
//! A class is a predicate iff one of its *directly declared* interfaces is the
//! "accept one path" or "accept (directory, name)" capability. The sandbox
//! relies on the generic check; the refined ones are for diagnostics.

use std::path::Path;
use std::sync::Arc;

use crate::{ClassDescriptor, GateError, Interface};

fn require_class(class: Option<&ClassDescriptor>) -> Result<&ClassDescriptor, GateError> {
    class.ok_or_else(|| GateError::InvalidArgument("class reference is missing".to_string()))
}

pub fn is_predicate(class: Option<&ClassDescriptor>) -> Result<bool, GateError> {
    let class = require_class(class)?;
    Ok(class.declares(&Interface::FilePredicate) || class.declares(&Interface::FilenamePredicate))
}

pub fn is_filename_predicate(class: Option<&ClassDescriptor>) -> Result<bool, GateError> {
    Ok(require_class(class)?.declares(&Interface::FilenamePredicate))
}

pub fn is_file_predicate(class: Option<&ClassDescriptor>) -> Result<bool, GateError> {
    Ok(require_class(class)?.declares(&Interface::FilePredicate))
}

/// Decides inclusion of a single path.
pub trait FilePredicate: Send + Sync {
    fn descriptor(&self) -> Arc<ClassDescriptor>;

    fn accept(&self, path: &Path) -> Result<bool, GateError>;
}

/// Decides inclusion of `name` inside `dir`.
pub trait FilenamePredicate: Send + Sync {
    fn descriptor(&self) -> Arc<ClassDescriptor>;

    fn accept(&self, dir: &Path, name: &str) -> Result<bool, GateError>;
}

/// A live predicate of either kind.
#[derive(Clone)]
pub enum Predicate {
    File(Arc<dyn FilePredicate>),
    Filename(Arc<dyn FilenamePredicate>),
}

impl Predicate {
    pub fn descriptor(&self) -> Arc<ClassDescriptor> {
        match self {
            Predicate::File(p) => p.descriptor(),
            Predicate::Filename(p) => p.descriptor(),
        }
    }

    /// Descriptor pushed while the predicate runs. It always declares the
    /// interface of the trait being evaluated, whatever the implementor's own
    /// descriptor claims.
    fn frame_descriptor(&self) -> Arc<ClassDescriptor> {
        let (descriptor, interface) = match self {
            Predicate::File(p) => (p.descriptor(), Interface::FilePredicate),
            Predicate::Filename(p) => (p.descriptor(), Interface::FilenamePredicate),
        };
        if descriptor.declares(&interface) {
            descriptor
        } else {
            Arc::new((*descriptor).clone().implementing(interface))
        }
    }

    /// Evaluates the predicate for `dir/name` inside its own frame, so every
    /// sensitive operation it attempts is checked against the sandbox.
    pub fn accept_entry(&self, dir: &Path, name: &str) -> Result<bool, GateError> {
        let _frame = crate::sandbox::enter(self.frame_descriptor());
        match self {
            Predicate::File(p) => p.accept(&dir.join(name)),
            Predicate::Filename(p) => p.accept(dir, name),
        }
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Predicate::File(_) => "File",
            Predicate::Filename(_) => "Filename",
        };
        write!(f, "Predicate::{}({})", kind, self.descriptor().name())
    }
}
