//! Transportable listing filters and the logic that rebuilds them into live
//! predicates.
//!
//! Filters travel as data from a closed set of kinds. Server-side extensions
//! are registered by name in a [`PredicateRegistry`] and referenced through
//! the `custom` kind; clients never ship code.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use super::{decode_value, fingerprint, to_blob};
use crate::predicate::{FilePredicate, Predicate};
use crate::sandbox::ops;
use crate::{ClassDescriptor, GateError, Interface};

const KNOWN_KINDS: [&str; 11] = [
    "suffix",
    "prefix",
    "name_equals",
    "directory_only",
    "file_only",
    "larger_than",
    "smaller_than",
    "all",
    "any",
    "not",
    "custom",
];

/// Deepest combinator nesting accepted from a client.
pub const MAX_FILTER_DEPTH: usize = 32;

const SPEC_FILTER_CLASS: &str = "callgate.filter.SpecFilter";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterSpec {
    Suffix {
        suffix: String,
        #[serde(default)]
        ignore_case: bool,
    },
    Prefix {
        prefix: String,
        #[serde(default)]
        ignore_case: bool,
    },
    NameEquals {
        name: String,
    },
    DirectoryOnly,
    FileOnly,
    LargerThan {
        bytes: u64,
    },
    SmallerThan {
        bytes: u64,
    },
    All {
        filters: Vec<FilterSpec>,
    },
    Any {
        filters: Vec<FilterSpec>,
    },
    Not {
        filter: Box<FilterSpec>,
    },
    /// A predicate the server registered under `name`.
    Custom {
        name: String,
        #[serde(default)]
        config: Value,
    },
}

impl FilterSpec {
    pub fn suffix(suffix: &str) -> Self {
        FilterSpec::Suffix {
            suffix: suffix.to_string(),
            ignore_case: false,
        }
    }

    pub fn prefix(prefix: &str) -> Self {
        FilterSpec::Prefix {
            prefix: prefix.to_string(),
            ignore_case: false,
        }
    }

    pub fn all(filters: Vec<FilterSpec>) -> Self {
        FilterSpec::All { filters }
    }

    pub fn any(filters: Vec<FilterSpec>) -> Self {
        FilterSpec::Any { filters }
    }

    pub fn negate(filter: FilterSpec) -> Self {
        FilterSpec::Not {
            filter: Box::new(filter),
        }
    }

    pub fn custom(name: &str, config: Value) -> Self {
        FilterSpec::Custom {
            name: name.to_string(),
            config,
        }
    }
}

pub fn encode_filter(spec: &FilterSpec) -> Result<String, GateError> {
    to_blob(spec)
}

/// Decodes a filter blob. Kinds this server does not know are
/// `PredicateUnresolvable`; anything else that fails to parse is malformed.
pub fn decode_filter(blob: &str, max_bytes: usize) -> Result<FilterSpec, GateError> {
    let value = decode_value(blob, max_bytes)?;
    check_kinds(&value, 0)?;
    serde_json::from_value(value).map_err(|err| GateError::BlobMalformed(err.to_string()))
}

fn check_kinds(value: &Value, depth: usize) -> Result<(), GateError> {
    if depth > MAX_FILTER_DEPTH {
        return Err(GateError::BlobMalformed(format!(
            "filter nesting exceeds {MAX_FILTER_DEPTH} levels"
        )));
    }
    let obj = value
        .as_object()
        .ok_or_else(|| GateError::BlobMalformed("filter must be an object".to_string()))?;
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| GateError::BlobMalformed("filter kind must be a string".to_string()))?;
    if !KNOWN_KINDS.contains(&kind) {
        return Err(GateError::PredicateUnresolvable(format!(
            "filter kind {kind:?} is not known to this server"
        )));
    }
    if let Some(children) = obj.get("filters").and_then(Value::as_array) {
        for child in children {
            check_kinds(child, depth + 1)?;
        }
    }
    if let Some(child) = obj.get("filter") {
        check_kinds(child, depth + 1)?;
    }
    Ok(())
}

/// Decodes `blob` and rebuilds the live predicate it describes.
pub fn rebuild_predicate(
    blob: &str,
    registry: &PredicateRegistry,
    max_bytes: usize,
) -> Result<Predicate, GateError> {
    let spec = decode_filter(blob, max_bytes).map_err(|err| {
        log::warn!("filter blob {} rejected: {}", fingerprint(blob), err);
        err
    })?;
    let predicate = registry.rebuild(&spec)?;
    log::debug!(
        "filter blob {} rebuilt as {}",
        fingerprint(blob),
        predicate.descriptor().name()
    );
    Ok(predicate)
}

// -------------------- Registry --------------------

type Factory = Arc<dyn Fn(&Value) -> anyhow::Result<Predicate> + Send + Sync>;

/// Server-side predicates clients may reference by name.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    factories: HashMap<String, Factory>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Predicate> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn resolve(&self, name: &str, config: &Value) -> Result<Predicate, GateError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            GateError::PredicateUnresolvable(format!("custom predicate {name:?} is not registered"))
        })?;
        factory(config).map_err(|err| {
            GateError::InvalidArgument(format!("custom predicate {name:?} rejected config: {err:#}"))
        })
    }

    /// Builds the live predicate for `spec`. A bare custom filter is returned
    /// as registered; everything else becomes one combinator tree.
    pub fn rebuild(&self, spec: &FilterSpec) -> Result<Predicate, GateError> {
        if let FilterSpec::Custom { name, config } = spec {
            return self.resolve(name, config);
        }
        let root = self.compile(spec)?;
        Ok(Predicate::File(Arc::new(SpecFilter { root })))
    }

    fn compile(&self, spec: &FilterSpec) -> Result<Node, GateError> {
        Ok(match spec {
            FilterSpec::Suffix {
                suffix,
                ignore_case,
            } => Node::Suffix(Pattern::new(suffix, *ignore_case)),
            FilterSpec::Prefix {
                prefix,
                ignore_case,
            } => Node::Prefix(Pattern::new(prefix, *ignore_case)),
            FilterSpec::NameEquals { name } => Node::NameEquals(name.clone()),
            FilterSpec::DirectoryOnly => Node::DirectoryOnly,
            FilterSpec::FileOnly => Node::FileOnly,
            FilterSpec::LargerThan { bytes } => Node::LargerThan(*bytes),
            FilterSpec::SmallerThan { bytes } => Node::SmallerThan(*bytes),
            FilterSpec::All { filters } => Node::All(self.compile_all(filters)?),
            FilterSpec::Any { filters } => Node::Any(self.compile_all(filters)?),
            FilterSpec::Not { filter } => Node::Not(Box::new(self.compile(filter)?)),
            FilterSpec::Custom { name, config } => Node::Custom(self.resolve(name, config)?),
        })
    }

    fn compile_all(&self, filters: &[FilterSpec]) -> Result<Vec<Node>, GateError> {
        filters.iter().map(|f| self.compile(f)).collect()
    }
}

// -------------------- Live Filter --------------------

struct Pattern {
    text: String,
    ignore_case: bool,
}

impl Pattern {
    fn new(text: &str, ignore_case: bool) -> Self {
        let text = if ignore_case {
            text.to_lowercase()
        } else {
            text.to_string()
        };
        Self { text, ignore_case }
    }

    fn prepare(&self, name: &str) -> String {
        if self.ignore_case {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }
}

enum Node {
    Suffix(Pattern),
    Prefix(Pattern),
    NameEquals(String),
    DirectoryOnly,
    FileOnly,
    LargerThan(u64),
    SmallerThan(u64),
    All(Vec<Node>),
    Any(Vec<Node>),
    Not(Box<Node>),
    Custom(Predicate),
}

impl Node {
    fn eval(&self, path: &Path, name: &str) -> Result<bool, GateError> {
        match self {
            Node::Suffix(p) => Ok(p.prepare(name).ends_with(&p.text)),
            Node::Prefix(p) => Ok(p.prepare(name).starts_with(&p.text)),
            Node::NameEquals(expected) => Ok(name == expected),
            Node::DirectoryOnly => Ok(entry_metadata(path)?.is_some_and(|m| m.is_dir())),
            Node::FileOnly => Ok(entry_metadata(path)?.is_some_and(|m| m.is_file())),
            Node::LargerThan(bytes) => Ok(entry_metadata(path)?.is_some_and(|m| m.len() > *bytes)),
            Node::SmallerThan(bytes) => {
                Ok(entry_metadata(path)?.is_some_and(|m| m.len() < *bytes))
            }
            Node::All(nodes) => {
                for node in nodes {
                    if !node.eval(path, name)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Node::Any(nodes) => {
                for node in nodes {
                    if node.eval(path, name)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Node::Not(node) => Ok(!node.eval(path, name)?),
            Node::Custom(predicate) => {
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                predicate.accept_entry(dir, name)
            }
        }
    }
}

/// Metadata of a listed entry; `None` if it vanished since listing.
fn entry_metadata(path: &Path) -> Result<Option<std::fs::Metadata>, GateError> {
    match ops::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(GateError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// The predicate every data-described filter rebuilds into.
struct SpecFilter {
    root: Node,
}

fn spec_filter_class() -> Arc<ClassDescriptor> {
    static CLASS: OnceLock<Arc<ClassDescriptor>> = OnceLock::new();
    CLASS
        .get_or_init(|| {
            Arc::new(
                ClassDescriptor::new(SPEC_FILTER_CLASS)
                    .expect("built-in filter class name is valid")
                    .implementing(Interface::FilePredicate),
            )
        })
        .clone()
}

impl FilePredicate for SpecFilter {
    fn descriptor(&self) -> Arc<ClassDescriptor> {
        spec_filter_class()
    }

    fn accept(&self, path: &Path) -> Result<bool, GateError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root.eval(path, &name)
    }
}
