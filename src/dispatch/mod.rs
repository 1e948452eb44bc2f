//! Name-based method dispatch over registered classes.
//!
//! `invoke` looks at the methods *declared* by the instance's class, then
//! walks up the superclass chain. Nothing found anywhere is `Ok(None)`, which
//! lets callers treat a method as an optional hook. At most one method per
//! name may be declared at a class level; there is no overload resolution.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{sandbox, validate_class_name, ClassDescriptor, GateError};

pub mod hooks;

pub use hooks::{GateHooks, NoHooks};

/// Longest superclass chain followed before the registry is considered broken.
const MAX_ANCESTRY: usize = 64;

// -------------------- Arguments --------------------

/// A loosely typed call argument or return value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Null,
    Boolean(bool),
    Byte(i8),
    Char(char),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Json(serde_json::Value),
}

impl Arg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Arg::Byte(v) => Some(v.into()),
            Arg::Short(v) => Some(v.into()),
            Arg::Int(v) => Some(v.into()),
            Arg::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Arg::Boolean(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Boolean(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Int(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Long(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Double(value)
    }
}

/// Formal parameter types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Str,
    Json,
}

impl ParamType {
    /// Infers the formal type from an argument's runtime value. Every wrapped
    /// scalar maps to its primitive type; the mapping is only used for
    /// inference and never to look methods up. `Null` infers nothing.
    pub fn infer(arg: &Arg) -> Option<ParamType> {
        match arg {
            Arg::Null => None,
            Arg::Boolean(_) => Some(ParamType::Boolean),
            Arg::Byte(_) => Some(ParamType::Byte),
            Arg::Char(_) => Some(ParamType::Char),
            Arg::Short(_) => Some(ParamType::Short),
            Arg::Int(_) => Some(ParamType::Int),
            Arg::Long(_) => Some(ParamType::Long),
            Arg::Float(_) => Some(ParamType::Float),
            Arg::Double(_) => Some(ParamType::Double),
            Arg::Str(_) => Some(ParamType::Str),
            Arg::Json(_) => Some(ParamType::Json),
        }
    }

    fn is_primitive(self) -> bool {
        !matches!(self, ParamType::Str | ParamType::Json)
    }

    fn accepts(self, arg: &Arg) -> bool {
        match ParamType::infer(arg) {
            Some(inferred) => inferred == self,
            // Null binds to reference parameters only.
            None => !self.is_primitive(),
        }
    }
}

// -------------------- Classes --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

pub type Handler = Arc<dyn Fn(&Instance, &[Arg]) -> anyhow::Result<Arg> + Send + Sync>;
type Constructor = Arc<dyn Fn() -> anyhow::Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

#[derive(Clone)]
pub struct MethodDef {
    name: String,
    params: Vec<ParamType>,
    visibility: Visibility,
    handler: Handler,
}

impl MethodDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }
}

/// A registered class: descriptor, declared methods and optional constructor.
pub struct ClassEntry {
    descriptor: Arc<ClassDescriptor>,
    methods: Vec<MethodDef>,
    constructor: Option<Constructor>,
}

impl ClassEntry {
    pub fn descriptor(&self) -> &Arc<ClassDescriptor> {
        &self.descriptor
    }

    pub fn declared_method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

pub struct ClassBuilder {
    descriptor: ClassDescriptor,
    methods: Vec<MethodDef>,
    constructor: Option<Constructor>,
}

impl ClassBuilder {
    pub fn new(descriptor: ClassDescriptor) -> Self {
        Self {
            descriptor,
            methods: Vec::new(),
            constructor: None,
        }
    }

    pub fn constructor<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(move || {
            let value = f()?;
            Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
        }));
        self
    }

    pub fn method<F>(self, name: &str, params: &[ParamType], handler: F) -> Self
    where
        F: Fn(&Instance, &[Arg]) -> anyhow::Result<Arg> + Send + Sync + 'static,
    {
        self.declare(name, params, Visibility::Public, Arc::new(handler))
    }

    pub fn private_method<F>(self, name: &str, params: &[ParamType], handler: F) -> Self
    where
        F: Fn(&Instance, &[Arg]) -> anyhow::Result<Arg> + Send + Sync + 'static,
    {
        self.declare(name, params, Visibility::Private, Arc::new(handler))
    }

    fn declare(
        mut self,
        name: &str,
        params: &[ParamType],
        visibility: Visibility,
        handler: Handler,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.to_string(),
            params: params.to_vec(),
            visibility,
            handler,
        });
        self
    }

    pub fn build(self) -> Result<ClassEntry, GateError> {
        for (i, method) in self.methods.iter().enumerate() {
            if self.methods[..i].iter().any(|m| m.name == method.name) {
                return Err(GateError::InvalidArgument(format!(
                    "{} declares {} more than once",
                    self.descriptor.name(),
                    method.name
                )));
            }
        }
        Ok(ClassEntry {
            descriptor: Arc::new(self.descriptor),
            methods: self.methods,
            constructor: self.constructor,
        })
    }
}

#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, Arc<ClassEntry>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: ClassEntry) -> Result<(), GateError> {
        let name = entry.descriptor.name().to_string();
        if self.classes.contains_key(&name) {
            return Err(GateError::InvalidArgument(format!(
                "class {name} already registered"
            )));
        }
        self.classes.insert(name, Arc::new(entry));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassEntry>> {
        self.classes.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn entry(&self, name: &str) -> Result<Arc<ClassEntry>, GateError> {
        self.get(name)
            .ok_or_else(|| GateError::Reflection(format!("class {name} is not registered")))
    }

    pub fn instantiate(&self, name: &str) -> Result<Instance, GateError> {
        let entry = self.entry(name)?;
        let constructor = entry
            .constructor
            .as_ref()
            .ok_or_else(|| GateError::Reflection(format!("class {name} has no constructor")))?;
        let state = constructor()
            .map_err(|err| GateError::Reflection(format!("cannot construct {name}: {err:#}")))?;
        Ok(Instance {
            descriptor: entry.descriptor.clone(),
            state,
        })
    }

    /// Finds the first class in `start`'s ancestry declaring `method`.
    fn resolve(
        &self,
        start: &str,
        method: &str,
    ) -> Result<Option<(Arc<ClassEntry>, usize)>, GateError> {
        let mut current = Some(start.to_string());
        let mut hops = 0;
        while let Some(name) = current {
            if hops == MAX_ANCESTRY {
                return Err(GateError::Reflection(format!(
                    "superclass chain of {start} exceeds {MAX_ANCESTRY} levels"
                )));
            }
            let entry = self.entry(&name)?;
            if let Some(index) = entry.methods.iter().position(|m| m.name == method) {
                return Ok(Some((entry, index)));
            }
            current = entry.descriptor.superclass().map(str::to_string);
            hops += 1;
        }
        Ok(None)
    }
}

// -------------------- Instances --------------------

/// A constructed object: its class plus type-erased state.
#[derive(Clone)]
pub struct Instance {
    descriptor: Arc<ClassDescriptor>,
    state: Arc<dyn Any + Send + Sync>,
}

impl Instance {
    pub fn new<T: Any + Send + Sync>(descriptor: Arc<ClassDescriptor>, state: T) -> Self {
        Self {
            descriptor,
            state: Arc::new(state),
        }
    }

    pub fn descriptor(&self) -> &Arc<ClassDescriptor> {
        &self.descriptor
    }

    pub fn class_name(&self) -> &str {
        self.descriptor.name()
    }

    /// Borrows the state as `T`; handlers call this to reach their receiver.
    pub fn receiver<T: Any>(&self) -> anyhow::Result<&T> {
        self.state.downcast_ref::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "{} state is not a {}",
                self.class_name(),
                std::any::type_name::<T>()
            )
        })
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class_name())
            .finish_non_exhaustive()
    }
}

// -------------------- Dispatcher --------------------

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ClassRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClassRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Invokes `method` if the instance's class or an ancestor declares it.
    pub fn invoke(
        &self,
        instance: &Instance,
        method: &str,
        args: &[Arg],
    ) -> Result<Option<Arg>, GateError> {
        match self.registry.resolve(instance.class_name(), method)? {
            Some((entry, index)) => {
                let def = &entry.methods[index];
                call(&entry, def, instance, args).map(Some)
            }
            None => {
                log::debug!(
                    "{} implements no {}; treating as unimplemented hook",
                    instance.class_name(),
                    method
                );
                Ok(None)
            }
        }
    }

    /// Like [`invoke`](Self::invoke) but a missing method is an error.
    pub fn invoke_required(
        &self,
        instance: &Instance,
        method: &str,
        args: &[Arg],
    ) -> Result<Arg, GateError> {
        self.invoke(instance, method, args)?
            .ok_or_else(|| GateError::DispatchTargetMissing {
                class: instance.class_name().to_string(),
                method: method.to_string(),
            })
    }

    /// Answers whether `class_name` or an ancestor declares `method`, without
    /// invoking anything. Lookup failures surface as `GateError::Reflection`.
    pub fn exists_method(&self, class_name: &str, method: &str) -> Result<bool, GateError> {
        validate_class_name(class_name)
            .map_err(|err| GateError::Reflection(err.to_string()))?;
        Ok(self.registry.resolve(class_name, method)?.is_some())
    }
}

fn call(
    entry: &ClassEntry,
    def: &MethodDef,
    instance: &Instance,
    args: &[Arg],
) -> Result<Arg, GateError> {
    let class = entry.descriptor.name();
    if def.visibility == Visibility::Private {
        return Err(GateError::AccessDenied {
            class: class.to_string(),
            method: def.name.clone(),
        });
    }
    check_arguments(class, def, args)?;

    let _frame = sandbox::enter(entry.descriptor.clone());
    (def.handler)(instance, args).map_err(|source| GateError::InvocationFailed {
        class: class.to_string(),
        method: def.name.clone(),
        source,
    })
}

fn check_arguments(class: &str, def: &MethodDef, args: &[Arg]) -> Result<(), GateError> {
    let bad = |detail: String| GateError::BadArguments {
        class: class.to_string(),
        method: def.name.clone(),
        detail,
    };
    if args.len() != def.params.len() {
        return Err(bad(format!(
            "expected {} arguments, got {}",
            def.params.len(),
            args.len()
        )));
    }
    for (i, (param, arg)) in def.params.iter().zip(args).enumerate() {
        if !param.accepts(arg) {
            return Err(bad(format!(
                "argument {i} is {:?}, parameter is {:?}",
                ParamType::infer(arg),
                param
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Counter {
        base: i64,
    }

    fn registry() -> Arc<ClassRegistry> {
        let mut registry = ClassRegistry::new();
        let base = ClassBuilder::new(ClassDescriptor::new("t.Base").unwrap())
            .method("describe", &[], |instance, _| {
                Ok(Arg::from(format!("base view of {}", instance.class_name())))
            })
            .method("twice", &[ParamType::Int], |_, args| {
                let v = args[0].as_i64().unwrap_or_default();
                Ok(Arg::Long(v * 2))
            })
            .build()
            .unwrap();
        let sub = ClassBuilder::new(
            ClassDescriptor::new("t.Sub")
                .unwrap()
                .extending("t.Base")
                .unwrap(),
        )
        .constructor(|| Ok(Counter { base: 40 }))
        .method("add", &[ParamType::Int], |instance, args| {
            let counter = instance.receiver::<Counter>()?;
            Ok(Arg::Long(counter.base + args[0].as_i64().unwrap_or_default()))
        })
        .method("twice", &[ParamType::Str], |_, args| {
            Ok(Arg::from(args[0].as_str().unwrap_or_default().repeat(2)))
        })
        .method("fail", &[], |_, _| Err(anyhow!("quota exceeded for user")))
        .method("echo", &[ParamType::Str], |_, args| Ok(args[0].clone()))
        .private_method("secret", &[], |_, _| Ok(Arg::from("hidden")))
        .build()
        .unwrap();
        registry.register(base).unwrap();
        registry.register(sub).unwrap();
        Arc::new(registry)
    }

    fn sub_instance(dispatcher: &Dispatcher) -> Instance {
        dispatcher.registry().instantiate("t.Sub").unwrap()
    }

    #[test]
    fn declared_method_is_invoked_with_state() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        let out = dispatcher.invoke(&instance, "add", &[Arg::Int(2)]).unwrap();
        assert_eq!(out, Some(Arg::Long(42)));
    }

    #[test]
    fn ancestor_method_is_found() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        let out = dispatcher.invoke(&instance, "describe", &[]).unwrap();
        assert_eq!(out, Some(Arg::from("base view of t.Sub")));
    }

    #[test]
    fn nearest_declaration_wins_without_overload_resolution() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        // t.Sub declares twice(Str); the Int version on t.Base is never tried.
        let err = dispatcher
            .invoke(&instance, "twice", &[Arg::Int(3)])
            .unwrap_err();
        assert!(matches!(err, GateError::BadArguments { .. }));
        let out = dispatcher
            .invoke(&instance, "twice", &[Arg::from("ab")])
            .unwrap();
        assert_eq!(out, Some(Arg::from("abab")));
    }

    #[test]
    fn missing_method_is_none_unless_required() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        assert_eq!(dispatcher.invoke(&instance, "doesNotExist", &[]).unwrap(), None);
        let err = dispatcher
            .invoke_required(&instance, "doesNotExist", &[])
            .unwrap_err();
        assert!(matches!(err, GateError::DispatchTargetMissing { .. }));
    }

    #[test]
    fn callee_failure_keeps_original_error() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        let err = dispatcher.invoke(&instance, "fail", &[]).unwrap_err();
        assert!(matches!(err, GateError::InvocationFailed { .. }));
        assert_eq!(err.into_callee_error().to_string(), "quota exceeded for user");
    }

    #[test]
    fn argument_shape_errors_are_dispatcher_errors() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        let arity = dispatcher.invoke(&instance, "add", &[]).unwrap_err();
        assert!(matches!(arity, GateError::BadArguments { .. }));
        let primitive_null = dispatcher
            .invoke(&instance, "add", &[Arg::Null])
            .unwrap_err();
        assert!(matches!(primitive_null, GateError::BadArguments { .. }));
        let reference_null = dispatcher.invoke(&instance, "echo", &[Arg::Null]).unwrap();
        assert_eq!(reference_null, Some(Arg::Null));
    }

    #[test]
    fn private_methods_are_found_but_not_callable() {
        let dispatcher = Dispatcher::new(registry());
        let instance = sub_instance(&dispatcher);
        assert!(dispatcher.exists_method("t.Sub", "secret").unwrap());
        let err = dispatcher.invoke(&instance, "secret", &[]).unwrap_err();
        assert!(matches!(err, GateError::AccessDenied { .. }));
    }

    #[test]
    fn exists_method_walks_ancestors_and_wraps_lookup_failures() {
        let dispatcher = Dispatcher::new(registry());
        assert!(dispatcher.exists_method("t.Sub", "describe").unwrap());
        assert!(!dispatcher.exists_method("t.Base", "add").unwrap());
        assert!(matches!(
            dispatcher.exists_method("t.Missing", "add"),
            Err(GateError::Reflection(_))
        ));
        assert!(matches!(
            dispatcher.exists_method("not a class", "add"),
            Err(GateError::Reflection(_))
        ));
    }

    #[test]
    fn broken_superclass_chain_is_a_reflection_error() {
        let mut registry = ClassRegistry::new();
        let orphan = ClassBuilder::new(
            ClassDescriptor::new("t.Orphan")
                .unwrap()
                .extending("t.Gone")
                .unwrap(),
        )
        .constructor(|| Ok(()))
        .build()
        .unwrap();
        registry.register(orphan).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));
        let instance = dispatcher.registry().instantiate("t.Orphan").unwrap();
        assert!(matches!(
            dispatcher.invoke(&instance, "x", &[]),
            Err(GateError::Reflection(_))
        ));
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let built = ClassBuilder::new(ClassDescriptor::new("t.Dup").unwrap())
            .method("m", &[], |_, _| Ok(Arg::Null))
            .method("m", &[ParamType::Int], |_, _| Ok(Arg::Null))
            .build();
        assert!(matches!(built, Err(GateError::InvalidArgument(_))));
    }

    #[test]
    fn constructor_failures_are_reflection_errors() {
        let mut registry = ClassRegistry::new();
        let broken = ClassBuilder::new(ClassDescriptor::new("t.Broken").unwrap())
            .constructor::<(), _>(|| Err(anyhow!("missing config")))
            .build()
            .unwrap();
        registry.register(broken).unwrap();
        let err = registry.instantiate("t.Broken").unwrap_err();
        assert!(matches!(err, GateError::Reflection(ref m) if m.contains("missing config")));
        assert!(matches!(
            registry.instantiate("t.Base"),
            Err(GateError::Reflection(_))
        ));
    }
}
