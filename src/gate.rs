//! RPC entry point: lookup, authorization, hooks and dispatch in request
//! order, plus filtered listings under the sandbox.

use std::path::Path;
use std::sync::Arc;

use crate::authorize::{validate_username, CallAuthorizer, ConfiguredRoots, DenialReason};
use crate::codec::{fingerprint, rebuild_predicate, PredicateRegistry, DEFAULT_MAX_BLOB_BYTES};
use crate::config::{GateConfig, Isolation};
use crate::dispatch::{Arg, ClassRegistry, Dispatcher, GateHooks, NoHooks};
use crate::listing;
use crate::sandbox::Sandbox;
use crate::GateError;

const LISTING_SUBJECT: &str = "directory listing";

#[derive(Clone)]
pub struct CallGate {
    dispatcher: Dispatcher,
    authorizer: CallAuthorizer,
    predicates: Arc<PredicateRegistry>,
    hooks: Arc<dyn GateHooks>,
    isolation: Isolation,
    max_blob_bytes: usize,
}

impl CallGate {
    /// Builds a gate and installs the process-wide sandbox.
    pub fn new(
        classes: Arc<ClassRegistry>,
        authorizer: CallAuthorizer,
        predicates: PredicateRegistry,
    ) -> Self {
        Sandbox::install();
        Self {
            dispatcher: Dispatcher::new(classes),
            authorizer,
            predicates: Arc::new(predicates),
            hooks: Arc::new(NoHooks),
            isolation: Isolation::InProcess,
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
        }
    }

    pub fn from_config(
        cfg: &GateConfig,
        classes: Arc<ClassRegistry>,
        predicates: PredicateRegistry,
    ) -> Self {
        let authorizer = CallAuthorizer::new(Arc::new(ConfiguredRoots::from_config(cfg)));
        Self::new(classes, authorizer, predicates)
            .with_isolation(cfg.isolation)
            .with_max_blob_bytes(cfg.max_blob_bytes)
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn GateHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_max_blob_bytes(mut self, max_blob_bytes: usize) -> Self {
        self.max_blob_bytes = max_blob_bytes;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn authorizer(&self) -> &CallAuthorizer {
        &self.authorizer
    }

    /// Invokes `class_name.method(args)` on behalf of `username`.
    pub fn call(
        &self,
        username: &str,
        class_name: &str,
        method: &str,
        args: &[Arg],
    ) -> Result<Arg, GateError> {
        let entry = self.dispatcher.registry().get(class_name).ok_or_else(|| {
            log::warn!("remote call of unknown class {class_name:?} by {username:?}");
            GateError::DispatchTargetMissing {
                class: class_name.to_string(),
                method: method.to_string(),
            }
        })?;
        let class = entry.descriptor();

        self.authorizer.check_callable(class, username)?;
        if let Err(err) = self.hooks.before_call(username, class, method) {
            log::warn!(
                "remote call of {}.{} by {:?} vetoed: {:#}",
                class.name(),
                method,
                username,
                err
            );
            return Err(GateError::AuthorizationDenied {
                class: class.name().to_string(),
                reason: DenialReason::Vetoed(format!("{err:#}")),
            });
        }

        let result = self
            .dispatcher
            .registry()
            .instantiate(class.name())
            .and_then(|instance| self.dispatcher.invoke_required(&instance, method, args));

        self.hooks
            .after_call(username, class, method, result.as_ref().map(|_| ()));
        match &result {
            Ok(_) => log::debug!("{}.{} completed for {:?}", class.name(), method, username),
            Err(err) => log::info!(
                "{}.{} failed for {:?}: {}",
                class.name(),
                method,
                username,
                err
            ),
        }
        result
    }

    /// Lists `dir`, keeping only entries the filter blob accepts. Without a
    /// filter every entry is returned.
    pub fn list(
        &self,
        username: &str,
        dir: &Path,
        filter: Option<&str>,
    ) -> Result<Vec<String>, GateError> {
        let deny = |reason: DenialReason| GateError::AuthorizationDenied {
            class: LISTING_SUBJECT.to_string(),
            reason,
        };
        if validate_username(username).is_err() {
            return Err(deny(DenialReason::InvalidUsername));
        }
        if let Err(err) = self.hooks.before_list(username, dir) {
            log::warn!("listing of {} by {:?} vetoed: {:#}", dir.display(), username, err);
            return Err(deny(DenialReason::Vetoed(format!("{err:#}"))));
        }

        let Some(blob) = filter else {
            return listing::list_all(dir);
        };
        let predicate = rebuild_predicate(blob, &self.predicates, self.max_blob_bytes)?;
        listing::list_names(dir, &predicate, self.isolation).map_err(|err| {
            if err.is_sandbox_violation() {
                log::warn!(
                    "listing of {} by {:?} with filter {} aborted: {}",
                    dir.display(),
                    username,
                    fingerprint(blob),
                    err
                );
            }
            err
        })
    }
}
