//! Optional server hooks.
//!
//! Each hook has a no-op default, so an implementation overrides only what it
//! needs and the gate calls every hook unconditionally.

use std::path::Path;

use crate::{ClassDescriptor, GateError};

pub trait GateHooks: Send + Sync {
    /// Runs after authorization and before dispatch. An error vetoes the call.
    fn before_call(
        &self,
        _username: &str,
        _class: &ClassDescriptor,
        _method: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_call(
        &self,
        _username: &str,
        _class: &ClassDescriptor,
        _method: &str,
        _outcome: Result<(), &GateError>,
    ) {
    }

    /// Runs before a filtered listing. An error vetoes the listing.
    fn before_list(&self, _username: &str, _dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl GateHooks for NoHooks {}
