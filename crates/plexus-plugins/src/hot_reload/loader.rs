//! Seam for swapping a plugin's code during reload
//!
//! Loading new code (a rebuilt dynamic library, a script, a fresh instance
//! from a factory) is not done here. A [`ModuleLoader`] receives the
//! destroyed instance and may hand back a replacement.

use std::sync::Arc;

use async_trait::async_trait;
use plexus_kernel::Plugin;

use super::ReloadError;

/// Produces the instance a plugin is reloaded into.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Called after `current` was destroyed. `Ok(None)` re-activates
    /// `current`; a returned replacement must carry the same name. Report
    /// failures as [`ReloadError::Loader`].
    async fn load(
        &self,
        plugin: &str,
        current: Arc<dyn Plugin>,
    ) -> Result<Option<Arc<dyn Plugin>>, ReloadError>;
}

/// Re-activates the existing instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepCurrentLoader;

#[async_trait]
impl ModuleLoader for KeepCurrentLoader {
    async fn load(
        &self,
        _plugin: &str,
        _current: Arc<dyn Plugin>,
    ) -> Result<Option<Arc<dyn Plugin>>, ReloadError> {
        Ok(None)
    }
}
