//! Unit tests for `plexus-kernel` plugin types
//!
//! Covers:
//! - [`PluginMetadata`] builder methods
//! - [`LifecyclePhase`] display strings used in error messages
//! - [`PluginStatus`] destroy bookkeeping
//! - default [`Plugin`] callbacks
#![allow(clippy::module_inception)]

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::plugin::{
        LifecyclePhase, Plugin, PluginMetadata, PluginResult, PluginStatus,
    };
    use crate::{Kernel, PluginContext};

    struct Bare {
        metadata: PluginMetadata,
    }

    #[async_trait::async_trait]
    impl Plugin for Bare {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        async fn init(&self, _ctx: &PluginContext) -> PluginResult<()> {
            Ok(())
        }
    }

    // =========================================================================
    // PluginMetadata
    // =========================================================================

    #[test]
    fn test_metadata_defaults() {
        let meta = PluginMetadata::new("db");
        assert_eq!(meta.name, "db");
        assert_eq!(meta.version, "0.0.0");
        assert!(meta.dependencies.is_empty());
        assert!(meta.startup_timeout.is_none());
    }

    #[test]
    fn test_metadata_builder_chain() {
        let meta = PluginMetadata::new("api")
            .with_version("2.1.0")
            .with_description("HTTP surface")
            .with_dependency("auth")
            .with_dependencies(["db", "cache"])
            .with_startup_timeout(Duration::from_millis(250));

        assert_eq!(meta.version, "2.1.0");
        assert_eq!(meta.description, "HTTP surface");
        assert_eq!(meta.dependencies, vec!["auth", "db", "cache"]);
        assert_eq!(meta.startup_timeout, Some(Duration::from_millis(250)));
    }

    // =========================================================================
    // LifecyclePhase / PluginStatus
    // =========================================================================

    #[test]
    fn test_phase_display() {
        assert_eq!(LifecyclePhase::Init.to_string(), "init");
        assert_eq!(LifecyclePhase::Start.to_string(), "start");
        assert_eq!(LifecyclePhase::Destroy.to_string(), "destroy");
    }

    #[test]
    fn test_status_needs_destroy() {
        assert!(!PluginStatus::Registered.needs_destroy());
        assert!(PluginStatus::Initialized.needs_destroy());
        assert!(PluginStatus::Running.needs_destroy());
        assert!(PluginStatus::StartFailed.needs_destroy());
        assert!(!PluginStatus::Destroyed.needs_destroy());
    }

    // =========================================================================
    // Default callbacks
    // =========================================================================

    #[tokio::test]
    async fn test_default_callbacks_are_noops() {
        let plugin = Bare {
            metadata: PluginMetadata::new("bare"),
        };
        let kernel = Kernel::default();
        let ctx = PluginContext::new("bare", &kernel);

        assert_eq!(plugin.name(), "bare");
        plugin.init(&ctx).await.unwrap();
        plugin.start(&ctx).await.unwrap();
        assert!(plugin.health_check().await.unwrap());
        assert!(plugin.snapshot_state().await.unwrap().is_none());
        plugin.restore_state(serde_json::json!({"n": 1})).await.unwrap();
        plugin.destroy().await.unwrap();
    }
}
