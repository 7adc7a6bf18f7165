//! Plugin registry
//!
//! Plugins are registered statically at startup and keyed by id, so the run
//! order is always the sorted id order. `COLLECTOR_PLUGINS` narrows the run
//! to a subset of the registered ids.

use crate::context::EngineContext;
use crate::error::{CollectorError, PluginError};
use crate::plugins;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One vendor integration
///
/// # Example
///
/// ```ignore
/// struct Hello;
///
/// #[async_trait]
/// impl Plugin for Hello {
///     fn id(&self) -> &'static str { "hello" }
///
///     async fn run(&self, ctx: &EngineContext) -> Result<(), PluginError> {
///         ctx.write_blank(&schema, schema.sentinel()).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identifier, used for ordering, filtering and alerts
    fn id(&self) -> &'static str;

    /// Collect and persist this plugin's datasets
    async fn run(&self, ctx: &EngineContext) -> Result<(), PluginError>;
}

/// Registry of known plugins, ordered by id
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for plugin in plugins::builtin() {
            registry.register(plugin);
        }
        registry
    }

    /// Register a plugin; a second plugin with the same id replaces the first
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let id = plugin.id();
        if self.plugins.insert(id, plugin).is_some() {
            warn!(plugin = id, "plugin registered twice, keeping the last");
        } else {
            info!(plugin = id, "registered plugin");
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Registered ids in run order
    pub fn ids(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }

    /// Plugins to run, sorted by id
    ///
    /// With a filter only the named plugins are returned; naming an id that is
    /// not registered is a configuration error.
    pub fn select(&self, filter: Option<&[String]>) -> Result<Vec<Arc<dyn Plugin>>, CollectorError> {
        let Some(wanted) = filter else {
            return Ok(self.plugins.values().cloned().collect());
        };

        let unknown: Vec<&str> = wanted
            .iter()
            .map(String::as_str)
            .filter(|id| !self.plugins.contains_key(*id))
            .collect();
        if !unknown.is_empty() {
            return Err(CollectorError::Config(format!(
                "unknown plugin id(s) in COLLECTOR_PLUGINS: {} (known: {})",
                unknown.join(", "),
                self.ids().join(", ")
            )));
        }

        Ok(self
            .plugins
            .iter()
            .filter(|(id, _)| wanted.iter().any(|w| w.as_str() == **id))
            .map(|(_, plugin)| Arc::clone(plugin))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    /// Plugin that succeeds without doing anything
    pub(crate) struct Named(pub &'static str);

    #[async_trait]
    impl Plugin for Named {
        fn id(&self) -> &'static str {
            self.0
        }

        async fn run(&self, _ctx: &EngineContext) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn registry(ids: &[&'static str]) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for id in ids {
            registry.register(Arc::new(Named(*id)));
        }
        registry
    }

    #[test]
    fn test_run_order_is_sorted_by_id() {
        let registry = registry(&["okta", "azure_entra", "knowbe4"]);
        let ids: Vec<_> = registry.select(None).unwrap().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["azure_entra", "knowbe4", "okta"]);
    }

    #[test]
    fn test_filter_keeps_sorted_order() {
        let registry = registry(&["okta", "azure_entra", "knowbe4"]);
        let filter = vec!["okta".to_string(), "azure_entra".to_string()];
        let ids: Vec<_> = registry
            .select(Some(filter.as_slice()))
            .unwrap()
            .iter()
            .map(|p| p.id())
            .collect();
        assert_eq!(ids, vec!["azure_entra", "okta"]);
    }

    #[test]
    fn test_unknown_filter_id_is_config_error() {
        let registry = registry(&["okta"]);
        let filter = vec!["crowdstrike".to_string()];
        let err = registry.select(Some(filter.as_slice())).err().unwrap();
        assert!(matches!(err, CollectorError::Config(ref m) if m.contains("crowdstrike")));
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let registry = registry(&["okta", "okta"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_builtin_catalog() {
        let registry = PluginRegistry::builtin();
        assert_eq!(
            registry.ids(),
            vec!["azure_entra", "domains", "knowbe4", "okta"]
        );
    }
}
