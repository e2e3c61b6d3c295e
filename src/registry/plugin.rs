//! Plugin catalog: plugin type → descriptors, one entry per plugin id.
//!
//! A descriptor may carry several ids (aliases); every id is registered as
//! its own key in one atomic step, and duplicate ids are rejected. Callers
//! that want to re-register a plugin must remove it first.

use crate::cow_list::CowList;
use crate::error::Result;
use crate::registry::{KeyedRegistry, RegisterPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Kind of extension a plugin provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PluginType {
    Step,
    Action,
    Database,
    Partitioner,
    Compression,
    ValueType,
    Extension,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::Step => write!(f, "Step"),
            PluginType::Action => write!(f, "Action"),
            PluginType::Database => write!(f, "Database"),
            PluginType::Partitioner => write!(f, "Partitioner"),
            PluginType::Compression => write!(f, "Compression"),
            PluginType::ValueType => write!(f, "Value type"),
            PluginType::Extension => write!(f, "Extension"),
        }
    }
}

/// What the plugin loader publishes about one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub plugin_type: PluginType,
    /// Primary id first, then aliases.
    pub ids: Vec<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    /// Library the plugin was loaded from; `None` for built-ins.
    #[serde(default)]
    pub library_path: Option<PathBuf>,
}

impl PluginDescriptor {
    pub fn new(plugin_type: PluginType, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            plugin_type,
            ids: vec![id.into()],
            name: name.into(),
            description: String::new(),
            category: String::new(),
            library_path: None,
        }
    }

    pub fn with_alias(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn primary_id(&self) -> &str {
        &self.ids[0]
    }

    pub fn is_native(&self) -> bool {
        self.library_path.is_none()
    }
}

/// Notified after a plugin is added to or removed from the catalog.
#[cfg_attr(test, mockall::automock)]
pub trait PluginCatalogListener: Send + Sync {
    fn plugin_added(&self, plugin: &PluginDescriptor);
    fn plugin_removed(&self, plugin: &PluginDescriptor);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PluginKey {
    plugin_type: PluginType,
    id: String,
}

/// Catalog of every known plugin, shared by loader and engine threads.
pub struct PluginCatalog {
    plugins: KeyedRegistry<PluginKey, Arc<PluginDescriptor>>,
    listeners: CowList<Arc<dyn PluginCatalogListener>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self {
            plugins: KeyedRegistry::new("plugin catalog", RegisterPolicy::RejectDuplicates),
            listeners: CowList::new(),
        }
    }

    /// Publish `descriptor` under all of its ids.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor has no ids or an empty id.
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<Arc<PluginDescriptor>> {
        assert!(
            !descriptor.ids.is_empty() && descriptor.ids.iter().all(|id| !id.is_empty()),
            "plugin descriptor needs at least one non-empty id"
        );
        let descriptor = Arc::new(descriptor);
        let entries = descriptor
            .ids
            .iter()
            .map(|id| {
                (
                    PluginKey {
                        plugin_type: descriptor.plugin_type,
                        id: id.clone(),
                    },
                    Arc::clone(&descriptor),
                )
            })
            .collect();
        self.plugins.register_all(entries)?;

        tracing::debug!(
            "Registered {} plugin '{}' ({})",
            descriptor.plugin_type,
            descriptor.primary_id(),
            descriptor.name
        );
        self.listeners.for_each(|l| l.plugin_added(&descriptor));
        Ok(descriptor)
    }

    pub fn get(&self, plugin_type: PluginType, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins.get(&PluginKey {
            plugin_type,
            id: id.to_string(),
        })
    }

    /// Remove the plugin owning `id`, together with all of its aliases.
    pub fn remove(&self, plugin_type: PluginType, id: &str) -> Option<Arc<PluginDescriptor>> {
        let removed = self.plugins.remove_where(|key, plugin| {
            key.plugin_type == plugin_type && plugin.ids.iter().any(|i| i == id)
        });
        let (_, descriptor) = removed.into_iter().next()?;
        tracing::debug!("Removed {} plugin '{}'", plugin_type, descriptor.primary_id());
        self.listeners.for_each(|l| l.plugin_removed(&descriptor));
        Some(descriptor)
    }

    /// Distinct plugins of `plugin_type`, in registration order.
    pub fn list(&self, plugin_type: PluginType) -> Vec<Arc<PluginDescriptor>> {
        let mut plugins: Vec<Arc<PluginDescriptor>> = Vec::new();
        for (key, plugin) in self.plugins.entries() {
            if key.plugin_type == plugin_type && !plugins.iter().any(|p| Arc::ptr_eq(p, &plugin)) {
                plugins.push(plugin);
            }
        }
        plugins
    }

    /// Plugin types with at least one registered plugin.
    pub fn list_types(&self) -> Vec<PluginType> {
        let types: BTreeSet<PluginType> = self
            .plugins
            .list_keys()
            .into_iter()
            .map(|k| k.plugin_type)
            .collect();
        types.into_iter().collect()
    }

    pub fn find_by_name(&self, plugin_type: PluginType, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.plugins
            .find(|key, plugin| key.plugin_type == plugin_type && plugin.name == name)
            .map(|(_, plugin)| plugin)
    }

    /// Sorted, non-empty categories used by plugins of `plugin_type`.
    pub fn categories(&self, plugin_type: PluginType) -> Vec<String> {
        let categories: BTreeSet<String> = self
            .list(plugin_type)
            .iter()
            .filter(|p| !p.category.is_empty())
            .map(|p| p.category.clone())
            .collect();
        categories.into_iter().collect()
    }

    /// Number of registered ids (aliases included).
    pub fn id_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn PluginCatalogListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PluginCatalogListener>) -> bool {
        self.listeners.remove_where(|l| Arc::ptr_eq(l, listener)) > 0
    }

    /// Drop every plugin (listeners are not notified).
    pub fn clear(&self) -> usize {
        self.plugins.clear()
    }
}

impl Default for PluginCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("ids", &self.plugins.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
