//! Hierarchical registry of log channels.
//!
//! Every pipeline, step copy, job and sub-pipeline registers a logging source
//! and gets back a [`LogChannelId`]. Sources name their parent, which lets the
//! engine collect "everything logged under this pipeline run" with
//! [`LogChannelRegistry::descendants_of`].
//!
//! Removing an id removes its whole subtree. When the registry is bounded
//! (`max_size > 0`), registering past the limit purges the oldest entries,
//! together with their subtrees, but never the new entry or its ancestors.

use crate::pipeline::id::LogChannelId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// What kind of engine object owns a log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoggingObjectType {
    Pipeline,
    Job,
    Step,
    Action,
    Database,
    Server,
    General,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum LogLevel {
    Nothing,
    Error,
    Minimal,
    #[default]
    Basic,
    Detailed,
    Debug,
    Rowlevel,
}

/// Description of an object that wants a log channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSource {
    pub object_type: LoggingObjectType,
    pub name: String,
    pub copy: Option<u32>,
    /// Id of the run/container the object belongs to.
    pub container_id: Option<String>,
    pub parent: Option<LogChannelId>,
    pub log_level: LogLevel,
}

impl LoggingSource {
    pub fn new(object_type: LoggingObjectType, name: impl Into<String>) -> Self {
        Self {
            object_type,
            name: name.into(),
            copy: None,
            container_id: None,
            parent: None,
            log_level: LogLevel::default(),
        }
    }

    pub fn with_parent(mut self, parent: LogChannelId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_copy(mut self, copy: u32) -> Self {
        self.copy = Some(copy);
        self
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    fn origin(&self) -> Origin {
        Origin {
            object_type: self.object_type,
            name: self.name.clone(),
            copy: self.copy,
            container_id: self.container_id.clone(),
            parent: self.parent,
        }
    }
}

/// Identity used to hand out the same id to a source registered twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Origin {
    object_type: LoggingObjectType,
    name: String,
    copy: Option<u32>,
    container_id: Option<String>,
    parent: Option<LogChannelId>,
}

/// A registered log channel.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingObject {
    pub id: LogChannelId,
    /// Parent link actually recorded (an unknown parent is not linked).
    pub parent: Option<LogChannelId>,
    pub source: LoggingSource,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    objects: HashMap<LogChannelId, Arc<LoggingObject>>,
    children: HashMap<LogChannelId, Vec<LogChannelId>>,
    by_origin: HashMap<Origin, LogChannelId>,
    /// Live ids in registration order.
    order: VecDeque<LogChannelId>,
    next_id: u64,
}

impl State {
    fn collect_descendants(&self, id: LogChannelId, out: &mut HashSet<LogChannelId>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.get(&current) {
                for &kid in kids {
                    if out.insert(kid) {
                        stack.push(kid);
                    }
                }
            }
        }
    }

    fn ancestors_and_self(&self, id: LogChannelId) -> HashSet<LogChannelId> {
        let mut seen = HashSet::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            if !seen.insert(cur) {
                break;
            }
            current = self.objects.get(&cur).and_then(|o| o.parent);
        }
        seen
    }

    /// Remove `id` and its transitive descendants. Returns how many went away.
    fn remove_subtree(&mut self, id: LogChannelId) -> usize {
        let Some(root) = self.objects.get(&id).cloned() else {
            return 0;
        };
        if let Some(parent) = root.parent {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&s| s != id);
            }
        }

        let mut doomed = HashSet::new();
        self.collect_descendants(id, &mut doomed);
        doomed.insert(id);

        for gone in &doomed {
            if let Some(object) = self.objects.remove(gone) {
                self.by_origin.remove(&object.source.origin());
            }
            self.children.remove(gone);
        }
        self.order.retain(|id| !doomed.contains(id));
        doomed.len()
    }

    fn purge(&mut self, max_size: usize, keep: LogChannelId) -> usize {
        let protected = self.ancestors_and_self(keep);
        let mut purged = 0;
        let mut i = 0;
        // Descendants are always registered after their parent, so removing
        // a subtree never shifts the entries before `i`.
        while self.objects.len() > max_size && i < self.order.len() {
            let candidate = self.order[i];
            if protected.contains(&candidate) {
                i += 1;
                continue;
            }
            purged += self.remove_subtree(candidate);
        }
        purged
    }
}

/// Registry of all live log channels and their parent/child links.
pub struct LogChannelRegistry {
    max_size: usize,
    state: RwLock<State>,
}

impl LogChannelRegistry {
    /// `max_size == 0` means unbounded.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: RwLock::new(State {
                next_id: 1,
                ..State::default()
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Register `source` and return its id.
    ///
    /// A source identical to a live one (type, name, copy, container and
    /// parent) gets the existing id back.
    ///
    /// # Panics
    ///
    /// Panics if the source name is empty.
    pub fn register(&self, source: LoggingSource) -> LogChannelId {
        assert!(!source.name.is_empty(), "logging source needs a name");
        let origin = source.origin();

        let mut state = self.state.write();
        if let Some(&existing) = state.by_origin.get(&origin) {
            return existing;
        }

        let parent = match source.parent {
            Some(p) if state.objects.contains_key(&p) => Some(p),
            Some(p) => {
                tracing::debug!("Log parent {} is not registered; '{}' becomes a root", p, source.name);
                None
            }
            None => None,
        };

        let id = LogChannelId(state.next_id);
        state.next_id += 1;

        let object = Arc::new(LoggingObject {
            id,
            parent,
            source,
            registered_at: Utc::now(),
        });
        state.objects.insert(id, object);
        state.by_origin.insert(origin, id);
        state.order.push_back(id);
        if let Some(p) = parent {
            state.children.entry(p).or_default().push(id);
        }

        if self.max_size > 0 && state.objects.len() > self.max_size {
            let purged = state.purge(self.max_size, id);
            if purged > 0 {
                tracing::debug!("Purged {} stale log channels (max {})", purged, self.max_size);
            }
        }
        id
    }

    pub fn get(&self, id: LogChannelId) -> Option<Arc<LoggingObject>> {
        self.state.read().objects.get(&id).cloned()
    }

    /// Every transitive descendant of `id` (not including `id`).
    ///
    /// Unknown or removed ids yield an empty set.
    pub fn descendants_of(&self, id: LogChannelId) -> HashSet<LogChannelId> {
        let state = self.state.read();
        let mut out = HashSet::new();
        if state.objects.contains_key(&id) {
            state.collect_descendants(id, &mut out);
        }
        out
    }

    /// Direct children of `id`, in registration order.
    pub fn children_of(&self, id: LogChannelId) -> Vec<LogChannelId> {
        self.state
            .read()
            .children
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove `id` and its whole subtree. Returns how many channels went away.
    pub fn remove(&self, id: LogChannelId) -> usize {
        self.state.write().remove_subtree(id)
    }

    /// Live ids in registration order.
    pub fn list_ids(&self) -> Vec<LogChannelId> {
        let mut ids: Vec<_> = self.state.read().objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.write();
        let count = state.objects.len();
        state.objects.clear();
        state.children.clear();
        state.by_origin.clear();
        state.order.clear();
        count
    }
}

impl fmt::Debug for LogChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogChannelRegistry")
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .finish()
    }
}
