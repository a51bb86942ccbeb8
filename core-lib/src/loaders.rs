// Copyright 2018 The Molt Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Class-loader handles and the weak-keyed loader registry.
//!
//! The host runtime owns its class-loaders; the engine only ever holds
//! [`WeakLoader`] references to them. Loader reclamation (the strong
//! handle being dropped) is the sole source of truth for teardown: the
//! registry's prune cycle detects dead entries and hands back their
//! plugin managers so the plugin registry can unwind them.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::plugins::PluginManager;

static NEXT_LOADER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CONTEXT_LOADER: RefCell<Option<LoaderHandle>> = RefCell::new(None);
}

/// A process-unique identifier for a class-loader.
///
/// The id outlives the loader itself; a dead `WeakLoader` still knows
/// which loader it referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
         Serialize, Deserialize)]
pub struct LoaderId(pub usize);

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "loader-{}", self.0)
    }
}

/// Allocates a fresh loader id. Called by whatever owns loader creation
/// (the host runtime, or `EmbeddedRuntime` in standalone mode).
pub fn next_loader_id() -> LoaderId {
    LoaderId(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug)]
struct LoaderData {
    id: LoaderId,
    name: String,
    parent: Option<WeakLoader>,
}

/// A strong handle to a class-loader. Only the host runtime should hold
/// these long-term; the engine stores [`WeakLoader`]s.
#[derive(Debug, Clone)]
pub struct LoaderHandle(Arc<LoaderData>);

/// A weak handle to a class-loader, remembering the loader's id.
#[derive(Debug, Clone)]
pub struct WeakLoader {
    id: LoaderId,
    inner: Weak<LoaderData>,
}

impl LoaderHandle {
    pub fn new(name: &str, parent: Option<&LoaderHandle>) -> LoaderHandle {
        LoaderHandle(Arc::new(LoaderData {
            id: next_loader_id(),
            name: name.to_owned(),
            parent: parent.map(LoaderHandle::downgrade),
        }))
    }

    pub fn id(&self) -> LoaderId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<LoaderHandle> {
        self.0.parent.as_ref().and_then(WeakLoader::upgrade)
    }

    pub fn downgrade(&self) -> WeakLoader {
        WeakLoader { id: self.0.id, inner: Arc::downgrade(&self.0) }
    }

    /// `true` if `self` is `descendant`, or appears on `descendant`'s
    /// parent chain.
    pub fn is_same_or_ancestor_of(&self, descendant: &LoaderHandle) -> bool {
        let mut cur = Some(descendant.clone());
        while let Some(loader) = cur {
            if loader.id() == self.id() {
                return true;
            }
            cur = loader.parent();
        }
        false
    }
}

impl PartialEq for LoaderHandle {
    fn eq(&self, other: &LoaderHandle) -> bool {
        self.id() == other.id()
    }
}

impl Eq for LoaderHandle {}

impl Hash for LoaderHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl fmt::Display for LoaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.0.id, self.0.name)
    }
}

impl WeakLoader {
    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn upgrade(&self) -> Option<LoaderHandle> {
        self.inner.upgrade().map(LoaderHandle)
    }

    pub fn is_live(&self) -> bool {
        self.inner.upgrade().is_some()
    }
}

/// Installs `loader` as the calling thread's context loader for the
/// duration of `f`. Used by the scheduled-command executor.
pub fn with_context_loader<F, T>(loader: &LoaderHandle, f: F) -> T
    where F: FnOnce() -> T,
{
    CONTEXT_LOADER.with(|cell| *cell.borrow_mut() = Some(loader.clone()));
    let result = f();
    CONTEXT_LOADER.with(|cell| *cell.borrow_mut() = None);
    result
}

/// Returns the calling thread's context loader, if one is installed.
pub fn current_context_loader() -> Option<LoaderHandle> {
    CONTEXT_LOADER.with(|cell| cell.borrow().clone())
}

struct RegistryEntry {
    loader: WeakLoader,
    seq: usize,
    managers: Vec<Arc<PluginManager>>,
}

/// The weak-keyed mapping from loader identity to its plugin managers.
///
/// Invariants: at most one entry per loader id; no strong reference from
/// the registry back to a loader; iteration is snapshot-style.
pub struct LoaderRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Vec<RegistryEntry>,
    next_seq: usize,
}

impl LoaderRegistry {
    pub fn new() -> LoaderRegistry {
        LoaderRegistry { inner: Mutex::new(RegistryInner::default()) }
    }

    /// Ensures an entry for `loader` exists, returning `true` if one was
    /// created by this call.
    pub fn observe(&self, loader: &LoaderHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.iter().any(|e| e.loader.id() == loader.id()) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(RegistryEntry {
            loader: loader.downgrade(),
            seq,
            managers: Vec::new(),
        });
        true
    }

    /// Returns a snapshot of the live loaders, in creation order.
    pub fn snapshot(&self) -> Vec<LoaderHandle> {
        let inner = self.inner.lock().unwrap();
        let mut entries = inner.entries.iter().collect::<Vec<_>>();
        entries.sort_by_key(|e| e.seq);
        entries.iter().filter_map(|e| e.loader.upgrade()).collect()
    }

    pub fn has_manager(&self, loader: LoaderId, plugin_name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter()
            .find(|e| e.loader.id() == loader)
            .map(|e| e.managers.iter().any(|m| m.plugin_name() == plugin_name))
            .unwrap_or(false)
    }

    /// Attaches `manager` to the entry for `loader`. The entry must
    /// already exist (see `observe`).
    pub fn add_manager(&self, loader: LoaderId, manager: Arc<PluginManager>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.iter_mut().find(|e| e.loader.id() == loader) {
            Some(entry) => entry.managers.push(manager),
            None => warn!("no registry entry for {}, dropping manager", loader),
        }
    }

    pub fn managers_for(&self, loader: LoaderId) -> Vec<Arc<PluginManager>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.iter()
            .find(|e| e.loader.id() == loader)
            .map(|e| e.managers.clone())
            .unwrap_or_default()
    }

    /// Removes entries whose loader has been reclaimed, returning the
    /// dead loaders' ids and managers for teardown.
    pub fn prune(&self) -> Vec<(LoaderId, Vec<Arc<PluginManager>>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut dead = Vec::new();
        let mut live = Vec::new();
        for entry in inner.entries.drain(..) {
            if entry.loader.is_live() {
                live.push(entry);
            } else {
                dead.push((entry.loader.id(), entry.managers));
            }
        }
        inner.entries = live;
        dead
    }

    /// Removes every entry, returning all managers for teardown; used
    /// at engine shutdown.
    pub fn drain_all(&self) -> Vec<(LoaderId, Vec<Arc<PluginManager>>)> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.drain(..)
            .map(|e| (e.loader.id(), e.managers))
            .collect()
    }

    /// Explicitly removes the entry for `loader`, returning its managers.
    pub fn drop_loader(&self, loader: LoaderId) -> Vec<Arc<PluginManager>> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.entries.iter().position(|e| e.loader.id() == loader);
        match idx {
            Some(idx) => inner.entries.remove(idx).managers,
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_lineage() {
        let root = LoaderHandle::new("root", None);
        let child = LoaderHandle::new("child", Some(&root));
        let other = LoaderHandle::new("other", None);

        assert!(root.is_same_or_ancestor_of(&child));
        assert!(root.is_same_or_ancestor_of(&root));
        assert!(!child.is_same_or_ancestor_of(&root));
        assert!(!other.is_same_or_ancestor_of(&child));
    }

    #[test]
    fn weak_loader_remembers_id() {
        let loader = LoaderHandle::new("app", None);
        let id = loader.id();
        let weak = loader.downgrade();
        drop(loader);
        assert_eq!(weak.id(), id);
        assert!(!weak.is_live());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn registry_dedupes_and_prunes() {
        let registry = LoaderRegistry::new();
        let a = LoaderHandle::new("a", None);
        let b = LoaderHandle::new("b", None);

        assert!(registry.observe(&a));
        assert!(!registry.observe(&a));
        assert!(registry.observe(&b));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot().len(), 2);

        let b_id = b.id();
        drop(b);
        let dead = registry.prune();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, b_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn context_loader_install() {
        let loader = LoaderHandle::new("ctx", None);
        assert!(current_context_loader().is_none());
        let seen = with_context_loader(&loader, || {
            current_context_loader().map(|l| l.id())
        });
        assert_eq!(seen, Some(loader.id()));
        assert!(current_context_loader().is_none());
    }
}
