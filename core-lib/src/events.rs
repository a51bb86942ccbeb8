// Copyright 2019 The Molt Authors. All rights reserved.
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

//! The typed event bus.
//!
//! Events are dispatched synchronously, in registration order, on the
//! thread that fires them (the scheduler thread for redefinitions, a
//! class-load thread for loads). Handlers declared `deferred` are
//! instead enqueued on the scheduled-command executor under a merge key
//! of (plugin, event kind, class identity), so bursts collapse into a
//! single callback.
//!
//! Handlers are grouped by owning loader: an event carrying a class
//! identity only reaches handlers whose loader is that identity's
//! loader or one of its parents. A handler that fails is logged and
//! does not affect its siblings.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::classfile::ClassForm;
use crate::diff::StructuralDiff;
use crate::errors::SwapError;
use crate::executor::{CommandExecutor, MergeKey, ScheduledCommand};
use crate::identity::ClassIdentity;
use crate::loaders::{LoaderHandle, LoaderId, WeakLoader};

/// The kinds of event the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ClassLoaded,
    ClassRedefined,
    LoaderCreated,
    LoaderReclaimed,
}

/// A typed event, delivered to plugin handlers.
#[derive(Clone)]
pub enum Event {
    ClassLoaded {
        identity: ClassIdentity,
        form: Arc<ClassForm>,
    },
    ClassRedefined {
        identity: ClassIdentity,
        old_form: Arc<ClassForm>,
        new_form: Arc<ClassForm>,
        diff: Arc<StructuralDiff>,
        /// `true` when the change could not be applied by the native
        /// redefine primitive and was propagated for plugins only.
        structural: bool,
    },
    LoaderCreated {
        loader: WeakLoader,
    },
    LoaderReclaimed {
        loader: LoaderId,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match *self {
            Event::ClassLoaded { .. } => EventKind::ClassLoaded,
            Event::ClassRedefined { .. } => EventKind::ClassRedefined,
            Event::LoaderCreated { .. } => EventKind::LoaderCreated,
            Event::LoaderReclaimed { .. } => EventKind::LoaderReclaimed,
        }
    }

    pub fn identity(&self) -> Option<&ClassIdentity> {
        match *self {
            Event::ClassLoaded { ref identity, .. }
            | Event::ClassRedefined { ref identity, .. } => Some(identity),
            _ => None,
        }
    }

    /// The loader this event concerns, live or not.
    pub fn loader_id(&self) -> Option<LoaderId> {
        match *self {
            Event::ClassLoaded { ref identity, .. }
            | Event::ClassRedefined { ref identity, .. } => Some(identity.loader_id()),
            Event::LoaderCreated { ref loader } => Some(loader.id()),
            Event::LoaderReclaimed { loader } => Some(loader),
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&Event) -> Result<(), SwapError> + Send + Sync>;
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A handler binding, as declared by a plugin.
#[derive(Clone)]
pub struct HandlerRegistration {
    /// A name for diagnostics.
    pub name: String,
    /// The plugin that owns the handler.
    pub plugin: String,
    pub kind: EventKind,
    pub predicate: Option<EventPredicate>,
    /// Deferred handlers run on the command executor after `delay`,
    /// coalescing bursts by merge key.
    pub deferred: bool,
    pub delay: Duration,
    pub callback: EventCallback,
}

/// Identifies a registration, for unregistering at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(usize);

struct HandlerEntry {
    id: HandlerId,
    seq: usize,
    /// The loader this handler is scoped to; `None` for engine-scope.
    scope: Option<WeakLoader>,
    reg: HandlerRegistration,
}

#[derive(Default)]
struct BusInner {
    handlers: Vec<HandlerEntry>,
    next_id: usize,
}

/// Delivers typed events to registered handlers.
pub struct EventBus {
    inner: Mutex<BusInner>,
    executor: Arc<CommandExecutor>,
}

impl EventBus {
    pub fn new(executor: Arc<CommandExecutor>) -> EventBus {
        EventBus { inner: Mutex::new(BusInner::default()), executor }
    }

    /// Registers a handler. `scope` ties the handler to a loader;
    /// engine components pass `None`.
    pub fn register(&self, scope: Option<&LoaderHandle>, reg: HandlerRegistration)
                    -> HandlerId {
        let mut inner = self.inner.lock().unwrap();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        let seq = inner.handlers.len();
        inner.handlers.push(HandlerEntry {
            id,
            seq,
            scope: scope.map(LoaderHandle::downgrade),
            reg,
        });
        id
    }

    pub fn unregister(&self, id: HandlerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.retain(|h| h.id != id);
    }

    pub fn unregister_all(&self, ids: &[HandlerId]) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.retain(|h| !ids.contains(&h.id));
    }

    pub fn handler_count(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }

    /// Delivers `event` to all eligible handlers, in registration order.
    pub fn dispatch(&self, event: &Event) {
        let eligible = {
            let inner = self.inner.lock().unwrap();
            let mut entries = inner.handlers.iter()
                .filter(|h| h.reg.kind == event.kind())
                .filter(|h| scope_eligible(h.scope.as_ref(), event))
                .map(|h| (h.seq, h.scope.clone(), h.reg.clone()))
                .collect::<Vec<_>>();
            entries.sort_by_key(|&(seq, ..)| seq);
            entries
        };

        for (_, scope, reg) in eligible {
            if let Some(ref predicate) = reg.predicate {
                if !predicate(event) {
                    continue;
                }
            }
            if reg.deferred {
                self.defer(scope, reg, event);
            } else if let Err(err) = (reg.callback)(event) {
                warn!("handler '{}' of plugin '{}' failed: {}",
                      reg.name, reg.plugin, err);
            }
        }
    }

    fn defer(&self, scope: Option<WeakLoader>, reg: HandlerRegistration,
             event: &Event) {
        let merge_key = MergeKey(match event.identity() {
            Some(identity) => {
                format!("{}/{:?}/{}", reg.plugin, event.kind(), identity)
            }
            None => format!("{}/{:?}", reg.plugin, event.kind()),
        });
        let loader = scope.or_else(|| match *event {
            Event::ClassLoaded { ref identity, .. }
            | Event::ClassRedefined { ref identity, .. } => {
                Some(identity.loader.clone())
            }
            Event::LoaderCreated { ref loader } => Some(loader.clone()),
            Event::LoaderReclaimed { .. } => None,
        });
        let event = event.clone();
        let callback = reg.callback.clone();
        let name = reg.name.clone();
        let plugin = reg.plugin.clone();
        let accepted = self.executor.submit(ScheduledCommand {
            loader,
            merge_key: Some(merge_key),
            delay: reg.delay,
            payload: Box::new(move || {
                if let Err(err) = callback(&event) {
                    warn!("deferred handler '{}' of plugin '{}' failed: {}",
                          name, plugin, err);
                }
            }),
        });
        if !accepted {
            debug!("executor is down, dropping deferred '{}'", reg.name);
        }
    }
}

/// An event reaches a loader-scoped handler only when the handler's
/// loader is the event's loader or one of that loader's parents.
fn scope_eligible(scope: Option<&WeakLoader>, event: &Event) -> bool {
    let scope = match scope {
        None => return true,
        Some(scope) => scope,
    };
    match *event {
        Event::LoaderReclaimed { loader } => loader == scope.id(),
        Event::LoaderCreated { ref loader } => loader.id() == scope.id(),
        Event::ClassLoaded { ref identity, .. }
        | Event::ClassRedefined { ref identity, .. } => {
            let scope = match scope.upgrade() {
                Some(scope) => scope,
                None => return false,
            };
            match identity.loader.upgrade() {
                Some(event_loader) => scope.is_same_or_ancestor_of(&event_loader),
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::classfile::read_form;
    use crate::test_helpers::ClassFileBuilder;

    fn test_form(name: &str) -> Arc<ClassForm> {
        Arc::new(read_form(&ClassFileBuilder::new(name).build()).unwrap())
    }

    fn counting_handler(plugin: &str, kind: EventKind, count: &Arc<AtomicUsize>)
                        -> HandlerRegistration {
        let count = count.clone();
        HandlerRegistration {
            name: format!("count-{}", plugin),
            plugin: plugin.to_owned(),
            kind,
            predicate: None,
            deferred: false,
            delay: Duration::from_millis(0),
            callback: Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        }
    }

    fn load_event(loader: &LoaderHandle, name: &str) -> Event {
        Event::ClassLoaded {
            identity: ClassIdentity::new(name.into(), loader),
            form: test_form(name),
        }
    }

    #[test]
    fn dispatch_by_kind() {
        let bus = EventBus::new(Arc::new(CommandExecutor::new()));
        let loads = Arc::new(AtomicUsize::new(0));
        let reclaims = Arc::new(AtomicUsize::new(0));
        bus.register(None, counting_handler("a", EventKind::ClassLoaded, &loads));
        bus.register(None, counting_handler("a", EventKind::LoaderReclaimed, &reclaims));

        let loader = LoaderHandle::new("l", None);
        bus.dispatch(&load_event(&loader, "p.A"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(reclaims.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn loader_containment() {
        let bus = EventBus::new(Arc::new(CommandExecutor::new()));
        let parent = LoaderHandle::new("parent", None);
        let child = LoaderHandle::new("child", Some(&parent));
        let sibling = LoaderHandle::new("sibling", None);

        let parent_count = Arc::new(AtomicUsize::new(0));
        let sibling_count = Arc::new(AtomicUsize::new(0));
        bus.register(Some(&parent),
                     counting_handler("p", EventKind::ClassLoaded, &parent_count));
        bus.register(Some(&sibling),
                     counting_handler("s", EventKind::ClassLoaded, &sibling_count));

        // an event in the child loader reaches the parent-scoped
        // handler but not the sibling's
        bus.dispatch(&load_event(&child, "p.A"));
        assert_eq!(parent_count.load(Ordering::SeqCst), 1);
        assert_eq!(sibling_count.load(Ordering::SeqCst), 0);

        // an event in the parent does not flow down to child scopes
        let child_count = Arc::new(AtomicUsize::new(0));
        bus.register(Some(&child),
                     counting_handler("c", EventKind::ClassLoaded, &child_count));
        bus.dispatch(&load_event(&parent, "p.B"));
        assert_eq!(child_count.load(Ordering::SeqCst), 0);
        assert_eq!(parent_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_handler_does_not_stop_siblings() {
        let bus = EventBus::new(Arc::new(CommandExecutor::new()));
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(None, HandlerRegistration {
            name: "bad".into(),
            plugin: "p".into(),
            kind: EventKind::ClassLoaded,
            predicate: None,
            deferred: false,
            delay: Duration::from_millis(0),
            callback: Arc::new(|_| Err(SwapError::PluginError {
                plugin: "p".into(),
                detail: "boom".into(),
            })),
        });
        bus.register(None, counting_handler("q", EventKind::ClassLoaded, &count));

        let loader = LoaderHandle::new("l", None);
        bus.dispatch(&load_event(&loader, "p.A"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn predicate_filters() {
        let bus = EventBus::new(Arc::new(CommandExecutor::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let mut reg = counting_handler("p", EventKind::ClassLoaded, &count);
        reg.predicate = Some(Arc::new(|event: &Event| {
            event.identity()
                .map(|i| i.name.as_str().ends_with("Wanted"))
                .unwrap_or(false)
        }));
        bus.register(None, reg);

        let loader = LoaderHandle::new("l", None);
        bus.dispatch(&load_event(&loader, "p.Ignored"));
        bus.dispatch(&load_event(&loader, "p.Wanted"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_burst_collapses() {
        let executor = Arc::new(CommandExecutor::new());
        let bus = EventBus::new(executor.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let mut reg = counting_handler("p", EventKind::ClassLoaded, &count);
        reg.deferred = true;
        reg.delay = Duration::from_millis(40);
        bus.register(None, reg);

        let loader = LoaderHandle::new("l", None);
        for _ in 0..4 {
            bus.dispatch(&load_event(&loader, "p.Same"));
        }
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_removes_handler() {
        let bus = EventBus::new(Arc::new(CommandExecutor::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.register(None, counting_handler("p", EventKind::ClassLoaded, &count));
        bus.unregister(id);

        let loader = LoaderHandle::new("l", None);
        bus.dispatch(&load_event(&loader, "p.A"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.handler_count(), 0);
    }
}
