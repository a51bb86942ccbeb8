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

//! Per-loader plugin activation and lifecycle.
//!
//! `PluginRegistry` watches `ClassLoaded` events for probe classes. The
//! first probe hit in a loader (passing the descriptor's version gate)
//! activates the plugin there: a fresh plugin instance is constructed,
//! its transformers and handlers are registered scoped to that loader,
//! and its `init` runs. The resulting `PluginManager` is owned by the
//! loader registry, and is torn down exactly once, when the loader is
//! reclaimed or the engine shuts down. There is no reactivation.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::classfile::ClassForm;
use crate::client::Client;
use crate::events::{Event, EventBus, EventKind, HandlerId, HandlerRegistration};
use crate::identity::ClassIdentity;
use crate::loaders::{LoaderHandle, LoaderId, LoaderRegistry, WeakLoader};
use crate::runtime::ReflectiveReader;
use crate::transform::{TransformPipeline, TransformerId};

use super::{PluginCatalog, PluginCtx, PluginName, ReloadPlugin};

/// The runtime instantiation of one plugin in one loader.
pub struct PluginManager {
    plugin_name: PluginName,
    loader: WeakLoader,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    plugin: Box<dyn ReloadPlugin>,
    transformer_ids: Vec<TransformerId>,
    handler_ids: Vec<HandlerId>,
    torn_down: bool,
}

impl PluginManager {
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader.id()
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().unwrap().torn_down
    }
}

/// Startup-discovered plugin descriptors plus the activation machinery.
pub struct PluginRegistry {
    catalog: PluginCatalog,
    loaders: Arc<LoaderRegistry>,
    pipeline: Arc<TransformPipeline>,
    bus: Arc<EventBus>,
    reader: Arc<dyn ReflectiveReader>,
    client: Client,
}

impl PluginRegistry {
    pub fn new(catalog: PluginCatalog, loaders: Arc<LoaderRegistry>,
               pipeline: Arc<TransformPipeline>, bus: Arc<EventBus>,
               reader: Arc<dyn ReflectiveReader>, client: Client)
               -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry {
            catalog,
            loaders,
            pipeline,
            bus,
            reader,
            client,
        });
        PluginRegistry::install(&registry);
        registry
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    /// Hooks activation onto the event bus. The handler holds a weak
    /// reference so the bus never keeps the registry alive.
    fn install(registry: &Arc<PluginRegistry>) {
        let weak: Weak<PluginRegistry> = Arc::downgrade(registry);
        registry.bus.register(None, HandlerRegistration {
            name: "plugin-activation".into(),
            plugin: "engine".into(),
            kind: EventKind::ClassLoaded,
            predicate: None,
            deferred: false,
            delay: Duration::from_millis(0),
            callback: Arc::new(move |event| {
                if let Some(registry) = weak.upgrade() {
                    if let Event::ClassLoaded { ref identity, ref form } = *event {
                        registry.on_class_loaded(identity, form);
                    }
                }
                Ok(())
            }),
        });
    }

    /// Activation check, run on every class load.
    pub fn on_class_loaded(&self, identity: &ClassIdentity, _form: &Arc<ClassForm>) {
        let candidates = self.catalog.probed_by(&identity.name);
        if candidates.is_empty() {
            return;
        }
        let loader = match identity.loader.upgrade() {
            Some(loader) => loader,
            None => return,
        };
        if self.loaders.observe(&loader) {
            self.bus.dispatch(&Event::LoaderCreated { loader: loader.downgrade() });
        }

        for desc in candidates {
            if self.loaders.has_manager(loader.id(), &desc.name) {
                continue;
            }
            if !self.version_gate_passes(identity, desc) {
                info!("plugin '{}' skipped in {}: probe version outside '{:?}'",
                      desc.name, loader, desc.version_expr);
                continue;
            }
            self.activate(desc, &loader);
        }
    }

    fn version_gate_passes(&self, identity: &ClassIdentity,
                           desc: &super::PluginDescription) -> bool {
        match self.reader.loaded_class(identity)
            .and_then(|c| c.implementation_version)
        {
            Some(version) => desc.version_expr.matches(&version),
            // an undeclared version attribute passes the gate
            None => true,
        }
    }

    fn activate(&self, desc: &super::PluginDescription, loader: &LoaderHandle) {
        info!("activating plugin '{}' in {}", desc.name, loader);
        let mut plugin = desc.instantiate();

        let transformer_ids = plugin.transformers().into_iter()
            .map(|t| self.pipeline.register(Some(loader), t))
            .collect::<Vec<_>>();
        let handler_ids = plugin.handlers().into_iter()
            .map(|h| self.bus.register(Some(loader), h))
            .collect::<Vec<_>>();

        plugin.init(&PluginCtx { loader });

        let manager = Arc::new(PluginManager {
            plugin_name: desc.name.clone(),
            loader: loader.downgrade(),
            state: Mutex::new(ManagerState {
                plugin,
                transformer_ids,
                handler_ids,
                torn_down: false,
            }),
        });
        self.loaders.add_manager(loader.id(), manager);
        self.client.plugin_activated(&desc.name, loader.id());
    }

    /// Tears a manager down exactly once, unregistering everything it
    /// scoped to its loader.
    fn teardown_manager(&self, manager: &PluginManager) {
        let mut state = manager.state.lock().unwrap();
        if state.torn_down {
            return;
        }
        debug!("tearing down plugin '{}' for {}", manager.plugin_name,
               manager.loader.id());
        self.pipeline.unregister_all(&state.transformer_ids);
        self.bus.unregister_all(&state.handler_ids);
        state.plugin.teardown();
        state.torn_down = true;
    }

    /// Runs one registry-scan cycle: reclaims dead loaders, tears down
    /// their managers, drops them from the pipeline's load records, and
    /// fires `LoaderReclaimed`.
    pub fn prune(&self) {
        for (loader_id, managers) in self.loaders.prune() {
            for manager in &managers {
                self.teardown_manager(manager);
            }
            self.pipeline.prune_loader(loader_id);
            self.bus.dispatch(&Event::LoaderReclaimed { loader: loader_id });
        }
    }

    /// Tears down every manager; used at engine shutdown.
    pub fn shutdown(&self) {
        for (_, managers) in self.loaders.drain_all() {
            for manager in &managers {
                self.teardown_manager(manager);
            }
        }
    }
}
