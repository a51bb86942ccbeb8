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

//! The main state of the engine, and dispatch for RPC.

#[cfg(feature = "notify")]
use std::path::Path;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use molt_rpc::{Handler, RemoteError, RpcCtx, RpcPeer};

use crate::bytecode::{BytecodeBackend, NullBackend};
use crate::classfile::read_form;
use crate::client::Client;
#[cfg(feature = "notify")]
use crate::config::{try_load_from_file, USER_CONFIG_FILE};
use crate::config::{ConfigManager, EngineConfig, Table};
use crate::errors::SwapError;
use crate::events::EventBus;
use crate::executor::CommandExecutor;
use crate::fingerprint::fingerprint;
#[cfg(feature = "notify")]
use crate::identity::ClassName;
use crate::identity::{ClassIdentity, RedefinitionRequest, RequestSource};
use crate::loaders::{LoaderHandle, LoaderId, LoaderRegistry};
use crate::plugins::{builtin_plugins, PluginCatalog, PluginRegistry};
use crate::rpc::{hex_to_bytes, CoreNotification, CoreRequest};
use crate::runtime::{EmbeddedRuntime, RuntimeCapabilities};
use crate::scheduler::Scheduler;
use crate::transform::TransformPipeline;
#[cfg(feature = "notify")]
use crate::watcher::{BuildWatcher, WatchEvent, WATCH_IDLE_TOKEN};

/// The main state of the engine, protected by a mutex.
///
/// # Note
///
/// Setup is dependent on how the attaching tool is configured (config
/// dir, watch dirs), so state is not instantiated until the
/// `client_started` RPC arrives.
pub enum MoltCore {
    Waiting,
    Running(Arc<Mutex<CoreState>>),
}

/// A weak reference to the main state, for worker threads.
#[derive(Clone)]
pub struct WeakMoltCore(Weak<Mutex<CoreState>>);

impl MoltCore {
    pub fn new() -> Self {
        MoltCore::Waiting
    }

    fn is_waiting(&self) -> bool {
        match *self {
            MoltCore::Waiting => true,
            _ => false,
        }
    }

    pub fn inner(&self) -> MutexGuard<CoreState> {
        match self {
            MoltCore::Running(ref inner) => inner.lock().unwrap(),
            MoltCore::Waiting => {
                panic!("core does not start until client_started is received")
            }
        }
    }

    pub fn weak_self(&self) -> Option<WeakMoltCore> {
        match self {
            MoltCore::Running(ref inner) => {
                Some(WeakMoltCore(Arc::downgrade(inner)))
            }
            MoltCore::Waiting => None,
        }
    }
}

impl Default for MoltCore {
    fn default() -> MoltCore {
        MoltCore::new()
    }
}

impl WeakMoltCore {
    pub fn upgrade(&self) -> Option<MoltCore> {
        self.0.upgrade().map(MoltCore::Running)
    }
}

/// Handler for messages originating with the attaching tool.
impl Handler for MoltCore {
    type Notification = CoreNotification;
    type Request = CoreRequest;

    fn handle_notification(&mut self, ctx: &RpcCtx, rpc: Self::Notification) {
        if let CoreNotification::ClientStarted { ref config_dir, ref watch_dirs } = rpc {
            if !self.is_waiting() {
                warn!("client_started can only be sent once");
                return;
            }
            let config_dir = config_dir.as_ref().map(PathBuf::from);
            let watch_dirs = watch_dirs.as_ref()
                .map(|dirs| dirs.iter().map(PathBuf::from).collect())
                .unwrap_or_default();
            let state = CoreState::new(ctx.get_peer().clone(), config_dir,
                                       watch_dirs);
            *self = MoltCore::Running(Arc::new(Mutex::new(state)));
            return;
        }
        match *self {
            MoltCore::Waiting => warn!("RPC received before client_started"),
            MoltCore::Running(..) => self.inner().client_notification(rpc),
        }
    }

    fn handle_request(&mut self, _ctx: &RpcCtx, rpc: Self::Request)
                      -> Result<Value, RemoteError> {
        match *self {
            MoltCore::Waiting => {
                Err(RemoteError::custom(1, "engine is not started", None))
            }
            MoltCore::Running(..) => self.inner().client_request(rpc),
        }
    }

    fn idle(&mut self, _ctx: &RpcCtx, token: usize) {
        if let MoltCore::Running(..) = *self {
            self.inner().handle_idle(token);
        }
    }
}

/// The apex of the engine's model graph: owns every component and
/// routes work between them.
pub struct CoreState {
    peer: RpcPeer,
    client: Client,
    config_manager: ConfigManager,
    config: EngineConfig,
    loaders: Arc<LoaderRegistry>,
    executor: Arc<CommandExecutor>,
    bus: Arc<EventBus>,
    pipeline: Arc<TransformPipeline>,
    runtime: Arc<EmbeddedRuntime>,
    capabilities: RuntimeCapabilities,
    registry: Arc<PluginRegistry>,
    scheduler: Scheduler,
    #[cfg(feature = "notify")]
    file_watcher: BuildWatcher,
    root_loader: LoaderHandle,
    /// Holds `push_class` requests between batch markers.
    batch_buffer: Option<Vec<RedefinitionRequest>>,
    is_shutdown: bool,
}

impl CoreState {
    pub fn new(peer: RpcPeer, config_dir: Option<PathBuf>,
               extra_watch_dirs: Vec<PathBuf>) -> CoreState {
        CoreState::new_with_backend(peer, config_dir, extra_watch_dirs,
                                    Arc::new(NullBackend))
    }

    /// Hosts embedding a real bytecode library supply it here.
    pub fn new_with_backend(peer: RpcPeer, config_dir: Option<PathBuf>,
                            extra_watch_dirs: Vec<PathBuf>,
                            backend: Arc<dyn BytecodeBackend>) -> CoreState {
        let client = Client::new(peer.clone());

        let mut config_manager = ConfigManager::default();
        if let Some(ref dir) = config_dir {
            config_manager.set_config_dir(dir);
            if let Err(err) = config_manager.load_config_dir() {
                warn!("failed to load user config: {}", err);
                client.alert(format!("config error: {}", err));
            }
        }
        let config = config_manager.get_config();

        let loaders = Arc::new(LoaderRegistry::new());
        let executor = Arc::new(CommandExecutor::new());
        let bus = Arc::new(EventBus::new(executor.clone()));
        let pipeline = Arc::new(TransformPipeline::new(backend, bus.clone()));
        let runtime = EmbeddedRuntime::new();
        let capabilities = runtime.capabilities();

        let catalog = PluginCatalog::new(builtin_plugins(),
                                         &config.items.disabled_plugins);
        let registry = PluginRegistry::new(catalog, loaders.clone(),
                                           pipeline.clone(), bus.clone(),
                                           capabilities.reader.clone(),
                                           client.clone());

        let scheduler = Scheduler::new(config.scheduler_config(),
                                       capabilities.clone(), bus.clone(),
                                       client.clone());

        let root_loader = runtime.create_loader("app", None);
        loaders.observe(&root_loader);

        #[cfg(feature = "notify")]
        let file_watcher = BuildWatcher::new(peer.clone());

        let mut state = CoreState {
            peer,
            client,
            config_manager,
            config,
            loaders,
            executor,
            bus,
            pipeline,
            runtime,
            capabilities,
            registry,
            scheduler,
            #[cfg(feature = "notify")]
            file_watcher,
            root_loader,
            batch_buffer: None,
            is_shutdown: false,
        };
        state.setup_watches(config_dir, extra_watch_dirs);

        state.apply_log_level();
        let names = state.registry.catalog().iter_names()
            .map(String::as_str)
            .collect::<Vec<_>>();
        state.client.available_plugins(&names);
        state
    }

    /// The `log_level` setting caps the global log filter.
    fn apply_log_level(&self) {
        let filter = match self.config.items.log_level.as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        };
        log::set_max_level(filter);
    }

    #[cfg(feature = "notify")]
    fn setup_watches(&mut self, config_dir: Option<PathBuf>,
                     extra_watch_dirs: Vec<PathBuf>) {
        if let Some(dir) = config_dir {
            self.file_watcher.watch_config_file(&dir.join(USER_CONFIG_FILE));
        }
        let mut roots = self.config.items.watch_dirs.iter()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        roots.extend(extra_watch_dirs);
        for root in roots {
            if let Some(root) = self.file_watcher.watch_build_root(&root) {
                info!("watching build output {:?}", root);
            }
        }
    }

    #[cfg(not(feature = "notify"))]
    fn setup_watches(&mut self, _config_dir: Option<PathBuf>,
                     _extra_watch_dirs: Vec<PathBuf>) {
    }

    /// Exposed for testing purposes only.
    #[doc(hidden)]
    pub fn _runtime(&self) -> Arc<EmbeddedRuntime> {
        self.runtime.clone()
    }

    /// Exposed for testing purposes only.
    #[doc(hidden)]
    pub fn _root_loader(&self) -> LoaderHandle {
        self.root_loader.clone()
    }

    /// Drives a class load through the pipeline and installs the final
    /// bytes in the embedded runtime. The load event fires after the
    /// class is defined, so handlers can reflect on it.
    pub fn load_class(&self, loader: &LoaderHandle, bytes: &[u8],
                      version: Option<String>)
                      -> Result<ClassIdentity, SwapError> {
        let declared = read_form(bytes)?.name;
        let outcome = self.pipeline.transform(&declared, loader, bytes)?;
        let identity = self.runtime
            .install_class(loader, (*outcome.bytes).clone(), version)?;
        self.pipeline.notify_loaded(loader, &outcome);
        Ok(identity)
    }

    /// Forces pending redefinitions through; used by tests and
    /// debug tooling.
    pub fn flush_scheduler(&self) {
        let _ = self.scheduler.flush_sync();
    }

    pub fn client_notification(&mut self, cmd: CoreNotification) {
        use self::CoreNotification::*;
        match cmd {
            ClientStarted { .. } => warn!("client_started can only be sent once"),
            BatchBegin {} => {
                if self.batch_buffer.is_some() {
                    warn!("batch_begin while a batch is open");
                }
                self.batch_buffer = Some(Vec::new());
            }
            BatchCommit {} => match self.batch_buffer.take() {
                Some(requests) => {
                    if let Err(err) = self.scheduler.submit_batch(requests) {
                        warn!("batch dropped: {}", err);
                    }
                }
                None => warn!("batch_commit without batch_begin"),
            },
            ModifyUserConfig { changes } => self.do_modify_config(changes),
            Shutdown {} => self.do_shutdown(),
        }
    }

    pub fn client_request(&mut self, cmd: CoreRequest)
                          -> Result<Value, RemoteError> {
        use self::CoreRequest::*;
        match cmd {
            PushClass { class_name, loader, bytes } => {
                self.do_push_class(&class_name, loader, &bytes)
            }
            DebugFingerprint { bytes } => self.do_debug_fingerprint(&bytes),
            DebugAvailablePlugins {} => {
                let names = self.registry.catalog().iter_names()
                    .cloned()
                    .collect::<Vec<_>>();
                Ok(json!({ "plugins": names }))
            }
            DebugLoadClass { loader, bytes, version } => {
                self.do_debug_load_class(loader, &bytes, version)
            }
            DebugCreateLoader { name, parent } => {
                self.do_debug_create_loader(&name, parent)
            }
            DebugDropLoader { loader } => {
                self.runtime.drop_loader(LoaderId(loader));
                self.registry.prune();
                Ok(json!({ "status": "ok" }))
            }
        }
    }

    fn resolve_loader(&self, loader: Option<usize>) -> Option<LoaderHandle> {
        match loader {
            Some(id) => self.runtime.loader(LoaderId(id)),
            None => Some(self.root_loader.clone()),
        }
    }

    fn do_push_class(&mut self, class_name: &str, loader: Option<usize>,
                     hex: &str) -> Result<Value, RemoteError> {
        if self.is_shutdown {
            return Ok(json!({"status": "error", "error_kind": "shutdown"}));
        }
        let bytes = hex_to_bytes(hex)
            .map_err(|e| RemoteError::InvalidParams(Some(json!(e))))?;
        let form = match read_form(&bytes) {
            Ok(form) => form,
            Err(err) => {
                return Ok(json!({
                    "status": "rejected",
                    "error_kind": err.kind_str(),
                }));
            }
        };
        if form.name.as_str() != class_name {
            warn!("push_class name '{}' does not match bytes ({})",
                  class_name, form.name);
        }
        let loader = match self.resolve_loader(loader) {
            Some(loader) => loader,
            None => {
                return Ok(json!({
                    "status": "error",
                    "error_kind": "unresolved_identity",
                }));
            }
        };
        let request = RedefinitionRequest::new(
            ClassIdentity::new(form.name, &loader), bytes, RequestSource::Push);

        let result = match self.batch_buffer {
            Some(ref mut buffer) => {
                buffer.push(request);
                Ok(())
            }
            None => self.scheduler.submit(request),
        };
        match result {
            Ok(()) => Ok(json!({"status": "ok"})),
            Err(err) => Ok(json!({
                "status": "error",
                "error_kind": err.kind_str(),
            })),
        }
    }

    fn do_debug_fingerprint(&self, hex: &str) -> Result<Value, RemoteError> {
        let bytes = hex_to_bytes(hex)
            .map_err(|e| RemoteError::InvalidParams(Some(json!(e))))?;
        match read_form(&bytes) {
            Ok(form) => {
                let policy = self.config.fingerprint_policy();
                let print = fingerprint(&form, &policy);
                Ok(json!({
                    "class": form.name.as_str(),
                    "fingerprint": print.as_str(),
                }))
            }
            Err(err) => Err(RemoteError::custom(2, err.to_string(), None)),
        }
    }

    fn do_debug_load_class(&mut self, loader: Option<usize>, hex: &str,
                           version: Option<String>)
                           -> Result<Value, RemoteError> {
        let bytes = hex_to_bytes(hex)
            .map_err(|e| RemoteError::InvalidParams(Some(json!(e))))?;
        let loader = self.resolve_loader(loader)
            .ok_or_else(|| RemoteError::custom(3, "no such loader", None))?;
        match self.load_class(&loader, &bytes, version) {
            Ok(identity) => Ok(json!({
                "class": identity.name.as_str(),
                "loader": identity.loader_id().0,
            })),
            Err(err) => Err(RemoteError::custom(2, err.to_string(), None)),
        }
    }

    fn do_debug_create_loader(&mut self, name: &str, parent: Option<usize>)
                              -> Result<Value, RemoteError> {
        let parent = match parent {
            Some(id) => Some(self.runtime.loader(LoaderId(id))
                .ok_or_else(|| RemoteError::custom(3, "no such loader", None))?),
            None => None,
        };
        let loader = self.runtime.create_loader(name, parent.as_ref());
        self.loaders.observe(&loader);
        Ok(json!({ "loader": loader.id().0 }))
    }

    fn do_modify_config(&mut self, changes: Table) {
        match self.config_manager.update_user_config(changes, None) {
            Ok(()) => self.after_config_change(),
            Err(err) => {
                warn!("rejected config change: {}", err);
                self.client.alert(format!("config error: {}", err));
            }
        }
    }

    /// Recomputes the config snapshot, notifies the tool of changed
    /// keys, and rebuilds the scheduler if its timing changed.
    fn after_config_change(&mut self) {
        let new_config = self.config_manager.get_config();
        let changes = new_config.changes_from_other(&self.config);
        let old_config = ::std::mem::replace(&mut self.config, new_config);
        self.apply_log_level();

        if let Some(ref changes) = changes {
            self.client.config_changed(changes);
        }

        let new_sched = self.config.scheduler_config();
        let old_sched = old_config.scheduler_config();
        if new_sched.debounce_min != old_sched.debounce_min
            || new_sched.debounce_max != old_sched.debounce_max
            || new_sched.retry_count != old_sched.retry_count
            || new_sched.retry_backoff != old_sched.retry_backoff
        {
            // the old scheduler drains before the new one starts
            self.scheduler.shutdown();
            self.scheduler = Scheduler::new(new_sched, self.capabilities.clone(),
                                            self.bus.clone(), self.client.clone());
        }
    }

    pub fn handle_idle(&mut self, token: usize) {
        #[cfg(feature = "notify")]
        {
            if token == WATCH_IDLE_TOKEN {
                self.handle_fs_events();
            }
        }
        #[cfg(not(feature = "notify"))]
        let _ = token;
        self.registry.prune();
    }

    #[cfg(feature = "notify")]
    fn handle_fs_events(&mut self) {
        for event in self.file_watcher.drain_events() {
            match event {
                WatchEvent::ClassChanged { class_name, path } => {
                    self.handle_class_artifact(class_name, &path)
                }
                WatchEvent::ConfigChanged { path } => self.reload_config_file(&path),
                WatchEvent::ConfigRemoved { path } => {
                    self.config_manager.remove_source(&path);
                    self.after_config_change();
                }
            }
        }
    }

    /// A changed artifact under a build root becomes a redefinition
    /// request for the root loader.
    #[cfg(feature = "notify")]
    fn handle_class_artifact(&mut self, class_name: ClassName, path: &Path) {
        let bytes = match ::std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to read {:?}: {}", path, err);
                return;
            }
        };
        debug!("build output changed: {}", class_name);
        let request = RedefinitionRequest::new(
            ClassIdentity::new(class_name, &self.root_loader), bytes,
            RequestSource::FileWatch);
        if let Err(err) = self.scheduler.submit(request) {
            warn!("watch request dropped: {}", err);
        }
    }

    #[cfg(feature = "notify")]
    fn reload_config_file(&mut self, path: &Path) {
        if !self.config_manager.should_load_file(path) {
            return;
        }
        match try_load_from_file(path) {
            Ok(table) => {
                let result = self.config_manager
                    .update_user_config(table, Some(path.to_owned()));
                match result {
                    Ok(()) => self.after_config_change(),
                    Err(err) => {
                        warn!("bad config file {:?}: {}", path, err);
                        self.client.alert(format!("config error: {}", err));
                    }
                }
            }
            Err(err) => warn!("unreadable config file {:?}: {}", path, err),
        }
    }

    /// Stops producers, drains the scheduler and executor, tears down
    /// plugin managers, and asks the runloop to exit.
    fn do_shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        info!("shutting down");
        self.is_shutdown = true;
        self.batch_buffer = None;
        self.scheduler.shutdown();
        self.executor.shutdown();
        self.registry.shutdown();
        self.pipeline.clear();
        self.peer.schedule_exit();
    }
}

impl Drop for CoreState {
    fn drop(&mut self) {
        if !self.is_shutdown {
            self.scheduler.shutdown();
            self.executor.shutdown();
            self.registry.shutdown();
        }
    }
}
