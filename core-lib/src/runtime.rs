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

//! The runtime attachment point.
//!
//! The engine plugs into exactly three capabilities of the host
//! runtime: the class-load hook (served by the transformer pipeline),
//! a reflective reader for currently-loaded classes, and the native
//! redefine primitive. A host embeds the engine by supplying the
//! latter two as trait objects.
//!
//! [`EmbeddedRuntime`] is an in-process implementation of those
//! capabilities over a plain class table. It backs the standalone
//! binary and the test suite, and can inject transient or permanent
//! redefine failures on demand.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::errors::SwapError;
use crate::identity::{ClassIdentity, ClassName};
use crate::loaders::{LoaderHandle, LoaderId};

/// A loaded class, as seen through the reflective reader.
#[derive(Debug, Clone)]
pub struct LoadedClass {
    /// The class's current bytes, as last defined or redefined.
    pub bytes: Vec<u8>,
    /// The version attribute of the artifact the class came from, when
    /// the runtime knows it. Plugin probes check this against their
    /// version expression.
    pub implementation_version: Option<String>,
}

/// Reads a loaded class's current bytes and metadata.
pub trait ReflectiveReader: Send + Sync {
    fn loaded_class(&self, identity: &ClassIdentity) -> Option<LoadedClass>;
}

/// Failure modes of the native redefine primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum RedefineError {
    /// The runtime was busy; the call may be retried.
    Transient(String),
    /// The runtime rejected the change.
    Permanent(String),
}

impl fmt::Display for RedefineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RedefineError::Transient(ref detail) => {
                write!(f, "transient: {}", detail)
            }
            RedefineError::Permanent(ref detail) => {
                write!(f, "permanent: {}", detail)
            }
        }
    }
}

impl From<RedefineError> for SwapError {
    fn from(err: RedefineError) -> SwapError {
        match err {
            RedefineError::Transient(detail) => SwapError::RedefineTransient(detail),
            RedefineError::Permanent(detail) => SwapError::RedefinePermanent(detail),
        }
    }
}

/// The native in-place redefinition facility.
///
/// The documented constraint on implementations: only method bodies
/// (plus annotations and attributes) may change. A batch is applied
/// atomically; cross-consistency checks happen inside one call.
pub trait RedefinePrimitive: Send + Sync {
    fn redefine(&self, batch: &[(ClassIdentity, Vec<u8>)])
                -> Result<(), RedefineError>;
}

/// The bundle of host capabilities the engine runs against.
#[derive(Clone)]
pub struct RuntimeCapabilities {
    pub reader: Arc<dyn ReflectiveReader>,
    pub redefiner: Arc<dyn RedefinePrimitive>,
}

#[derive(Default)]
struct EmbeddedInner {
    classes: HashMap<(ClassName, LoaderId), LoadedClass>,
    loaders: HashMap<LoaderId, LoaderHandle>,
    fail_transient: usize,
    fail_permanent: Option<String>,
    redefined_batches: Vec<Vec<ClassName>>,
}

/// An in-process runtime: a class table plus loader ownership.
///
/// The strong loader handles live here, mirroring a real runtime where
/// loaders are reachable from the application. Dropping a loader from
/// the table reclaims it, and the engine's weak references die.
pub struct EmbeddedRuntime {
    inner: Mutex<EmbeddedInner>,
}

impl EmbeddedRuntime {
    pub fn new() -> Arc<EmbeddedRuntime> {
        Arc::new(EmbeddedRuntime { inner: Mutex::new(EmbeddedInner::default()) })
    }

    /// The capability bundle backed by this runtime.
    pub fn capabilities(self: &Arc<Self>) -> RuntimeCapabilities {
        RuntimeCapabilities {
            reader: self.clone() as Arc<dyn ReflectiveReader>,
            redefiner: self.clone() as Arc<dyn RedefinePrimitive>,
        }
    }

    /// Creates a loader owned by this runtime.
    pub fn create_loader(&self, name: &str, parent: Option<&LoaderHandle>)
                         -> LoaderHandle {
        let loader = LoaderHandle::new(name, parent);
        let mut inner = self.inner.lock().unwrap();
        inner.loaders.insert(loader.id(), loader.clone());
        loader
    }

    /// Looks up a live loader owned by this runtime.
    pub fn loader(&self, id: LoaderId) -> Option<LoaderHandle> {
        self.inner.lock().unwrap().loaders.get(&id).cloned()
    }

    /// Drops the runtime's strong reference to a loader. Classes
    /// defined in it are removed from the table.
    pub fn drop_loader(&self, id: LoaderId) {
        let mut inner = self.inner.lock().unwrap();
        inner.loaders.remove(&id);
        inner.classes.retain(|&(_, loader_id), _| loader_id != id);
    }

    /// Installs a class into the table, as a runtime does after its
    /// load hook returns final bytes.
    pub fn install_class(&self, loader: &LoaderHandle, bytes: Vec<u8>,
                         implementation_version: Option<String>)
                         -> Result<ClassIdentity, SwapError> {
        let form = crate::classfile::read_form(&bytes)?;
        let identity = ClassIdentity::new(form.name.clone(), loader);
        let mut inner = self.inner.lock().unwrap();
        inner.classes.insert((form.name, loader.id()),
                             LoadedClass { bytes, implementation_version });
        Ok(identity)
    }

    /// Makes the next `n` redefine calls fail with a transient error.
    pub fn fail_next_transient(&self, n: usize) {
        self.inner.lock().unwrap().fail_transient = n;
    }

    /// Makes the next redefine call fail permanently.
    pub fn fail_next_permanent(&self, detail: &str) {
        self.inner.lock().unwrap().fail_permanent = Some(detail.to_owned());
    }

    /// The number of successful redefine calls so far.
    pub fn redefine_count(&self) -> usize {
        self.inner.lock().unwrap().redefined_batches.len()
    }

    /// The classes of each successful redefine call, in call order.
    pub fn redefined_batches(&self) -> Vec<Vec<ClassName>> {
        self.inner.lock().unwrap().redefined_batches.clone()
    }
}

impl ReflectiveReader for EmbeddedRuntime {
    fn loaded_class(&self, identity: &ClassIdentity) -> Option<LoadedClass> {
        let inner = self.inner.lock().unwrap();
        inner.classes
            .get(&(identity.name.clone(), identity.loader_id()))
            .cloned()
    }
}

impl RedefinePrimitive for EmbeddedRuntime {
    fn redefine(&self, batch: &[(ClassIdentity, Vec<u8>)])
                -> Result<(), RedefineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_transient > 0 {
            inner.fail_transient -= 1;
            return Err(RedefineError::Transient("class table busy".into()));
        }
        if let Some(detail) = inner.fail_permanent.take() {
            return Err(RedefineError::Permanent(detail));
        }
        for &(ref identity, _) in batch {
            let key = (identity.name.clone(), identity.loader_id());
            if !inner.classes.contains_key(&key) {
                return Err(RedefineError::Permanent(
                    format!("{} is not loaded", identity)));
            }
        }
        let mut names = Vec::with_capacity(batch.len());
        for &(ref identity, ref bytes) in batch {
            let key = (identity.name.clone(), identity.loader_id());
            if let Some(loaded) = inner.classes.get_mut(&key) {
                loaded.bytes = bytes.clone();
            }
            names.push(identity.name.clone());
        }
        inner.redefined_batches.push(names);
        Ok(())
    }
}
