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

//! The transformer pipeline.
//!
//! This is the engine's collaborator with the runtime's class-load
//! hook: given (class name, intended loader, original bytes), it runs
//! every matching transformer in order and returns the bytes the
//! runtime should define. Results are cached by (name, source digest)
//! so a repeated load with identical input skips the chain.
//!
//! The pipeline runs on whichever thread is loading the class, and is
//! fully thread-safe.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::bytecode::{BytecodeBackend, ClassEditor, EditError};
use crate::classfile::{read_form, ClassForm};
use crate::errors::SwapError;
use crate::events::{Event, EventBus};
use crate::fingerprint::digest_bytes;
use crate::identity::{ClassIdentity, ClassName};
use crate::loaders::{LoaderHandle, LoaderId};

/// How a transformer names its target classes.
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// A literal binary name.
    Exact(ClassName),
    /// A glob over binary names; `*` matches any run of characters and
    /// `?` matches one.
    Glob(String),
    /// Every class.
    All,
}

impl NamePattern {
    /// Match specificity: exact beats glob beats all.
    fn rank(&self) -> u8 {
        match *self {
            NamePattern::Exact(..) => 0,
            NamePattern::Glob(..) => 1,
            NamePattern::All => 2,
        }
    }

    fn compile(&self) -> Option<Regex> {
        match *self {
            NamePattern::Glob(ref glob) => {
                let mut pattern = String::from("^");
                for ch in glob.chars() {
                    match ch {
                        '*' => pattern.push_str(".*"),
                        '?' => pattern.push('.'),
                        c => pattern.push_str(&regex::escape(&c.to_string())),
                    }
                }
                pattern.push('$');
                match Regex::new(&pattern) {
                    Ok(regex) => Some(regex),
                    Err(err) => {
                        warn!("bad glob '{}': {}", glob, err);
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

/// Whether a transformer sees every load, or only the first load of an
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadScope {
    FirstLoadOnly,
    EveryLoad,
}

/// The executable part of a transformer. Returning `Ok(None)` abstains,
/// leaving the current bytes untouched.
pub type TransformFn =
    Arc<dyn Fn(&TransformCtx) -> Result<Option<Vec<u8>>, SwapError> + Send + Sync>;

/// A declarative description of one transform.
#[derive(Clone)]
pub struct TransformerDescriptor {
    /// A name for diagnostics.
    pub name: String,
    pub pattern: NamePattern,
    /// Lower priorities run earlier; ties keep registration order.
    pub priority: i32,
    pub scope: LoadScope,
    pub transform: TransformFn,
}

/// Identifies a registration, for unregistering at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformerId(usize);

/// What a transformer sees when invoked.
pub struct TransformCtx<'a> {
    /// The class's current name (renaming transformers may have
    /// changed it earlier in the chain).
    pub class_name: &'a ClassName,
    pub loader: &'a LoaderHandle,
    /// The current bytes, as produced by the chain so far.
    pub bytes: &'a [u8],
    /// `true` the first time this class identity is loaded.
    pub first_load: bool,
    backend: &'a dyn BytecodeBackend,
}

impl<'a> TransformCtx<'a> {
    /// Opens the current bytes for editing with the configured backend.
    pub fn editor(&self) -> Result<ClassEditor, EditError> {
        ClassEditor::open(self.backend, self.bytes)
    }
}

struct TransformerEntry {
    id: TransformerId,
    seq: usize,
    scope_loader: Option<LoaderId>,
    regex: Option<Regex>,
    desc: TransformerDescriptor,
}

impl TransformerEntry {
    fn matches(&self, name: &ClassName) -> bool {
        match self.desc.pattern {
            NamePattern::Exact(ref exact) => exact == name,
            NamePattern::Glob(..) => self.regex.as_ref()
                .map(|r| r.is_match(name.as_str()))
                .unwrap_or(false),
            NamePattern::All => true,
        }
    }

    fn applies_to_loader(&self, loader: &LoaderHandle) -> bool {
        match self.scope_loader {
            None => true,
            Some(scope_id) => {
                // scoped transformers apply to their loader and its
                // descendants
                let mut cur = Some(loader.clone());
                while let Some(l) = cur {
                    if l.id() == scope_id {
                        return true;
                    }
                    cur = l.parent();
                }
                false
            }
        }
    }

    fn sort_key(&self) -> (u8, i32, usize) {
        (self.desc.pattern.rank(), self.desc.priority, self.seq)
    }
}

#[derive(Default)]
struct PipelineInner {
    entries: Vec<TransformerEntry>,
    next_id: usize,
}

struct CachedLoad {
    bytes: Arc<Vec<u8>>,
    form: Arc<ClassForm>,
}

/// The result of running the pipeline for one load.
pub struct LoadOutcome {
    pub bytes: Arc<Vec<u8>>,
    pub form: Arc<ClassForm>,
    pub from_cache: bool,
}

/// The ordered, cached chain of class transformers.
pub struct TransformPipeline {
    inner: Mutex<PipelineInner>,
    cache: Mutex<HashMap<(ClassName, String), CachedLoad>>,
    seen: Mutex<HashSet<(ClassName, LoaderId)>>,
    backend: Arc<dyn BytecodeBackend>,
    bus: Arc<EventBus>,
}

impl TransformPipeline {
    pub fn new(backend: Arc<dyn BytecodeBackend>, bus: Arc<EventBus>)
               -> TransformPipeline {
        TransformPipeline {
            inner: Mutex::new(PipelineInner::default()),
            cache: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            backend,
            bus,
        }
    }

    /// Registers a transformer. `scope` ties it to a loader and its
    /// descendants; engine-wide transformers pass `None`.
    pub fn register(&self, scope: Option<&LoaderHandle>, desc: TransformerDescriptor)
                    -> TransformerId {
        let mut inner = self.inner.lock().unwrap();
        let id = TransformerId(inner.next_id);
        inner.next_id += 1;
        let seq = inner.entries.len();
        let regex = desc.pattern.compile();
        inner.entries.push(TransformerEntry {
            id,
            seq,
            scope_loader: scope.map(LoaderHandle::id),
            regex,
            desc,
        });
        id
    }

    pub fn unregister(&self, id: TransformerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.id != id);
    }

    pub fn unregister_all(&self, ids: &[TransformerId]) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| !ids.contains(&e.id));
    }

    pub fn transformer_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// The class-load hook. Returns the final bytes to define along
    /// with their parsed form, and fires a `ClassLoaded` event.
    ///
    /// Embeddings that need the class defined before handlers observe
    /// it call [`transform`](#method.transform) and
    /// [`notify_loaded`](#method.notify_loaded) separately.
    pub fn on_class_load(&self, declared_name: &ClassName, loader: &LoaderHandle,
                         bytes: &[u8]) -> Result<LoadOutcome, SwapError> {
        let outcome = self.transform(declared_name, loader, bytes)?;
        self.notify_loaded(loader, &outcome);
        Ok(outcome)
    }

    /// Runs the transformer chain without firing the load event.
    pub fn transform(&self, declared_name: &ClassName, loader: &LoaderHandle,
                     bytes: &[u8]) -> Result<LoadOutcome, SwapError> {
        let form = read_form(bytes)?;
        if &form.name != declared_name {
            warn!("declared name {} does not match parsed name {}",
                  declared_name, form.name);
        }
        let name = form.name.clone();
        let digest = digest_bytes(bytes);

        let first_load = {
            let mut seen = self.seen.lock().unwrap();
            seen.insert((name.clone(), loader.id()))
        };

        if let Some(cached) = self.cache_lookup(&name, &digest) {
            return Ok(LoadOutcome {
                bytes: cached.bytes,
                form: cached.form,
                from_cache: true,
            });
        }

        let (final_bytes, final_form) =
            self.run_chain(loader, bytes, form, first_load);

        let outcome = LoadOutcome {
            bytes: Arc::new(final_bytes),
            form: Arc::new(final_form),
            from_cache: false,
        };
        {
            let mut cache = self.cache.lock().unwrap();
            // a racing identical insert is harmless; last writer wins
            cache.insert((name, digest), CachedLoad {
                bytes: outcome.bytes.clone(),
                form: outcome.form.clone(),
            });
        }
        Ok(outcome)
    }

    /// Fires the `ClassLoaded` event for a completed load. Embeddings
    /// call this once the runtime has the class defined.
    pub fn notify_loaded(&self, loader: &LoaderHandle, outcome: &LoadOutcome) {
        self.bus.dispatch(&Event::ClassLoaded {
            identity: ClassIdentity::new(outcome.form.name.clone(), loader),
            form: outcome.form.clone(),
        });
    }

    /// Drops all record of previous loads; used at shutdown.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
        self.seen.lock().unwrap().clear();
    }

    /// Forgets identities belonging to a reclaimed loader.
    pub fn prune_loader(&self, loader: LoaderId) {
        let mut seen = self.seen.lock().unwrap();
        seen.retain(|&(_, loader_id)| loader_id != loader);
    }

    fn cache_lookup(&self, name: &ClassName, digest: &str) -> Option<CachedLoad> {
        let cache = self.cache.lock().unwrap();
        cache.get(&(name.clone(), digest.to_owned())).map(|c| CachedLoad {
            bytes: c.bytes.clone(),
            form: c.form.clone(),
        })
    }

    /// Runs the transformer chain. Matching is recomputed whenever a
    /// transformer changes the class's name, so renaming transformers
    /// hand off to transformers matching the new name.
    fn run_chain(&self, loader: &LoaderHandle, original: &[u8], form: ClassForm,
                 first_load: bool) -> (Vec<u8>, ClassForm) {
        let mut bytes = original.to_vec();
        let mut form = form;
        let mut ran = Vec::new();

        loop {
            let next = {
                let inner = self.inner.lock().unwrap();
                let mut candidates = inner.entries.iter()
                    .filter(|e| !ran.contains(&e.id))
                    .filter(|e| e.matches(&form.name))
                    .filter(|e| e.applies_to_loader(loader))
                    .map(|e| (e.sort_key(), e.id, e.desc.clone()))
                    .collect::<Vec<_>>();
                candidates.sort_by(|a, b| a.0.cmp(&b.0));
                candidates.into_iter().next()
            };
            let (_, id, desc) = match next {
                Some(next) => next,
                None => break,
            };
            ran.push(id);

            if desc.scope == LoadScope::FirstLoadOnly && !first_load {
                continue;
            }

            let ctx = TransformCtx {
                class_name: &form.name,
                loader,
                bytes: &bytes,
                first_load,
                backend: &*self.backend,
            };
            match (desc.transform)(&ctx) {
                Ok(None) => (),
                Ok(Some(new_bytes)) => match read_form(&new_bytes) {
                    Ok(new_form) => {
                        bytes = new_bytes;
                        form = new_form;
                    }
                    Err(err) => {
                        warn!("transformer '{}' produced unparseable bytes, \
                               discarding: {}", desc.name, err);
                    }
                },
                Err(err) => {
                    warn!("transformer '{}' failed, discarding: {}", desc.name, err);
                }
            }
        }

        (bytes, form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::executor::CommandExecutor;
    use crate::test_helpers::{ClassFileBuilder, RecordingBackend};

    fn new_pipeline() -> TransformPipeline {
        let bus = Arc::new(EventBus::new(Arc::new(CommandExecutor::new())));
        TransformPipeline::new(Arc::new(RecordingBackend::new()), bus)
    }

    fn replacing(name: &str, pattern: NamePattern, priority: i32,
                 replacement: Vec<u8>) -> TransformerDescriptor {
        TransformerDescriptor {
            name: name.to_owned(),
            pattern,
            priority,
            scope: LoadScope::EveryLoad,
            transform: Arc::new(move |_| Ok(Some(replacement.clone()))),
        }
    }

    fn abstaining(name: &str, pattern: NamePattern) -> TransformerDescriptor {
        TransformerDescriptor {
            name: name.to_owned(),
            pattern,
            priority: 0,
            scope: LoadScope::EveryLoad,
            transform: Arc::new(|_| Ok(None)),
        }
    }

    #[test]
    fn no_transformers_returns_original() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let bytes = ClassFileBuilder::new("p.A").method("f", "()I").build();
        let outcome = pipeline.on_class_load(&"p.A".into(), &loader, &bytes).unwrap();
        assert_eq!(*outcome.bytes, bytes);
        assert!(!outcome.from_cache);
    }

    #[test]
    fn last_non_abstaining_wins() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let original = ClassFileBuilder::new("p.B").build();
        let replaced = ClassFileBuilder::new("p.B").method("added", "()V").build();

        pipeline.register(None, replacing("rewrite", NamePattern::Exact("p.B".into()),
                                          0, replaced.clone()));
        pipeline.register(None, abstaining("noop", NamePattern::All));

        let outcome = pipeline.on_class_load(&"p.B".into(), &loader, &original).unwrap();
        assert_eq!(*outcome.bytes, replaced);
    }

    #[test]
    fn priority_orders_chain() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let original = ClassFileBuilder::new("p.C").build();
        let first = ClassFileBuilder::new("p.C").field("first", "I").build();
        let second = ClassFileBuilder::new("p.C").field("second", "I").build();

        // higher priority value runs later and so has the final say
        pipeline.register(None, replacing("late", NamePattern::Exact("p.C".into()),
                                          10, second.clone()));
        pipeline.register(None, replacing("early", NamePattern::Exact("p.C".into()),
                                          0, first));

        let outcome = pipeline.on_class_load(&"p.C".into(), &loader, &original).unwrap();
        assert_eq!(*outcome.bytes, second);
    }

    #[test]
    fn glob_and_all_patterns_match() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        pipeline.register(None, TransformerDescriptor {
            name: "glob".into(),
            pattern: NamePattern::Glob("com.example.*".into()),
            priority: 0,
            scope: LoadScope::EveryLoad,
            transform: Arc::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        });

        let hit = ClassFileBuilder::new("com.example.Hit").build();
        let miss = ClassFileBuilder::new("org.other.Miss").build();
        pipeline.on_class_load(&"com.example.Hit".into(), &loader, &hit).unwrap();
        pipeline.on_class_load(&"org.other.Miss".into(), &loader, &miss).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_load_only_skipped_on_reload() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        pipeline.register(None, TransformerDescriptor {
            name: "once".into(),
            pattern: NamePattern::Exact("p.D".into()),
            priority: 0,
            scope: LoadScope::FirstLoadOnly,
            transform: Arc::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        });

        let v1 = ClassFileBuilder::new("p.D").method("f", "()I").body(&[1]).build();
        let v2 = ClassFileBuilder::new("p.D").method("f", "()I").body(&[2]).build();
        pipeline.on_class_load(&"p.D".into(), &loader, &v1).unwrap();
        pipeline.on_class_load(&"p.D".into(), &loader, &v2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn identical_input_served_from_cache() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        pipeline.register(None, TransformerDescriptor {
            name: "count".into(),
            pattern: NamePattern::Exact("p.E".into()),
            priority: 0,
            scope: LoadScope::EveryLoad,
            transform: Arc::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        });

        let bytes = ClassFileBuilder::new("p.E").build();
        let first = pipeline.on_class_load(&"p.E".into(), &loader, &bytes).unwrap();
        let second = pipeline.on_class_load(&"p.E".into(), &loader, &bytes).unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_transformer_contribution_discarded() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let original = ClassFileBuilder::new("p.F").build();

        pipeline.register(None, TransformerDescriptor {
            name: "broken".into(),
            pattern: NamePattern::Exact("p.F".into()),
            priority: 0,
            scope: LoadScope::EveryLoad,
            transform: Arc::new(|_| {
                Err(SwapError::PluginError {
                    plugin: "t".into(),
                    detail: "boom".into(),
                })
            }),
        });

        let outcome = pipeline.on_class_load(&"p.F".into(), &loader, &original).unwrap();
        assert_eq!(*outcome.bytes, original);
    }

    #[test]
    fn rename_rematches_remaining_transformers() {
        let pipeline = new_pipeline();
        let loader = LoaderHandle::new("l", None);
        let original = ClassFileBuilder::new("p.Old").build();
        let renamed = ClassFileBuilder::new("p.New").build();
        let final_bytes = ClassFileBuilder::new("p.New").field("touched", "I").build();

        pipeline.register(None, replacing("rename", NamePattern::Exact("p.Old".into()),
                                          0, renamed));
        // matches only the post-rename name
        pipeline.register(None, replacing("after", NamePattern::Exact("p.New".into()),
                                          0, final_bytes.clone()));

        let outcome = pipeline.on_class_load(&"p.Old".into(), &loader, &original).unwrap();
        assert_eq!(*outcome.bytes, final_bytes);
        assert_eq!(outcome.form.name, ClassName::new("p.New"));
    }

    #[test]
    fn loader_scoped_transformer_contained() {
        let pipeline = new_pipeline();
        let scoped_loader = LoaderHandle::new("scoped", None);
        let other_loader = LoaderHandle::new("other", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        pipeline.register(Some(&scoped_loader), TransformerDescriptor {
            name: "scoped".into(),
            pattern: NamePattern::All,
            priority: 0,
            scope: LoadScope::EveryLoad,
            transform: Arc::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        });

        let a = ClassFileBuilder::new("p.G").build();
        pipeline.on_class_load(&"p.G".into(), &other_loader, &a).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        pipeline.on_class_load(&"p.G".into(), &scoped_loader, &a).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
