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

//! Monitoring build output and the user configuration file.
//!
//! `BuildWatcher` turns raw filesystem notifications into engine work.
//! The underlying [`notify`](https://docs.rs/notify) watcher (inotify,
//! kqueue or fsevent, platform dependent) reports debounced path
//! events; those are classified on the watcher's own thread, as they
//! arrive:
//!
//! - a path under a registered build root must carry the `.class`
//!   extension, map to a binary class name, and pass the artifact
//!   validity check (size and magic number) before it becomes a
//!   [`WatchEvent::ClassChanged`];
//! - a write to the registered config file becomes
//!   [`WatchEvent::ConfigChanged`], a deletion
//!   [`WatchEvent::ConfigRemoved`];
//! - everything else is dropped on the watcher thread and never
//!   reaches the engine.
//!
//! Queued work wakes the runloop through the [`Notify`] trait; the
//! dispatch thread collects it with `drain_events` during its idle
//! handler.

use std::collections::VecDeque;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use notify::{watcher, DebouncedEvent, RecommendedWatcher, RecursiveMode, Watcher};

use crate::classfile::CLASS_MAGIC;
use crate::identity::ClassName;

/// Idle token for watcher-related idle scheduling.
pub const WATCH_IDLE_TOKEN: usize = 1002;

/// The per-path debounce applied by the underlying notify watcher.
const NOTIFY_DEBOUNCE_MS: u64 = 100;

/// A trait for types which can wake the runloop when work is queued.
pub trait Notify: Send {
    fn notify(&self);
}

/// One unit of filesystem-derived engine work.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A class artifact appeared or changed under a build root.
    ClassChanged { class_name: ClassName, path: PathBuf },
    /// The user config file was written or created.
    ConfigChanged { path: PathBuf },
    /// The user config file was deleted.
    ConfigRemoved { path: PathBuf },
}

/// Watches build-output trees and the config file, queueing classified
/// work items. The inner notify watcher runs in its own thread and
/// communicates over an `mpsc::channel`.
pub struct BuildWatcher {
    inner: RecommendedWatcher,
    state: Arc<Mutex<WatchState>>,
}

#[derive(Default)]
struct WatchState {
    queue: VecDeque<WatchEvent>,
    build_roots: Vec<PathBuf>,
    config_file: Option<PathBuf>,
}

impl WatchState {
    /// Decides what engine work, if any, a changed path implies.
    fn classify(&self, path: &Path, removed: bool) -> Option<WatchEvent> {
        if self.config_file.as_ref().map(PathBuf::as_path) == Some(path) {
            return Some(if removed {
                WatchEvent::ConfigRemoved { path: path.to_owned() }
            } else {
                WatchEvent::ConfigChanged { path: path.to_owned() }
            });
        }
        if removed {
            // a deleted artifact has no bytes to redefine with
            return None;
        }
        let root = self.build_roots.iter().find(|root| path.starts_with(root))?;
        let class_name = ClassName::from_class_path(path.strip_prefix(root).ok()?)?;
        if !is_valid_class_artifact(path) {
            return None;
        }
        Some(WatchEvent::ClassChanged { class_name, path: path.to_owned() })
    }

    /// Folds one raw notification into the queue. Returns `true` if
    /// work was queued and the runloop should be woken.
    fn accept(&mut self, event: &DebouncedEvent) -> bool {
        let work = match *event {
            DebouncedEvent::Create(ref path) | DebouncedEvent::Write(ref path) => {
                self.classify(path, false)
            }
            // a compiler moving output into place reports a rename;
            // only the destination matters
            DebouncedEvent::Rename(_, ref to) => self.classify(to, false),
            DebouncedEvent::Remove(ref path) => self.classify(path, true),
            // notices precede the debounced write; rescans and errors
            // carry no actionable path
            _ => None,
        };
        match work {
            Some(work) => {
                self.queue.push_back(work);
                true
            }
            None => false,
        }
    }
}

impl BuildWatcher {
    pub fn new<T: Notify + 'static>(peer: T) -> Self {
        let (tx_event, rx_event) = channel();
        let state = Arc::new(Mutex::new(WatchState::default()));
        let state_clone = state.clone();

        let inner = watcher(tx_event, Duration::from_millis(NOTIFY_DEBOUNCE_MS))
            .expect("watcher should spawn");

        thread::spawn(move || {
            while let Ok(event) = rx_event.recv() {
                if state_clone.lock().unwrap().accept(&event) {
                    peer.notify();
                }
            }
        });

        BuildWatcher { inner, state }
    }

    /// Starts watching a build-output tree, recursively. Returns the
    /// canonical root under which class names are resolved.
    pub fn watch_build_root(&mut self, path: &Path) -> Option<PathBuf> {
        let root = match path.canonicalize() {
            Ok(root) => root,
            Err(err) => {
                warn!("cannot watch build root {:?}: {}", path, err);
                return None;
            }
        };
        if let Err(err) = self.inner.watch(&root, RecursiveMode::Recursive) {
            warn!("error watching {:?}: {:?}", root, err);
            return None;
        }
        let mut state = self.state.lock().unwrap();
        if !state.build_roots.contains(&root) {
            state.build_roots.push(root.clone());
        }
        Some(root)
    }

    /// Starts watching the user config file. The parent directory is
    /// watched, since editors replace files rather than rewrite them.
    pub fn watch_config_file(&mut self, path: &Path) {
        let (dir, file_name) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(file_name)) => (dir, file_name),
            _ => return,
        };
        let dir = match dir.canonicalize() {
            Ok(dir) => dir,
            Err(err) => {
                warn!("cannot watch config dir {:?}: {}", dir, err);
                return;
            }
        };
        if let Err(err) = self.inner.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("error watching {:?}: {:?}", dir, err);
            return;
        }
        self.state.lock().unwrap().config_file = Some(dir.join(file_name));
    }

    /// Empties the queue, returning any pending work items.
    pub fn drain_events(&self) -> Vec<WatchEvent> {
        let mut state = self.state.lock().unwrap();
        state.queue.drain(..).collect()
    }
}

/// Checks whether the file at `path` is plausibly a class artifact:
/// large enough for a header, and carrying the class magic number.
/// Half-written compiler output fails this check and is picked up by
/// the write that completes it.
pub fn is_valid_class_artifact(path: &Path) -> bool {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return false,
    };
    if !metadata.is_file() || metadata.len() < 16 {
        return false;
    }
    let mut magic = [0u8; 4];
    match fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == CLASS_MAGIC,
        Err(_) => false,
    }
}

impl Notify for ::molt_rpc::RpcPeer {
    fn notify(&self) {
        self.schedule_idle(WATCH_IDLE_TOKEN);
    }
}

#[cfg(test)]
extern crate tempdir;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as IoWrite;
    use std::sync::mpsc;
    use std::time::Instant;

    use crate::test_helpers::ClassFileBuilder;

    impl Notify for mpsc::Sender<bool> {
        fn notify(&self) {
            self.send(true).expect("send shouldn't fail")
        }
    }

    fn write_file(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create parent");
        }
        let mut file = File::create(path).expect("failed to create file");
        file.write_all(contents).expect("failed to write");
        file.sync_all().expect("failed to sync");
    }

    /// Polls the watcher until at least `want` work items are queued,
    /// draining as it goes.
    fn drain_at_least(watcher: &BuildWatcher, want: usize, timeout: Duration)
                      -> Vec<WatchEvent> {
        let start = Instant::now();
        let mut events = Vec::new();
        while start.elapsed() < timeout {
            events.extend(watcher.drain_events());
            if events.len() >= want {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }
        events
    }

    #[test]
    fn classify_routes_paths() {
        let tmp = tempdir::TempDir::new("molt-watch").unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let config = root.join("molt.toml");
        write_file(&root.join("com/Foo.class"),
                   &ClassFileBuilder::new("com.Foo").build());

        let state = WatchState {
            queue: VecDeque::new(),
            build_roots: vec![root.join("classes")],
            config_file: Some(config.clone()),
        };

        assert_eq!(state.classify(&config, false),
                   Some(WatchEvent::ConfigChanged { path: config.clone() }));
        assert_eq!(state.classify(&config, true),
                   Some(WatchEvent::ConfigRemoved { path: config.clone() }));

        // outside every build root
        assert_eq!(state.classify(&root.join("com/Foo.class"), false), None);
        // under a root but not a class file
        assert_eq!(state.classify(&root.join("classes/readme.md"), false), None);
        // class artifact removals produce no work
        assert_eq!(state.classify(&root.join("classes/com/Foo.class"), true), None);

        let state = WatchState {
            queue: VecDeque::new(),
            build_roots: vec![root.clone()],
            config_file: None,
        };
        assert_eq!(state.classify(&root.join("com/Foo.class"), false),
                   Some(WatchEvent::ClassChanged {
                       class_name: ClassName::new("com.Foo"),
                       path: root.join("com/Foo.class"),
                   }));
    }

    #[test]
    fn artifact_validity() {
        let tmp = tempdir::TempDir::new("molt-watch").unwrap();
        let valid = tmp.path().join("Valid.class");
        write_file(&valid, &ClassFileBuilder::new("Valid").build());
        assert!(is_valid_class_artifact(&valid));

        let bogus = tmp.path().join("Bogus.class");
        write_file(&bogus, b"this is not bytecode, whatever the extension says");
        assert!(!is_valid_class_artifact(&bogus));

        let short = tmp.path().join("Tiny.class");
        write_file(&short, &CLASS_MAGIC);
        assert!(!is_valid_class_artifact(&short));

        assert!(!is_valid_class_artifact(&tmp.path().join("Absent.class")));
    }

    #[test]
    fn build_root_delivers_only_class_artifacts() {
        let tmp = tempdir::TempDir::new("molt-watch").unwrap();
        fs::create_dir_all(tmp.path().join("com")).unwrap();

        let (tx, _rx) = mpsc::channel();
        let mut watcher = BuildWatcher::new(tx);
        let root = watcher.watch_build_root(tmp.path()).unwrap();

        write_file(&root.join("com/Foo.class"),
                   &ClassFileBuilder::new("com.Foo").build());
        write_file(&root.join("com/Bogus.class"), b"wrong magic, right extension");
        write_file(&root.join("com/readme.md"), b"not a class");

        let events = drain_at_least(&watcher, 1, Duration::from_secs(2));
        assert!(!events.is_empty());
        for event in events {
            match event {
                WatchEvent::ClassChanged { class_name, path } => {
                    assert_eq!(class_name, ClassName::new("com.Foo"));
                    assert_eq!(path, root.join("com/Foo.class"));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn config_file_lifecycle_reported() {
        let tmp = tempdir::TempDir::new("molt-watch").unwrap();
        let config = tmp.path().canonicalize().unwrap().join("molt.toml");

        let (tx, _rx) = mpsc::channel();
        let mut watcher = BuildWatcher::new(tx);
        watcher.watch_config_file(&config);

        write_file(&config, b"debounce_min_ms = 50\n");
        let events = drain_at_least(&watcher, 1, Duration::from_secs(2));
        assert!(events.iter().all(|e| match *e {
            WatchEvent::ConfigChanged { ref path } => path == &config,
            _ => false,
        }));
        assert!(!events.is_empty());

        fs::remove_file(&config).unwrap();
        let events = drain_at_least(&watcher, 1, Duration::from_secs(2));
        assert!(events.contains(&WatchEvent::ConfigRemoved { path: config.clone() }));
    }

    #[test]
    fn sibling_files_do_not_look_like_config() {
        let tmp = tempdir::TempDir::new("molt-watch").unwrap();
        let dir = tmp.path().canonicalize().unwrap();

        let (tx, _rx) = mpsc::channel();
        let mut watcher = BuildWatcher::new(tx);
        watcher.watch_config_file(&dir.join("molt.toml"));

        write_file(&dir.join("notes.toml"), b"unrelated = true\n");
        thread::sleep(Duration::from_millis(400));
        assert!(watcher.drain_events().is_empty());
    }
}
