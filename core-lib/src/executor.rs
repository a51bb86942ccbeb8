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

//! The scheduled-command executor.
//!
//! A single dedicated worker runs deferred callbacks after their delay
//! elapses. Commands are ordered by earliest-execution time, ties broken
//! by submission order. Two submissions with the same merge key collapse
//! into one: the queue retains a single entry, taking the later
//! submission's payload and timer.
//!
//! A command whose owning loader has been reclaimed by execution time is
//! dropped silently. Shutdown discards pending commands; an in-flight
//! command completes.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::loaders::{with_context_loader, WeakLoader};

/// The payload of a scheduled command. It runs on the executor's worker
/// thread with the target loader installed as the context loader.
pub type CommandPayload = Box<dyn FnOnce() + Send>;

/// Collapses bursts of equivalent commands into one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey(pub String);

/// A deferred callback awaiting execution.
pub struct ScheduledCommand {
    /// The loader to install while the payload runs. Commands with no
    /// loader are engine-scoped and always run.
    pub loader: Option<WeakLoader>,
    pub merge_key: Option<MergeKey>,
    pub delay: Duration,
    pub payload: CommandPayload,
}

struct QueueEntry {
    run_at: Instant,
    seq: u64,
    loader: Option<WeakLoader>,
    merge_key: Option<MergeKey>,
    payload: CommandPayload,
}

#[derive(Default)]
struct ExecQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct ExecutorShared {
    queue: Mutex<ExecQueue>,
    cvar: Condvar,
}

/// Owner of the worker thread and the timed queue.
pub struct CommandExecutor {
    shared: Arc<ExecutorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandExecutor {
    pub fn new() -> CommandExecutor {
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(ExecQueue::default()),
            cvar: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("molt-executor".to_owned())
            .spawn(move || run_worker(worker_shared))
            .expect("executor worker should spawn");
        CommandExecutor { shared, worker: Mutex::new(Some(worker)) }
    }

    /// Submits a command. Returns `false` if the executor has shut down
    /// and the command was discarded.
    pub fn submit(&self, cmd: ScheduledCommand) -> bool {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.shutdown {
            return false;
        }
        let run_at = Instant::now() + cmd.delay;
        if let Some(ref key) = cmd.merge_key {
            let existing = queue.entries.iter_mut()
                .find(|e| e.merge_key.as_ref() == Some(key));
            if let Some(entry) = existing {
                entry.run_at = run_at;
                entry.payload = cmd.payload;
                entry.loader = cmd.loader;
                self.shared.cvar.notify_one();
                return true;
            }
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(QueueEntry {
            run_at,
            seq,
            loader: cmd.loader,
            merge_key: cmd.merge_key,
            payload: cmd.payload,
        });
        self.shared.cvar.notify_one();
        true
    }

    /// The number of commands waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().entries.len()
    }

    /// Stops the worker. Pending commands are discarded; an in-flight
    /// command completes before this returns.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.shutdown = true;
            queue.entries.clear();
        }
        self.shared.cvar.notify_one();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<ExecutorShared>) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if queue.shutdown {
                    return;
                }
                let now = Instant::now();
                let due_idx = {
                    let mut best: Option<(usize, Instant, u64)> = None;
                    for (idx, entry) in queue.entries.iter().enumerate() {
                        let candidate = (idx, entry.run_at, entry.seq);
                        let better = match best {
                            None => true,
                            Some((_, at, seq)) => {
                                (entry.run_at, entry.seq) < (at, seq)
                            }
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                    best
                };
                match due_idx {
                    None => {
                        queue = shared.cvar.wait(queue).unwrap();
                    }
                    Some((idx, run_at, _)) if run_at <= now => {
                        break queue.entries.remove(idx);
                    }
                    Some((_, run_at, _)) => {
                        let wait = run_at - now;
                        let (q, _timeout) =
                            shared.cvar.wait_timeout(queue, wait).unwrap();
                        queue = q;
                    }
                }
            }
        };

        match entry.loader {
            None => (entry.payload)(),
            Some(ref weak) => match weak.upgrade() {
                Some(loader) => with_context_loader(&loader, entry.payload),
                // reclaimed loader: the command is dropped silently
                None => debug!("dropping command for dead {}", weak.id()),
            },
        }
    }
}
