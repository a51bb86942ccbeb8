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

//! The redefinition scheduler.
//!
//! A single worker thread owns all redefinition state. Producers post
//! requests over a channel; the worker coalesces them by class identity
//! (last bytes win), waits out a debounce window, and then processes
//! the accumulated batch: diff against the currently-loaded form,
//! partition into redefinable and structural changes, dependency-sort,
//! drive the native redefine primitive (with bounded retry on transient
//! failure), and fire `ClassRedefined` events in dependency order.
//!
//! No two batches are ever in flight at once, and synchronous event
//! handlers observe the runtime already redefined.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::classfile::{read_form, ClassForm};
use crate::client::Client;
use crate::diff::{diff, StructuralDiff};
use crate::errors::SwapError;
use crate::events::{Event, EventBus};
use crate::fingerprint::digest_bytes;
use crate::identity::{ClassIdentity, ClassName, RedefinitionRequest};
use crate::loaders::LoaderId;
use crate::runtime::{RedefineError, RuntimeCapabilities};

/// Timing and retry parameters, distilled from the engine config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The inactivity window that closes a batch.
    pub debounce_min: Duration,
    /// The hard ceiling from the first pending request, regardless of
    /// continued activity.
    pub debounce_max: Duration,
    pub retry_count: u32,
    /// Initial transient-failure backoff; doubled on each retry.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            debounce_min: Duration::from_millis(300),
            debounce_max: Duration::from_millis(1500),
            retry_count: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

enum SchedulerMsg {
    Submit(RedefinitionRequest),
    /// A pushed batch, treated as one coalesced unit and processed
    /// immediately.
    SubmitBatch(Vec<RedefinitionRequest>),
    /// Forces the pending batch out now. The ack fires once the batch
    /// (and its events) completed.
    Flush(Option<mpsc::Sender<()>>),
    Shutdown(mpsc::Sender<()>),
}

/// The public handle. All mutation happens on the worker thread.
pub struct Scheduler {
    tx: Mutex<Option<mpsc::Sender<SchedulerMsg>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, runtime: RuntimeCapabilities,
               bus: Arc<EventBus>, client: Client) -> Scheduler {
        let (tx, rx) = mpsc::channel();
        let worker_state = SchedulerWorker { cfg, runtime, bus, client };
        let worker = thread::Builder::new()
            .name("molt-scheduler".to_owned())
            .spawn(move || worker_state.run(rx))
            .expect("scheduler worker should spawn");
        Scheduler { tx: Mutex::new(Some(tx)), worker: Mutex::new(Some(worker)) }
    }

    /// Submits one request; it will be coalesced by identity.
    pub fn submit(&self, request: RedefinitionRequest) -> Result<(), SwapError> {
        self.send(SchedulerMsg::Submit(request))
    }

    /// Submits a pushed batch, processed as a single unit.
    pub fn submit_batch(&self, requests: Vec<RedefinitionRequest>)
                        -> Result<(), SwapError> {
        self.send(SchedulerMsg::SubmitBatch(requests))
    }

    /// Forces the pending batch out and waits for it to complete.
    pub fn flush_sync(&self) -> Result<(), SwapError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(SchedulerMsg::Flush(Some(ack_tx)))?;
        ack_rx.recv().map_err(|_| SwapError::Shutdown)
    }

    /// Drains pending work and stops the worker.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let (ack_tx, ack_rx) = mpsc::channel();
            if tx.send(SchedulerMsg::Shutdown(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn send(&self, msg: SchedulerMsg) -> Result<(), SwapError> {
        let tx = self.tx.lock().unwrap();
        match *tx {
            Some(ref tx) => tx.send(msg).map_err(|_| SwapError::Shutdown),
            None => Err(SwapError::Shutdown),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BatchItem {
    identity: ClassIdentity,
    bytes: Vec<u8>,
    old_form: Arc<ClassForm>,
    new_form: Arc<ClassForm>,
    diff: Arc<StructuralDiff>,
    structural: bool,
}

struct SchedulerWorker {
    cfg: SchedulerConfig,
    runtime: RuntimeCapabilities,
    bus: Arc<EventBus>,
    client: Client,
}

type PendingMap = HashMap<(ClassName, LoaderId), RedefinitionRequest>;

impl SchedulerWorker {
    fn run(self, rx: mpsc::Receiver<SchedulerMsg>) {
        let mut pending: PendingMap = HashMap::new();
        let mut first_at: Option<Instant> = None;
        let mut last_at = Instant::now();

        loop {
            let msg = if pending.is_empty() {
                match rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                }
            } else {
                let now = Instant::now();
                let deadline = {
                    let min_deadline = last_at + self.cfg.debounce_min;
                    let max_deadline = first_at.unwrap_or(now) + self.cfg.debounce_max;
                    if min_deadline < max_deadline { min_deadline } else { max_deadline }
                };
                if now >= deadline {
                    self.process_batch(drain(&mut pending));
                    first_at = None;
                    continue;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        self.process_batch(drain(&mut pending));
                        break;
                    }
                }
            };

            match msg {
                // a deadline elapsed; handled at the top of the loop
                None => continue,
                Some(SchedulerMsg::Submit(request)) => {
                    let now = Instant::now();
                    if first_at.is_none() {
                        first_at = Some(now);
                    }
                    last_at = now;
                    pending.insert(request.identity.key(), request);
                }
                Some(SchedulerMsg::SubmitBatch(requests)) => {
                    for request in requests {
                        pending.insert(request.identity.key(), request);
                    }
                    self.process_batch(drain(&mut pending));
                    first_at = None;
                }
                Some(SchedulerMsg::Flush(ack)) => {
                    if !pending.is_empty() {
                        self.process_batch(drain(&mut pending));
                        first_at = None;
                    }
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                Some(SchedulerMsg::Shutdown(ack)) => {
                    if !pending.is_empty() {
                        self.process_batch(drain(&mut pending));
                    }
                    let _ = ack.send(());
                    break;
                }
            }
        }
    }

    fn process_batch(&self, requests: Vec<RedefinitionRequest>) {
        if requests.is_empty() {
            return;
        }
        trace!("processing batch of {}", requests.len());

        let mut items = Vec::new();
        let mut failed = 0;

        for request in requests {
            match self.prepare(&request) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {
                    // byte-identical with the loaded class; short-circuit
                    self.client.redefine_status(&request.identity, "ok", None,
                                                Some("unchanged"));
                }
                Err(err) => {
                    failed += 1;
                    warn!("dropping request for {}: {}", request.identity, err);
                    self.client.redefine_status(&request.identity, "error",
                                                Some(err.kind_str()),
                                                Some(&err.to_string()));
                }
            }
        }

        let items = dependency_sort(items);

        let redefine_batch = items.iter()
            .filter(|item| !item.structural)
            .map(|item| (item.identity.clone(), item.bytes.clone()))
            .collect::<Vec<_>>();

        let redefine_result = if redefine_batch.is_empty() {
            Ok(())
        } else {
            self.redefine_with_retry(&redefine_batch)
        };

        let mut redefined = 0;
        let mut structural = 0;
        for item in &items {
            if item.structural {
                structural += 1;
                self.client.redefine_status(&item.identity, "structural", None,
                                            Some(&item.diff.summary()));
            } else {
                match redefine_result {
                    Ok(()) => {
                        redefined += 1;
                        self.client.redefine_status(&item.identity, "ok", None, None);
                    }
                    Err(ref err) => {
                        failed += 1;
                        let err = SwapError::from(err.clone());
                        self.client.redefine_status(
                            &item.identity, "error", Some(err.kind_str()),
                            Some(&format!("{}; {}", err, item.diff.summary())));
                    }
                }
            }
            // plugins are notified regardless of the native outcome, so
            // they can compensate
            self.bus.dispatch(&Event::ClassRedefined {
                identity: item.identity.clone(),
                old_form: item.old_form.clone(),
                new_form: item.new_form.clone(),
                diff: item.diff.clone(),
                structural: item.structural,
            });
        }

        self.client.batch_complete(redefined, structural, failed);
    }

    /// Reads both forms and computes the diff. `Ok(None)` means the new
    /// bytes are identical to the loaded ones.
    fn prepare(&self, request: &RedefinitionRequest)
               -> Result<Option<BatchItem>, SwapError> {
        if !request.identity.is_live() {
            return Err(SwapError::UnresolvedIdentity(request.identity.to_string()));
        }
        let new_form = read_form(&request.bytes)?;
        let current = self.runtime.reader.loaded_class(&request.identity)
            .ok_or_else(|| {
                SwapError::UnresolvedIdentity(request.identity.to_string())
            })?;
        if digest_bytes(&current.bytes) == digest_bytes(&request.bytes) {
            return Ok(None);
        }
        let old_form = read_form(&current.bytes)?;
        let class_diff = diff(&old_form, &new_form);
        let structural = class_diff.is_structural();
        Ok(Some(BatchItem {
            identity: request.identity.clone(),
            bytes: request.bytes.clone(),
            old_form: Arc::new(old_form),
            new_form: Arc::new(new_form),
            diff: Arc::new(class_diff),
            structural,
        }))
    }

    /// One native call for the whole redefinable set, retried with
    /// exponential backoff on transient failure. The sleep blocks the
    /// scheduler thread, which keeps batches atomic.
    fn redefine_with_retry(&self, batch: &[(ClassIdentity, Vec<u8>)])
                           -> Result<(), RedefineError> {
        let mut attempt = 0;
        loop {
            match self.runtime.redefiner.redefine(batch) {
                Ok(()) => return Ok(()),
                Err(RedefineError::Transient(detail)) => {
                    if attempt >= self.cfg.retry_count {
                        return Err(RedefineError::Transient(detail));
                    }
                    let shift = if attempt > 16 { 16 } else { attempt };
                    let backoff = self.cfg.retry_backoff * (1u32 << shift);
                    debug!("transient redefine failure ({}), retrying in {:?}",
                           detail, backoff);
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn drain(pending: &mut PendingMap) -> Vec<RedefinitionRequest> {
    pending.drain().map(|(_, request)| request).collect()
}

/// `true` if `item` must come after `other`: its superclass or its
/// enclosing class is also in the batch, in the same loader.
fn depends_on(item: &BatchItem, other: &BatchItem) -> bool {
    if item.identity.loader_id() != other.identity.loader_id() {
        return false;
    }
    if item.new_form.super_name.as_ref() == Some(&other.identity.name) {
        return true;
    }
    item.identity.name.enclosing_class().as_ref() == Some(&other.identity.name)
}

/// Orders a batch so superclasses precede subclasses and enclosing
/// classes precede their inner classes.
fn dependency_sort(items: Vec<BatchItem>) -> Vec<BatchItem> {
    let mut remaining = items;
    let mut sorted = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let next = remaining.iter().position(|item| {
            !remaining.iter().any(|other| {
                other.identity != item.identity && depends_on(item, other)
            })
        });
        // a dependency cycle degrades to submission order
        let idx = next.unwrap_or(0);
        sorted.push(remaining.remove(idx));
    }
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use molt_rpc::test_utils::DummyPeer;

    use crate::events::{EventKind, HandlerRegistration};
    use crate::executor::CommandExecutor;
    use crate::identity::RequestSource;
    use crate::runtime::{EmbeddedRuntime, ReflectiveReader};
    use crate::test_helpers::ClassFileBuilder;

    struct Fixture {
        runtime: Arc<EmbeddedRuntime>,
        bus: Arc<EventBus>,
        scheduler: Scheduler,
        events: Arc<Mutex<Vec<(String, bool)>>>,
    }

    fn fixture(cfg: SchedulerConfig) -> Fixture {
        let runtime = EmbeddedRuntime::new();
        let executor = Arc::new(CommandExecutor::new());
        let bus = Arc::new(EventBus::new(executor));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.register(None, HandlerRegistration {
            name: "recorder".into(),
            plugin: "test".into(),
            kind: EventKind::ClassRedefined,
            predicate: None,
            deferred: false,
            delay: Duration::from_millis(0),
            callback: Arc::new(move |event| {
                if let Event::ClassRedefined { ref identity, structural, .. } = *event {
                    sink.lock().unwrap()
                        .push((identity.name.as_str().to_owned(), structural));
                }
                Ok(())
            }),
        });
        let client = Client::new(Box::new(DummyPeer));
        let scheduler = Scheduler::new(cfg, runtime.capabilities(), bus.clone(),
                                       client);
        Fixture { runtime, bus, scheduler, events }
    }

    fn quick_config() -> SchedulerConfig {
        SchedulerConfig {
            debounce_min: Duration::from_millis(40),
            debounce_max: Duration::from_millis(400),
            retry_count: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }

    fn submit(fx: &Fixture, identity: &ClassIdentity, bytes: Vec<u8>) {
        fx.scheduler
            .submit(RedefinitionRequest::new(identity.clone(), bytes,
                                             RequestSource::Push))
            .unwrap();
    }

    #[test]
    fn body_only_hot_swap() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let v1 = ClassFileBuilder::new("p.A").method("f", "()I").body(&[1]).build();
        let v2 = ClassFileBuilder::new("p.A").method("f", "()I").body(&[2]).build();
        let identity = fx.runtime.install_class(&loader, v1, None).unwrap();

        submit(&fx, &identity, v2.clone());
        fx.scheduler.flush_sync().unwrap();

        assert_eq!(fx.runtime.redefine_count(), 1);
        assert_eq!(fx.runtime.loaded_class(&identity).unwrap().bytes, v2);
        let events = fx.events.lock().unwrap();
        assert_eq!(*events, vec![("p.A".to_owned(), false)]);
    }

    #[test]
    fn burst_coalesces_to_last_bytes() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let v1 = ClassFileBuilder::new("p.B").method("f", "()I").body(&[1]).build();
        let identity = fx.runtime.install_class(&loader, v1, None).unwrap();

        for marker in 2..5 {
            let v = ClassFileBuilder::new("p.B")
                .method("f", "()I")
                .body(&[marker])
                .build();
            submit(&fx, &identity, v);
        }
        thread::sleep(Duration::from_millis(250));

        assert_eq!(fx.runtime.redefine_count(), 1);
        let expected = ClassFileBuilder::new("p.B")
            .method("f", "()I")
            .body(&[4])
            .build();
        assert_eq!(fx.runtime.loaded_class(&identity).unwrap().bytes, expected);
        assert_eq!(fx.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn structural_change_skips_native_redefine() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let v1 = ClassFileBuilder::new("p.C").method("f", "()I").build();
        let v2 = ClassFileBuilder::new("p.C")
            .method("f", "()I")
            .field("x", "I")
            .build();
        let identity = fx.runtime.install_class(&loader, v1.clone(), None).unwrap();

        submit(&fx, &identity, v2);
        fx.scheduler.flush_sync().unwrap();

        assert_eq!(fx.runtime.redefine_count(), 0);
        assert_eq!(fx.runtime.loaded_class(&identity).unwrap().bytes, v1);
        let events = fx.events.lock().unwrap();
        assert_eq!(*events, vec![("p.C".to_owned(), true)]);
    }

    #[test]
    fn transient_failure_retried_once_event() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let v1 = ClassFileBuilder::new("p.D").method("f", "()I").body(&[1]).build();
        let v2 = ClassFileBuilder::new("p.D").method("f", "()I").body(&[2]).build();
        let identity = fx.runtime.install_class(&loader, v1, None).unwrap();

        fx.runtime.fail_next_transient(1);
        submit(&fx, &identity, v2.clone());
        fx.scheduler.flush_sync().unwrap();

        assert_eq!(fx.runtime.redefine_count(), 1);
        assert_eq!(fx.runtime.loaded_class(&identity).unwrap().bytes, v2);
        assert_eq!(fx.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn exhausted_retries_still_notifies_plugins() {
        let mut cfg = quick_config();
        cfg.retry_count = 1;
        let fx = fixture(cfg);
        let loader = fx.runtime.create_loader("app", None);
        let v1 = ClassFileBuilder::new("p.E").method("f", "()I").body(&[1]).build();
        let v2 = ClassFileBuilder::new("p.E").method("f", "()I").body(&[2]).build();
        let identity = fx.runtime.install_class(&loader, v1.clone(), None).unwrap();

        fx.runtime.fail_next_transient(5);
        submit(&fx, &identity, v2);
        fx.scheduler.flush_sync().unwrap();

        // the native call never succeeded
        assert_eq!(fx.runtime.redefine_count(), 0);
        assert_eq!(fx.runtime.loaded_class(&identity).unwrap().bytes, v1);
        // but the plugin event still fired, exactly once
        assert_eq!(fx.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn identical_bytes_short_circuit() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let v1 = ClassFileBuilder::new("p.F").method("f", "()I").body(&[1]).build();
        let identity = fx.runtime.install_class(&loader, v1.clone(), None).unwrap();

        submit(&fx, &identity, v1);
        fx.scheduler.flush_sync().unwrap();

        assert_eq!(fx.runtime.redefine_count(), 0);
        assert!(fx.events.lock().unwrap().is_empty());
    }

    #[test]
    fn superclass_ordered_before_subclass() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let base_v1 = ClassFileBuilder::new("p.Base")
            .method("f", "()I").body(&[1]).build();
        let sub_v1 = ClassFileBuilder::new("p.Sub")
            .super_class("p.Base")
            .method("g", "()I").body(&[1]).build();
        let base_id = fx.runtime.install_class(&loader, base_v1, None).unwrap();
        let sub_id = fx.runtime.install_class(&loader, sub_v1, None).unwrap();

        let sub_v2 = ClassFileBuilder::new("p.Sub")
            .super_class("p.Base")
            .method("g", "()I").body(&[2]).build();
        let base_v2 = ClassFileBuilder::new("p.Base")
            .method("f", "()I").body(&[2]).build();

        // subclass submitted first; the batch must still order the
        // superclass ahead of it
        submit(&fx, &sub_id, sub_v2);
        submit(&fx, &base_id, base_v2);
        fx.scheduler.flush_sync().unwrap();

        let events = fx.events.lock().unwrap();
        let names = events.iter().map(|&(ref n, _)| n.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["p.Base", "p.Sub"]);
    }

    #[test]
    fn enclosing_class_ordered_before_inner() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let outer_v1 = ClassFileBuilder::new("p.Out")
            .method("f", "()I").body(&[1]).build();
        let inner_v1 = ClassFileBuilder::new("p.Out$In")
            .method("g", "()I").body(&[1]).build();
        let outer_id = fx.runtime.install_class(&loader, outer_v1, None).unwrap();
        let inner_id = fx.runtime.install_class(&loader, inner_v1, None).unwrap();

        let inner_v2 = ClassFileBuilder::new("p.Out$In")
            .method("g", "()I").body(&[2]).build();
        let outer_v2 = ClassFileBuilder::new("p.Out")
            .method("f", "()I").body(&[2]).build();

        submit(&fx, &inner_id, inner_v2);
        submit(&fx, &outer_id, outer_v2);
        fx.scheduler.flush_sync().unwrap();

        let events = fx.events.lock().unwrap();
        let names = events.iter().map(|&(ref n, _)| n.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["p.Out", "p.Out$In"]);
    }

    #[test]
    fn malformed_bytes_do_not_poison_batch() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let good_v1 = ClassFileBuilder::new("p.Good")
            .method("f", "()I").body(&[1]).build();
        let good_v2 = ClassFileBuilder::new("p.Good")
            .method("f", "()I").body(&[2]).build();
        let good_id = fx.runtime.install_class(&loader, good_v1, None).unwrap();
        let bad_id = ClassIdentity::new("p.Bad".into(), &loader);

        submit(&fx, &bad_id, b"junk".to_vec());
        submit(&fx, &good_id, good_v2.clone());
        fx.scheduler.flush_sync().unwrap();

        assert_eq!(fx.runtime.loaded_class(&good_id).unwrap().bytes, good_v2);
        assert_eq!(fx.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn unresolved_identity_not_retried() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let ghost = ClassIdentity::new("p.Ghost".into(), &loader);
        let bytes = ClassFileBuilder::new("p.Ghost").build();

        submit(&fx, &ghost, bytes);
        fx.scheduler.flush_sync().unwrap();

        assert_eq!(fx.runtime.redefine_count(), 0);
        assert!(fx.events.lock().unwrap().is_empty());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let identity = ClassIdentity::new("p.Late".into(), &loader);
        fx.scheduler.shutdown();
        let bytes = ClassFileBuilder::new("p.Late").build();
        match fx.scheduler.submit(RedefinitionRequest::new(identity, bytes,
                                                           RequestSource::Push)) {
            Err(SwapError::Shutdown) => (),
            other => panic!("expected Shutdown, got {:?}", other),
        }
    }

    #[test]
    fn counting_handler_sees_no_overlap() {
        // no two ClassRedefined events for one identity are concurrent:
        // dispatch happens on the single scheduler thread
        let fx = fixture(quick_config());
        let loader = fx.runtime.create_loader("app", None);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let in_flight2 = in_flight.clone();
        let overlap2 = overlap.clone();
        fx.bus.register(None, HandlerRegistration {
            name: "overlap".into(),
            plugin: "test".into(),
            kind: EventKind::ClassRedefined,
            predicate: None,
            deferred: false,
            delay: Duration::from_millis(0),
            callback: Arc::new(move |_| {
                if in_flight2.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap2.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(5));
                in_flight2.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }),
        });

        let v1 = ClassFileBuilder::new("p.H").method("f", "()I").body(&[1]).build();
        let identity = fx.runtime.install_class(&loader, v1, None).unwrap();
        for marker in 2..6 {
            let v = ClassFileBuilder::new("p.H")
                .method("f", "()I").body(&[marker]).build();
            submit(&fx, &identity, v);
            fx.scheduler.flush_sync().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
