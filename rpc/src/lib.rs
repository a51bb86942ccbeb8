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

//! Generic RPC handling, used for communication with the attaching tool.
//!
//! The protocol is newline-delimited JSON-RPC: each message is a single
//! JSON object on one line. A `RpcLoop` reads messages from a stream on a
//! dedicated thread and dispatches them to a typed [`Handler`] on the
//! calling thread; a [`Peer`] is the handle used to send messages in the
//! other direction.
//!
//! In addition to message dispatch, the runloop maintains an _idle queue_:
//! components may schedule a token with [`Peer::schedule_idle`], and the
//! handler's `idle` method is invoked with that token whenever no messages
//! are pending. This is how filesystem events, debounce timers and other
//! out-of-band work are folded into the single dispatch thread.

extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
extern crate crossbeam_utils;

mod error;
mod parse;
pub mod test_utils;

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use crate::error::{Error, ReadError, RemoteError};
pub use crate::parse::{Call, MessageReader, RequestId, Response, RpcObject};

/// The callback invoked when an async RPC request receives a response.
pub trait Callback: Send {
    fn call(self: Box<Self>, result: Result<Value, Error>);
}

impl<F: Send + FnOnce(Result<Value, Error>)> Callback for F {
    fn call(self: Box<F>, result: Result<Value, Error>) {
        (*self)(result)
    }
}

/// A handle to the remote side of a peer connection.
///
/// This is defined as a trait (rather than exposing `RawPeer` directly)
/// so that peers can be boxed, stored, and mocked out in tests.
pub trait Peer: Send + Sync + 'static {
    fn box_clone(&self) -> Box<dyn Peer>;
    /// Sends a notification (no response expected) to the peer.
    fn send_rpc_notification(&self, method: &str, params: &Value);
    /// Sends a request asynchronously; `f` is invoked with the result
    /// on the thread that reads the peer's responses.
    fn send_rpc_request_async(&self, method: &str, params: &Value, f: Box<dyn Callback>);
    /// Sends a request and blocks until the response arrives.
    ///
    /// Must not be called from the runloop's dispatch thread.
    fn send_rpc_request(&self, method: &str, params: &Value) -> Result<Value, Error>;
    /// Returns `true` if an incoming message is waiting to be handled.
    fn request_is_pending(&self) -> bool;
    /// Schedules a call to the handler's `idle` method with `token`, to
    /// run when no messages are pending.
    fn schedule_idle(&self, token: usize);
    /// Asks the runloop to exit after the message currently being
    /// handled, without waiting for the peer to disconnect.
    fn schedule_exit(&self);
}

/// A boxed `Peer`, the form in which peers are passed around.
pub type RpcPeer = Box<dyn Peer>;

impl Clone for Box<dyn Peer> {
    fn clone(&self) -> Box<dyn Peer> {
        self.box_clone()
    }
}

/// Context passed to handler methods, granting access to the peer.
pub struct RpcCtx {
    peer: RpcPeer,
}

impl RpcCtx {
    pub fn get_peer(&self) -> &RpcPeer {
        &self.peer
    }

    pub fn schedule_idle(&self, token: usize) {
        self.peer.schedule_idle(token)
    }
}

/// The trait implemented by the embedding application to handle
/// incoming RPCs.
pub trait Handler {
    type Notification: DeserializeOwned;
    type Request: DeserializeOwned;
    fn handle_notification(&mut self, ctx: &RpcCtx, rpc: Self::Notification);
    fn handle_request(&mut self, ctx: &RpcCtx, rpc: Self::Request)
                      -> Result<Value, RemoteError>;
    #[allow(unused_variables)]
    fn idle(&mut self, ctx: &RpcCtx, token: usize) {}
}

enum ResponseHandler {
    Chan(mpsc::Sender<Result<Value, Error>>),
    Callback(Box<dyn Callback>),
}

impl ResponseHandler {
    fn invoke(self, result: Result<Value, Error>) {
        match self {
            ResponseHandler::Chan(tx) => {
                let _ = tx.send(result);
            }
            ResponseHandler::Callback(f) => f.call(result),
        }
    }
}

enum NextRead {
    Msg(Result<RpcObject, ReadError>),
    Idle(usize),
    Exit,
}

/// The concrete peer, writing messages to some `W`.
pub struct RawPeer<W: Write + 'static>(Arc<RpcState<W>>);

struct RpcState<W: Write> {
    rx_queue: Mutex<VecDeque<Result<RpcObject, ReadError>>>,
    rx_cvar: Condvar,
    writer: Mutex<W>,
    id: AtomicUsize,
    pending: Mutex<BTreeMap<usize, ResponseHandler>>,
    idle_queue: Mutex<VecDeque<usize>>,
    needs_exit: AtomicBool,
}

impl<W: Write + 'static> Clone for RawPeer<W> {
    fn clone(&self) -> Self {
        RawPeer(self.0.clone())
    }
}

impl<W: Write + Send + 'static> Peer for RawPeer<W> {
    fn box_clone(&self) -> Box<dyn Peer> {
        Box::new((*self).clone())
    }

    fn send_rpc_notification(&self, method: &str, params: &Value) {
        if let Err(e) = self.send(&json!({"method": method, "params": params})) {
            error!("send error on notification '{}': {}", method, e);
        }
    }

    fn send_rpc_request_async(&self, method: &str, params: &Value, f: Box<dyn Callback>) {
        self.send_request(method, params, ResponseHandler::Callback(f));
    }

    fn send_rpc_request(&self, method: &str, params: &Value) -> Result<Value, Error> {
        let (tx, rx) = mpsc::channel();
        self.send_request(method, params, ResponseHandler::Chan(tx));
        rx.recv().unwrap_or(Err(Error::PeerDisconnect))
    }

    fn request_is_pending(&self) -> bool {
        let queue = self.0.rx_queue.lock().unwrap();
        !queue.is_empty()
    }

    fn schedule_idle(&self, token: usize) {
        self.0.idle_queue.lock().unwrap().push_back(token);
        self.0.rx_cvar.notify_one();
    }

    fn schedule_exit(&self) {
        self.0.needs_exit.store(true, Ordering::Relaxed);
        self.0.rx_cvar.notify_one();
    }
}

impl<W: Write> RawPeer<W> {
    fn send(&self, v: &Value) -> Result<(), io::Error> {
        let mut s = serde_json::to_string(v)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        s.push('\n');
        let mut writer = self.0.writer.lock().unwrap();
        writer.write_all(s.as_bytes())
    }

    fn send_request(&self, method: &str, params: &Value, rh: ResponseHandler) {
        let id = self.0.id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.0.pending.lock().unwrap();
            pending.insert(id, rh);
        }
        if let Err(e) = self.send(&json!({"id": id, "method": method, "params": params})) {
            error!("send error on request '{}': {}", method, e);
            let mut pending = self.0.pending.lock().unwrap();
            if let Some(rh) = pending.remove(&id) {
                rh.invoke(Err(Error::Io(e)));
            }
        }
    }

    fn respond(&self, result: Response, id: RequestId) {
        let v = match result {
            Ok(result) => json!({"id": id, "result": result}),
            Err(err) => json!({"id": id, "error": err}),
        };
        if let Err(e) = self.send(&v) {
            error!("error {} sending response to RPC {}", e, id);
        }
    }

    fn handle_response(&self, id: u64, resp: Result<Response, String>) {
        let handler = {
            let mut pending = self.0.pending.lock().unwrap();
            pending.remove(&(id as usize))
        };
        match (handler, resp) {
            (Some(rh), Ok(resp)) => rh.invoke(resp.map_err(Error::RemoteError)),
            (Some(rh), Err(msg)) => {
                warn!("error handling response {}: {}", id, msg);
                rh.invoke(Err(Error::InvalidResponse));
            }
            (None, _) => warn!("id {} not found in pending requests", id),
        }
    }

    fn put_rx(&self, json: Result<RpcObject, ReadError>) {
        let mut queue = self.0.rx_queue.lock().unwrap();
        queue.push_back(json);
        self.0.rx_cvar.notify_one();
    }

    /// Blocks until a message, an idle token, or the exit flag is
    /// available. Messages take priority over idle work, except that
    /// pending idle work runs before a clean disconnect is delivered.
    fn next_read(&self) -> NextRead {
        let mut queue = self.0.rx_queue.lock().unwrap();
        loop {
            if self.0.needs_exit.load(Ordering::Relaxed) {
                return NextRead::Exit;
            }
            let disconnect_next = match queue.front() {
                Some(&Err(ReadError::Disconnect)) => true,
                _ => false,
            };
            if !disconnect_next {
                if let Some(msg) = queue.pop_front() {
                    return NextRead::Msg(msg);
                }
            }
            if let Some(token) = self.0.idle_queue.lock().unwrap().pop_front() {
                return NextRead::Idle(token);
            }
            if disconnect_next {
                return NextRead::Msg(queue.pop_front().unwrap());
            }
            queue = self.0.rx_cvar.wait(queue).unwrap();
        }
    }

    fn reset_needs_exit(&self) {
        self.0.needs_exit.store(false, Ordering::Relaxed);
    }
}

/// A runloop, tying together a reader, a writer, and a handler.
pub struct RpcLoop<W: Write + 'static> {
    peer: RawPeer<W>,
}

impl<W: Write + Send + 'static> RpcLoop<W> {
    /// Creates a new runloop which writes to `writer`.
    pub fn new(writer: W) -> Self {
        let rpc_peer = RawPeer(Arc::new(RpcState {
            rx_queue: Mutex::new(VecDeque::new()),
            rx_cvar: Condvar::new(),
            writer: Mutex::new(writer),
            id: AtomicUsize::new(0),
            pending: Mutex::new(BTreeMap::new()),
            idle_queue: Mutex::new(VecDeque::new()),
            needs_exit: AtomicBool::new(false),
        }));
        RpcLoop { peer: rpc_peer }
    }

    /// Returns a clone of the concrete peer.
    pub fn get_raw_peer(&self) -> RawPeer<W> {
        self.peer.clone()
    }

    /// Returns a boxed clone of the peer.
    pub fn get_peer(&self) -> RpcPeer {
        Box::new(self.peer.clone())
    }

    /// Starts the runloop, reading messages produced by `rf` and
    /// dispatching them to `handler` until the stream closes, the
    /// handler schedules an exit, or a read error occurs.
    ///
    /// Reading happens on a dedicated thread; parsing and dispatch
    /// happen on the calling thread, so the handler sees messages
    /// strictly in arrival order. A closed stream is a normal exit.
    pub fn mainloop<R, RF, H>(&mut self, rf: RF, handler: &mut H) -> Result<(), ReadError>
        where R: BufRead,
              RF: Send + FnOnce() -> R,
              H: Handler,
    {
        self.peer.reset_needs_exit();
        let read_peer = self.get_raw_peer();
        let dispatch_peer = self.get_raw_peer();
        let ctx = RpcCtx { peer: Box::new(self.get_raw_peer()) };

        let scope_result = crossbeam_utils::thread::scope(|scope| {
            scope.spawn(move |_| {
                let mut stream = rf();
                let mut reader = MessageReader::default();
                loop {
                    let json = reader.next(&mut stream);
                    match json {
                        Ok(obj) => {
                            if obj.is_response() {
                                let id = obj.get_id().unwrap_or(0);
                                read_peer.handle_response(id, obj.into_response());
                            } else {
                                read_peer.put_rx(Ok(obj));
                            }
                        }
                        Err(err) => {
                            read_peer.put_rx(Err(err));
                            break;
                        }
                    }
                }
            });

            loop {
                match dispatch_peer.next_read() {
                    NextRead::Exit => break Ok(()),
                    NextRead::Idle(token) => handler.idle(&ctx, token),
                    NextRead::Msg(Ok(obj)) => {
                        match obj.into_rpc::<H::Notification, H::Request>() {
                            Call::Request(id, request) => {
                                let result = handler.handle_request(&ctx, request);
                                dispatch_peer.respond(result, id);
                            }
                            Call::Notification(notif) => {
                                handler.handle_notification(&ctx, notif)
                            }
                            Call::InvalidRequest(Some(id), err) => {
                                dispatch_peer.respond(Err(err), id)
                            }
                            Call::InvalidRequest(None, err) => {
                                warn!("dropping malformed notification: {:?}", err)
                            }
                        }
                    }
                    NextRead::Msg(Err(ReadError::Disconnect)) => break Ok(()),
                    NextRead::Msg(Err(err)) => break Err(err),
                }
            }
        });

        match scope_result {
            Ok(result) => result,
            Err(_) => Err(ReadError::Disconnect),
        }
    }
}
