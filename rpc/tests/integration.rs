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

#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
extern crate molt_rpc;

use std::io;
use std::time::Duration;

use serde_json::Value;

use molt_rpc::test_utils::{make_reader, test_channel};
use molt_rpc::{Handler, ReadError, RemoteError, RpcCtx, RpcLoop};

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "method", content = "params")]
enum TestNotification {
    Hello { name: String },
    ScheduleIdle { token: usize },
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "method", content = "params")]
enum TestRequest {
    Echo { words: String },
    Fail {},
}

/// Handler that echoes request params and records idle tokens.
struct EchoHandler {
    notifs: Vec<TestNotification>,
    idles: Vec<usize>,
}

impl EchoHandler {
    fn new() -> Self {
        EchoHandler { notifs: Vec::new(), idles: Vec::new() }
    }
}

impl Handler for EchoHandler {
    type Notification = TestNotification;
    type Request = TestRequest;

    fn handle_notification(&mut self, ctx: &RpcCtx, rpc: Self::Notification) {
        if let TestNotification::ScheduleIdle { token } = rpc {
            ctx.schedule_idle(token);
        }
        self.notifs.push(rpc);
    }

    fn handle_request(&mut self, _ctx: &RpcCtx, rpc: Self::Request)
                      -> Result<Value, RemoteError> {
        match rpc {
            TestRequest::Echo { words } => Ok(json!({ "words": words })),
            TestRequest::Fail {} => Err(RemoteError::custom(11, "nope", None)),
        }
    }

    fn idle(&mut self, _ctx: &RpcCtx, token: usize) {
        self.idles.push(token);
    }
}

#[test]
fn recv_notification() {
    let mut handler = EchoHandler::new();
    let mut looper = RpcLoop::new(io::sink());
    let reader = make_reader(r#"{"method":"hello","params":{"name":"constance"}}"#);
    assert!(looper.mainloop(|| reader, &mut handler).is_ok());
    assert_eq!(handler.notifs,
               vec![TestNotification::Hello { name: "constance".into() }]);
}

#[test]
fn recv_request() {
    let mut handler = EchoHandler::new();
    let (tx, mut rx) = test_channel();
    let mut looper = RpcLoop::new(tx);
    let reader = make_reader(r#"{"id":0,"method":"echo","params":{"words":"plz"}}"#);
    assert!(looper.mainloop(|| reader, &mut handler).is_ok());
    assert_eq!(rx.expect_response(), Ok(json!({"words": "plz"})));
}

#[test]
fn recv_error() {
    let mut handler = EchoHandler::new();
    let (tx, mut rx) = test_channel();
    let mut looper = RpcLoop::new(tx);
    let reader = make_reader(r#"{"id":0,"method":"fail","params":{}}"#);
    assert!(looper.mainloop(|| reader, &mut handler).is_ok());
    assert_eq!(rx.expect_response(),
               Err(RemoteError::custom(11, "nope", None)));
}

#[test]
fn unknown_method_gets_response() {
    let mut handler = EchoHandler::new();
    let (tx, mut rx) = test_channel();
    let mut looper = RpcLoop::new(tx);
    let reader = make_reader(r#"{"id":7,"method":"no_such_method","params":{}}"#);
    assert!(looper.mainloop(|| reader, &mut handler).is_ok());
    assert!(rx.expect_response().is_err());
}

#[test]
fn malformed_json_closes_loop() {
    let mut handler = EchoHandler::new();
    let mut looper = RpcLoop::new(io::sink());
    let reader = make_reader(r#"{method:"hello","params":{}}"#);
    match looper.mainloop(|| reader, &mut handler).err() {
        Some(ReadError::Json(_)) => (),
        other => panic!("expected json error, got {:?}", other),
    }
}

#[test]
fn idle_runs_after_messages() {
    let mut handler = EchoHandler::new();
    let mut looper = RpcLoop::new(io::sink());
    let reader = make_reader(
        r#"{"method":"schedule_idle","params":{"token":42}}
{"method":"hello","params":{"name":"later"}}"#,
    );
    assert!(looper.mainloop(|| reader, &mut handler).is_ok());
    assert_eq!(handler.idles, vec![42]);
    assert_eq!(handler.notifs.len(), 2);
}

#[test]
fn no_response_to_notification() {
    let mut handler = EchoHandler::new();
    let (tx, mut rx) = test_channel();
    let mut looper = RpcLoop::new(tx);
    let reader = make_reader(r#"{"method":"hello","params":{"name":"quiet"}}"#);
    assert!(looper.mainloop(|| reader, &mut handler).is_ok());
    rx.expect_nothing(Duration::from_millis(100));
}
