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

//! Reading and parsing of raw JSON messages into RPC objects.

use std::io::BufRead;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ReadError, RemoteError};

/// A unique identifier attached to request RPCs.
pub type RequestId = u64;

/// The result of a request RPC, as it goes over the wire.
pub type Response = Result<Value, RemoteError>;

/// Reads new-line delimited JSON messages from a stream, reusing an
/// internal buffer between reads.
#[derive(Debug, Default)]
pub struct MessageReader(String);

impl MessageReader {
    /// Attempts to read the next message from the stream.
    ///
    /// Returns `ReadError::Disconnect` when the stream is closed.
    pub fn next<R: BufRead>(&mut self, reader: &mut R) -> Result<RpcObject, ReadError> {
        self.0.clear();
        let _ = reader.read_line(&mut self.0)?;
        if self.0.is_empty() {
            Err(ReadError::Disconnect)
        } else {
            self.parse(&self.0)
        }
    }

    /// Attempts to parse a &str as an RPC object.
    ///
    /// This should not be called directly unless you are writing tests.
    #[doc(hidden)]
    pub fn parse(&self, s: &str) -> Result<RpcObject, ReadError> {
        let val = serde_json::from_str::<Value>(s)?;
        if !val.is_object() {
            Err(ReadError::NotObject)
        } else {
            Ok(RpcObject(val))
        }
    }
}

/// A parsed JSON object, known to be one of the three message shapes:
/// a request, a notification, or a response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcObject(pub Value);

/// An RPC call that expects to be dispatched to a handler: either a
/// request (with an id, expecting a response) or a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Call<N, R> {
    /// An id and an RPC Request
    Request(RequestId, R),
    /// An RPC Notification
    Notification(N),
    /// A malformed request: the client should receive an error response
    /// if an id is present.
    InvalidRequest(Option<RequestId>, RemoteError),
}

impl RpcObject {
    /// Returns the 'id' of the underlying object, if present.
    pub fn get_id(&self) -> Option<u64> {
        self.0.get("id").and_then(Value::as_u64)
    }

    /// Returns the 'method' field of the underlying object, if present.
    pub fn get_method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    /// Returns `true` if this object looks like a response; that is,
    /// if it has an 'id' field and does _not_ have a 'method' field.
    pub fn is_response(&self) -> bool {
        self.0.get("id").is_some() && self.0.get("method").is_none()
    }

    /// Converts the underlying value into a response object.
    ///
    /// The caller is responsible for verifying that the object is a
    /// response before calling this method.
    pub fn into_response(mut self) -> Result<Response, String> {
        self.get_id().ok_or_else(|| "Response requires 'id' field.".to_string())?;
        let obj = match self.0.as_object_mut() {
            Some(obj) => obj,
            None => return Err("Response must be a JSON object.".into()),
        };
        let result = obj.remove("result");
        let error = obj.remove("error");
        match (result, error) {
            (Some(result), None) => Ok(Ok(result)),
            (None, Some(error)) => match serde_json::from_value::<RemoteError>(error) {
                Ok(err) => Ok(Err(err)),
                Err(err) => Err(format!("Error handling response: {:?}", err)),
            },
            _ => Err("Response must contain exactly one of 'result' or 'error'.".into()),
        }
    }

    /// Converts the underlying value into a typed RPC call.
    pub fn into_rpc<N, R>(self) -> Call<N, R>
        where N: DeserializeOwned,
              R: DeserializeOwned,
    {
        let id = self.get_id();
        let has_method = self.get_method().is_some();
        match (has_method, id) {
            (true, Some(id)) => match serde_json::from_value::<R>(self.0) {
                Ok(request) => Call::Request(id, request),
                Err(err) => {
                    let err = RemoteError::InvalidRequest(Some(json!(err.to_string())));
                    Call::InvalidRequest(Some(id), err)
                }
            },
            (true, None) => match serde_json::from_value::<N>(self.0) {
                Ok(notif) => Call::Notification(notif),
                Err(err) => {
                    let err = RemoteError::InvalidRequest(Some(json!(err.to_string())));
                    Call::InvalidRequest(None, err)
                }
            },
            (false, id) => {
                let err = RemoteError::InvalidRequest(Some(json!("missing 'method' field")));
                Call::InvalidRequest(id, err)
            }
        }
    }
}
