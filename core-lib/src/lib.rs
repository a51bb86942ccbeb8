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

//! The main library for molt, a runtime hot-swap engine.
//!
//! While a target application runs, molt accepts modified class
//! artifacts (from a filesystem watcher over build output, or pushed
//! over RPC), coalesces them, computes structural diffs against the
//! classes currently loaded, drives the runtime's native redefine
//! primitive, and notifies framework-reload plugins so that the next
//! invocation observes the new code without a restart.

extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate regex;
extern crate sha2;
extern crate toml;
#[cfg(feature = "notify")]
extern crate notify;

extern crate molt_rpc;

pub mod bytecode;
pub mod classfile;
pub mod client;
pub mod config;
pub mod core;
pub mod diff;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fingerprint;
pub mod identity;
pub mod loaders;
pub mod plugins;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod transform;
#[cfg(feature = "notify")]
pub mod watcher;

#[doc(hidden)]
pub mod test_helpers;

pub use crate::classfile::{read_form, ClassForm, MemberInfo, MemberKey};
pub use crate::core::{CoreState, MoltCore, WeakMoltCore};
pub use crate::diff::{diff, StructuralDiff};
pub use crate::errors::SwapError;
pub use crate::fingerprint::{fingerprint, Fingerprint, FingerprintPolicy,
                             SignatureElement};
pub use crate::identity::{ClassIdentity, ClassName, RedefinitionRequest,
                          RequestSource};
pub use crate::loaders::{LoaderHandle, LoaderId, LoaderRegistry, WeakLoader};
pub use crate::rpc::{CoreNotification, CoreRequest};

/// The peer type connected to the attaching tool.
pub type MainPeer = molt_rpc::RpcPeer;
