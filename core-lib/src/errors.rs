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

//! The engine's error taxonomy.
//!
//! Errors are contained to the lifecycle of a single class wherever
//! possible: a batch of N classes may see a mix of successes and
//! per-class failures.

use std::error::Error;
use std::fmt;

/// An error in the lifecycle of a single class, or in the engine itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SwapError {
    /// The class bytes could not be parsed.
    MalformedClass(String),
    /// No class is currently loaded under the requested name and loader.
    UnresolvedIdentity(String),
    /// The native redefine failed for a reason known to be retryable.
    RedefineTransient(String),
    /// The native redefine rejected the change.
    RedefinePermanent(String),
    /// A plugin callback failed.
    PluginError { plugin: String, detail: String },
    /// The operation arrived after the engine was shut down.
    Shutdown,
}

impl SwapError {
    /// A stable identifier for this error kind, as it appears on the wire.
    pub fn kind_str(&self) -> &'static str {
        use self::SwapError::*;
        match *self {
            MalformedClass(..) => "malformed_class",
            UnresolvedIdentity(..) => "unresolved_identity",
            RedefineTransient(..) => "redefine_transient",
            RedefinePermanent(..) => "redefine_permanent",
            PluginError { .. } => "plugin_error",
            Shutdown => "shutdown",
        }
    }

    /// `true` if the scheduler may retry the operation.
    pub fn is_transient(&self) -> bool {
        match *self {
            SwapError::RedefineTransient(..) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::SwapError::*;
        match self {
            MalformedClass(ref detail) => write!(f, "malformed class: {}", detail),
            UnresolvedIdentity(ref identity) => {
                write!(f, "no class loaded for {}", identity)
            }
            RedefineTransient(ref detail) => {
                write!(f, "transient redefine failure: {}", detail)
            }
            RedefinePermanent(ref detail) => {
                write!(f, "redefine rejected: {}", detail)
            }
            PluginError { ref plugin, ref detail } => {
                write!(f, "plugin '{}' failed: {}", plugin, detail)
            }
            Shutdown => write!(f, "engine is shut down"),
        }
    }
}

impl Error for SwapError {
    fn description(&self) -> &str {
        self.kind_str()
    }
}
