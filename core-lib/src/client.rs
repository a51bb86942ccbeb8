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

//! An interface to the attaching tool.

use molt_rpc::RpcPeer;

use crate::config::Table;
use crate::identity::ClassIdentity;
use crate::loaders::LoaderId;

/// The engine's view of the tool on the other end of the connection.
#[derive(Clone)]
pub struct Client(RpcPeer);

impl Client {
    pub fn new(peer: RpcPeer) -> Self {
        Client(peer)
    }

    /// One line of outcome per class; permanent failures carry the
    /// change kind that was rejected so the developer can decide to
    /// restart.
    pub fn redefine_status(&self, class: &ClassIdentity, status: &str,
                           error_kind: Option<&str>, detail: Option<&str>) {
        self.0.send_rpc_notification("redefine_status",
                                     &json!({
                                         "class": class.name.as_str(),
                                         "loader": class.loader_id().0,
                                         "status": status,
                                         "error_kind": error_kind,
                                         "detail": detail,
                                     }));
    }

    pub fn batch_complete(&self, redefined: usize, structural: usize,
                          failed: usize) {
        self.0.send_rpc_notification("batch_complete",
                                     &json!({
                                         "redefined": redefined,
                                         "structural": structural,
                                         "failed": failed,
                                     }));
    }

    pub fn plugin_activated(&self, plugin: &str, loader: LoaderId) {
        self.0.send_rpc_notification("plugin_activated",
                                     &json!({
                                         "plugin": plugin,
                                         "loader": loader.0,
                                     }));
    }

    /// Notify the client of the available plugins.
    pub fn available_plugins(&self, plugins: &[&str]) {
        self.0.send_rpc_notification("available_plugins",
                                     &json!({ "plugins": plugins }));
    }

    pub fn config_changed(&self, changes: &Table) {
        self.0.send_rpc_notification("config_changed",
                                     &json!({ "changes": changes }));
    }

    pub fn alert<S: AsRef<str>>(&self, msg: S) {
        self.0.send_rpc_notification("alert", &json!({ "msg": msg.as_ref() }));
    }

    pub fn schedule_idle(&self, token: usize) {
        self.0.schedule_idle(token)
    }
}
