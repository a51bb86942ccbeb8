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

//! RPC handling for communications with the attaching tool.
//!
//! Class bytes travel hex-encoded inside JSON strings. A `push_class`
//! request is answered as soon as the request is validated and handed
//! to the scheduler; the eventual outcome arrives asynchronously as a
//! `redefine_status` notification.

use crate::config::Table;

// =============================================================================
//  Command types
// =============================================================================

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "method", content = "params")]
pub enum CoreNotification {
    /// Sent by the tool once, before anything else.
    ClientStarted {
        #[serde(default)]
        config_dir: Option<String>,
        /// Build-output directories to watch, in addition to any
        /// configured ones.
        #[serde(default)]
        watch_dirs: Option<Vec<String>>,
    },
    /// Opens a pushed batch; subsequent `push_class` requests are held
    /// until the commit marker.
    BatchBegin {},
    /// Commits the open batch as a single coalesced unit.
    BatchCommit {},
    /// Applies changes to the user config, as if written to molt.toml.
    ModifyUserConfig { changes: Table },
    Shutdown {},
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "method", content = "params")]
pub enum CoreRequest {
    /// Pushes new bytes for a loaded class. Responds with a status
    /// object: `ok` (accepted), `rejected` (malformed class), or
    /// `error` with an error kind.
    PushClass {
        class_name: String,
        /// The target loader id; the runtime's root loader if absent.
        #[serde(default)]
        loader: Option<usize>,
        /// Hex-encoded class bytes.
        bytes: String,
    },
    /// Computes the structural fingerprint of the given class bytes.
    DebugFingerprint { bytes: String },
    DebugAvailablePlugins {},
    /// Drives a class load through the pipeline into the embedded
    /// runtime; standalone mode only.
    DebugLoadClass {
        #[serde(default)]
        loader: Option<usize>,
        bytes: String,
        #[serde(default)]
        version: Option<String>,
    },
    /// Creates a loader in the embedded runtime; standalone mode only.
    DebugCreateLoader {
        name: String,
        #[serde(default)]
        parent: Option<usize>,
    },
    /// Reclaims an embedded-runtime loader; standalone mode only.
    DebugDropLoader { loader: usize },
}

// =============================================================================
//  Wire encoding of class bytes
// =============================================================================

/// Encodes bytes for transport inside a JSON string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Decodes a hex string produced by `bytes_to_hex`.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, String> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return Err("odd-length hex string".into());
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = hex_digit(pair[0])?;
        let lo = hex_digit(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_digit(c: u8) -> Result<u8, String> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(format!("bad hex digit '{}'", c as char)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_round_trip() {
        let json = r#"{"method":"client_started","params":{"watch_dirs":["build/classes"]}}"#;
        let parsed = ::serde_json::from_str::<CoreNotification>(json).unwrap();
        assert_eq!(parsed, CoreNotification::ClientStarted {
            config_dir: None,
            watch_dirs: Some(vec!["build/classes".into()]),
        });
    }

    #[test]
    fn push_class_parses() {
        let json = r#"{"id":1,"method":"push_class",
                       "params":{"class_name":"p.A","bytes":"cafebabe"}}"#;
        let parsed = ::serde_json::from_str::<CoreRequest>(json).unwrap();
        assert_eq!(parsed, CoreRequest::PushClass {
            class_name: "p.A".into(),
            loader: None,
            bytes: "cafebabe".into(),
        });
    }

    #[test]
    fn modify_user_config_parses_toml_table() {
        let json = r#"{"method":"modify_user_config",
                       "params":{"changes":{"debounce_min_ms":50}}}"#;
        match ::serde_json::from_str::<CoreNotification>(json).unwrap() {
            CoreNotification::ModifyUserConfig { changes } => {
                assert_eq!(changes.get("debounce_min_ms")
                               .and_then(|v| v.as_integer()),
                           Some(50));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn hex_round_trip() {
        let bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x10];
        let hex = bytes_to_hex(&bytes);
        assert_eq!(hex, "cafebabe0010");
        assert_eq!(hex_to_bytes(&hex).unwrap(), bytes);
        assert_eq!(hex_to_bytes("CAFEBABE").unwrap(), vec![0xCA, 0xFE, 0xBA, 0xBE]);
    }

    #[test]
    fn bad_hex_rejected() {
        assert!(hex_to_bytes("abc").is_err());
        assert!(hex_to_bytes("zz").is_err());
    }
}
