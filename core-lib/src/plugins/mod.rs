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

//! Plugins and related functionality.
//!
//! A plugin is a framework-specific reload strategy. It is described
//! declaratively by a [`PluginDescription`] (name, probe classes,
//! version expression) and implemented behind the [`ReloadPlugin`]
//! trait, which contributes transformers and event handlers. Plugins
//! are enumerated once at startup; per-loader activation and lifecycle
//! live in [`manager`].

mod catalog;
mod manager;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{Event, EventKind, HandlerRegistration};
use crate::identity::ClassName;
use crate::loaders::LoaderHandle;
use crate::transform::TransformerDescriptor;

pub use self::catalog::PluginCatalog;
pub use self::manager::{PluginManager, PluginRegistry};

pub type PluginName = String;

/// A version constraint over a probe class's version attribute.
///
/// Accepted forms: `1.2` (exact), `1.2+` (at least), `1.2-2.0`
/// (inclusive range). An absent version attribute always satisfies the
/// expression.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionExpr {
    min: Option<Vec<u64>>,
    max: Option<Vec<u64>>,
}

impl VersionExpr {
    /// Matches every version.
    pub fn any() -> VersionExpr {
        VersionExpr { min: None, max: None }
    }

    pub fn parse(source: &str) -> Result<VersionExpr, String> {
        let source = source.trim();
        if source.is_empty() {
            return Ok(VersionExpr::any());
        }
        if let Some(idx) = source.find('-') {
            let min = parse_version(&source[..idx])?;
            let max = parse_version(&source[idx + 1..])?;
            return Ok(VersionExpr { min: Some(min), max: Some(max) });
        }
        if source.ends_with('+') {
            let min = parse_version(&source[..source.len() - 1])?;
            return Ok(VersionExpr { min: Some(min), max: None });
        }
        let exact = parse_version(source)?;
        Ok(VersionExpr { min: Some(exact.clone()), max: Some(exact) })
    }

    /// Whether `version` satisfies this expression. An unparseable
    /// version fails a constrained expression.
    pub fn matches(&self, version: &str) -> bool {
        if self.min.is_none() && self.max.is_none() {
            return true;
        }
        let version = match parse_version(version) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if let Some(ref min) = self.min {
            if compare_versions(&version, min) == ::std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(ref max) = self.max {
            if compare_versions(&version, max) == ::std::cmp::Ordering::Greater {
                return false;
            }
        }
        true
    }
}

fn parse_version(source: &str) -> Result<Vec<u64>, String> {
    let source = source.trim();
    if source.is_empty() {
        return Err("empty version".into());
    }
    source.split('.')
        .map(|part| part.parse::<u64>()
             .map_err(|_| format!("bad version component '{}'", part)))
        .collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> ::std::cmp::Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).cloned().unwrap_or(0);
        let y = b.get(i).cloned().unwrap_or(0);
        match x.cmp(&y) {
            ::std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    ::std::cmp::Ordering::Equal
}

/// Context handed to plugin callbacks at activation.
pub struct PluginCtx<'a> {
    pub loader: &'a LoaderHandle,
}

/// The contract a plugin implements. One instance exists per activated
/// (plugin, loader) pair, owned by its `PluginManager`.
pub trait ReloadPlugin: Send {
    /// Transformers to register, scoped to the activated loader.
    fn transformers(&self) -> Vec<TransformerDescriptor> {
        Vec::new()
    }

    /// Event-handler bindings to register, scoped to the activated
    /// loader.
    fn handlers(&self) -> Vec<HandlerRegistration> {
        Vec::new()
    }

    /// Called once after the plugin's transformers and handlers are
    /// registered.
    #[allow(unused_variables)]
    fn init(&mut self, ctx: &PluginCtx) {}

    /// Called when the owning loader is reclaimed or the engine shuts
    /// down.
    fn teardown(&mut self) {}
}

type PluginFactory = Arc<dyn Fn() -> Box<dyn ReloadPlugin> + Send + Sync>;

/// Describes attributes and capabilities of a plugin.
#[derive(Clone)]
pub struct PluginDescription {
    pub name: PluginName,
    pub version: String,
    /// Class names whose load in a loader activates the plugin there.
    pub probes: Vec<ClassName>,
    /// Constraint on the probe class's version attribute.
    pub version_expr: VersionExpr,
    factory: PluginFactory,
}

impl PluginDescription {
    pub fn new<S, V>(name: S, version: V, probes: Vec<ClassName>,
                     version_expr: VersionExpr, factory: PluginFactory)
                     -> PluginDescription
        where S: Into<String>, V: Into<String>,
    {
        PluginDescription {
            name: name.into(),
            version: version.into(),
            probes,
            version_expr,
            factory,
        }
    }

    /// Constructs a fresh instance of the plugin's runtime object, one
    /// per activated loader.
    pub fn instantiate(&self) -> Box<dyn ReloadPlugin> {
        (self.factory)()
    }
}

impl fmt::Debug for PluginDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PluginDescription {{ name: {}, version: {}, probes: {:?} }}",
               self.name, self.version, self.probes)
    }
}

/// The plugins bundled with the engine.
pub fn builtin_plugins() -> Vec<PluginDescription> {
    vec![reload_logger_description()]
}

/// A minimal bundled plugin: logs every redefinition in its loader,
/// deferring so that bursts collapse into one line.
fn reload_logger_description() -> PluginDescription {
    PluginDescription::new(
        "reload-logger", "0.1",
        vec![ClassName::new("java.lang.Object")],
        VersionExpr::any(),
        Arc::new(|| Box::new(ReloadLogger) as Box<dyn ReloadPlugin>),
    )
}

struct ReloadLogger;

impl ReloadPlugin for ReloadLogger {
    fn handlers(&self) -> Vec<HandlerRegistration> {
        vec![HandlerRegistration {
            name: "log-redefinitions".into(),
            plugin: "reload-logger".into(),
            kind: EventKind::ClassRedefined,
            predicate: None,
            deferred: true,
            delay: Duration::from_millis(200),
            callback: Arc::new(|event| {
                if let Event::ClassRedefined { ref identity, ref diff, structural, .. } = *event {
                    info!("reloaded {} ({}{})", identity, diff.summary(),
                          if structural { ", structural" } else { "" });
                }
                Ok(())
            }),
        }]
    }

    fn init(&mut self, ctx: &PluginCtx) {
        debug!("reload-logger active in {}", ctx.loader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_expr_forms() {
        let exact = VersionExpr::parse("1.2").unwrap();
        assert!(exact.matches("1.2"));
        assert!(exact.matches("1.2.0"));
        assert!(!exact.matches("1.3"));

        let at_least = VersionExpr::parse("2.0+").unwrap();
        assert!(at_least.matches("2.0"));
        assert!(at_least.matches("3.5.1"));
        assert!(!at_least.matches("1.9"));

        let range = VersionExpr::parse("1.2-2.0").unwrap();
        assert!(range.matches("1.2"));
        assert!(range.matches("1.9.9"));
        assert!(range.matches("2.0"));
        assert!(!range.matches("2.0.1"));
        assert!(!range.matches("1.1"));

        assert!(VersionExpr::any().matches("anything"));
        assert!(!range.matches("not.a.version"));
    }

    #[test]
    fn bad_version_expr_rejected() {
        assert!(VersionExpr::parse("one.two").is_err());
        assert!(VersionExpr::parse("1..2").is_err());
    }

    #[test]
    fn builtins_enumerate() {
        let plugins = builtin_plugins();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "reload-logger");
        // instantiation yields a fresh object each time
        let _a = plugins[0].instantiate();
        let _b = plugins[0].instantiate();
    }
}
