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

use std::collections::HashMap;

use super::{PluginDescription, PluginName};
use crate::identity::ClassName;

/// A catalog of all discovered plugins, built once at startup.
pub struct PluginCatalog {
    items: HashMap<PluginName, PluginDescription>,
}

impl<'a> PluginCatalog {
    /// Builds a catalog, skipping disabled plugins and warning on
    /// duplicate names.
    pub fn new(plugins: Vec<PluginDescription>, disabled: &[String]) -> Self {
        let mut items = HashMap::with_capacity(plugins.len());
        for plugin in plugins {
            if disabled.iter().any(|d| d == &plugin.name) {
                info!("plugin '{}' disabled by configuration", plugin.name);
                continue;
            }
            if items.contains_key(&plugin.name) {
                warn!("duplicate plugin name '{}', keeping the first", plugin.name);
                continue;
            }
            items.insert(plugin.name.clone(), plugin);
        }
        PluginCatalog { items }
    }

    /// Returns an iterator over all plugins, in arbitrary order.
    pub fn iter(&'a self) -> Box<dyn Iterator<Item = &'a PluginDescription> + 'a> {
        Box::new(self.items.values())
    }

    /// Returns an iterator over all plugin names, in arbitrary order.
    pub fn iter_names(&'a self) -> Box<dyn Iterator<Item = &'a PluginName> + 'a> {
        Box::new(self.items.keys())
    }

    /// Returns a reference to the named plugin, if present.
    pub fn get_named(&self, plugin_name: &str) -> Option<&PluginDescription> {
        self.items.get(plugin_name)
    }

    /// All plugins for which `class_name` is a probe.
    pub fn probed_by(&self, class_name: &ClassName) -> Vec<&PluginDescription> {
        self.filter(|desc| desc.probes.contains(class_name))
    }

    /// Returns all descriptions matching some predicate.
    pub fn filter<F>(&self, predicate: F) -> Vec<&PluginDescription>
        where F: Fn(&PluginDescription) -> bool,
    {
        self.iter().filter(|item| predicate(item)).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use super::super::{ReloadPlugin, VersionExpr};

    struct Inert;
    impl ReloadPlugin for Inert {}

    fn desc(name: &str, probe: &str) -> PluginDescription {
        PluginDescription::new(
            name, "1.0",
            vec![ClassName::new(probe)],
            VersionExpr::any(),
            Arc::new(|| Box::new(Inert) as Box<dyn ReloadPlugin>),
        )
    }

    #[test]
    fn disabled_plugins_skipped() {
        let catalog = PluginCatalog::new(
            vec![desc("a", "p.A"), desc("b", "p.B")],
            &["b".to_owned()],
        );
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get_named("a").is_some());
        assert!(catalog.get_named("b").is_none());
    }

    #[test]
    fn duplicates_keep_first() {
        let catalog = PluginCatalog::new(vec![desc("a", "p.A"), desc("a", "p.B")],
                                         &[]);
        assert_eq!(catalog.len(), 1);
        let kept = catalog.get_named("a").unwrap();
        assert_eq!(kept.probes, vec![ClassName::new("p.A")]);
    }

    #[test]
    fn probe_lookup() {
        let catalog = PluginCatalog::new(
            vec![desc("a", "p.Shared"), desc("b", "p.Shared"), desc("c", "p.Other")],
            &[],
        );
        let mut probed = catalog.probed_by(&ClassName::new("p.Shared"))
            .iter()
            .map(|d| d.name.clone())
            .collect::<Vec<_>>();
        probed.sort();
        assert_eq!(probed, vec!["a".to_owned(), "b".to_owned()]);
        assert!(catalog.probed_by(&ClassName::new("p.None")).is_empty());
    }
}
