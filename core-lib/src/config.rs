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

//! Engine configuration.
//!
//! Settings follow the common pattern of bundled defaults masked by a
//! user table. The user file is `molt.toml` in the config directory;
//! it is validated against a key whitelist, and a malformed file leaves
//! the defaults in force.

use std::collections::HashSet;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::fingerprint::FingerprintPolicy;
use crate::scheduler::SchedulerConfig;

static MOLT_CONFIG_DIR: &str = "MOLT_CONFIG_DIR";
static XDG_CONFIG_HOME: &str = "XDG_CONFIG_HOME";

/// The file name of the user configuration inside the config dir.
pub static USER_CONFIG_FILE: &str = "molt.toml";

/// A map of config keys to settings.
pub type Table = ::toml::value::Table;

/// Namespace for the default settings.
mod defaults {
    use super::Table;

    pub const BASE: &str = include_str!("../assets/defaults.toml");

    /// The config keys recognised in user files.
    pub const ENGINE_KEYS: &[&str] = &[
        "debounce_min_ms",
        "debounce_max_ms",
        "redefine_retry_count",
        "redefine_retry_backoff_ms",
        "fingerprint_policy",
        "disabled_plugins",
        "log_level",
        "watch_dirs",
    ];

    pub fn base() -> Table {
        load(BASE)
    }

    fn load(source: &str) -> Table {
        source.parse::<::toml::Value>()
            .ok()
            .and_then(|v| v.as_table().cloned())
            .expect("default config must parse")
    }
}

lazy_static! {
    static ref BASE_DEFAULTS: Table = defaults::base();
}

/// The errors that can occur when managing configs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The config contains a key that is not recognised.
    IllegalKey(String),
    /// A key has a value of the wrong shape.
    IllegalValue(String),
    /// A file-based config could not be loaded or parsed.
    FileParse(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ConfigError::*;
        match self {
            IllegalKey(ref key) => write!(f, "illegal config key: {}", key),
            IllegalValue(ref detail) => write!(f, "illegal config value: {}", detail),
            FileParse(ref path) => write!(f, "failed to parse config file: {:?}", path),
        }
    }
}

impl Error for ConfigError {
    fn description(&self) -> &str {
        use self::ConfigError::*;
        match *self {
            IllegalKey(..) => "illegal key",
            IllegalValue(..) => "illegal value",
            FileParse(..) => "failed to parse file",
        }
    }
}

/// A `Validator` checks a config table before it is accepted.
pub trait Validator: fmt::Debug + Send {
    fn validate(&self, key: &str, value: &::toml::Value) -> Result<(), ConfigError>;

    fn validate_table(&self, table: &Table) -> Result<(), ConfigError> {
        for (key, value) in table.iter() {
            self.validate(key, value)?;
        }
        Ok(())
    }
}

/// A `Validator` that checks keys against a whitelist.
#[derive(Debug, Clone)]
pub struct KeyValidator {
    keys: HashSet<String>,
}

impl KeyValidator {
    pub fn for_engine() -> Arc<KeyValidator> {
        let keys = defaults::ENGINE_KEYS.iter()
            .map(|s| String::from(*s))
            .collect();
        Arc::new(KeyValidator { keys })
    }
}

impl Validator for KeyValidator {
    fn validate(&self, key: &str, _value: &::toml::Value) -> Result<(), ConfigError> {
        if self.keys.contains(key) {
            Ok(())
        } else {
            Err(ConfigError::IllegalKey(key.to_owned()))
        }
    }
}

/// Default settings masked by user settings, with a cached collation.
#[derive(Debug)]
struct ConfigPair {
    base: Table,
    user: Option<Table>,
    cache: Arc<Table>,
    validator: Arc<KeyValidator>,
}

impl ConfigPair {
    fn new(base: Table, validator: Arc<KeyValidator>) -> ConfigPair {
        let mut pair = ConfigPair { base, user: None, cache: Arc::new(Table::new()),
                                    validator };
        pair.rebuild();
        pair
    }

    fn set_user(&mut self, user: Table) -> Result<(), ConfigError> {
        self.validator.validate_table(&user)?;
        let previous = self.user.take();
        self.user = Some(user);
        self.rebuild();
        // the key whitelist cannot catch shape errors; a trial
        // deserialization can
        if let Err(err) = EngineItems::from_table(&self.cache) {
            self.user = previous;
            self.rebuild();
            return Err(err);
        }
        Ok(())
    }

    fn rebuild(&mut self) {
        let mut cache = self.base.clone();
        if let Some(ref user) = self.user {
            for (k, v) in user.iter() {
                cache.insert(k.to_owned(), v.clone());
            }
        }
        self.cache = Arc::new(cache);
    }
}

/// The concrete engine settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EngineItems {
    pub debounce_min_ms: u64,
    pub debounce_max_ms: u64,
    pub redefine_retry_count: u32,
    pub redefine_retry_backoff_ms: u64,
    pub fingerprint_policy: Vec<String>,
    pub disabled_plugins: Vec<String>,
    pub log_level: String,
    pub watch_dirs: Vec<String>,
}

impl EngineItems {
    fn from_table(table: &Table) -> Result<EngineItems, ConfigError> {
        ::toml::Value::Table(table.clone())
            .try_into::<EngineItems>()
            .map_err(|e| ConfigError::IllegalValue(e.to_string()))
    }
}

/// A frozen snapshot of the settings, plus its source table for diffing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    source: Arc<Table>,
    pub items: EngineItems,
}

impl EngineConfig {
    /// Returns a `Table` of the keys in `self` whose values differ
    /// from `other`.
    pub fn changes_from_other(&self, other: &EngineConfig) -> Option<Table> {
        let mut out: Option<Table> = None;
        for (k, v) in self.source.iter() {
            if other.source.get(k) != Some(v) {
                out.get_or_insert_with(Table::new).insert(k.to_owned(), v.clone());
            }
        }
        out
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            debounce_min: Duration::from_millis(self.items.debounce_min_ms),
            debounce_max: Duration::from_millis(self.items.debounce_max_ms),
            retry_count: self.items.redefine_retry_count,
            retry_backoff: Duration::from_millis(self.items.redefine_retry_backoff_ms),
        }
    }

    pub fn fingerprint_policy(&self) -> FingerprintPolicy {
        FingerprintPolicy::from_names(&self.items.fingerprint_policy)
    }
}

impl PartialEq for EngineConfig {
    fn eq(&self, other: &EngineConfig) -> bool {
        self.items == other.items
    }
}

/// Owns the engine's configuration state.
#[derive(Debug)]
pub struct ConfigManager {
    pair: ConfigPair,
    /// Paths whose contents are currently loaded as user config.
    sources: HashSet<PathBuf>,
    config_dir: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> ConfigManager {
        ConfigManager {
            pair: ConfigPair::new(BASE_DEFAULTS.clone(), KeyValidator::for_engine()),
            sources: HashSet::new(),
            config_dir: None,
        }
    }
}

impl ConfigManager {
    /// Sets the config directory, canonicalized so that watcher-reported
    /// paths compare equal to it.
    pub fn set_config_dir<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref();
        self.config_dir = Some(path.canonicalize()
            .unwrap_or_else(|_| path.to_owned()));
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_ref().map(PathBuf::as_path)
    }

    /// Whether a given file is our config file in the expected place.
    pub fn should_load_file<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        path.file_name().map(|n| n == USER_CONFIG_FILE).unwrap_or(false)
            && self.config_dir.as_ref()
                .map(|dir| Some(dir.as_path()) == path.parent())
                .unwrap_or(false)
    }

    /// Replaces the user config with the contents of `table`.
    pub fn update_user_config<P>(&mut self, table: Table, path: P)
                                 -> Result<(), ConfigError>
        where P: Into<Option<PathBuf>>,
    {
        self.pair.set_user(table)?;
        if let Some(path) = path.into() {
            self.sources.insert(path);
        }
        Ok(())
    }

    /// If `path` is a loaded config file, unloads it.
    pub fn remove_source(&mut self, path: &Path) {
        if self.sources.remove(path) {
            self.pair.set_user(Table::new())
                .expect("empty table is always valid");
        }
    }

    /// Loads `molt.toml` from the config dir, if present.
    pub fn load_config_dir(&mut self) -> Result<(), ConfigError> {
        let path = match self.config_dir {
            Some(ref dir) => dir.join(USER_CONFIG_FILE),
            None => return Ok(()),
        };
        if !path.exists() {
            return Ok(());
        }
        let table = try_load_from_file(&path)?;
        self.update_user_config(table, path)
    }

    /// Generates a snapshot of the current configuration.
    pub fn get_config(&self) -> EngineConfig {
        let source = self.pair.cache.clone();
        let items = EngineItems::from_table(&source)
            .expect("cached config is always valid");
        EngineConfig { source, items }
    }
}

/// Attempts to load a config table from a TOML file.
pub fn try_load_from_file(path: &Path) -> Result<Table, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|_| ConfigError::FileParse(path.to_owned()))?;
    contents.parse::<::toml::Value>()
        .ok()
        .and_then(|v| v.as_table().cloned())
        .ok_or_else(|| ConfigError::FileParse(path.to_owned()))
}

/// Returns the location of the active config directory.
///
/// env vars are passed in as `Option<&str>` for easier testing.
fn config_dir_impl(molt_var: Option<&str>, xdg_var: Option<&str>) -> PathBuf {
    molt_var.map(PathBuf::from).unwrap_or_else(|| {
        let mut xdg_config = xdg_var.map(PathBuf::from).unwrap_or_else(|| {
            env::var("HOME").map(PathBuf::from)
                .map(|mut p| {
                    p.push(".config");
                    p
                })
                .expect("$HOME is required by POSIX")
        });
        xdg_config.push("molt");
        xdg_config
    })
}

pub fn get_config_dir() -> PathBuf {
    let molt_var = env::var(MOLT_CONFIG_DIR).ok();
    let xdg_var = env::var(XDG_CONFIG_HOME).ok();
    config_dir_impl(molt_var.as_ref().map(String::as_ref),
                    xdg_var.as_ref().map(String::as_ref))
}
