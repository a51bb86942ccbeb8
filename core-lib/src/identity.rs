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

//! Class names, class identities, and redefinition requests.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use crate::loaders::{LoaderHandle, LoaderId, WeakLoader};

/// The binary name of a class, e.g. `com.example.Foo$Bar`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
         Serialize, Deserialize)]
pub struct ClassName(String);

impl ClassName {
    pub fn new<S: Into<String>>(name: S) -> ClassName {
        ClassName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The package part of the name, or `""` for the default package.
    pub fn package(&self) -> &str {
        match self.0.rfind('.') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// The name without its package.
    pub fn simple_name(&self) -> &str {
        match self.0.rfind('.') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// For a nested class `Foo$Bar`, the enclosing class `Foo`.
    pub fn enclosing_class(&self) -> Option<ClassName> {
        let simple = self.simple_name();
        let dollar = simple.find('$')?;
        if dollar == 0 {
            return None;
        }
        let enclosing_simple = &simple[..dollar];
        if self.package().is_empty() {
            Some(ClassName::new(enclosing_simple))
        } else {
            Some(ClassName::new(format!("{}.{}", self.package(), enclosing_simple)))
        }
    }

    /// Maps a build-output path like `com/example/Foo.class` to the
    /// binary name `com.example.Foo`. The path must be relative.
    pub fn from_class_path(path: &Path) -> Option<ClassName> {
        if path.is_absolute() || path.extension().map(|e| e != "class").unwrap_or(true) {
            return None;
        }
        let mut parts = Vec::new();
        for component in path.with_extension("").components() {
            let part = component.as_os_str().to_str()?;
            if part.is_empty() || part == "." || part == ".." {
                return None;
            }
            parts.push(part.to_owned());
        }
        if parts.is_empty() {
            None
        } else {
            Some(ClassName(parts.join(".")))
        }
    }

    /// Converts the internal slashed form `com/example/Foo` to a name.
    pub fn from_internal(name: &str) -> ClassName {
        ClassName(name.replace('/', "."))
    }

    /// The internal slashed form of this name.
    pub fn to_internal(&self) -> String {
        self.0.replace('.', "/")
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'a> From<&'a str> for ClassName {
    fn from(s: &'a str) -> ClassName {
        ClassName(s.to_owned())
    }
}

impl From<String> for ClassName {
    fn from(s: String) -> ClassName {
        ClassName(s)
    }
}

/// The pair (binary name, owning loader) which uniquely identifies a
/// class within the runtime. The loader reference is weak: an identity
/// whose loader has been reclaimed is dead, and is pruned from caches.
#[derive(Debug, Clone)]
pub struct ClassIdentity {
    pub name: ClassName,
    pub loader: WeakLoader,
}

impl ClassIdentity {
    pub fn new(name: ClassName, loader: &LoaderHandle) -> ClassIdentity {
        ClassIdentity { name, loader: loader.downgrade() }
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader.id()
    }

    pub fn is_live(&self) -> bool {
        self.loader.is_live()
    }

    /// The hashable projection of this identity.
    pub fn key(&self) -> (ClassName, LoaderId) {
        (self.name.clone(), self.loader.id())
    }
}

impl PartialEq for ClassIdentity {
    fn eq(&self, other: &ClassIdentity) -> bool {
        self.name == other.name && self.loader.id() == other.loader.id()
    }
}

impl Eq for ClassIdentity {}

impl Hash for ClassIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.loader.id().hash(state);
    }
}

impl fmt::Display for ClassIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.loader.id())
    }
}

/// Where a redefinition request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    /// The filesystem watcher noticed a changed class file.
    FileWatch,
    /// An external tool pushed bytes over the command protocol.
    Push,
}

/// A request to redefine one class in place.
#[derive(Debug, Clone)]
pub struct RedefinitionRequest {
    pub identity: ClassIdentity,
    pub bytes: Vec<u8>,
    pub source: RequestSource,
    pub submitted_at: Instant,
}

impl RedefinitionRequest {
    pub fn new(identity: ClassIdentity, bytes: Vec<u8>, source: RequestSource)
               -> RedefinitionRequest {
        RedefinitionRequest { identity, bytes, source, submitted_at: Instant::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_parts() {
        let name = ClassName::new("com.example.Foo");
        assert_eq!(name.package(), "com.example");
        assert_eq!(name.simple_name(), "Foo");
        assert_eq!(name.enclosing_class(), None);

        let inner = ClassName::new("com.example.Foo$Bar");
        assert_eq!(inner.simple_name(), "Foo$Bar");
        assert_eq!(inner.enclosing_class(), Some(ClassName::new("com.example.Foo")));

        let plain = ClassName::new("Top");
        assert_eq!(plain.package(), "");
        assert_eq!(plain.simple_name(), "Top");
    }

    #[test]
    fn path_mapping() {
        let name = ClassName::from_class_path(Path::new("com/example/Foo.class"));
        assert_eq!(name, Some(ClassName::new("com.example.Foo")));

        assert_eq!(ClassName::from_class_path(Path::new("Foo.class")),
                   Some(ClassName::new("Foo")));
        assert_eq!(ClassName::from_class_path(Path::new("com/example/Foo.txt")), None);
        assert_eq!(ClassName::from_class_path(Path::new("/abs/Foo.class")), None);
    }

    #[test]
    fn internal_form_round_trip() {
        let name = ClassName::from_internal("com/example/Foo$Bar");
        assert_eq!(name.as_str(), "com.example.Foo$Bar");
        assert_eq!(name.to_internal(), "com/example/Foo$Bar");
    }

    #[test]
    fn identities_distinct_by_loader() {
        let l1 = LoaderHandle::new("l1", None);
        let l2 = LoaderHandle::new("l2", None);
        let a1 = ClassIdentity::new("p.A".into(), &l1);
        let a2 = ClassIdentity::new("p.A".into(), &l2);
        let a1_again = ClassIdentity::new("p.A".into(), &l1);

        assert_ne!(a1, a2);
        assert_eq!(a1, a1_again);
    }
}
