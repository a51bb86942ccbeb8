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

//! The bytecode editor facade.
//!
//! Molt does not edit method bodies itself; that is the job of an
//! external bytecode library. [`BytecodeBackend`] captures the
//! capability set the engine requires of that library, and
//! [`ClassEditor`] is the stable facade transformers program against.
//! Stack-map validity of emitted bytes is the backend's responsibility.
//!
//! The facade validates what it can before delegating: member
//! existence is the backend's to check (it owns the parsed class), but
//! descriptor syntax is checked here so a malformed edit fails the
//! same way against every backend.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::classfile::MemberKey;
use crate::identity::ClassName;

/// Errors from the editing facade.
#[derive(Debug, Clone, PartialEq)]
pub enum EditError {
    /// The requested edit is malformed.
    InvalidEdit(String),
    /// The named method or field does not exist in the open class.
    UnknownMember(String),
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EditError::InvalidEdit(ref detail) => write!(f, "invalid edit: {}", detail),
            EditError::UnknownMember(ref member) => {
                write!(f, "no such member: {}", member)
            }
        }
    }
}

impl Error for EditError {
    fn description(&self) -> &str {
        match *self {
            EditError::InvalidEdit(..) => "invalid edit",
            EditError::UnknownMember(..) => "unknown member",
        }
    }
}

/// Where inserted statements are placed relative to the method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    /// Before the first existing statement.
    Entry,
    /// Before every return, so the insertion observes the method's exit.
    Exit,
}

/// An editing session over one class, produced by a backend.
pub trait ClassSession: Send {
    /// The name of the open class.
    fn class_name(&self) -> ClassName;
    /// Inserts statements at the given point of an existing method.
    fn insert_code(&mut self, method: &MemberKey, point: InsertionPoint,
                   source: &str) -> Result<(), EditError>;
    /// Replaces the body of an existing method.
    fn replace_body(&mut self, method: &MemberKey, source: &str)
                    -> Result<(), EditError>;
    /// Adds a new field with the given descriptor and access flags.
    fn add_field(&mut self, name: &str, descriptor: &str, access_flags: u16)
                 -> Result<(), EditError>;
    /// Rewrites type references according to the name map.
    fn rename_references(&mut self, map: &HashMap<ClassName, ClassName>)
                         -> Result<(), EditError>;
    /// Produces the edited class bytes.
    fn emit(self: Box<Self>) -> Result<Vec<u8>, EditError>;
}

/// The capability set required of the external bytecode library.
pub trait BytecodeBackend: Send + Sync {
    /// Opens class bytes for editing.
    fn open(&self, bytes: &[u8]) -> Result<Box<dyn ClassSession>, EditError>;
}

/// The facade over a backend session handed to transformers.
///
/// An editor that is never written to emits the original bytes
/// unchanged, so a no-op edit is exactly the identity.
pub struct ClassEditor {
    session: Box<dyn ClassSession>,
    original: Vec<u8>,
    dirty: bool,
}

impl ClassEditor {
    pub fn open(backend: &dyn BytecodeBackend, bytes: &[u8])
                -> Result<ClassEditor, EditError> {
        let session = backend.open(bytes)?;
        Ok(ClassEditor { session, original: bytes.to_vec(), dirty: false })
    }

    pub fn class_name(&self) -> ClassName {
        self.session.class_name()
    }

    /// Prepends statements to a method body.
    pub fn prepend(&mut self, method: &MemberKey, source: &str)
                   -> Result<(), EditError> {
        self.check_source(source)?;
        self.session.insert_code(method, InsertionPoint::Entry, source)?;
        self.dirty = true;
        Ok(())
    }

    /// Inserts statements before every return of a method.
    pub fn intercept_returns(&mut self, method: &MemberKey, source: &str)
                             -> Result<(), EditError> {
        self.check_source(source)?;
        self.session.insert_code(method, InsertionPoint::Exit, source)?;
        self.dirty = true;
        Ok(())
    }

    /// Replaces a method body outright.
    pub fn replace_body(&mut self, method: &MemberKey, source: &str)
                        -> Result<(), EditError> {
        self.check_source(source)?;
        self.session.replace_body(method, source)?;
        self.dirty = true;
        Ok(())
    }

    /// Adds a field to the class.
    pub fn add_field(&mut self, name: &str, descriptor: &str, access_flags: u16)
                     -> Result<(), EditError> {
        if name.is_empty() {
            return Err(EditError::InvalidEdit("empty field name".into()));
        }
        if !is_valid_field_descriptor(descriptor) {
            return Err(EditError::InvalidEdit(
                format!("bad field descriptor '{}'", descriptor)));
        }
        self.session.add_field(name, descriptor, access_flags)?;
        self.dirty = true;
        Ok(())
    }

    /// Rewrites type references according to `map`.
    pub fn rename_references(&mut self, map: &HashMap<ClassName, ClassName>)
                             -> Result<(), EditError> {
        if map.is_empty() {
            return Ok(());
        }
        self.session.rename_references(map)?;
        self.dirty = true;
        Ok(())
    }

    /// Finishes the session, producing class bytes. With no edits this
    /// is the original bytes, byte for byte.
    pub fn finish(self) -> Result<Vec<u8>, EditError> {
        if self.dirty {
            self.session.emit()
        } else {
            Ok(self.original)
        }
    }

    fn check_source(&self, source: &str) -> Result<(), EditError> {
        if source.trim().is_empty() {
            Err(EditError::InvalidEdit("empty statement source".into()))
        } else {
            Ok(())
        }
    }
}

/// The backend used when no bytecode library is attached: classes can
/// be opened and emitted unchanged, but every edit is rejected.
pub struct NullBackend;

impl BytecodeBackend for NullBackend {
    fn open(&self, bytes: &[u8]) -> Result<Box<dyn ClassSession>, EditError> {
        let form = crate::classfile::read_form(bytes)
            .map_err(|e| EditError::InvalidEdit(e.to_string()))?;
        Ok(Box::new(NullSession { name: form.name, original: bytes.to_vec() }))
    }
}

struct NullSession {
    name: ClassName,
    original: Vec<u8>,
}

impl NullSession {
    fn reject<T>(&self) -> Result<T, EditError> {
        Err(EditError::InvalidEdit("no bytecode library attached".into()))
    }
}

impl ClassSession for NullSession {
    fn class_name(&self) -> ClassName {
        self.name.clone()
    }
    fn insert_code(&mut self, _method: &MemberKey, _point: InsertionPoint,
                   _source: &str) -> Result<(), EditError> {
        self.reject()
    }
    fn replace_body(&mut self, _method: &MemberKey, _source: &str)
                    -> Result<(), EditError> {
        self.reject()
    }
    fn add_field(&mut self, _name: &str, _descriptor: &str, _access_flags: u16)
                 -> Result<(), EditError> {
        self.reject()
    }
    fn rename_references(&mut self, _map: &HashMap<ClassName, ClassName>)
                         -> Result<(), EditError> {
        self.reject()
    }
    fn emit(self: Box<Self>) -> Result<Vec<u8>, EditError> {
        Ok(self.original)
    }
}

/// Validates a JVM field descriptor: a primitive type letter, an object
/// type `Lname;`, or an array of either.
pub fn is_valid_field_descriptor(descriptor: &str) -> bool {
    let mut rest = descriptor;
    while rest.starts_with('[') {
        rest = &rest[1..];
    }
    match rest.as_bytes().first() {
        Some(&b'B') | Some(&b'C') | Some(&b'D') | Some(&b'F') | Some(&b'I')
        | Some(&b'J') | Some(&b'S') | Some(&b'Z') => rest.len() == 1,
        Some(&b'L') => rest.ends_with(';') && rest.len() > 2,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ClassFileBuilder, RecordingBackend};

    #[test]
    fn descriptor_validation() {
        assert!(is_valid_field_descriptor("I"));
        assert!(is_valid_field_descriptor("[J"));
        assert!(is_valid_field_descriptor("[[Z"));
        assert!(is_valid_field_descriptor("Ljava/lang/String;"));
        assert!(is_valid_field_descriptor("[Ljava/lang/String;"));
        assert!(!is_valid_field_descriptor(""));
        assert!(!is_valid_field_descriptor("X"));
        assert!(!is_valid_field_descriptor("L;"));
        assert!(!is_valid_field_descriptor("II"));
    }

    #[test]
    fn noop_edit_returns_original_bytes() {
        let backend = RecordingBackend::new();
        let bytes = ClassFileBuilder::new("p.A").method("f", "()I").build();
        let editor = ClassEditor::open(&backend, &bytes).unwrap();
        assert_eq!(editor.finish().unwrap(), bytes);
    }

    #[test]
    fn unknown_method_rejected() {
        let backend = RecordingBackend::new();
        let bytes = ClassFileBuilder::new("p.B").method("f", "()I").build();
        let mut editor = ClassEditor::open(&backend, &bytes).unwrap();
        let missing = MemberKey::new("g", "()I");
        match editor.prepend(&missing, "log.enter();") {
            Err(EditError::UnknownMember(..)) => (),
            other => panic!("expected UnknownMember, got {:?}", other),
        }
    }

    #[test]
    fn bad_field_descriptor_rejected_before_backend() {
        let backend = RecordingBackend::new();
        let bytes = ClassFileBuilder::new("p.C").build();
        let mut editor = ClassEditor::open(&backend, &bytes).unwrap();
        match editor.add_field("x", "Q", 0) {
            Err(EditError::InvalidEdit(..)) => (),
            other => panic!("expected InvalidEdit, got {:?}", other),
        }
        assert!(backend.edit_log().is_empty());
    }

    #[test]
    fn edits_are_recorded() {
        let backend = RecordingBackend::new();
        let bytes = ClassFileBuilder::new("p.D").method("f", "()I").build();
        let mut editor = ClassEditor::open(&backend, &bytes).unwrap();
        editor.prepend(&MemberKey::new("f", "()I"), "count += 1;").unwrap();
        editor.add_field("count", "I", 0).unwrap();
        let _ = editor.finish().unwrap();
        assert_eq!(backend.edit_log().len(), 2);
    }
}
