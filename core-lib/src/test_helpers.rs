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

//! Types and helpers used for testing.
//!
//! `ClassFileBuilder` emits real, minimal class files: a constant pool,
//! member tables, and the annotation/exception attributes the
//! inspector reads. Method bodies are opaque `Code` attribute payloads,
//! which is enough to give two structurally-identical classes different
//! bytes.

#![doc(hidden)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::bytecode::{BytecodeBackend, ClassSession, EditError, InsertionPoint};
use crate::classfile::{read_form, ClassForm, MemberKey, ACC_PRIVATE, ACC_PUBLIC,
                       ACC_STATIC, CLASS_MAGIC};
use crate::identity::ClassName;

const ACC_SUPER: u16 = 0x0020;

#[derive(Default)]
struct PoolWriter {
    entries: Vec<Vec<u8>>,
    utf8_idx: HashMap<String, u16>,
    class_idx: HashMap<String, u16>,
}

impl PoolWriter {
    fn utf8(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.utf8_idx.get(s) {
            return idx;
        }
        let mut entry = vec![1u8];
        push_u16(&mut entry, s.len() as u16);
        entry.extend_from_slice(s.as_bytes());
        self.entries.push(entry);
        let idx = self.entries.len() as u16;
        self.utf8_idx.insert(s.to_owned(), idx);
        idx
    }

    fn class(&mut self, dotted: &str) -> u16 {
        if let Some(&idx) = self.class_idx.get(dotted) {
            return idx;
        }
        let name_idx = self.utf8(&dotted.replace('.', "/"));
        let mut entry = vec![7u8];
        push_u16(&mut entry, name_idx);
        self.entries.push(entry);
        let idx = self.entries.len() as u16;
        self.class_idx.insert(dotted.to_owned(), idx);
        idx
    }

    fn count(&self) -> u16 {
        self.entries.len() as u16 + 1
    }
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.push((value >> 8) as u8);
    buf.push(value as u8);
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.push((value >> 24) as u8);
    buf.push((value >> 16) as u8);
    buf.push((value >> 8) as u8);
    buf.push(value as u8);
}

fn push_attribute(pool: &mut PoolWriter, buf: &mut Vec<u8>, name: &str,
                  content: &[u8]) {
    push_u16(buf, pool.utf8(name));
    push_u32(buf, content.len() as u32);
    buf.extend_from_slice(content);
}

fn annotations_content(pool: &mut PoolWriter, types: &[String]) -> Vec<u8> {
    let mut content = Vec::new();
    push_u16(&mut content, types.len() as u16);
    for ty in types {
        let descriptor = format!("L{};", ty.replace('.', "/"));
        let idx = pool.utf8(&descriptor);
        push_u16(&mut content, idx);
        push_u16(&mut content, 0); // no element-value pairs
    }
    content
}

struct BuildMember {
    name: String,
    descriptor: String,
    access_flags: u16,
    annotations: Vec<String>,
    exceptions: Vec<String>,
    body: Option<Vec<u8>>,
}

impl BuildMember {
    fn new(name: &str, descriptor: &str, access_flags: u16) -> BuildMember {
        BuildMember {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            access_flags,
            annotations: Vec::new(),
            exceptions: Vec::new(),
            body: None,
        }
    }

    fn write(&self, pool: &mut PoolWriter, buf: &mut Vec<u8>) {
        push_u16(buf, self.access_flags);
        let name_idx = pool.utf8(&self.name);
        push_u16(buf, name_idx);
        let desc_idx = pool.utf8(&self.descriptor);
        push_u16(buf, desc_idx);

        let mut attr_count = 0u16;
        if !self.annotations.is_empty() {
            attr_count += 1;
        }
        if !self.exceptions.is_empty() {
            attr_count += 1;
        }
        if self.body.is_some() {
            attr_count += 1;
        }
        push_u16(buf, attr_count);

        if !self.annotations.is_empty() {
            let content = annotations_content(pool, &self.annotations);
            push_attribute(pool, buf, "RuntimeVisibleAnnotations", &content);
        }
        if !self.exceptions.is_empty() {
            let mut content = Vec::new();
            push_u16(&mut content, self.exceptions.len() as u16);
            for exc in &self.exceptions {
                let idx = pool.class(exc);
                push_u16(&mut content, idx);
            }
            push_attribute(pool, buf, "Exceptions", &content);
        }
        if let Some(ref body) = self.body {
            push_attribute(pool, buf, "Code", body);
        }
    }
}

/// Builds minimal, well-formed class files for tests.
pub struct ClassFileBuilder {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    access_flags: u16,
    version: (u16, u16),
    class_annotations: Vec<String>,
    methods: Vec<BuildMember>,
    fields: Vec<BuildMember>,
}

impl ClassFileBuilder {
    pub fn new(name: &str) -> ClassFileBuilder {
        ClassFileBuilder {
            name: name.to_owned(),
            super_name: Some("java.lang.Object".to_owned()),
            interfaces: Vec::new(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            version: (52, 0),
            class_annotations: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn version(mut self, major: u16, minor: u16) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn super_class(mut self, name: &str) -> Self {
        self.super_name = Some(name.to_owned());
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_owned());
        self
    }

    /// Adds a class-level marker annotation.
    pub fn annotation(mut self, type_name: &str) -> Self {
        self.class_annotations.push(type_name.to_owned());
        self
    }

    pub fn method(self, name: &str, descriptor: &str) -> Self {
        self.method_with_flags(name, descriptor, ACC_PUBLIC)
    }

    pub fn method_with_flags(mut self, name: &str, descriptor: &str,
                             access_flags: u16) -> Self {
        self.methods.push(BuildMember::new(name, descriptor, access_flags));
        self
    }

    pub fn constructor(mut self, descriptor: &str) -> Self {
        self.methods.push(BuildMember::new("<init>", descriptor, ACC_PUBLIC));
        self
    }

    pub fn class_initialiser(mut self) -> Self {
        self.methods.push(BuildMember::new("<clinit>", "()V", ACC_STATIC));
        self
    }

    /// Adds a marker annotation to the most recently added method.
    pub fn method_annotation(mut self, type_name: &str) -> Self {
        self.methods.last_mut()
            .expect("method_annotation requires a method")
            .annotations.push(type_name.to_owned());
        self
    }

    /// Adds a declared exception to the most recently added method.
    pub fn method_exception(mut self, type_name: &str) -> Self {
        self.methods.last_mut()
            .expect("method_exception requires a method")
            .exceptions.push(type_name.to_owned());
        self
    }

    /// Gives the most recently added method an opaque body, so that
    /// structurally identical classes can differ in bytes.
    pub fn body(mut self, marker: &[u8]) -> Self {
        self.methods.last_mut()
            .expect("body requires a method")
            .body = Some(marker.to_vec());
        self
    }

    pub fn field(mut self, name: &str, descriptor: &str) -> Self {
        self.fields.push(BuildMember::new(name, descriptor, ACC_PRIVATE));
        self
    }

    pub fn field_with_flags(mut self, name: &str, descriptor: &str,
                            access_flags: u16) -> Self {
        self.fields.push(BuildMember::new(name, descriptor, access_flags));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut pool = PoolWriter::default();
        let this_class = pool.class(&self.name);
        let super_class = match self.super_name {
            Some(ref name) => pool.class(name),
            None => 0,
        };
        let interface_idxs = self.interfaces.iter()
            .map(|name| pool.class(name))
            .collect::<Vec<_>>();

        let mut fields_buf = Vec::new();
        for field in &self.fields {
            field.write(&mut pool, &mut fields_buf);
        }
        let mut methods_buf = Vec::new();
        for method in &self.methods {
            method.write(&mut pool, &mut methods_buf);
        }

        let mut class_attrs = Vec::new();
        let mut class_attr_count = 0u16;
        if !self.class_annotations.is_empty() {
            let content = annotations_content(&mut pool, &self.class_annotations);
            push_attribute(&mut pool, &mut class_attrs,
                           "RuntimeVisibleAnnotations", &content);
            class_attr_count += 1;
        }

        let mut out = Vec::new();
        out.extend_from_slice(&CLASS_MAGIC);
        push_u16(&mut out, self.version.1); // minor
        push_u16(&mut out, self.version.0); // major
        push_u16(&mut out, pool.count());
        for entry in &pool.entries {
            out.extend_from_slice(entry);
        }
        push_u16(&mut out, self.access_flags);
        push_u16(&mut out, this_class);
        push_u16(&mut out, super_class);
        push_u16(&mut out, interface_idxs.len() as u16);
        for idx in interface_idxs {
            push_u16(&mut out, idx);
        }
        push_u16(&mut out, self.fields.len() as u16);
        out.extend_from_slice(&fields_buf);
        push_u16(&mut out, self.methods.len() as u16);
        out.extend_from_slice(&methods_buf);
        push_u16(&mut out, class_attr_count);
        out.extend_from_slice(&class_attrs);
        out
    }
}

/// A bytecode backend that validates edits against the parsed form and
/// records them, emitting the original bytes. The real backend wraps
/// the external bytecode library.
pub struct RecordingBackend {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingBackend {
    pub fn new() -> RecordingBackend {
        RecordingBackend { log: Arc::new(Mutex::new(Vec::new())) }
    }

    /// The edits recorded by every session of this backend.
    pub fn edit_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl BytecodeBackend for RecordingBackend {
    fn open(&self, bytes: &[u8]) -> Result<Box<dyn ClassSession>, EditError> {
        let form = read_form(bytes)
            .map_err(|e| EditError::InvalidEdit(e.to_string()))?;
        Ok(Box::new(RecordingSession {
            form,
            original: bytes.to_vec(),
            log: self.log.clone(),
        }))
    }
}

struct RecordingSession {
    form: ClassForm,
    original: Vec<u8>,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingSession {
    fn require_method(&self, method: &MemberKey) -> Result<(), EditError> {
        let exists = self.form.find_method(method).is_some()
            || self.form.constructors.iter().any(|c| &c.key() == method);
        if exists {
            Ok(())
        } else {
            Err(EditError::UnknownMember(method.to_string()))
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl ClassSession for RecordingSession {
    fn class_name(&self) -> ClassName {
        self.form.name.clone()
    }

    fn insert_code(&mut self, method: &MemberKey, point: InsertionPoint,
                   source: &str) -> Result<(), EditError> {
        self.require_method(method)?;
        self.record(format!("insert {:?} {} <- {}", point, method, source));
        Ok(())
    }

    fn replace_body(&mut self, method: &MemberKey, source: &str)
                    -> Result<(), EditError> {
        self.require_method(method)?;
        self.record(format!("replace {} <- {}", method, source));
        Ok(())
    }

    fn add_field(&mut self, name: &str, descriptor: &str, access_flags: u16)
                 -> Result<(), EditError> {
        if self.form.find_field(name).is_some() {
            return Err(EditError::InvalidEdit(format!("field '{}' exists", name)));
        }
        self.record(format!("add_field {}:{} {:#06x}", name, descriptor,
                            access_flags));
        Ok(())
    }

    fn rename_references(&mut self, map: &HashMap<ClassName, ClassName>)
                         -> Result<(), EditError> {
        let mut pairs = map.iter()
            .map(|(from, to)| format!("{}=>{}", from, to))
            .collect::<Vec<_>>();
        pairs.sort();
        self.record(format!("rename {}", pairs.join(",")));
        Ok(())
    }

    fn emit(self: Box<Self>) -> Result<Vec<u8>, EditError> {
        Ok(self.original)
    }
}
