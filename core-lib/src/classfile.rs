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

//! The class-file inspector.
//!
//! Decodes a class file just far enough to build a [`ClassForm`]: the
//! class's name, supertype, interfaces, declared members and annotation
//! sets. The inspector never loads the class, and never touches method
//! bodies; code attributes are skipped over.
//!
//! Members in a `ClassForm` are canonically ordered: methods, fields and
//! constructors by (name, descriptor), annotation sets by type name,
//! exception lists by type name. Two class files with equal attribute
//! tuples therefore parse to equal forms.

use crate::errors::SwapError;
use crate::identity::ClassName;

/// The four magic bytes that begin every class file.
pub const CLASS_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_PROTECTED: u16 = 0x0004;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;
pub const ACC_ANNOTATION: u16 = 0x2000;
pub const ACC_ENUM: u16 = 0x4000;

/// A cheap validity check used by the filesystem watcher: correct magic
/// number and enough bytes to plausibly hold a header.
pub fn is_class_file(bytes: &[u8]) -> bool {
    bytes.len() >= 16 && bytes[..4] == CLASS_MAGIC
}

/// A (name, descriptor) pair identifying a declared member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
         Serialize, Deserialize)]
pub struct MemberKey {
    pub name: String,
    pub descriptor: String,
}

impl MemberKey {
    pub fn new<S1: Into<String>, S2: Into<String>>(name: S1, descriptor: S2) -> MemberKey {
        MemberKey { name: name.into(), descriptor: descriptor.into() }
    }
}

impl ::std::fmt::Display for MemberKey {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

/// An annotation use, with its element values rendered to a canonical
/// textual form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AnnotationInfo {
    /// The annotation's type, as a dotted binary name.
    pub type_name: String,
    /// Element name / rendered value pairs, sorted by element name.
    pub values: Vec<(String, String)>,
}

/// A declared method, constructor or field.
///
/// For fields, `parameter_annotations` and `exceptions` are empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemberInfo {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub annotations: Vec<AnnotationInfo>,
    pub parameter_annotations: Vec<Vec<AnnotationInfo>>,
    pub exceptions: Vec<ClassName>,
}

impl MemberInfo {
    pub fn key(&self) -> MemberKey {
        MemberKey::new(self.name.as_str(), self.descriptor.as_str())
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & ACC_PRIVATE != 0
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_synthetic(&self) -> bool {
        self.access_flags & ACC_SYNTHETIC != 0
    }
}

/// The structural summary of a class, derivable from its bytes without
/// loading it.
///
/// The class initialiser (`<clinit>`) is never represented; constructors
/// (`<init>`) are kept separate from methods so that a class declaring
/// nothing but constructors has an empty method set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassForm {
    pub name: ClassName,
    pub super_name: Option<ClassName>,
    pub interfaces: Vec<ClassName>,
    pub access_flags: u16,
    /// Class-file version, as (major, minor).
    pub version: (u16, u16),
    pub methods: Vec<MemberInfo>,
    pub constructors: Vec<MemberInfo>,
    pub fields: Vec<MemberInfo>,
    pub annotations: Vec<AnnotationInfo>,
}

impl ClassForm {
    pub fn find_method(&self, key: &MemberKey) -> Option<&MemberInfo> {
        self.methods.iter().find(|m| &m.key() == key)
    }

    pub fn find_field(&self, name: &str) -> Option<&MemberInfo> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn malformed(detail: &str) -> SwapError {
    SwapError::MalformedClass(detail.to_owned())
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> ByteReader<'a> {
        ByteReader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SwapError> {
        if self.pos + n > self.bytes.len() {
            return Err(malformed("unexpected end of class file"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SwapError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SwapError> {
        let b = self.take(2)?;
        Ok((u16::from(b[0]) << 8) | u16::from(b[1]))
    }

    fn u32(&mut self) -> Result<u32, SwapError> {
        let b = self.take(4)?;
        Ok((u32::from(b[0]) << 24) | (u32::from(b[1]) << 16)
            | (u32::from(b[2]) << 8) | u32::from(b[3]))
    }

    fn skip(&mut self, n: usize) -> Result<(), SwapError> {
        self.take(n).map(|_| ())
    }
}

/// One slot of the constant pool. Only the entries the inspector needs
/// are retained in full; the rest are recorded as `Other` so indices
/// stay aligned.
enum CpEntry {
    Utf8(String),
    Class(u16),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Other,
    /// The phantom slot following a Long or Double entry.
    Wide,
}

struct ConstantPool(Vec<CpEntry>);

impl ConstantPool {
    fn get(&self, idx: u16) -> Result<&CpEntry, SwapError> {
        if idx == 0 || idx as usize > self.0.len() {
            return Err(malformed("constant pool index out of range"));
        }
        Ok(&self.0[idx as usize - 1])
    }

    fn utf8(&self, idx: u16) -> Result<&str, SwapError> {
        match self.get(idx)? {
            CpEntry::Utf8(ref s) => Ok(s),
            _ => Err(malformed("expected Utf8 constant")),
        }
    }

    fn class_name(&self, idx: u16) -> Result<ClassName, SwapError> {
        match self.get(idx)? {
            &CpEntry::Class(name_idx) => {
                Ok(ClassName::from_internal(self.utf8(name_idx)?))
            }
            _ => Err(malformed("expected Class constant")),
        }
    }
}

fn read_constant_pool(r: &mut ByteReader) -> Result<ConstantPool, SwapError> {
    let count = r.u16()?;
    if count == 0 {
        return Err(malformed("empty constant pool"));
    }
    let mut entries = Vec::with_capacity(count as usize - 1);
    let mut i = 1;
    while i < count {
        let tag = r.u8()?;
        let entry = match tag {
            1 => {
                let len = r.u16()? as usize;
                let bytes = r.take(len)?;
                CpEntry::Utf8(String::from_utf8_lossy(bytes).into_owned())
            }
            3 => CpEntry::Integer(r.u32()? as i32),
            4 => CpEntry::Float(r.u32()?),
            5 => {
                let hi = r.u32()?;
                let lo = r.u32()?;
                CpEntry::Long(((u64::from(hi) << 32) | u64::from(lo)) as i64)
            }
            6 => {
                let hi = r.u32()?;
                let lo = r.u32()?;
                CpEntry::Double((u64::from(hi) << 32) | u64::from(lo))
            }
            7 => CpEntry::Class(r.u16()?),
            9 | 10 | 11 | 12 | 17 | 18 => {
                r.skip(4)?;
                CpEntry::Other
            }
            15 => {
                r.skip(3)?;
                CpEntry::Other
            }
            8 | 16 | 19 | 20 => {
                r.skip(2)?;
                CpEntry::Other
            }
            _ => return Err(malformed("unknown constant pool tag")),
        };
        let is_wide = match entry {
            CpEntry::Long(..) | CpEntry::Double(..) => true,
            _ => false,
        };
        entries.push(entry);
        if is_wide {
            entries.push(CpEntry::Wide);
            i += 1;
        }
        i += 1;
    }
    Ok(ConstantPool(entries))
}

fn render_element_value(r: &mut ByteReader, pool: &ConstantPool)
                        -> Result<String, SwapError> {
    let tag = r.u8()?;
    match tag {
        b'B' | b'C' | b'I' | b'S' | b'Z' => {
            let idx = r.u16()?;
            match pool.get(idx)? {
                &CpEntry::Integer(v) => Ok(v.to_string()),
                _ => Err(malformed("expected integer constant")),
            }
        }
        b'J' => {
            let idx = r.u16()?;
            match pool.get(idx)? {
                &CpEntry::Long(v) => Ok(v.to_string()),
                _ => Err(malformed("expected long constant")),
            }
        }
        b'F' => {
            let idx = r.u16()?;
            match pool.get(idx)? {
                &CpEntry::Float(bits) => Ok(format!("float:{:#x}", bits)),
                _ => Err(malformed("expected float constant")),
            }
        }
        b'D' => {
            let idx = r.u16()?;
            match pool.get(idx)? {
                &CpEntry::Double(bits) => Ok(format!("double:{:#x}", bits)),
                _ => Err(malformed("expected double constant")),
            }
        }
        b's' => {
            let idx = r.u16()?;
            match pool.get(idx)? {
                &CpEntry::Utf8(ref s) => Ok(format!("\"{}\"", s)),
                _ => Err(malformed("expected string constant")),
            }
        }
        b'e' => {
            let type_idx = r.u16()?;
            let const_idx = r.u16()?;
            Ok(format!("{}.{}",
                       descriptor_to_name(pool.utf8(type_idx)?),
                       pool.utf8(const_idx)?))
        }
        b'c' => {
            let idx = r.u16()?;
            Ok(format!("class {}", descriptor_to_name(pool.utf8(idx)?)))
        }
        b'@' => {
            let nested = read_annotation(r, pool)?;
            let values = nested.values.iter()
                .map(|&(ref k, ref v)| format!("{}={}", k, v))
                .collect::<Vec<_>>();
            Ok(format!("@{}({})", nested.type_name, values.join(",")))
        }
        b'[' => {
            let count = r.u16()?;
            let mut parts = Vec::with_capacity(count as usize);
            for _ in 0..count {
                parts.push(render_element_value(r, pool)?);
            }
            Ok(format!("[{}]", parts.join(",")))
        }
        _ => Err(malformed("unknown annotation element tag")),
    }
}

/// `Lcom/foo/Ann;` → `com.foo.Ann`; non-reference descriptors are
/// returned unchanged.
fn descriptor_to_name(descriptor: &str) -> String {
    if descriptor.starts_with('L') && descriptor.ends_with(';') {
        descriptor[1..descriptor.len() - 1].replace('/', ".")
    } else {
        descriptor.to_owned()
    }
}

fn read_annotation(r: &mut ByteReader, pool: &ConstantPool)
                   -> Result<AnnotationInfo, SwapError> {
    let type_idx = r.u16()?;
    let type_name = descriptor_to_name(pool.utf8(type_idx)?);
    let num_pairs = r.u16()?;
    let mut values = Vec::with_capacity(num_pairs as usize);
    for _ in 0..num_pairs {
        let name = pool.utf8(r.u16()?)?.to_owned();
        let value = render_element_value(r, pool)?;
        values.push((name, value));
    }
    values.sort();
    Ok(AnnotationInfo { type_name, values })
}

fn read_annotations(r: &mut ByteReader, pool: &ConstantPool)
                    -> Result<Vec<AnnotationInfo>, SwapError> {
    let count = r.u16()?;
    let mut annotations = Vec::with_capacity(count as usize);
    for _ in 0..count {
        annotations.push(read_annotation(r, pool)?);
    }
    Ok(annotations)
}

struct MemberAttrs {
    annotations: Vec<AnnotationInfo>,
    parameter_annotations: Vec<Vec<AnnotationInfo>>,
    exceptions: Vec<ClassName>,
}

fn read_member_attributes(r: &mut ByteReader, pool: &ConstantPool)
                          -> Result<MemberAttrs, SwapError> {
    let mut attrs = MemberAttrs {
        annotations: Vec::new(),
        parameter_annotations: Vec::new(),
        exceptions: Vec::new(),
    };
    let count = r.u16()?;
    for _ in 0..count {
        let name_idx = r.u16()?;
        let len = r.u32()? as usize;
        let body = r.take(len)?;
        let name = pool.utf8(name_idx)?;
        let mut body_reader = ByteReader::new(body);
        match name {
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                attrs.annotations.extend(read_annotations(&mut body_reader, pool)?);
            }
            "RuntimeVisibleParameterAnnotations"
            | "RuntimeInvisibleParameterAnnotations" => {
                let num_params = body_reader.u8()?;
                for param in 0..num_params as usize {
                    let anns = read_annotations(&mut body_reader, pool)?;
                    while attrs.parameter_annotations.len() <= param {
                        attrs.parameter_annotations.push(Vec::new());
                    }
                    attrs.parameter_annotations[param].extend(anns);
                }
            }
            "Exceptions" => {
                let num = body_reader.u16()?;
                for _ in 0..num {
                    attrs.exceptions.push(pool.class_name(body_reader.u16()?)?);
                }
            }
            _ => (),
        }
    }
    attrs.annotations.sort();
    for anns in &mut attrs.parameter_annotations {
        anns.sort();
    }
    attrs.exceptions.sort();
    Ok(attrs)
}

fn read_member(r: &mut ByteReader, pool: &ConstantPool)
               -> Result<MemberInfo, SwapError> {
    let access_flags = r.u16()?;
    let name = pool.utf8(r.u16()?)?.to_owned();
    let descriptor = pool.utf8(r.u16()?)?.to_owned();
    let attrs = read_member_attributes(r, pool)?;
    Ok(MemberInfo {
        name,
        descriptor,
        access_flags,
        annotations: attrs.annotations,
        parameter_annotations: attrs.parameter_annotations,
        exceptions: attrs.exceptions,
    })
}

/// Parses class bytes into a [`ClassForm`].
pub fn read_form(bytes: &[u8]) -> Result<ClassForm, SwapError> {
    let mut r = ByteReader::new(bytes);
    let magic = r.take(4)?;
    if magic != CLASS_MAGIC {
        return Err(malformed("bad magic number"));
    }
    let minor = r.u16()?;
    let major = r.u16()?;
    let pool = read_constant_pool(&mut r)?;

    let access_flags = r.u16()?;
    let this_class = r.u16()?;
    let name = pool.class_name(this_class)?;
    let super_idx = r.u16()?;
    let super_name = if super_idx == 0 {
        None
    } else {
        Some(pool.class_name(super_idx)?)
    };

    let interface_count = r.u16()?;
    let mut interfaces = Vec::with_capacity(interface_count as usize);
    for _ in 0..interface_count {
        interfaces.push(pool.class_name(r.u16()?)?);
    }
    interfaces.sort();

    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        fields.push(read_member(&mut r, &pool)?);
    }

    let method_count = r.u16()?;
    let mut methods = Vec::new();
    let mut constructors = Vec::new();
    for _ in 0..method_count {
        let member = read_member(&mut r, &pool)?;
        match member.name.as_str() {
            // the class initialiser is never part of a form
            "<clinit>" => (),
            "<init>" => constructors.push(member),
            _ => methods.push(member),
        }
    }

    let mut annotations = Vec::new();
    let attr_count = r.u16()?;
    for _ in 0..attr_count {
        let name_idx = r.u16()?;
        let len = r.u32()? as usize;
        let body = r.take(len)?;
        let attr_name = pool.utf8(name_idx)?;
        if attr_name == "RuntimeVisibleAnnotations"
            || attr_name == "RuntimeInvisibleAnnotations"
        {
            let mut body_reader = ByteReader::new(body);
            annotations.extend(read_annotations(&mut body_reader, &pool)?);
        }
    }

    methods.sort_by(|a, b| a.key().cmp(&b.key()));
    constructors.sort_by(|a, b| a.key().cmp(&b.key()));
    fields.sort_by(|a, b| a.key().cmp(&b.key()));
    annotations.sort();

    Ok(ClassForm {
        name,
        super_name,
        interfaces,
        access_flags,
        version: (major, minor),
        methods,
        constructors,
        fields,
        annotations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ClassFileBuilder;

    #[test]
    fn reject_garbage() {
        match read_form(b"not a class file, definitely") {
            Err(SwapError::MalformedClass(..)) => (),
            other => panic!("expected MalformedClass, got {:?}", other),
        }
    }

    #[test]
    fn reject_truncated() {
        let bytes = ClassFileBuilder::new("p.A").build();
        match read_form(&bytes[..bytes.len() / 2]) {
            Err(SwapError::MalformedClass(..)) => (),
            other => panic!("expected MalformedClass, got {:?}", other),
        }
    }

    #[test]
    fn magic_check() {
        assert!(is_class_file(&ClassFileBuilder::new("p.A").build()));
        assert!(!is_class_file(b"MZ not a class"));
        assert!(!is_class_file(&CLASS_MAGIC));
    }

    #[test]
    fn basic_form() {
        let bytes = ClassFileBuilder::new("com.example.Widget")
            .interface("java.io.Serializable")
            .method("render", "()V")
            .method("size", "()I")
            .field("width", "I")
            .build();
        let form = read_form(&bytes).unwrap();
        assert_eq!(form.name, ClassName::new("com.example.Widget"));
        assert_eq!(form.super_name, Some(ClassName::new("java.lang.Object")));
        assert_eq!(form.interfaces, vec![ClassName::new("java.io.Serializable")]);
        assert_eq!(form.methods.len(), 2);
        // canonical order: by (name, descriptor)
        assert_eq!(form.methods[0].name, "render");
        assert_eq!(form.methods[1].name, "size");
        assert_eq!(form.fields.len(), 1);
        assert_eq!(form.fields[0].descriptor, "I");
    }

    #[test]
    fn initialisers_excluded_from_method_set() {
        let bytes = ClassFileBuilder::new("p.OnlyCtor")
            .constructor("()V")
            .class_initialiser()
            .build();
        let form = read_form(&bytes).unwrap();
        assert!(form.methods.is_empty());
        assert_eq!(form.constructors.len(), 1);
    }

    #[test]
    fn annotations_parsed_and_sorted() {
        let bytes = ClassFileBuilder::new("p.Annotated")
            .annotation("z.Last")
            .annotation("a.First")
            .method("go", "()V")
            .method_annotation("m.OnMethod")
            .build();
        let form = read_form(&bytes).unwrap();
        assert_eq!(form.annotations.len(), 2);
        assert_eq!(form.annotations[0].type_name, "a.First");
        assert_eq!(form.annotations[1].type_name, "z.Last");
        assert_eq!(form.methods[0].annotations[0].type_name, "m.OnMethod");
    }

    #[test]
    fn method_exceptions_parsed() {
        let bytes = ClassFileBuilder::new("p.Throws")
            .method("risky", "()V")
            .method_exception("java.io.IOException")
            .build();
        let form = read_form(&bytes).unwrap();
        assert_eq!(form.methods[0].exceptions,
                   vec![ClassName::new("java.io.IOException")]);
    }

    #[test]
    fn body_change_leaves_form_equal() {
        let v1 = ClassFileBuilder::new("p.Body")
            .method("f", "()I")
            .body(&[1])
            .build();
        let v2 = ClassFileBuilder::new("p.Body")
            .method("f", "()I")
            .body(&[2])
            .build();
        assert_ne!(v1, v2);
        assert_eq!(read_form(&v1).unwrap(), read_form(&v2).unwrap());
    }
}
