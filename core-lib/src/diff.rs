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

//! The signature differ.
//!
//! Compares two [`ClassForm`]s and produces a [`StructuralDiff`]
//! enumerating member-level changes. Method bodies are invisible at
//! this level: a class whose bytes changed but whose diff is empty has
//! only body changes.

use crate::classfile::{ClassForm, MemberInfo, MemberKey};

/// The structural changes between an old and a new form of a class.
///
/// `diff(a, b)` and `diff(b, a)` are symmetric: the added sets and
/// removed sets swap, and everything else is identical.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructuralDiff {
    pub methods_added: Vec<MemberKey>,
    pub methods_removed: Vec<MemberKey>,
    /// Methods present on both sides under the same name whose
    /// descriptor or modifiers changed.
    pub methods_signature_changed: Vec<MemberKey>,
    pub method_annotations_changed: Vec<MemberKey>,
    pub fields_added: Vec<MemberKey>,
    pub fields_removed: Vec<MemberKey>,
    /// Names of fields whose descriptor changed.
    pub fields_type_changed: Vec<String>,
    pub class_annotations_changed: bool,
    pub supertype_changed: bool,
    pub interfaces_changed: bool,
}

impl StructuralDiff {
    /// `true` iff nothing structural changed: no member-set changes, no
    /// signature changes, no supertype or interface changes.
    ///
    /// Annotation-only changes are not structural; the native redefine
    /// primitive tolerates them.
    pub fn is_structural(&self) -> bool {
        !self.methods_added.is_empty()
            || !self.methods_removed.is_empty()
            || !self.methods_signature_changed.is_empty()
            || !self.fields_added.is_empty()
            || !self.fields_removed.is_empty()
            || !self.fields_type_changed.is_empty()
            || self.supertype_changed
            || self.interfaces_changed
    }

    /// `true` iff the diff records no changes at all; with changed
    /// bytes, this means every change was inside a method body.
    pub fn body_only(&self) -> bool {
        !self.is_structural()
            && self.method_annotations_changed.is_empty()
            && !self.class_annotations_changed
    }

    /// A short human-readable summary of the change kinds present,
    /// used in diagnostics for rejected redefinitions.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.methods_added.is_empty() {
            parts.push(format!("{} method(s) added", self.methods_added.len()));
        }
        if !self.methods_removed.is_empty() {
            parts.push(format!("{} method(s) removed", self.methods_removed.len()));
        }
        if !self.methods_signature_changed.is_empty() {
            parts.push(format!("{} method signature(s) changed",
                               self.methods_signature_changed.len()));
        }
        if !self.method_annotations_changed.is_empty() {
            parts.push(format!("{} method annotation set(s) changed",
                               self.method_annotations_changed.len()));
        }
        if !self.fields_added.is_empty() {
            parts.push(format!("{} field(s) added", self.fields_added.len()));
        }
        if !self.fields_removed.is_empty() {
            parts.push(format!("{} field(s) removed", self.fields_removed.len()));
        }
        if !self.fields_type_changed.is_empty() {
            parts.push(format!("{} field type(s) changed",
                               self.fields_type_changed.len()));
        }
        if self.class_annotations_changed {
            parts.push("class annotations changed".to_owned());
        }
        if self.supertype_changed {
            parts.push("supertype changed".to_owned());
        }
        if self.interfaces_changed {
            parts.push("interfaces changed".to_owned());
        }
        if parts.is_empty() {
            "no structural changes".to_owned()
        } else {
            parts.join(", ")
        }
    }
}

fn diff_methods(old: &[MemberInfo], new: &[MemberInfo], out: &mut StructuralDiff) {
    for method in new {
        match old.iter().find(|m| m.key() == method.key()) {
            Some(prev) => {
                if prev.access_flags != method.access_flags
                    || prev.exceptions != method.exceptions
                {
                    out.methods_signature_changed.push(method.key());
                } else if prev.annotations != method.annotations
                    || prev.parameter_annotations != method.parameter_annotations
                {
                    out.method_annotations_changed.push(method.key());
                }
            }
            None => {
                // same name on exactly one overload each side is a
                // descriptor change, not an add/remove pair
                let old_same_name = old.iter()
                    .filter(|m| m.name == method.name)
                    .collect::<Vec<_>>();
                let new_same_name = new.iter()
                    .filter(|m| m.name == method.name)
                    .count();
                if old_same_name.len() == 1 && new_same_name == 1
                    && new.iter().all(|m| m.key() != old_same_name[0].key())
                {
                    out.methods_signature_changed.push(method.key());
                } else {
                    out.methods_added.push(method.key());
                }
            }
        }
    }
    for method in old {
        if new.iter().any(|m| m.key() == method.key()) {
            continue;
        }
        let new_same_name = new.iter().filter(|m| m.name == method.name).count();
        let old_same_name = old.iter().filter(|m| m.name == method.name).count();
        if old_same_name == 1 && new_same_name == 1 {
            // already recorded as a signature change
            continue;
        }
        out.methods_removed.push(method.key());
    }
}

fn diff_fields(old: &[MemberInfo], new: &[MemberInfo], out: &mut StructuralDiff) {
    for field in new {
        match old.iter().find(|f| f.name == field.name) {
            Some(prev) => {
                if prev.descriptor != field.descriptor {
                    out.fields_type_changed.push(field.name.clone());
                }
            }
            None => out.fields_added.push(field.key()),
        }
    }
    for field in old {
        if !new.iter().any(|f| f.name == field.name) {
            out.fields_removed.push(field.key());
        }
    }
}

/// Computes the structural diff between two forms of a class.
pub fn diff(old: &ClassForm, new: &ClassForm) -> StructuralDiff {
    let mut out = StructuralDiff::default();

    diff_methods(&old.methods, &new.methods, &mut out);
    diff_fields(&old.fields, &new.fields, &mut out);

    // constructor set changes behave like method set changes
    diff_methods(&old.constructors, &new.constructors, &mut out);

    out.class_annotations_changed = old.annotations != new.annotations;
    out.supertype_changed = old.super_name != new.super_name;
    out.interfaces_changed = old.interfaces != new.interfaces;

    out.methods_added.sort();
    out.methods_removed.sort();
    out.methods_signature_changed.sort();
    out.method_annotations_changed.sort();
    out.fields_added.sort();
    out.fields_removed.sort();
    out.fields_type_changed.sort();
    out
}
