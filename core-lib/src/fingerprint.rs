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

//! Structural fingerprints.
//!
//! A [`Fingerprint`] is a deterministic digest over a canonical
//! projection of a [`ClassForm`]. The projection is parameterised by a
//! [`FingerprintPolicy`] naming the signature elements to include;
//! synthetic members and the class initialiser are always excluded.

use std::collections::HashSet;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::classfile::{ClassForm, MemberInfo};

/// Member-name prefixes emitted by compilers for synthetic helpers
/// (accessor bridges, lambda bodies, switch tables).
const SYNTHETIC_PREFIXES: &[&str] = &["access$", "lambda$", "$"];

/// One element of a class's structural signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureElement {
    Methods,
    PrivateMethods,
    StaticMethods,
    MethodAnnotations,
    MethodParameterAnnotations,
    MethodExceptions,
    Constructors,
    PrivateConstructors,
    ClassAnnotations,
    Interfaces,
    SuperClass,
    Fields,
    StaticFields,
    FieldAnnotations,
}

impl SignatureElement {
    pub fn all() -> &'static [SignatureElement] {
        use self::SignatureElement::*;
        &[Methods, PrivateMethods, StaticMethods, MethodAnnotations,
          MethodParameterAnnotations, MethodExceptions, Constructors,
          PrivateConstructors, ClassAnnotations, Interfaces, SuperClass,
          Fields, StaticFields, FieldAnnotations]
    }

    /// Parses the kebab-case name used in configuration files.
    pub fn from_name(name: &str) -> Option<SignatureElement> {
        use self::SignatureElement::*;
        let element = match name {
            "methods" => Methods,
            "private-methods" => PrivateMethods,
            "static-methods" => StaticMethods,
            "method-annotations" => MethodAnnotations,
            "method-parameter-annotations" => MethodParameterAnnotations,
            "method-exceptions" => MethodExceptions,
            "constructors" => Constructors,
            "private-constructors" => PrivateConstructors,
            "class-annotations" => ClassAnnotations,
            "interfaces" => Interfaces,
            "super-class" => SuperClass,
            "fields" => Fields,
            "static-fields" => StaticFields,
            "field-annotations" => FieldAnnotations,
            _ => return None,
        };
        Some(element)
    }
}

/// The set of signature elements included in a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintPolicy {
    elements: HashSet<SignatureElement>,
}

impl FingerprintPolicy {
    pub fn new<I: IntoIterator<Item = SignatureElement>>(elements: I) -> Self {
        FingerprintPolicy { elements: elements.into_iter().collect() }
    }

    /// Builds a policy from configured element names. Unrecognised names
    /// are skipped with a warning rather than failing the whole config.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> FingerprintPolicy {
        let mut elements = HashSet::new();
        for name in names {
            match SignatureElement::from_name(name.as_ref()) {
                Some(element) => {
                    elements.insert(element);
                }
                None => warn!("unknown fingerprint policy element '{}'", name.as_ref()),
            }
        }
        FingerprintPolicy { elements }
    }

    pub fn includes(&self, element: SignatureElement) -> bool {
        self.elements.contains(&element)
    }
}

impl Default for FingerprintPolicy {
    fn default() -> FingerprintPolicy {
        FingerprintPolicy::new(SignatureElement::all().iter().cloned())
    }
}

/// A deterministic digest of a class's projected structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Digests arbitrary bytes; used for transformer cache keys and
/// identical-bytes short-circuiting.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.input(bytes);
    to_hex(&hasher.result())
}

/// `true` for members that are compiler-generated helpers; these never
/// participate in a fingerprint.
pub fn is_synthetic_member(member: &MemberInfo) -> bool {
    member.is_synthetic()
        || SYNTHETIC_PREFIXES.iter().any(|p| member.name.starts_with(p))
}

fn member_included(member: &MemberInfo, policy: &FingerprintPolicy,
                   base: SignatureElement, private_gate: SignatureElement,
                   static_gate: Option<SignatureElement>) -> bool {
    if is_synthetic_member(member) || !policy.includes(base) {
        return false;
    }
    if member.is_private() && !policy.includes(private_gate) {
        return false;
    }
    if let Some(static_gate) = static_gate {
        if member.is_static() && !policy.includes(static_gate) {
            return false;
        }
    }
    true
}

fn push_annotations(out: &mut String, annotations: &[crate::classfile::AnnotationInfo]) {
    for ann in annotations {
        out.push_str(" @");
        out.push_str(&ann.type_name);
        for &(ref name, ref value) in &ann.values {
            out.push_str(&format!("({}={})", name, value));
        }
    }
}

fn push_member(out: &mut String, member: &MemberInfo, policy: &FingerprintPolicy,
               kind: &str, is_method: bool) {
    out.push_str(kind);
    out.push(' ');
    out.push_str(&format!("{:#06x} ", member.access_flags));
    out.push_str(&member.name);
    out.push_str(&member.descriptor);
    if is_method {
        if policy.includes(SignatureElement::MethodAnnotations) {
            push_annotations(out, &member.annotations);
        }
        if policy.includes(SignatureElement::MethodParameterAnnotations) {
            for (i, anns) in member.parameter_annotations.iter().enumerate() {
                if !anns.is_empty() {
                    out.push_str(&format!(" p{}:", i));
                    push_annotations(out, anns);
                }
            }
        }
        if policy.includes(SignatureElement::MethodExceptions)
            && !member.exceptions.is_empty()
        {
            out.push_str(" throws");
            for exc in &member.exceptions {
                out.push(' ');
                out.push_str(exc.as_str());
            }
        }
    } else if policy.includes(SignatureElement::FieldAnnotations) {
        push_annotations(out, &member.annotations);
    }
    out.push('\n');
}

/// Computes the fingerprint of `form` under `policy`.
///
/// Members of a `ClassForm` are already canonically sorted, so the
/// projection (and therefore the digest) is stable across runs and
/// across re-parsed forms.
pub fn fingerprint(form: &ClassForm, policy: &FingerprintPolicy) -> Fingerprint {
    use self::SignatureElement::*;

    let mut projection = String::new();
    projection.push_str("class ");
    projection.push_str(form.name.as_str());
    projection.push('\n');

    if policy.includes(SuperClass) {
        if let Some(ref super_name) = form.super_name {
            projection.push_str("super ");
            projection.push_str(super_name.as_str());
            projection.push('\n');
        }
    }
    if policy.includes(Interfaces) {
        for interface in &form.interfaces {
            projection.push_str("interface ");
            projection.push_str(interface.as_str());
            projection.push('\n');
        }
    }
    if policy.includes(ClassAnnotations) && !form.annotations.is_empty() {
        projection.push_str("annotations");
        push_annotations(&mut projection, &form.annotations);
        projection.push('\n');
    }

    for method in &form.methods {
        if member_included(method, policy, Methods, PrivateMethods,
                           Some(StaticMethods)) {
            push_member(&mut projection, method, policy, "method", true);
        }
    }
    for ctor in &form.constructors {
        if member_included(ctor, policy, Constructors, PrivateConstructors, None) {
            push_member(&mut projection, ctor, policy, "constructor", true);
        }
    }
    for field in &form.fields {
        if member_included(field, policy, Fields, Fields, Some(StaticFields)) {
            push_member(&mut projection, field, policy, "field", false);
        }
    }

    let mut hasher = Sha256::new();
    hasher.input(projection.as_bytes());
    Fingerprint(to_hex(&hasher.result()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{read_form, ACC_PRIVATE, ACC_STATIC};
    use crate::test_helpers::ClassFileBuilder;

    fn form_of(bytes: &[u8]) -> ClassForm {
        read_form(bytes).unwrap()
    }

    #[test]
    fn stable_across_reads() {
        let bytes = ClassFileBuilder::new("p.Stable")
            .method("f", "()I")
            .field("x", "J")
            .build();
        let policy = FingerprintPolicy::default();
        let fp1 = fingerprint(&form_of(&bytes), &policy);
        let fp2 = fingerprint(&form_of(&bytes), &policy);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn body_change_keeps_fingerprint() {
        let policy = FingerprintPolicy::default();
        let v1 = ClassFileBuilder::new("p.B").method("f", "()I").body(&[1]).build();
        let v2 = ClassFileBuilder::new("p.B").method("f", "()I").body(&[2]).build();
        assert_eq!(fingerprint(&form_of(&v1), &policy),
                   fingerprint(&form_of(&v2), &policy));
    }

    #[test]
    fn added_method_changes_fingerprint() {
        let policy = FingerprintPolicy::default();
        let v1 = ClassFileBuilder::new("p.C").method("f", "()I").build();
        let v2 = ClassFileBuilder::new("p.C")
            .method("f", "()I")
            .method("g", "()I")
            .build();
        assert_ne!(fingerprint(&form_of(&v1), &policy),
                   fingerprint(&form_of(&v2), &policy));
    }

    #[test]
    fn private_methods_gated_by_policy() {
        let with_private = ClassFileBuilder::new("p.D")
            .method("f", "()I")
            .method_with_flags("secret", "()I", ACC_PRIVATE)
            .build();
        let without = ClassFileBuilder::new("p.D").method("f", "()I").build();

        let no_private = FingerprintPolicy::new(
            vec![SignatureElement::Methods, SignatureElement::SuperClass]);
        assert_eq!(fingerprint(&form_of(&with_private), &no_private),
                   fingerprint(&form_of(&without), &no_private));

        let full = FingerprintPolicy::default();
        assert_ne!(fingerprint(&form_of(&with_private), &full),
                   fingerprint(&form_of(&without), &full));
    }

    #[test]
    fn synthetic_members_always_excluded() {
        let plain = ClassFileBuilder::new("p.E").method("f", "()I").build();
        let synthetic = ClassFileBuilder::new("p.E")
            .method("f", "()I")
            .method_with_flags("access$000", "()I", ACC_STATIC)
            .field("$SWITCH_TABLE$p$Color", "[I")
            .build();
        let policy = FingerprintPolicy::default();
        assert_eq!(fingerprint(&form_of(&plain), &policy),
                   fingerprint(&form_of(&synthetic), &policy));
    }

    #[test]
    fn policy_from_names_skips_unknown() {
        let policy = FingerprintPolicy::from_names(&["methods", "not-a-thing"]);
        assert!(policy.includes(SignatureElement::Methods));
        assert!(!policy.includes(SignatureElement::Fields));
    }

    #[test]
    fn digest_bytes_is_stable() {
        assert_eq!(digest_bytes(b"abc"), digest_bytes(b"abc"));
        assert_ne!(digest_bytes(b"abc"), digest_bytes(b"abd"));
    }
}
