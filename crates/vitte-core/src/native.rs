//! native.rs — Native call bridge: signature parsing and qualifier-
//! driven argument construction (spec §3 "Qualifier", §4.8).
//!
//! A native is registered under a textual signature such as
//! `"push(ref list, val item)"`. Parsing that signature once, at
//! registration time, lets the call path skip per-call string work:
//! each parameter's `Qualifier` says how the interpreter should
//! materialize that argument's `Value` from the caller's registers
//! (by reference, by value, as a raw stack slot, cloned, or as its
//! runtime type tag), and `QualifierSignature` precomputes whether
//! any of that special-casing is needed at all.

use crate::error::VmError;
use crate::object::{Qualifier, QualifierSignature};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub qualifier: Qualifier,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSignature {
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl NativeSignature {
    pub fn arity(&self) -> u8 {
        self.params.len() as u8
    }

    pub fn qualifiers(&self) -> Vec<Qualifier> {
        self.params.iter().map(|p| p.qualifier).collect()
    }

    /// Precomputes the fast-path classification the interpreter uses
    /// to decide whether it can skip qualifier handling entirely.
    pub fn signature_shape(&self) -> QualifierSignature {
        if self.params.iter().all(|p| p.qualifier == Qualifier::Val) {
            QualifierSignature::AllNormal
        } else if self
            .params
            .iter()
            .all(|p| matches!(p.qualifier, Qualifier::Val | Qualifier::Clone | Qualifier::TypeOf))
        {
            QualifierSignature::AllNormalNoRefs
        } else {
            QualifierSignature::HasQualifiers
        }
    }
}

fn parse_qualifier(word: &str) -> Qualifier {
    match word {
        "ref" => Qualifier::Ref,
        "slot" => Qualifier::Slot,
        "clone" => Qualifier::Clone,
        "typeof" => Qualifier::TypeOf,
        _ => Qualifier::Val,
    }
}

/// Parses `"name(qual? param, qual? param, ...)"`. An empty parameter
/// list (`"name()"`) is valid and yields arity zero.
pub fn parse_signature(src: &str) -> Result<NativeSignature, VmError> {
    let src = src.trim();
    let open = src
        .find('(')
        .ok_or_else(|| VmError::Type(format!("native signature missing '(': {src:?}")))?;
    if !src.ends_with(')') {
        return Err(VmError::Type(format!("native signature missing trailing ')': {src:?}")));
    }
    let name = src[..open].trim();
    if name.is_empty() {
        return Err(VmError::Type(format!("native signature missing a name: {src:?}")));
    }
    let body = &src[open + 1..src.len() - 1];

    let mut params = Vec::new();
    for raw in body.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let mut words = raw.split_whitespace();
        let first = words
            .next()
            .ok_or_else(|| VmError::Type(format!("empty parameter in signature: {src:?}")))?;
        let second = words.next();
        let (qualifier, param_name) = match second {
            Some(name) => (parse_qualifier(first), name),
            None => (Qualifier::Val, first),
        };
        if words.next().is_some() {
            return Err(VmError::Type(format!("malformed parameter {raw:?} in {src:?}")));
        }
        params.push(ParamSpec { qualifier, name: param_name.to_owned() });
    }

    Ok(NativeSignature { name: name.to_owned(), params })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zero_arity() {
        let sig = parse_signature("now()").unwrap();
        assert_eq!(sig.name, "now");
        assert_eq!(sig.arity(), 0);
    }

    #[test]
    fn parses_mixed_qualifiers() {
        let sig = parse_signature("push(ref list, val item)").unwrap();
        assert_eq!(sig.name, "push");
        assert_eq!(sig.arity(), 2);
        assert_eq!(sig.params[0].qualifier, Qualifier::Ref);
        assert_eq!(sig.params[0].name, "list");
        assert_eq!(sig.params[1].qualifier, Qualifier::Val);
        assert_eq!(sig.signature_shape(), QualifierSignature::HasQualifiers);
    }

    #[test]
    fn all_val_params_use_fast_shape() {
        let sig = parse_signature("add(val a, val b)").unwrap();
        assert_eq!(sig.signature_shape(), QualifierSignature::AllNormal);
    }

    #[test]
    fn missing_parens_is_an_error() {
        assert!(parse_signature("oops").is_err());
    }
}
