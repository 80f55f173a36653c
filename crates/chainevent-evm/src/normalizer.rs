//! Converts alloy `DynSolValue` → chainevent `FieldValue`.

use alloy_dyn_abi::DynSolValue;
use alloy_json_abi::Param;
use chainevent_core::types::FieldValue;

/// Component names of a parameter type, mirroring its tuple/array nesting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldNames {
    /// Not a tuple, or a tuple without names: components are keyed by position.
    #[default]
    Positional,
    Tuple(Vec<(String, FieldNames)>),
    Array(Box<FieldNames>),
}

impl FieldNames {
    /// Names for an ABI type string (`tuple`, `tuple[]`, `tuple[2][]`, ...)
    /// and its `components`.
    pub fn from_abi(ty: &str, components: &[Param]) -> Self {
        if components.is_empty() {
            return FieldNames::Positional;
        }
        let mut names = FieldNames::Tuple(
            components
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let name = if c.name.is_empty() {
                        i.to_string()
                    } else {
                        c.name.clone()
                    };
                    (name, FieldNames::from_abi(&c.ty, &c.components))
                })
                .collect(),
        );
        for _ in 0..ty.matches('[').count() {
            names = FieldNames::Array(Box::new(names));
        }
        names
    }
}

/// Convert a decoded `DynSolValue` into a `FieldValue`, tuple components keyed by position.
pub fn normalize(val: DynSolValue) -> FieldValue {
    normalize_named(val, &FieldNames::Positional)
}

/// Like [`normalize`], keying tuple components by their ABI names.
pub fn normalize_named(val: DynSolValue, names: &FieldNames) -> FieldValue {
    match val {
        DynSolValue::Bool(b) => FieldValue::Bool(b),

        DynSolValue::Int(i, _bits) => match i128::try_from(i) {
            Ok(v) => FieldValue::Int(v),
            Err(_) => FieldValue::BigInt(i.to_string()),
        },

        DynSolValue::Uint(u, _bits) => match u128::try_from(u) {
            Ok(v) => FieldValue::Uint(v),
            Err(_) => FieldValue::BigUint(u.to_string()),
        },

        // Only the first `size` bytes of the word are meaningful
        DynSolValue::FixedBytes(word, size) => FieldValue::Bytes(word[..size.min(32)].to_vec()),

        DynSolValue::Bytes(b) => FieldValue::Bytes(b),

        DynSolValue::String(s) => FieldValue::Str(s),

        DynSolValue::Address(a) => FieldValue::Address(format!("0x{}", hex::encode(a.as_slice()))),

        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) => {
            let inner = match names {
                FieldNames::Array(inner) => inner.as_ref(),
                _ => &FieldNames::Positional,
            };
            FieldValue::Array(vals.into_iter().map(|v| normalize_named(v, inner)).collect())
        }

        DynSolValue::Tuple(fields) => {
            let components: &[(String, FieldNames)] = match names {
                FieldNames::Tuple(components) => components,
                _ => &[],
            };
            FieldValue::Tuple(
                fields
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| match components.get(i) {
                        Some((name, inner)) => (name.clone(), normalize_named(v, inner)),
                        None => (i.to_string(), normalize(v)),
                    })
                    .collect(),
            )
        }

        DynSolValue::Function(f) => FieldValue::Bytes(f.to_vec()),

        #[allow(unreachable_patterns)]
        other => FieldValue::Str(format!("{other:?}")),
    }
}
