use std::fmt;
use std::sync::Arc;

use crate::error::{DbError, Result};

/// Closed set of named arithmetic primitives. The token spellings are part
/// of the on-disk descriptor grammar, so two kinds of the same width (for
/// example `longint` and `longlongint`) stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Int,
    UnsignedInt,
    ShortInt,
    ShortUnsignedInt,
    LongInt,
    LongUnsignedInt,
    LongLongInt,
    LongLongUnsignedInt,
    Float,
    Double,
    Bool,
    Char,
    SignedChar,
    UnsignedChar,
    WideChar,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 15] = [
        PrimitiveKind::Int,
        PrimitiveKind::UnsignedInt,
        PrimitiveKind::ShortInt,
        PrimitiveKind::ShortUnsignedInt,
        PrimitiveKind::LongInt,
        PrimitiveKind::LongUnsignedInt,
        PrimitiveKind::LongLongInt,
        PrimitiveKind::LongLongUnsignedInt,
        PrimitiveKind::Float,
        PrimitiveKind::Double,
        PrimitiveKind::Bool,
        PrimitiveKind::Char,
        PrimitiveKind::SignedChar,
        PrimitiveKind::UnsignedChar,
        PrimitiveKind::WideChar,
    ];

    pub fn token(self) -> &'static str {
        match self {
            PrimitiveKind::Int => "int",
            PrimitiveKind::UnsignedInt => "unsignedint",
            PrimitiveKind::ShortInt => "shortint",
            PrimitiveKind::ShortUnsignedInt => "shortunsignedint",
            PrimitiveKind::LongInt => "longint",
            PrimitiveKind::LongUnsignedInt => "longunsignedint",
            PrimitiveKind::LongLongInt => "longlongint",
            PrimitiveKind::LongLongUnsignedInt => "longlongunsignedint",
            PrimitiveKind::Float => "float",
            PrimitiveKind::Double => "double",
            PrimitiveKind::Bool => "bool",
            PrimitiveKind::Char => "char",
            PrimitiveKind::SignedChar => "signedchar",
            PrimitiveKind::UnsignedChar => "unsignedchar",
            PrimitiveKind::WideChar => "wchar_t",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.token() == token)
    }

    /// Encoded byte width.
    pub fn size(self) -> u64 {
        match self {
            PrimitiveKind::Bool
            | PrimitiveKind::Char
            | PrimitiveKind::SignedChar
            | PrimitiveKind::UnsignedChar => 1,
            PrimitiveKind::ShortInt | PrimitiveKind::ShortUnsignedInt => 2,
            PrimitiveKind::Int
            | PrimitiveKind::UnsignedInt
            | PrimitiveKind::Float
            | PrimitiveKind::WideChar => 4,
            PrimitiveKind::LongInt
            | PrimitiveKind::LongUnsignedInt
            | PrimitiveKind::LongLongInt
            | PrimitiveKind::LongLongUnsignedInt
            | PrimitiveKind::Double => 8,
        }
    }
}

/// A schema descriptor. Classes are compared by canonical serialized form;
/// composite classes share their components through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub enum Class {
    Primitive {
        kind: PrimitiveKind,
        name: String,
    },
    Str {
        name: String,
    },
    Struct {
        name: String,
        fields: Vec<Arc<Class>>,
    },
    Relation {
        name: String,
        ingress: Arc<Class>,
        egress: Arc<Class>,
        attrs: Vec<Arc<Class>>,
    },
}

impl Class {
    pub fn primitive(kind: PrimitiveKind, name: &str) -> Result<Arc<Self>> {
        validate_name(name)?;
        Ok(Arc::new(Class::Primitive {
            kind,
            name: name.to_owned(),
        }))
    }

    pub fn string(name: &str) -> Result<Arc<Self>> {
        validate_name(name)?;
        Ok(Arc::new(Class::Str {
            name: name.to_owned(),
        }))
    }

    pub fn structure(name: &str, fields: Vec<Arc<Class>>) -> Result<Arc<Self>> {
        validate_name(name)?;
        Ok(Arc::new(Class::Struct {
            name: name.to_owned(),
            fields,
        }))
    }

    pub fn relation(
        name: &str,
        ingress: Arc<Class>,
        egress: Arc<Class>,
        attrs: Vec<Arc<Class>>,
    ) -> Result<Arc<Self>> {
        validate_name(name)?;
        Ok(Arc::new(Class::Relation {
            name: name.to_owned(),
            ingress,
            egress,
            attrs,
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Class::Primitive { name, .. }
            | Class::Str { name }
            | Class::Struct { name, .. }
            | Class::Relation { name, .. } => name,
        }
    }

    /// Canonical serialized form; whitespace is stripped on emission. Two
    /// classes are the same catalog entry iff these strings are byte-equal.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out.retain(|c| !c.is_whitespace());
        out
    }

    fn serialize_into(&self, out: &mut String) {
        match self {
            Class::Primitive { kind, name } => {
                out.push('_');
                out.push_str(kind.token());
                out.push('@');
                out.push_str(name);
                out.push('_');
            }
            Class::Str { name } => {
                out.push_str("_string@");
                out.push_str(name);
                out.push('_');
            }
            Class::Struct { name, fields } => {
                out.push_str("_struct@");
                out.push_str(name);
                out.push_str("_<");
                for field in fields {
                    field.serialize_into(out);
                }
                out.push('>');
            }
            Class::Relation {
                name,
                ingress,
                egress,
                attrs,
            } => {
                out.push_str("_relation@");
                out.push_str(name);
                out.push_str("_<");
                ingress.serialize_into(out);
                egress.serialize_into(out);
                for attr in attrs {
                    attr.serialize_into(out);
                }
                out.push('>');
            }
        }
    }

    /// Parses a canonical serialized descriptor. Inverse of [`serialize`],
    /// up to re-serialization equality.
    ///
    /// [`serialize`]: Class::serialize
    pub fn parse(serialized: &str) -> Result<Arc<Self>> {
        super::parse::parse_class(serialized)
    }

    /// Encoded byte count of one object, when every leaf is fixed-width.
    /// `None` as soon as a string is reachable.
    pub fn size(&self) -> Option<u64> {
        match self {
            Class::Primitive { kind, .. } => Some(kind.size()),
            Class::Str { .. } => None,
            Class::Struct { fields, .. } => {
                fields.iter().try_fold(0u64, |sum, f| Some(sum + f.size()?))
            }
            Class::Relation { attrs, .. } => attrs
                .iter()
                .try_fold(16u64, |sum, a| Some(sum + a.size()?)),
        }
    }

    /// Number of leaf values a construction call must supply. Relation
    /// endpoints count as one leaf each (the object ids).
    pub fn leaf_count(&self) -> usize {
        match self {
            Class::Primitive { .. } | Class::Str { .. } => 1,
            Class::Struct { fields, .. } => fields.iter().map(|f| f.leaf_count()).sum(),
            Class::Relation { attrs, .. } => {
                2 + attrs.iter().map(|a| a.leaf_count()).sum::<usize>()
            }
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self, Class::Relation { .. })
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::Type("class name must be non-empty".into()));
    }
    if name.contains(['@', '_', '<', '>']) {
        return Err(DbError::Type(format!(
            "class name {name:?} contains a reserved character"
        )));
    }
    Ok(())
}
