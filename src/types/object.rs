use std::fmt;
use std::sync::Arc;

use crate::error::{DbError, Result};
use crate::file::DbFile;
use crate::types::{Class, ObjectId, PrimitiveKind};

/// Machine value of one primitive leaf. The variant always agrees with the
/// width of the leaf's [`PrimitiveKind`]; construction goes through the
/// class, so the pairing cannot drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrimitiveValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveValue::I8(v) => write!(f, "{v}"),
            PrimitiveValue::U8(v) => write!(f, "{v}"),
            PrimitiveValue::I16(v) => write!(f, "{v}"),
            PrimitiveValue::U16(v) => write!(f, "{v}"),
            PrimitiveValue::I32(v) => write!(f, "{v}"),
            PrimitiveValue::U32(v) => write!(f, "{v}"),
            PrimitiveValue::I64(v) => write!(f, "{v}"),
            PrimitiveValue::U64(v) => write!(f, "{v}"),
            PrimitiveValue::F32(v) => write!(f, "{v}"),
            PrimitiveValue::F64(v) => write!(f, "{v}"),
            PrimitiveValue::Bool(v) => write!(f, "{}", if *v { "true" } else { "false" }),
        }
    }
}

/// Input literal for object construction. One literal feeds one leaf of
/// the class; numeric literals are coerced to the leaf's width with a
/// range check.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<i32> for Literal {
    fn from(v: i32) -> Self {
        Literal::Int(v.into())
    }
}

impl From<u64> for Literal {
    fn from(v: u64) -> Self {
        Literal::UInt(v)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Bool(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::Str(v.to_owned())
    }
}

impl From<String> for Literal {
    fn from(v: String) -> Self {
        Literal::Str(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Primitive(PrimitiveValue),
    Str(String),
    Struct(Vec<Object>),
    Relation {
        ingress: ObjectId,
        egress: ObjectId,
        attrs: Vec<Object>,
    },
}

/// One typed value of a class, encodable at a file offset in the byte
/// layout the class dictates.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    class: Arc<Class>,
    value: Value,
}

impl Object {
    /// Builds an object from one literal per class leaf. The argument count
    /// must match [`Class::leaf_count`]; relation objects take the ingress
    /// and egress ids as their first two literals.
    pub fn new<L, I>(class: &Arc<Class>, args: I) -> Result<Self>
    where
        L: Into<Literal>,
        I: IntoIterator<Item = L>,
    {
        let literals: Vec<Literal> = args.into_iter().map(Into::into).collect();
        if class.leaf_count() != literals.len() {
            return Err(DbError::BadArgument(format!(
                "class {} takes {} arguments, got {}",
                class.name(),
                class.leaf_count(),
                literals.len()
            )));
        }
        let mut cursor = literals.iter();
        let object = build(class, &mut cursor)?;
        Ok(object)
    }

    /// Zero/empty-constructs an object of the class.
    pub fn default_new(class: &Arc<Class>) -> Result<Self> {
        let value = match class.as_ref() {
            Class::Primitive { kind, .. } => Value::Primitive(default_primitive(*kind)),
            Class::Str { .. } => Value::Str(String::new()),
            Class::Struct { fields, .. } => Value::Struct(
                fields
                    .iter()
                    .map(Object::default_new)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Class::Relation { attrs, .. } => Value::Relation {
                ingress: 0,
                egress: 0,
                attrs: attrs
                    .iter()
                    .map(Object::default_new)
                    .collect::<Result<Vec<_>>>()?,
            },
        };
        Ok(Self {
            class: class.clone(),
            value,
        })
    }

    /// Reassembles a struct object from already-built field objects. The
    /// field objects must line up with the class's field classes.
    pub fn structure_of(class: Arc<Class>, fields: Vec<Object>) -> Result<Self> {
        let Class::Struct {
            fields: field_classes,
            ..
        } = class.as_ref()
        else {
            return Err(DbError::BadArgument(format!(
                "class {} is not a struct",
                class.name()
            )));
        };
        if field_classes.len() != fields.len() {
            return Err(DbError::BadArgument(format!(
                "struct {} has {} fields, got {}",
                class.name(),
                field_classes.len(),
                fields.len()
            )));
        }
        Ok(Self {
            class,
            value: Value::Struct(fields),
        })
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Encoded byte count.
    pub fn size(&self) -> u64 {
        match &self.value {
            Value::Primitive(_) => match self.class.as_ref() {
                Class::Primitive { kind, .. } => kind.size(),
                _ => 0,
            },
            Value::Str(s) => 4 + s.len() as u64,
            Value::Struct(fields) => fields.iter().map(Object::size).sum(),
            Value::Relation { attrs, .. } => 16 + attrs.iter().map(Object::size).sum::<u64>(),
        }
    }

    /// Writes the object at `offset`, returning the offset just past it.
    pub fn write_at(&self, file: &mut DbFile, offset: u64) -> Result<u64> {
        match &self.value {
            Value::Primitive(v) => write_primitive(file, offset, v),
            Value::Str(s) => {
                let next = file.write_val::<u32>(offset, s.len() as u32)?;
                file.write_bytes(next, s.as_bytes())
            }
            Value::Struct(fields) => {
                let mut next = offset;
                for field in fields {
                    next = field.write_at(file, next)?;
                }
                Ok(next)
            }
            Value::Relation {
                ingress,
                egress,
                attrs,
            } => {
                let mut next = file.write_val::<u64>(offset, *ingress)?;
                next = file.write_val::<u64>(next, *egress)?;
                for attr in attrs {
                    next = attr.write_at(file, next)?;
                }
                Ok(next)
            }
        }
    }

    /// Reads an object of `class` at `offset`.
    pub fn read_at(class: &Arc<Class>, file: &mut DbFile, offset: u64) -> Result<Self> {
        let value = match class.as_ref() {
            Class::Primitive { kind, .. } => Value::Primitive(read_primitive(file, offset, *kind)?),
            Class::Str { .. } => {
                let len = file.read_val::<u32>(offset)? as usize;
                let bytes = file.read_bytes(offset + 4, len)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| DbError::Structure("stored string is not valid UTF-8".into()))?;
                Value::Str(s)
            }
            Class::Struct { fields, .. } => {
                let mut next = offset;
                let mut values = Vec::with_capacity(fields.len());
                for field_class in fields {
                    let field = Object::read_at(field_class, file, next)?;
                    next += field.size();
                    values.push(field);
                }
                Value::Struct(values)
            }
            Class::Relation { attrs, .. } => {
                let ingress = file.read_val::<u64>(offset)?;
                let egress = file.read_val::<u64>(offset + 8)?;
                let mut next = offset + 16;
                let mut values = Vec::with_capacity(attrs.len());
                for attr_class in attrs {
                    let attr = Object::read_at(attr_class, file, next)?;
                    next += attr.size();
                    values.push(attr);
                }
                Value::Relation {
                    ingress,
                    egress,
                    attrs: values,
                }
            }
        };
        Ok(Self {
            class: class.clone(),
            value,
        })
    }

    /// Struct field lookup by class name.
    pub fn field(&self, name: &str) -> Result<&Object> {
        let Value::Struct(fields) = &self.value else {
            return Err(DbError::Runtime(format!(
                "{} is not a struct object",
                self.class.name()
            )));
        };
        fields
            .iter()
            .find(|f| f.class.name() == name)
            .ok_or_else(|| DbError::Runtime(format!("no field {name} in {}", self.class.name())))
    }

    pub fn ingress(&self) -> Result<ObjectId> {
        match &self.value {
            Value::Relation { ingress, .. } => Ok(*ingress),
            _ => Err(DbError::Runtime(format!(
                "{} is not a relation object",
                self.class.name()
            ))),
        }
    }

    pub fn egress(&self) -> Result<ObjectId> {
        match &self.value {
            Value::Relation { egress, .. } => Ok(*egress),
            _ => Err(DbError::Runtime(format!(
                "{} is not a relation object",
                self.class.name()
            ))),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            Value::Primitive(PrimitiveValue::I8(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::I16(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::I32(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::I64(v)) => Some(*v),
            Value::Primitive(PrimitiveValue::U8(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::U16(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::U32(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::U64(v)) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            Value::Primitive(PrimitiveValue::F32(v)) => Some((*v).into()),
            Value::Primitive(PrimitiveValue::F64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            Value::Primitive(PrimitiveValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.class.name();
        match &self.value {
            Value::Primitive(v) => write!(f, "{name}: {v}"),
            Value::Str(s) => write!(f, "{name}: \"{s}\""),
            Value::Struct(fields) => {
                write!(f, "{name}: {{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, " }}")
            }
            Value::Relation {
                ingress,
                egress,
                attrs,
            } => {
                write!(f, "{name}: #{ingress} -> #{egress}")?;
                if !attrs.is_empty() {
                    write!(f, " {{ ")?;
                    for (i, attr) in attrs.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{attr}")?;
                    }
                    write!(f, " }}")?;
                }
                Ok(())
            }
        }
    }
}

fn build<'a>(
    class: &Arc<Class>,
    args: &mut impl Iterator<Item = &'a Literal>,
) -> Result<Object> {
    let value = match class.as_ref() {
        Class::Primitive { kind, .. } => {
            let literal = next_arg(args, class)?;
            Value::Primitive(coerce_primitive(*kind, literal)?)
        }
        Class::Str { .. } => match next_arg(args, class)? {
            Literal::Str(s) => Value::Str(s.clone()),
            other => {
                return Err(DbError::BadArgument(format!(
                    "string leaf {} needs a string literal, got {other:?}",
                    class.name()
                )))
            }
        },
        Class::Struct { fields, .. } => Value::Struct(
            fields
                .iter()
                .map(|field| build(field, args))
                .collect::<Result<Vec<_>>>()?,
        ),
        Class::Relation { attrs, .. } => {
            let ingress = coerce_id(next_arg(args, class)?)?;
            let egress = coerce_id(next_arg(args, class)?)?;
            Value::Relation {
                ingress,
                egress,
                attrs: attrs
                    .iter()
                    .map(|attr| build(attr, args))
                    .collect::<Result<Vec<_>>>()?,
            }
        }
    };
    Ok(Object {
        class: class.clone(),
        value,
    })
}

fn next_arg<'a>(
    args: &mut impl Iterator<Item = &'a Literal>,
    class: &Arc<Class>,
) -> Result<&'a Literal> {
    args.next().ok_or_else(|| {
        DbError::BadArgument(format!("ran out of arguments building {}", class.name()))
    })
}

fn coerce_id(literal: &Literal) -> Result<ObjectId> {
    match literal {
        Literal::UInt(v) => Ok(*v),
        Literal::Int(v) if *v >= 0 => Ok(*v as u64),
        other => Err(DbError::BadArgument(format!(
            "relation endpoint needs a non-negative id, got {other:?}"
        ))),
    }
}

fn default_primitive(kind: PrimitiveKind) -> PrimitiveValue {
    use PrimitiveKind as K;
    use PrimitiveValue as V;
    match kind {
        K::Int => V::I32(0),
        K::UnsignedInt => V::U32(0),
        K::ShortInt => V::I16(0),
        K::ShortUnsignedInt => V::U16(0),
        K::LongInt | K::LongLongInt => V::I64(0),
        K::LongUnsignedInt | K::LongLongUnsignedInt => V::U64(0),
        K::Float => V::F32(0.0),
        K::Double => V::F64(0.0),
        K::Bool => V::Bool(false),
        K::Char | K::UnsignedChar => V::U8(0),
        K::SignedChar => V::I8(0),
        K::WideChar => V::U32(0),
    }
}

fn coerce_primitive(kind: PrimitiveKind, literal: &Literal) -> Result<PrimitiveValue> {
    use PrimitiveKind as K;
    use PrimitiveValue as V;

    macro_rules! integral {
        ($variant:ident, $ty:ty) => {
            match literal {
                Literal::Int(v) => <$ty>::try_from(*v).map(V::$variant).map_err(|_| {
                    DbError::BadArgument(format!("{v} out of range for {}", kind.token()))
                }),
                Literal::UInt(v) => <$ty>::try_from(*v).map(V::$variant).map_err(|_| {
                    DbError::BadArgument(format!("{v} out of range for {}", kind.token()))
                }),
                other => Err(DbError::BadArgument(format!(
                    "{} leaf needs an integer literal, got {other:?}",
                    kind.token()
                ))),
            }
        };
    }

    match kind {
        K::Int => integral!(I32, i32),
        K::UnsignedInt => integral!(U32, u32),
        K::ShortInt => integral!(I16, i16),
        K::ShortUnsignedInt => integral!(U16, u16),
        K::LongInt | K::LongLongInt => integral!(I64, i64),
        K::LongUnsignedInt | K::LongLongUnsignedInt => integral!(U64, u64),
        K::Char | K::UnsignedChar => integral!(U8, u8),
        K::SignedChar => integral!(I8, i8),
        K::WideChar => integral!(U32, u32),
        K::Float => match literal {
            Literal::Float(v) => Ok(V::F32(*v as f32)),
            Literal::Int(v) => Ok(V::F32(*v as f32)),
            other => Err(DbError::BadArgument(format!(
                "float leaf needs a numeric literal, got {other:?}"
            ))),
        },
        K::Double => match literal {
            Literal::Float(v) => Ok(V::F64(*v)),
            Literal::Int(v) => Ok(V::F64(*v as f64)),
            other => Err(DbError::BadArgument(format!(
                "double leaf needs a numeric literal, got {other:?}"
            ))),
        },
        K::Bool => match literal {
            Literal::Bool(v) => Ok(V::Bool(*v)),
            other => Err(DbError::BadArgument(format!(
                "bool leaf needs a bool literal, got {other:?}"
            ))),
        },
    }
}

fn write_primitive(file: &mut DbFile, offset: u64, value: &PrimitiveValue) -> Result<u64> {
    match value {
        PrimitiveValue::I8(v) => file.write_val(offset, *v),
        PrimitiveValue::U8(v) => file.write_val(offset, *v),
        PrimitiveValue::I16(v) => file.write_val(offset, *v),
        PrimitiveValue::U16(v) => file.write_val(offset, *v),
        PrimitiveValue::I32(v) => file.write_val(offset, *v),
        PrimitiveValue::U32(v) => file.write_val(offset, *v),
        PrimitiveValue::I64(v) => file.write_val(offset, *v),
        PrimitiveValue::U64(v) => file.write_val(offset, *v),
        PrimitiveValue::F32(v) => file.write_val(offset, *v),
        PrimitiveValue::F64(v) => file.write_val(offset, *v),
        PrimitiveValue::Bool(v) => file.write_val::<u8>(offset, u8::from(*v)),
    }
}

fn read_primitive(file: &mut DbFile, offset: u64, kind: PrimitiveKind) -> Result<PrimitiveValue> {
    use PrimitiveKind as K;
    use PrimitiveValue as V;
    Ok(match kind {
        K::Int => V::I32(file.read_val(offset)?),
        K::UnsignedInt => V::U32(file.read_val(offset)?),
        K::ShortInt => V::I16(file.read_val(offset)?),
        K::ShortUnsignedInt => V::U16(file.read_val(offset)?),
        K::LongInt | K::LongLongInt => V::I64(file.read_val(offset)?),
        K::LongUnsignedInt | K::LongLongUnsignedInt => V::U64(file.read_val(offset)?),
        K::Float => V::F32(file.read_val(offset)?),
        K::Double => V::F64(file.read_val(offset)?),
        K::Char | K::UnsignedChar => V::U8(file.read_val(offset)?),
        K::SignedChar => V::I8(file.read_val(offset)?),
        K::WideChar => V::U32(file.read_val(offset)?),
        K::Bool => match file.read_val::<u8>(offset)? {
            0 => V::Bool(false),
            1 => V::Bool(true),
            other => {
                return Err(DbError::Structure(format!(
                    "invalid boolean encoding: {other}"
                )))
            }
        },
    })
}
