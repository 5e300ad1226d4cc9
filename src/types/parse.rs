//! Parser for the canonical serialized descriptor grammar:
//!
//! ```text
//! class      := primitive | string | struct | relation
//! primitive  := "_" type-name "@" identifier "_"
//! string     := "_string@" identifier "_"
//! struct     := "_struct@" identifier "_<" class* ">"
//! relation   := "_relation@" identifier "_<" class class class* ">"
//! identifier := [^@_<>]+
//! ```

use std::sync::Arc;

use crate::error::{DbError, Result};
use crate::types::class::{Class, PrimitiveKind};

pub(super) fn parse_class(input: &str) -> Result<Arc<Class>> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    let class = parser.class()?;
    if parser.pos != parser.bytes.len() {
        return Err(DbError::Type(format!(
            "trailing bytes after class descriptor at offset {}",
            parser.pos
        )));
    }
    Ok(class)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn fail(&self, what: &str) -> DbError {
        DbError::Type(format!(
            "malformed class descriptor: {what} at offset {}",
            self.pos
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.fail(&format!("expected {:?}", byte as char)))
        }
    }

    /// Consumes up to (not including) `end`, requiring at least one byte.
    fn take_until(&mut self, end: u8) -> Result<&'a str> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte == end {
                if self.pos == start {
                    return Err(self.fail("empty identifier"));
                }
                let token = &self.bytes[start..self.pos];
                self.pos += 1;
                return std::str::from_utf8(token)
                    .map_err(|_| self.fail("identifier is not valid UTF-8"));
            }
            self.pos += 1;
        }
        Err(self.fail(&format!("unterminated token, expected {:?}", end as char)))
    }

    fn class(&mut self) -> Result<Arc<Class>> {
        self.expect(b'_')?;
        let token = self.take_until(b'@')?;
        let name = self.take_until(b'_')?;

        match token {
            "struct" => {
                self.expect(b'<')?;
                let fields = self.class_list()?;
                Class::structure(name, fields)
            }
            "relation" => {
                self.expect(b'<')?;
                let mut members = self.class_list()?;
                if members.len() < 2 {
                    return Err(self.fail("relation needs ingress and egress classes"));
                }
                let attrs = members.split_off(2);
                let egress = members.pop().expect("two members checked");
                let ingress = members.pop().expect("two members checked");
                Class::relation(name, ingress, egress, attrs)
            }
            "string" => Class::string(name),
            other => match PrimitiveKind::from_token(other) {
                Some(kind) => Class::primitive(kind, name),
                None => Err(DbError::NotImplemented(
                    "unsupported primitive type in class descriptor",
                )),
            },
        }
    }

    /// Parses classes until the closing `>` of the enclosing composite.
    fn class_list(&mut self) -> Result<Vec<Arc<Class>>> {
        let mut members = Vec::new();
        loop {
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    return Ok(members);
                }
                Some(_) => members.push(self.class()?),
                None => return Err(self.fail("unterminated composite class")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(serialized: &str) {
        let class = Class::parse(serialized).expect("parse");
        assert_eq!(class.serialize(), serialized);
    }

    #[test]
    fn primitive_round_trips() {
        for kind in PrimitiveKind::ALL {
            round_trip(&format!("_{}@value_", kind.token()));
        }
    }

    #[test]
    fn string_round_trips() {
        round_trip("_string@name_");
    }

    #[test]
    fn nested_struct_round_trips() {
        round_trip("_struct@point_<_double@x__double@y_>");
        round_trip("_struct@outer_<_struct@inner_<_int@a_>_string@tag_>");
        round_trip("_struct@empty_<>");
    }

    #[test]
    fn relation_round_trips() {
        round_trip("_relation@edge_<_struct@point_<_double@x__double@y_>_struct@point_<_double@x__double@y_>>");
        round_trip("_relation@liked_<_string@name__string@name__int@score_>");
    }

    #[test]
    fn malformed_descriptors_fail() {
        for bad in [
            "",
            "int@age_",
            "_int@age",
            "_int@_",
            "_struct@s_<_int@a_",
            "_relation@r_<_int@a_>",
            "_int@age_extra",
        ] {
            assert!(Class::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn unknown_primitive_is_not_implemented() {
        assert!(matches!(
            Class::parse("_quadfloat@q_"),
            Err(DbError::NotImplemented(_))
        ));
    }
}
