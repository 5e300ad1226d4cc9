pub mod db;
pub mod error;
pub mod file;
pub mod pager;
pub mod query;
pub mod storage;
pub mod types;

pub use crate::db::{Database, OpenMode};
pub use crate::error::{DbError, Result};
pub use crate::file::DbFile;
pub use crate::query::Pattern;
pub use crate::storage::NodeRecord;
pub use crate::types::{Class, Literal, Object, ObjectId, PrimitiveKind, Value};
