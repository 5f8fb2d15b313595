//! Query-related data models.
//!
//! This module defines types for SQL batch requests and their results.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Separator between statements in a textual batch.
pub const STATEMENT_SEPARATOR: char = '\0';

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arbitrary JSON document
    Json(JsonValue),
}

/// A batch of statements executed in order on one transaction's connection.
///
/// `params` are bound to every statement of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub statements: Vec<String>,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// `None` or `0` means unlimited.
    #[serde(default)]
    pub max_rows: Option<u64>,
}

impl QueryRequest {
    /// Create a request holding a single statement.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            statements: vec![sql.into()],
            params: Vec::new(),
            max_rows: None,
        }
    }

    /// Create a request from a list of statements.
    pub fn from_statements<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
            params: Vec::new(),
            max_rows: None,
        }
    }

    /// Split a NUL-separated batch into statements, skipping empty pieces.
    pub fn from_batch(batch: &str) -> Self {
        Self::from_statements(
            batch
                .split(STATEMENT_SEPARATOR)
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        )
    }

    /// Add a parameter to this query.
    pub fn with_param(mut self, param: QueryParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    /// Row limit to enforce, treating `0` as unlimited.
    pub fn effective_max_rows(&self) -> Option<u64> {
        self.max_rows.filter(|&n| n > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Coarse semantic category of a column, as exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    #[serde(rename = "i")]
    Integer,
    #[serde(rename = "n")]
    Number,
    #[serde(rename = "d")]
    Date,
    #[serde(rename = "s")]
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Database-specific type (e.g., "int8", "varchar", "TEXT")
    pub type_name: String,
    pub type_tag: TypeTag,
    /// `None` when the backend cannot tell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// Declared length of character types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
}

impl ColumnMetadata {
    /// Create new column metadata.
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        type_tag: TypeTag,
        nullable: Option<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            type_tag,
            nullable,
            width: None,
            precision: None,
            scale: None,
        }
    }

    /// Two result sets are compatible when every column matches by name and type.
    pub fn same_shape(left: &[ColumnMetadata], right: &[ColumnMetadata]) -> bool {
        left.len() == right.len()
            && left
                .iter()
                .zip(right)
                .all(|(a, b)| a.name == b.name && a.type_name.eq_ignore_ascii_case(&b.type_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Vec<JsonValue>>,
    pub truncated: bool,
    pub execution_time_ms: u64,
}
