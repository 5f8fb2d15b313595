//! Database-agnostic type mappings.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! On top of the built-in conversion, a [`DecoderRegistry`] holds the
//! session's custom [`TypeDecoder`]s, which post-process decoded values by
//! backend type name.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

use crate::models::{ColumnMetadata, DatabaseType, TypeTag};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Text,
    Binary,
    Json,
    Uuid,
    Unknown,
}

impl TypeCategory {
    /// Semantic tag exposed in column metadata.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Integer => TypeTag::Integer,
            Self::Float | Self::Decimal | Self::Boolean => TypeTag::Number,
            Self::Date => TypeTag::Date,
            _ => TypeTag::String,
        }
    }
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Date/time types
    if lower.contains("timestamp")
        || lower.contains("date")
        || lower == "time"
        || lower == "timetz"
    {
        return TypeCategory::Date;
    }

    // Integer types ("interval" and range types share the "int" prefix)
    if (lower.starts_with("int") || lower.ends_with("int") || lower.contains("serial"))
        && lower != "interval"
        && !lower.contains("range")
    {
        return TypeCategory::Integer;
    }

    // Boolean
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Float types
    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    // JSON types
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    // UUID (PostgreSQL)
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    // Binary types
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// Semantic type tag for a backend type name.
pub fn type_tag(type_name: &str, db: DatabaseType) -> TypeTag {
    categorize_type(type_name, db).type_tag()
}

/// Size modifiers of a declared type: `(width, precision, scale)`.
///
/// `varchar(20)` has width 20, `numeric(10,2)` has precision 10 and scale 2.
pub fn parse_type_modifiers(
    declared: &str,
    db: DatabaseType,
) -> (Option<u32>, Option<u32>, Option<u32>) {
    let Some((base, rest)) = declared.split_once('(') else {
        return (None, None, None);
    };
    let Some((args, _)) = rest.split_once(')') else {
        return (None, None, None);
    };
    let mut numbers = args.split(',').map(|n| n.trim().parse::<u32>().ok());
    let first = numbers.next().flatten();
    let second = numbers.next().flatten();

    match categorize_type(base.trim(), db) {
        TypeCategory::Decimal | TypeCategory::Float => (None, first, second),
        TypeCategory::Date => (None, first, None),
        _ => (first, None, None),
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_from_binary(value.as_bytes()?)
                .map(RawDecimal)
                .ok_or_else(|| "malformed binary NUMERIC".into()),
        }
    }
}

/// Render the binary NUMERIC wire format (base-10000 digit groups) as text.
fn numeric_from_binary(buf: &[u8]) -> Option<String> {
    if buf.len() < 8 {
        return None;
    }
    let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    let dscale = word(6) as usize;

    if sign == 0xC000 {
        return Some("NaN".to_string());
    }
    if buf.len() < 8 + ndigits * 2 {
        return None;
    }
    let digit = |i: i32| -> u16 {
        if i < 0 || i as usize >= ndigits {
            0
        } else {
            word(8 + i as usize * 2)
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", digit(i)));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Decode binary data to JSON value.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary` is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::String(STANDARD.encode(bytes)),
        }
    } else {
        JsonValue::String(STANDARD.encode(bytes))
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to positional JSON values.
pub trait RowToJson {
    fn to_json_values(&self) -> Vec<JsonValue>;
    fn column_metadata(&self) -> Vec<ColumnMetadata>;
}

impl RowToJson for PgRow {
    fn to_json_values(&self) -> Vec<JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::PostgreSQL);
                postgres::decode_column(self, idx, type_name, category)
            })
            .collect()
    }

    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        self.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                ColumnMetadata::new(
                    col.name(),
                    type_name,
                    type_tag(type_name, DatabaseType::PostgreSQL),
                    None,
                )
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_values(&self) -> Vec<JsonValue> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::SQLite);
                sqlite::decode_column(self, idx, category)
            })
            .collect()
    }

    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        self.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                ColumnMetadata::new(
                    col.name(),
                    type_name,
                    type_tag(type_name, DatabaseType::SQLite),
                    None,
                )
            })
            .collect()
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Date => decode_date(row, idx, type_name),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            _ => decode_text(row, idx),
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(_) => decode_text(row, idx),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        decode_text(row, idx)
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        decode_text(row, idx)
    }

    fn decode_date(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        let decoded = match type_name.to_lowercase().as_str() {
            "timestamptz" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .map(|v| v.map(|dt| dt.to_rfc3339())),
            "timestamp" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .map(|v| v.map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
            "date" => row
                .try_get::<Option<NaiveDate>, _>(idx)
                .map(|v| v.map(|d| d.to_string())),
            "time" => row
                .try_get::<Option<chrono::NaiveTime>, _>(idx)
                .map(|v| v.map(|t| t.to_string())),
            _ => return decode_text(row, idx),
        };
        match decoded {
            Ok(Some(s)) => JsonValue::String(s),
            Ok(None) => JsonValue::Null,
            Err(_) => decode_text(row, idx),
        }
    }

    fn decode_binary_col(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v, false))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        match raw.format() {
            PgValueFormat::Binary => raw
                .as_bytes()
                .ok()
                .and_then(|b| uuid::Uuid::from_slice(b).ok())
                .map(|u| JsonValue::String(u.to_string()))
                .unwrap_or(JsonValue::Null),
            PgValueFormat::Text => raw
                .as_str()
                .map(|s| JsonValue::String(s.to_string()))
                .unwrap_or(JsonValue::Null),
        }
    }

    /// Text columns, and the textual form of any type without a dedicated decoder.
    fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        match raw.format() {
            PgValueFormat::Text => raw
                .as_str()
                .map(|s| JsonValue::String(s.to_string()))
                .unwrap_or(JsonValue::Null),
            PgValueFormat::Binary => raw
                .as_bytes()
                .map(|b| decode_binary_value(b, true))
                .unwrap_or(JsonValue::Null),
        }
    }
}

mod sqlite {
    use super::*;

    /// SQLite values carry their own storage class; the declared column type
    /// only decides how an INTEGER is presented.
    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return JsonValue::Null,
            Ok(raw) => raw.type_info().name().to_uppercase(),
            Err(_) => return JsonValue::Null,
        };

        match storage.as_str() {
            "INTEGER" | "BOOLEAN" => decode_integer(row, idx, category),
            "REAL" => decode_float(row, idx),
            "BLOB" => decode_binary_col(row, idx),
            _ => decode_text(row, idx, category),
        }
    }

    fn decode_integer(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match row.try_get::<Option<i64>, _>(idx) {
            Ok(Some(v)) if category == TypeCategory::Boolean => JsonValue::Bool(v != 0),
            Ok(Some(v)) => JsonValue::Number(v.into()),
            _ => JsonValue::Null,
        }
    }

    fn decode_float(row: &SqliteRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<f64>, _>(idx) {
            Ok(Some(v)) => float_value(v),
            _ => JsonValue::Null,
        }
    }

    fn decode_binary_col(row: &SqliteRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| decode_binary_value(&v, false))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            if category == TypeCategory::Json {
                if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                    return json;
                }
            }
            return JsonValue::String(v);
        }
        JsonValue::Null
    }
}

// =============================================================================
// Custom Type Decoders
// =============================================================================

type DecodeFn = dyn Fn(&JsonValue) -> JsonValue + Send + Sync;

/// Post-processing hook for values of specific backend types.
///
/// Decoders never see SQL NULL.
#[derive(Clone)]
pub struct TypeDecoder {
    name: String,
    type_names: Vec<String>,
    decode: Arc<DecodeFn>,
}

impl TypeDecoder {
    pub fn new<I, S, F>(name: impl Into<String>, type_names: I, decode: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            type_names: type_names
                .into_iter()
                .map(|s| s.into().to_lowercase())
                .collect(),
            decode: Arc::new(decode),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handles(&self, type_name: &str) -> bool {
        let lower = type_name.to_lowercase();
        self.type_names.iter().any(|t| *t == lower)
    }

    pub fn apply(&self, value: &JsonValue) -> JsonValue {
        if value.is_null() {
            return JsonValue::Null;
        }
        (self.decode)(value)
    }

    /// Date and timestamp columns as RFC 3339 strings in UTC.
    pub fn rfc3339_timestamps() -> Self {
        Self::new("rfc3339_timestamps", TIMESTAMP_TYPES, |value| {
            match value.as_str().and_then(parse_timestamp) {
                Some(dt) => JsonValue::String(dt.to_rfc3339()),
                None => value.clone(),
            }
        })
    }

    /// Date and timestamp columns as fractional seconds since the Unix epoch.
    pub fn epoch_timestamps() -> Self {
        Self::new("epoch_timestamps", TIMESTAMP_TYPES, |value| {
            match value.as_str().and_then(parse_timestamp) {
                Some(dt) => float_value(dt.timestamp_millis() as f64 / 1000.0),
                None => value.clone(),
            }
        })
    }
}

impl fmt::Debug for TypeDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDecoder")
            .field("name", &self.name)
            .field("type_names", &self.type_names)
            .finish()
    }
}

const TIMESTAMP_TYPES: [&str; 4] = ["timestamp", "timestamptz", "date", "datetime"];

/// Parse the textual timestamp forms produced by the row decoders.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// The decoders installed on one connection, in registration order.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    decoders: Vec<TypeDecoder>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, decoder: TypeDecoder) {
        self.decoders.push(decoder);
    }

    pub fn clear(&mut self) {
        self.decoders.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.decoders.iter().map(|d| d.name().to_string()).collect()
    }

    /// The most recently registered decoder for `type_name`.
    pub fn lookup(&self, type_name: &str) -> Option<&TypeDecoder> {
        self.decoders.iter().rev().find(|d| d.handles(type_name))
    }

    /// Rewrite `rows` in place using the decoders matching each column.
    pub fn decode_rows(&self, columns: &[ColumnMetadata], rows: &mut [Vec<JsonValue>]) {
        if self.decoders.is_empty() {
            return;
        }
        let per_column: Vec<Option<&TypeDecoder>> =
            columns.iter().map(|c| self.lookup(&c.type_name)).collect();
        if per_column.iter().all(Option::is_none) {
            return;
        }
        for row in rows.iter_mut() {
            for (value, decoder) in row.iter_mut().zip(&per_column) {
                if let Some(decoder) = decoder {
                    *value = decoder.apply(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::SQLite),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("int4", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::PostgreSQL),
            TypeCategory::Unknown
        );
        assert_eq!(
            categorize_type("point", DatabaseType::PostgreSQL),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::PostgreSQL),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_dates() {
        for name in ["timestamptz", "TIMESTAMP", "date", "DATETIME", "time"] {
            assert_eq!(
                categorize_type(name, DatabaseType::PostgreSQL),
                TypeCategory::Date,
                "{name}"
            );
        }
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(type_tag("int8", DatabaseType::PostgreSQL), TypeTag::Integer);
        assert_eq!(type_tag("bool", DatabaseType::PostgreSQL), TypeTag::Number);
        assert_eq!(type_tag("float8", DatabaseType::PostgreSQL), TypeTag::Number);
        assert_eq!(type_tag("numeric", DatabaseType::PostgreSQL), TypeTag::Number);
        assert_eq!(type_tag("date", DatabaseType::PostgreSQL), TypeTag::Date);
        assert_eq!(type_tag("TEXT", DatabaseType::SQLite), TypeTag::String);
        assert_eq!(type_tag("NULL", DatabaseType::SQLite), TypeTag::String);
    }

    #[test]
    fn test_parse_type_modifiers() {
        assert_eq!(
            parse_type_modifiers("character varying(20)", DatabaseType::PostgreSQL),
            (Some(20), None, None)
        );
        assert_eq!(
            parse_type_modifiers("numeric(10,2)", DatabaseType::PostgreSQL),
            (None, Some(10), Some(2))
        );
        assert_eq!(
            parse_type_modifiers("DECIMAL(8, 3)", DatabaseType::SQLite),
            (None, Some(8), Some(3))
        );
        assert_eq!(
            parse_type_modifiers("integer", DatabaseType::SQLite),
            (None, None, None)
        );
    }

    #[test]
    fn test_numeric_from_binary() {
        // 12345.678: groups [1, 2345, 6780], weight 1, dscale 3
        let buf = [0, 3, 0, 1, 0, 0, 0, 3, 0, 1, 0x09, 0x29, 0x1A, 0x7C];
        assert_eq!(numeric_from_binary(&buf).unwrap(), "12345.678");
        // -0.05: groups [500], weight -1, dscale 2
        let buf = [0, 1, 0xFF, 0xFF, 0x40, 0, 0, 2, 0x01, 0xF4];
        assert_eq!(numeric_from_binary(&buf).unwrap(), "-0.05");
        assert!(numeric_from_binary(&[0, 1]).is_none());
    }

    #[test]
    fn test_decode_binary_value() {
        let bytes = b"hello world";
        assert_eq!(
            decode_binary_value(bytes, true),
            JsonValue::String("hello world".to_string())
        );
        assert_eq!(
            decode_binary_value(bytes, false),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        let invalid: &[u8] = &[0xFF, 0xFE, 0x00, 0x01];
        assert_eq!(
            decode_binary_value(invalid, true),
            JsonValue::String("//4AAQ==".to_string())
        );
    }

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = "2024-03-01T12:30:00+00:00";
        for input in [
            "2024-03-01T12:30:00+00:00",
            "2024-03-01T12:30:00",
            "2024-03-01 12:30:00",
        ] {
            assert_eq!(parse_timestamp(input).unwrap().to_rfc3339(), expected);
        }
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn test_decoder_skips_null() {
        let decoder = TypeDecoder::new("boom", ["text"], |_| json!("decoded"));
        assert_eq!(decoder.apply(&JsonValue::Null), JsonValue::Null);
        assert_eq!(decoder.apply(&json!("x")), json!("decoded"));
    }

    #[test]
    fn test_later_decoder_shadows_earlier() {
        let mut registry = DecoderRegistry::new();
        registry.register(TypeDecoder::new("first", ["date", "text"], |_| json!(1)));
        registry.register(TypeDecoder::new("second", ["DATE"], |_| json!(2)));

        assert_eq!(registry.lookup("date").unwrap().name(), "second");
        assert_eq!(registry.lookup("text").unwrap().name(), "first");
        assert!(registry.lookup("int4").is_none());
        assert_eq!(registry.names(), vec!["first", "second"]);
    }

    #[test]
    fn test_decode_rows_by_column_type() {
        let mut registry = DecoderRegistry::new();
        registry.register(TypeDecoder::epoch_timestamps());

        let columns = vec![
            ColumnMetadata::new("id", "int4", TypeTag::Integer, None),
            ColumnMetadata::new("at", "timestamptz", TypeTag::Date, None),
        ];
        let mut rows = vec![
            vec![json!(1), json!("1970-01-01T00:00:10+00:00")],
            vec![json!(2), JsonValue::Null],
        ];
        registry.decode_rows(&columns, &mut rows);

        assert_eq!(rows[0], vec![json!(1), json!(10.0)]);
        assert_eq!(rows[1], vec![json!(2), JsonValue::Null]);
    }

    #[test]
    fn test_rfc3339_decoder_normalizes_naive_timestamps() {
        let decoder = TypeDecoder::rfc3339_timestamps();
        assert_eq!(
            decoder.apply(&json!("2024-03-01 12:30:00")),
            json!("2024-03-01T12:30:00+00:00")
        );
        assert_eq!(decoder.apply(&json!("garbage")), json!("garbage"));
    }
}
