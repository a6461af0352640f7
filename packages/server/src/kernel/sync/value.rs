//! Dynamic row values and destination-driven text encoding.
//!
//! Extraction reads `SELECT *` over tables the engine has never seen, so
//! rows come back as heterogeneous tuples. Each cell is decoded into the
//! closed `SqlValue` set below; transport encoding back out is driven by the
//! *destination* column's declared type (array literal, canonical JSON,
//! plain text), never by the source value's runtime tag.

use std::cmp::Ordering;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use tracing::debug;
use uuid::Uuid;

/// Variant set for values crossing the transfer pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<SqlValue>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Plain text form, independent of any destination column. `None` is
    /// SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(if *b { "t".into() } else { "f".into() }),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(format_float(*f)),
            SqlValue::Numeric(d) => Some(d.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            SqlValue::TimestampTz(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string()),
            SqlValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => Some(t.format("%H:%M:%S%.6f").to_string()),
            SqlValue::Uuid(u) => Some(u.to_string()),
            SqlValue::Bytes(b) => Some(format!("\\x{}", hex::encode(b))),
            SqlValue::Json(v) => Some(compact_json(v)),
            SqlValue::Array(items) => Some(format_array_literal(items, true)),
        }
    }

    /// Ordering used for high-watermark tracking. Values of different
    /// families fall back to comparing their text forms.
    pub fn watermark_cmp(&self, other: &SqlValue) -> Ordering {
        use SqlValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Numeric(a), Numeric(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (TimestampTz(a), TimestampTz(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (a, b) => a
                .to_text()
                .unwrap_or_default()
                .cmp(&b.to_text().unwrap_or_default()),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

fn compact_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

// ============================================================================
// Row decoding
// ============================================================================

/// Decode every cell of a dynamically-typed row, preserving column order.
pub fn decode_row(row: &PgRow) -> Vec<(String, SqlValue)> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let name = col.name().to_string();
            let type_name = col.type_info().name().to_string();
            let value = decode_cell(row, idx, &type_name).unwrap_or_else(|| {
                debug!(column = %name, pg_type = %type_name, "no decoder for column type, passing NULL");
                SqlValue::Null
            });
            (name, value)
        })
        .collect()
}

macro_rules! take {
    ($row:expr, $idx:expr, $ty:ty, $variant:expr) => {
        $row.try_get::<Option<$ty>, _>($idx)
            .ok()
            .map(|opt| opt.map($variant).unwrap_or(SqlValue::Null))
    };
}

macro_rules! take_array {
    ($row:expr, $idx:expr, $ty:ty, $variant:expr) => {
        $row.try_get::<Option<Vec<$ty>>, _>($idx).ok().map(|opt| {
            opt.map(|items| SqlValue::Array(items.into_iter().map($variant).collect()))
                .unwrap_or(SqlValue::Null)
        })
    };
}

fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Option<SqlValue> {
    match type_name {
        "BOOL" => take!(row, idx, bool, SqlValue::Bool),
        "INT2" => take!(row, idx, i16, |v| SqlValue::Int(v as i64)),
        "INT4" => take!(row, idx, i32, |v| SqlValue::Int(v as i64)),
        "INT8" => take!(row, idx, i64, SqlValue::Int),
        "FLOAT4" => take!(row, idx, f32, |v| SqlValue::Float(v as f64)),
        "FLOAT8" => take!(row, idx, f64, SqlValue::Float),
        "NUMERIC" => take!(row, idx, Decimal, SqlValue::Numeric),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "BPCHAR" | "CITEXT" => {
            take!(row, idx, String, SqlValue::Text)
        }
        "TIMESTAMP" => take!(row, idx, NaiveDateTime, SqlValue::Timestamp),
        "TIMESTAMPTZ" => take!(row, idx, DateTime<Utc>, SqlValue::TimestampTz),
        "DATE" => take!(row, idx, NaiveDate, SqlValue::Date),
        "TIME" => take!(row, idx, NaiveTime, SqlValue::Time),
        "UUID" => take!(row, idx, Uuid, SqlValue::Uuid),
        "JSON" | "JSONB" => take!(row, idx, serde_json::Value, SqlValue::Json),
        "BYTEA" => take!(row, idx, Vec<u8>, SqlValue::Bytes),

        "BOOL[]" => take_array!(row, idx, bool, SqlValue::Bool),
        "INT2[]" => take_array!(row, idx, i16, |v| SqlValue::Int(v as i64)),
        "INT4[]" => take_array!(row, idx, i32, |v| SqlValue::Int(v as i64)),
        "INT8[]" => take_array!(row, idx, i64, SqlValue::Int),
        "FLOAT4[]" => take_array!(row, idx, f32, |v| SqlValue::Float(v as f64)),
        "FLOAT8[]" => take_array!(row, idx, f64, SqlValue::Float),
        "NUMERIC[]" => take_array!(row, idx, Decimal, SqlValue::Numeric),
        "TEXT[]" | "VARCHAR[]" | "NAME[]" | "BPCHAR[]" => {
            take_array!(row, idx, String, SqlValue::Text)
        }
        "TIMESTAMP[]" => take_array!(row, idx, NaiveDateTime, SqlValue::Timestamp),
        "TIMESTAMPTZ[]" => take_array!(row, idx, DateTime<Utc>, SqlValue::TimestampTz),
        "UUID[]" => take_array!(row, idx, Uuid, SqlValue::Uuid),
        "JSON[]" | "JSONB[]" => take_array!(row, idx, serde_json::Value, SqlValue::Json),

        // Unknown types (intervals, ranges, user-defined enums, ...) decode
        // through their text representation when the driver allows it.
        _ => take!(row, idx, String, SqlValue::Text),
    }
}

// ============================================================================
// Destination column metadata
// ============================================================================

/// Declared type of a destination column; drives all outbound encoding.
#[derive(Debug, Clone)]
pub struct DestColumn {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
}

impl DestColumn {
    pub fn is_array(&self) -> bool {
        self.data_type == "ARRAY" || self.udt_name.starts_with('_')
    }

    pub fn is_json(&self) -> bool {
        matches!(self.udt_name.as_str(), "json" | "jsonb")
    }

    /// Element type of an array column (`_int4` -> `int4`).
    pub fn element_udt(&self) -> &str {
        self.udt_name.strip_prefix('_').unwrap_or(&self.udt_name)
    }

    /// Cast target used in generated placeholders (`$n::int8`).
    pub fn cast_type(&self) -> String {
        if self.is_array() {
            format!("{}[]", self.element_udt())
        } else {
            self.udt_name.clone()
        }
    }

    /// Whether the transfer strategies cannot faithfully encode this column
    /// through the bulk-load path.
    pub fn is_complex(&self) -> bool {
        self.is_array()
            || self.data_type == "USER-DEFINED"
            || matches!(self.udt_name.as_str(), "tsvector" | "tsquery")
    }

    /// Ordered column list of a destination table.
    pub async fn fetch(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<DestColumn>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, udt_name::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, udt_name)| DestColumn {
                name,
                data_type,
                udt_name,
            })
            .collect())
    }
}

// ============================================================================
// Destination-driven encoding
// ============================================================================

/// Encode a value for a destination column as its text form (`None` = NULL).
///
/// The same forms feed both the casted-placeholder INSERT path and the COPY
/// text stream (COPY additionally escapes control characters).
pub fn encode_for_column(value: &SqlValue, col: &DestColumn) -> Option<String> {
    if value.is_null() {
        return None;
    }

    if col.is_array() {
        return Some(encode_array_value(value, col));
    }

    if col.is_json() {
        return Some(match value {
            SqlValue::Json(v) => compact_json(v),
            SqlValue::Text(s) => sanitize_json_string(s),
            other => other
                .to_text()
                .map(|t| sanitize_json_string(&t))
                .unwrap_or_else(|| "null".to_string()),
        });
    }

    match value {
        // Strings that look like JSON in JSON-suggestive columns are
        // re-canonicalized even when the destination is plain text.
        SqlValue::Text(s) if json_field_name(&col.name) && looks_like_json(s) => {
            Some(sanitize_json_string(s))
        }
        other => other.to_text(),
    }
}

fn encode_array_value(value: &SqlValue, col: &DestColumn) -> String {
    let quote = array_element_needs_quotes(col.element_udt());
    match value {
        SqlValue::Array(items) => format_array_literal(items, quote),
        SqlValue::Json(serde_json::Value::Array(items)) => {
            format_json_array_literal(items, quote)
        }
        SqlValue::Text(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') && trimmed.ends_with('}') {
                // Already a PostgreSQL array literal.
                s.clone()
            } else if trimmed.starts_with('[') && trimmed.ends_with(']') {
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(serde_json::Value::Array(items)) => {
                        format_json_array_literal(&items, quote)
                    }
                    _ => s.clone(),
                }
            } else {
                s.clone()
            }
        }
        other => other.to_text().unwrap_or_default(),
    }
}

/// `{a,b,c}` with element quoting and escaping.
fn format_array_literal(items: &[SqlValue], quote: bool) -> String {
    let rendered: Vec<String> = items
        .iter()
        .map(|item| match item {
            SqlValue::Null => "NULL".to_string(),
            other => {
                let text = other.to_text().unwrap_or_default();
                if quote {
                    quote_array_element(&text)
                } else {
                    text
                }
            }
        })
        .collect();
    format!("{{{}}}", rendered.join(","))
}

fn format_json_array_literal(items: &[serde_json::Value], quote: bool) -> String {
    let rendered: Vec<String> = items
        .iter()
        .map(|item| match item {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::String(s) if quote => quote_array_element(s),
            serde_json::Value::String(s) => s.clone(),
            other => {
                let text = other.to_string();
                if quote {
                    quote_array_element(&text)
                } else {
                    text
                }
            }
        })
        .collect();
    format!("{{{}}}", rendered.join(","))
}

fn quote_array_element(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Numeric and boolean array elements go unquoted; everything else is
/// quoted.
pub fn array_element_needs_quotes(element_udt: &str) -> bool {
    !matches!(
        element_udt,
        "int2" | "int4" | "int8" | "float4" | "float8" | "numeric" | "bool"
    )
}

// ============================================================================
// JSON canonicalization
// ============================================================================

const JSON_FIELD_INDICATORS: &[&str] = &[
    "json", "data", "metadata", "config", "settings", "params", "properties", "attributes",
    "extra", "custom", "payload",
];

/// Field names that conventionally hold JSON documents.
pub fn json_field_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    JSON_FIELD_INDICATORS.iter().any(|ind| lower.contains(ind))
}

/// Shallow structural check for JSON-looking strings.
pub fn looks_like_json(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || (trimmed.starts_with('"') && trimmed.ends_with('"'))
}

/// Parse-and-reserialize to guarantee valid, compact JSON; strings that do
/// not parse are wrapped as JSON strings.
pub fn sanitize_json_string(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "null".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(parsed) => compact_json(&parsed),
        Err(_) => serde_json::to_string(trimmed).unwrap_or_else(|_| "null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn text_col(name: &str) -> DestColumn {
        DestColumn {
            name: name.to_string(),
            data_type: "text".to_string(),
            udt_name: "text".to_string(),
        }
    }

    fn jsonb_col(name: &str) -> DestColumn {
        DestColumn {
            name: name.to_string(),
            data_type: "jsonb".to_string(),
            udt_name: "jsonb".to_string(),
        }
    }

    fn array_col(name: &str, element: &str) -> DestColumn {
        DestColumn {
            name: name.to_string(),
            data_type: "ARRAY".to_string(),
            udt_name: format!("_{element}"),
        }
    }

    #[test]
    fn scalar_text_forms() {
        assert_eq!(SqlValue::Int(42).to_text().unwrap(), "42");
        assert_eq!(SqlValue::Bool(true).to_text().unwrap(), "t");
        assert_eq!(SqlValue::Bool(false).to_text().unwrap(), "f");
        assert_eq!(SqlValue::Null.to_text(), None);
        assert_eq!(
            SqlValue::Bytes(vec![0xde, 0xad]).to_text().unwrap(),
            "\\xdead"
        );

        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(
            SqlValue::TimestampTz(ts).to_text().unwrap(),
            "2024-03-01 12:30:00.000000+00"
        );
    }

    #[test]
    fn non_finite_floats_use_postgres_spelling() {
        assert_eq!(SqlValue::Float(f64::NAN).to_text().unwrap(), "NaN");
        assert_eq!(SqlValue::Float(f64::INFINITY).to_text().unwrap(), "Infinity");
        assert_eq!(
            SqlValue::Float(f64::NEG_INFINITY).to_text().unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn text_array_elements_are_quoted_and_escaped() {
        let value = SqlValue::Array(vec![
            SqlValue::Text("plain".into()),
            SqlValue::Text("with \"quote\"".into()),
            SqlValue::Null,
        ]);
        let encoded = encode_for_column(&value, &array_col("tags", "text")).unwrap();
        assert_eq!(encoded, r#"{"plain","with \"quote\"",NULL}"#);
    }

    #[test]
    fn numeric_array_elements_go_unquoted() {
        let value = SqlValue::Array(vec![SqlValue::Int(1), SqlValue::Int(2), SqlValue::Int(3)]);
        let encoded = encode_for_column(&value, &array_col("ids", "int4")).unwrap();
        assert_eq!(encoded, "{1,2,3}");
    }

    #[test]
    fn json_arrays_convert_to_pg_literals() {
        let value = SqlValue::Text(r#"["a","b"]"#.into());
        let encoded = encode_for_column(&value, &array_col("tags", "text")).unwrap();
        assert_eq!(encoded, r#"{"a","b"}"#);

        let existing = SqlValue::Text("{x,y}".into());
        let encoded = encode_for_column(&existing, &array_col("tags", "text")).unwrap();
        assert_eq!(encoded, "{x,y}");
    }

    #[test]
    fn json_columns_canonicalize_structured_values() {
        let value = SqlValue::Json(serde_json::json!({"a": [true, null], "b": 1}));
        let encoded = encode_for_column(&value, &jsonb_col("payload")).unwrap();
        assert_eq!(encoded, r#"{"a":[true,null],"b":1}"#);
    }

    #[test]
    fn json_columns_repair_loose_strings() {
        let valid = SqlValue::Text(r#"{ "k" : 1 }"#.into());
        assert_eq!(
            encode_for_column(&valid, &jsonb_col("payload")).unwrap(),
            r#"{"k":1}"#
        );

        let invalid = SqlValue::Text("not json".into());
        assert_eq!(
            encode_for_column(&invalid, &jsonb_col("payload")).unwrap(),
            r#""not json""#
        );
    }

    #[test]
    fn json_suggestive_text_columns_are_recanonicalized() {
        let value = SqlValue::Text(r#"{ "k" : 1 }"#.into());
        assert_eq!(
            encode_for_column(&value, &text_col("metadata")).unwrap(),
            r#"{"k":1}"#
        );

        // Same value in a neutral column stays untouched.
        assert_eq!(
            encode_for_column(&value, &text_col("note")).unwrap(),
            r#"{ "k" : 1 }"#
        );

        // JSON-suggestive name but non-JSON content stays untouched.
        let plain = SqlValue::Text("plain words".into());
        assert_eq!(
            encode_for_column(&plain, &text_col("metadata")).unwrap(),
            "plain words"
        );
    }

    #[test]
    fn watermark_ordering_spans_families() {
        assert_eq!(
            SqlValue::Int(12).watermark_cmp(&SqlValue::Int(9)),
            Ordering::Greater
        );
        assert_eq!(
            SqlValue::Float(1.5).watermark_cmp(&SqlValue::Int(2)),
            Ordering::Less
        );

        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            SqlValue::TimestampTz(later).watermark_cmp(&SqlValue::TimestampTz(earlier)),
            Ordering::Greater
        );
    }

    #[test]
    fn cast_types_follow_udt_names() {
        assert_eq!(array_col("ids", "int4").cast_type(), "int4[]");
        assert_eq!(jsonb_col("payload").cast_type(), "jsonb");
        assert!(array_col("ids", "int4").is_complex());
        assert!(!jsonb_col("payload").is_complex());
    }
}
