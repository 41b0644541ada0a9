//! Converting upstream text-format values into JSON rows.
//!
//! Streaming tuples identify their type by OID; backfill COPY output is
//! interpreted through the column metadata collected at sync time. Both
//! converge on `serde_json::Value`, which is what rows look like
//! everywhere downstream.

use serde_json::Value;
use zero_core::lite::ColumnMetadata;

// Common type OIDs; see pg_type.dat.
const BOOL: u32 = 16;
const INT2: u32 = 21;
const INT4: u32 = 23;
const INT8: u32 = 20;
const FLOAT4: u32 = 700;
const FLOAT8: u32 = 701;
const NUMERIC: u32 = 1700;
const JSON: u32 = 114;
const JSONB: u32 = 3802;

/// Maps a type OID to the upstream type name we persist in column
/// metadata. Unknown OIDs fall back to `text`.
pub fn type_name(oid: u32) -> &'static str {
    match oid {
        BOOL => "bool",
        INT2 => "int2",
        INT4 => "int4",
        INT8 => "int8",
        FLOAT4 => "float4",
        FLOAT8 => "float8",
        NUMERIC => "numeric",
        JSON => "json",
        JSONB => "jsonb",
        25 => "text",
        1043 => "varchar",
        2950 => "uuid",
        1082 => "date",
        1114 => "timestamp",
        1184 => "timestamptz",
        17 => "bytea",
        _ => "text",
    }
}

/// Parses a streaming tuple value by its type OID.
pub fn parse_by_oid(text: &str, oid: u32) -> Value {
    match oid {
        BOOL => Value::Bool(text == "t" || text == "true"),
        INT2 | INT4 | INT8 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        FLOAT4 | FLOAT8 | NUMERIC => text
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(text.to_string())),
        JSON | JSONB => serde_json::from_str(text)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

/// Parses a COPY text-format value through the column's metadata. Array
/// columns decode the `{...}` literal into a JSON array of
/// element-parsed values.
pub fn parse_by_metadata(text: &str, meta: &ColumnMetadata) -> Value {
    if meta.is_array {
        return parse_array(text, &meta.upstream_type);
    }
    parse_scalar(text, &meta.upstream_type)
}

fn parse_scalar(text: &str, upstream_type: &str) -> Value {
    match upstream_type {
        "bool" | "boolean" => Value::Bool(text == "t" || text == "true"),
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "oid" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "float4" | "float8" | "real" | "double precision" | "numeric" => text
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(text.to_string())),
        "json" | "jsonb" => serde_json::from_str(text)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

/// Decodes a Postgres array literal (`{a,b,NULL,"c d"}`).
fn parse_array(text: &str, element_type: &str) -> Value {
    let Some(inner) = text
        .strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
    else {
        return Value::String(text.to_string());
    };
    if inner.is_empty() {
        return Value::Array(Vec::new());
    }

    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => {
                in_quotes = true;
                was_quoted = true;
            }
            '"' => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !in_quotes => {
                elements.push(array_element(&current, was_quoted, element_type));
                current.clear();
                was_quoted = false;
            }
            c => current.push(c),
        }
    }
    elements.push(array_element(&current, was_quoted, element_type));
    Value::Array(elements)
}

fn array_element(raw: &str, was_quoted: bool, element_type: &str) -> Value {
    if !was_quoted && raw == "NULL" {
        return Value::Null;
    }
    parse_scalar(raw, element_type)
}

/// Undoes COPY text-format escaping for one field. `\N` (a null field)
/// is handled by the caller.
pub fn unescape_copy_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("42", INT8, json!(42))]
    #[case("t", BOOL, json!(true))]
    #[case("1.5", FLOAT8, json!(1.5))]
    #[case(r#"{"d":1}"#, JSONB, json!({"d":1}))]
    #[case("hello", 25, json!("hello"))]
    #[case("not-a-number", INT8, json!("not-a-number"))]
    fn oid_parsing(#[case] text: &str, #[case] oid: u32, #[case] expected: Value) {
        assert_eq!(parse_by_oid(text, oid), expected);
    }

    #[test]
    fn array_literals_decode_elementwise() {
        let meta = ColumnMetadata::of("int8").array();
        assert_eq!(parse_by_metadata("{1,2,3}", &meta), json!([1, 2, 3]));

        let meta = ColumnMetadata::of("text").array();
        assert_eq!(
            parse_by_metadata(r#"{a,"b c",NULL,"NULL"}"#, &meta),
            json!(["a", "b c", null, "NULL"])
        );

        let meta = ColumnMetadata::of("json").array();
        assert_eq!(
            parse_by_metadata(r#"{"{\"e\":4}",5}"#, &meta),
            json!([{"e": 4}, 5])
        );

        let meta = ColumnMetadata::of("int8").array();
        assert_eq!(parse_by_metadata("{}", &meta), json!([]));
    }

    #[test]
    fn copy_escapes_roundtrip() {
        assert_eq!(unescape_copy_field(r"a\tb"), "a\tb");
        assert_eq!(unescape_copy_field(r"line\nbreak"), "line\nbreak");
        assert_eq!(unescape_copy_field(r"back\\slash"), "back\\slash");
        assert_eq!(unescape_copy_field("plain"), "plain");
    }
}
