//! Column metadata and its compact storage encoding.
//!
//! The replica keeps one metadata record per user column so that
//! backfills and schema-drift checks can compare against the upstream
//! definition. Records are persisted as a single "lite type string":
//! the upstream type name, an optional `(maxlen)` qualifier, a `[]`
//! suffix for arrays, and `|`-separated flags. Examples:
//!
//! ```text
//! int8
//! varchar(180)|NOT_NULL
//! mood|NOT_NULL|ENUM
//! jsonb[]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::VersionError;

const FLAG_NOT_NULL: &str = "NOT_NULL";
const FLAG_ENUM: &str = "ENUM";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub upstream_type: String,
    #[serde(default)]
    pub is_not_null: bool,
    #[serde(default)]
    pub is_enum: bool,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_max_length: Option<u32>,
}

impl ColumnMetadata {
    pub fn of(upstream_type: impl Into<String>) -> Self {
        ColumnMetadata {
            upstream_type: upstream_type.into(),
            is_not_null: false,
            is_enum: false,
            is_array: false,
            character_max_length: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.is_not_null = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn enum_type(mut self) -> Self {
        self.is_enum = true;
        self
    }

    pub fn max_length(mut self, len: u32) -> Self {
        self.character_max_length = Some(len);
        self
    }

    /// Encodes into the lite type string. [`ColumnMetadata::parse`] is the
    /// lossless inverse.
    pub fn encode(&self) -> String {
        let mut out = self.upstream_type.clone();
        if let Some(len) = self.character_max_length {
            out.push_str(&format!("({len})"));
        }
        if self.is_array {
            out.push_str("[]");
        }
        if self.is_not_null {
            out.push('|');
            out.push_str(FLAG_NOT_NULL);
        }
        if self.is_enum {
            out.push('|');
            out.push_str(FLAG_ENUM);
        }
        out
    }

    pub fn parse(encoded: &str) -> Result<Self, VersionError> {
        let mut parts = encoded.split('|');
        let head = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| VersionError::Malformed(encoded.to_string()))?;

        let (head, is_array) = match head.strip_suffix("[]") {
            Some(rest) => (rest, true),
            None => (head, false),
        };
        let (upstream_type, character_max_length) = match head.strip_suffix(')') {
            Some(rest) => {
                let (name, len) = rest
                    .rsplit_once('(')
                    .ok_or_else(|| VersionError::Malformed(encoded.to_string()))?;
                let len = len
                    .parse::<u32>()
                    .map_err(|_| VersionError::Malformed(encoded.to_string()))?;
                (name.to_string(), Some(len))
            }
            None => (head.to_string(), None),
        };

        let mut meta = ColumnMetadata {
            upstream_type,
            is_not_null: false,
            is_enum: false,
            is_array,
            character_max_length,
        };
        for flag in parts {
            match flag {
                FLAG_NOT_NULL => meta.is_not_null = true,
                FLAG_ENUM => meta.is_enum = true,
                _ => return Err(VersionError::Malformed(encoded.to_string())),
            }
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ColumnMetadata::of("int8"), "int8")]
    #[case(ColumnMetadata::of("text").not_null(), "text|NOT_NULL")]
    #[case(ColumnMetadata::of("varchar").not_null().max_length(180), "varchar(180)|NOT_NULL")]
    #[case(ColumnMetadata::of("mood").not_null().enum_type(), "mood|NOT_NULL|ENUM")]
    #[case(ColumnMetadata::of("jsonb").array(), "jsonb[]")]
    #[case(ColumnMetadata::of("varchar").array().max_length(16), "varchar(16)[]")]
    fn roundtrip(#[case] meta: ColumnMetadata, #[case] encoded: &str) {
        assert_eq!(meta.encode(), encoded);
        assert_eq!(ColumnMetadata::parse(encoded).unwrap(), meta);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "|NOT_NULL", "int8|WAT", "varchar(x)"] {
            assert!(ColumnMetadata::parse(bad).is_err(), "{bad:?}");
        }
    }
}
