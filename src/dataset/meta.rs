//! Meta item encoding: the file-type table that decides how a meta item
//! canonicalizes to bytes.
//!
//! Two logically-equal meta items must encode to byte-identical blobs, so
//! every file type has exactly one canonical form: JSON is compact with
//! sorted keys, WKT collapses internal whitespace, and all text forms are
//! LF-terminated.

use serde_json::Value;

use crate::errors::StrataError;
use crate::serialise::{json_pack, json_unpack};

/// How a named meta item serializes to its blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaItemFileType {
    Json,
    Wkt,
    Xml,
    Text,
    /// Verbatim bytes - schema legends and other internal blobs.
    Bytes,
}

impl MetaItemFileType {
    /// Choose the file type from the item name, by suffix.
    pub fn from_item_name(name: &str) -> MetaItemFileType {
        if name.starts_with("legend/") {
            return MetaItemFileType::Bytes;
        }
        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("json") => MetaItemFileType::Json,
            Some("wkt") => MetaItemFileType::Wkt,
            Some("xml") => MetaItemFileType::Xml,
            _ => MetaItemFileType::Text,
        }
    }

    /// Canonicalize a decoded value into blob bytes.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        match self {
            MetaItemFileType::Json => json_pack(value),
            MetaItemFileType::Wkt => {
                let text = value_as_text(value)?;
                Ok(ensure_trailing_newline(normalise_wkt(&text)))
            }
            MetaItemFileType::Xml | MetaItemFileType::Text => {
                let text = value_as_text(value)?;
                Ok(ensure_trailing_newline(text))
            }
            MetaItemFileType::Bytes => match value {
                Value::String(s) => Ok(s.as_bytes().to_vec()),
                _ => Err(StrataError::InvalidArgument(
                    "bytes meta item must be a string".to_string(),
                )),
            },
        }
    }

    /// Decode blob bytes back into a value.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        match self {
            MetaItemFileType::Json => json_unpack(bytes),
            MetaItemFileType::Wkt | MetaItemFileType::Xml | MetaItemFileType::Text => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    StrataError::InvalidArgument("meta item is not valid UTF-8".to_string())
                })?;
                Ok(Value::String(text.trim_end_matches('\n').to_string()))
            }
            MetaItemFileType::Bytes => Ok(Value::String(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }
}

fn value_as_text(value: &Value) -> Result<String, StrataError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(StrataError::InvalidArgument(format!(
            "expected a text meta item, got: {value}"
        ))),
    }
}

fn ensure_trailing_newline(mut text: String) -> Vec<u8> {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text.into_bytes()
}

/// Drop whitespace outside quoted sections. WKT structure is carried by
/// brackets and commas, so unquoted whitespace is purely cosmetic.
fn normalise_wkt(wkt: &str) -> String {
    let mut result = String::with_capacity(wkt.len());
    let mut in_quotes = false;
    for c in wkt.trim().chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        if !in_quotes && c.is_whitespace() {
            continue;
        }
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_file_type_from_name() {
        assert_eq!(
            MetaItemFileType::from_item_name("schema.json"),
            MetaItemFileType::Json
        );
        assert_eq!(
            MetaItemFileType::from_item_name("crs/EPSG:4326.wkt"),
            MetaItemFileType::Wkt
        );
        assert_eq!(
            MetaItemFileType::from_item_name("metadata.xml"),
            MetaItemFileType::Xml
        );
        assert_eq!(
            MetaItemFileType::from_item_name("title"),
            MetaItemFileType::Text
        );
        assert_eq!(
            MetaItemFileType::from_item_name("legend/0123abcd"),
            MetaItemFileType::Bytes
        );
    }

    #[test]
    fn test_json_is_canonical() {
        let a = json!({"z": 1, "a": [1, 2]});
        let b = json!({"a": [1, 2], "z": 1});
        let t = MetaItemFileType::Json;
        assert_eq!(t.encode(&a).unwrap(), t.encode(&b).unwrap());
        assert_eq!(t.decode(&t.encode(&a).unwrap()).unwrap(), a);
    }

    #[test]
    fn test_text_is_newline_terminated() {
        let t = MetaItemFileType::Text;
        assert_eq!(t.encode(&json!("A title")).unwrap(), b"A title\n");
        assert_eq!(t.encode(&json!("A title\n")).unwrap(), b"A title\n");
        assert_eq!(t.decode(b"A title\n").unwrap(), json!("A title"));
    }

    #[test]
    fn test_wkt_whitespace_normalised() {
        let t = MetaItemFileType::Wkt;
        let messy = json!("GEOGCS[ \"WGS 84\",\n    DATUM[ \"WGS_1984\" ] ]");
        let tidy = json!("GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\"]]");
        assert_eq!(t.encode(&messy).unwrap(), t.encode(&tidy).unwrap());
    }

    #[test]
    fn test_wkt_quoted_whitespace_preserved() {
        let t = MetaItemFileType::Wkt;
        let encoded = t.encode(&json!("PROJCS[\"NZGD2000 /  NZTM\"]")).unwrap();
        assert_eq!(encoded, b"PROJCS[\"NZGD2000 /  NZTM\"]\n");
    }
}
