//! LFS-style pointer files and the local content-addressed object cache.
//!
//! Tile datasets don't store tile bytes in the object database - each tile
//! is a small text pointer blob referencing the real object by SHA-256. The
//! objects themselves live in the cache laid out as
//! `lfs/objects/<hh>/<hh>/<sha256-hex>`, where `<hh><hh>` are the first two
//! bytes of the hash. Cache writes land in a temporary path and atomically
//! rename into place, so duplicate writes of the same OID are idempotent.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use bstr::ByteSlice;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::StrataError;

/// The first line of every pointer file.
pub const POINTER_FILE_VERSION: &str = "https://git-lfs.github.com/spec/v1";

/// A parsed pointer file: the referenced object plus any extra headers
/// (format, CRS, extent, provenance, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointerFile {
    /// `sha256:<hex>`
    pub oid: String,
    pub size: u64,
    pub extra: BTreeMap<String, String>,
}

impl PointerFile {
    pub fn new(oid_hex: &str, size: u64) -> PointerFile {
        let oid = if oid_hex.starts_with("sha256:") {
            oid_hex.to_string()
        } else {
            format!("sha256:{oid_hex}")
        };
        PointerFile {
            oid,
            size,
            extra: BTreeMap::new(),
        }
    }

    /// The bare hex digest, without the `sha256:` prefix.
    pub fn oid_hex(&self) -> &str {
        self.oid.strip_prefix("sha256:").unwrap_or(&self.oid)
    }

    /// Serialize: version line, `oid`, `size`, then the extra headers sorted
    /// lexicographically, each line LF-terminated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "version {POINTER_FILE_VERSION}\noid {}\nsize {}\n",
            self.oid, self.size
        );
        for (key, value) in &self.extra {
            out.push_str(key);
            out.push(' ');
            out.push_str(value);
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Parse pointer-file bytes. Unknown headers are kept; a missing
    /// version, oid or size is an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<PointerFile, StrataError> {
        let invalid = |why: &str| {
            StrataError::InvalidArgument(format!("Invalid pointer file: {why}"))
        };
        let mut version = None;
        let mut oid = None;
        let mut size = None;
        let mut extra = BTreeMap::new();

        for line in bytes.lines() {
            if line.is_empty() {
                continue;
            }
            let line = line.to_str().map_err(|_| invalid("non-utf8 line"))?;
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| invalid("line without a value"))?;
            match key {
                "version" => version = Some(value.to_string()),
                "oid" => oid = Some(value.to_string()),
                "size" => {
                    size = Some(value.parse().map_err(|_| invalid("unparseable size"))?)
                }
                _ => {
                    extra.insert(key.to_string(), value.to_string());
                }
            }
        }

        version.ok_or_else(|| invalid("missing version"))?;
        let oid: String = oid.ok_or_else(|| invalid("missing oid"))?;
        if !oid.starts_with("sha256:") {
            return Err(invalid("oid is not sha256"));
        }
        Ok(PointerFile {
            oid,
            size: size.ok_or_else(|| invalid("missing size"))?,
            extra,
        })
    }

    /// The pointer as a JSON map - the "tile summary" form used in diffs.
    /// The version header is implied and not included.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("oid".to_string(), Value::String(self.oid.clone()));
        map.insert("size".to_string(), Value::Number(self.size.into()));
        for (key, value) in &self.extra {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(map)
    }

    /// Build a pointer from a JSON map such as a tile summary. Keys other
    /// than `oid`/`size`/`version` become extra headers.
    pub fn from_json(value: &Value) -> Result<PointerFile, StrataError> {
        let map = value.as_object().ok_or_else(|| {
            StrataError::InvalidArgument("pointer dict must be an object".to_string())
        })?;
        let oid = map
            .get("oid")
            .and_then(Value::as_str)
            .ok_or_else(|| StrataError::InvalidArgument("pointer dict missing oid".to_string()))?;
        let size = map
            .get("size")
            .and_then(Value::as_u64)
            .ok_or_else(|| StrataError::InvalidArgument("pointer dict missing size".to_string()))?;
        let mut pointer = PointerFile::new(oid, size);
        for (key, value) in map {
            if matches!(key.as_str(), "oid" | "size" | "version") {
                continue;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pointer.extra.insert(key.clone(), text);
        }
        Ok(pointer)
    }
}

/// Merge two pointer dicts (later keys win) and encode the result.
pub fn merge_dicts_to_pointer_file_bytes(a: &Value, b: &Value) -> Result<Vec<u8>, StrataError> {
    let mut merged = a
        .as_object()
        .cloned()
        .ok_or_else(|| StrataError::InvalidArgument("pointer dict must be an object".into()))?;
    if let Some(overlay) = b.as_object() {
        for (key, value) in overlay {
            merged.insert(key.clone(), value.clone());
        }
    }
    Ok(PointerFile::from_json(&Value::Object(merged))?.to_bytes())
}

/// The local cache path for an object hash.
pub fn lfs_object_path(lfs_root: &Path, oid_hex: &str) -> PathBuf {
    lfs_root
        .join("objects")
        .join(&oid_hex[0..2])
        .join(&oid_hex[2..4])
        .join(oid_hex)
}

/// Scratch directory for in-flight cache writes.
pub fn lfs_tmp_path(lfs_root: &Path) -> PathBuf {
    lfs_root.join("tmp")
}

/// SHA-256 and byte length of a file on disk.
pub fn hash_and_size_of_file(path: &Path) -> Result<(String, u64), StrataError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// A function converting a tile during import: `(source, dest)` paths.
pub type ConversionFunc<'a> = &'a (dyn Fn(&Path, &Path) -> Result<(), StrataError> + Sync);

/// Copy (optionally converting) a file into the local LFS cache, returning
/// the pointer dict `{"oid": "sha256:<hex>", "size": <n>}` for the cached
/// object.
///
/// The write goes to a uuid-named temp path first and renames into place.
/// When `preserve_original` is false the source file was only fetched for
/// this import and is deleted afterwards.
pub fn copy_file_to_local_lfs_cache(
    lfs_root: &Path,
    source: &Path,
    conversion_func: Option<ConversionFunc<'_>>,
    oid_and_size: Option<(String, u64)>,
    preserve_original: bool,
) -> Result<Value, StrataError> {
    let tmp_dir = lfs_tmp_path(lfs_root);
    fs::create_dir_all(&tmp_dir)?;

    let (staged, owned_tmp) = match conversion_func {
        Some(convert) => {
            let tmp = tmp_dir.join(uuid::Uuid::new_v4().to_string());
            convert(source, &tmp)?;
            (tmp, true)
        }
        None => (source.to_path_buf(), false),
    };

    let (oid_hex, size) = match (&oid_and_size, owned_tmp) {
        (Some((oid, size)), false) => (
            oid.strip_prefix("sha256:").unwrap_or(oid).to_string(),
            *size,
        ),
        // Converted output always gets re-hashed.
        _ => hash_and_size_of_file(&staged)?,
    };

    let final_path = lfs_object_path(lfs_root, &oid_hex);
    fs::create_dir_all(final_path.parent().expect("object path has a parent"))?;

    if final_path.exists() {
        // Duplicate write of the same OID; nothing to do.
        if owned_tmp {
            fs::remove_file(&staged).ok();
        }
    } else if owned_tmp {
        fs::rename(&staged, &final_path)?;
    } else {
        let tmp = tmp_dir.join(uuid::Uuid::new_v4().to_string());
        fs::copy(&staged, &tmp)?;
        fs::rename(&tmp, &final_path)?;
    }

    if !preserve_original {
        fs::remove_file(source).ok();
    }

    let mut map = Map::new();
    map.insert("oid".to_string(), Value::String(format!("sha256:{oid_hex}")));
    map.insert("size".to_string(), Value::Number(size.into()));
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_pointer_roundtrip() {
        let mut pointer = PointerFile::new("ab".repeat(32).as_str(), 1234);
        pointer
            .extra
            .insert("format".to_string(), "pc:v1/copc-1.0".to_string());
        pointer
            .extra
            .insert("crs".to_string(), "EPSG:2193".to_string());

        let bytes = pointer.to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("version {POINTER_FILE_VERSION}"));
        assert!(lines[1].starts_with("oid sha256:"));
        assert!(lines[2].starts_with("size "));
        // extra headers sorted lexicographically
        assert!(lines[3].starts_with("crs "));
        assert!(lines[4].starts_with("format "));

        assert_eq!(PointerFile::from_bytes(&bytes).unwrap(), pointer);
    }

    #[test]
    fn test_pointer_rejects_missing_fields() {
        assert!(PointerFile::from_bytes(b"oid sha256:abcd\nsize 1\n").is_err());
        assert!(
            PointerFile::from_bytes(
                format!("version {POINTER_FILE_VERSION}\nsize 1\n").as_bytes()
            )
            .is_err()
        );
    }

    #[test]
    fn test_pointer_json_roundtrip() {
        let summary = json!({
            "oid": format!("sha256:{}", "cd".repeat(32)),
            "size": 42,
            "format": "laz-1.4",
        });
        let pointer = PointerFile::from_json(&summary).unwrap();
        assert_eq!(pointer.to_json(), summary);
    }

    #[test]
    fn test_cache_copy_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let lfs_root = dir.path().join("lfs");
        let source = dir.path().join("tile.laz");
        fs::write(&source, b"tile-bytes").unwrap();

        let pointer = copy_file_to_local_lfs_cache(&lfs_root, &source, None, None, true).unwrap();
        let oid_hex = pointer["oid"]
            .as_str()
            .unwrap()
            .strip_prefix("sha256:")
            .unwrap()
            .to_string();
        let cached = lfs_object_path(&lfs_root, &oid_hex);
        assert!(cached.exists());
        assert!(source.exists());
        assert_eq!(pointer["size"], json!(10));

        // Writing the same object again is a no-op.
        let again = copy_file_to_local_lfs_cache(&lfs_root, &source, None, None, true).unwrap();
        assert_eq!(again, pointer);
    }

    #[test]
    fn test_cache_copy_with_conversion_deletes_fetched_source() {
        let dir = tempfile::tempdir().unwrap();
        let lfs_root = dir.path().join("lfs");
        let source = dir.path().join("downloaded.laz");
        fs::write(&source, b"raw").unwrap();

        let convert: ConversionFunc<'_> = &|src, dest| {
            let mut data = fs::read(src)?;
            data.extend(b"-converted");
            fs::write(dest, data)?;
            Ok(())
        };
        let pointer =
            copy_file_to_local_lfs_cache(&lfs_root, &source, Some(convert), None, false).unwrap();

        assert!(!source.exists());
        let oid_hex = pointer["oid"]
            .as_str()
            .unwrap()
            .strip_prefix("sha256:")
            .unwrap()
            .to_string();
        let cached = lfs_object_path(&lfs_root, &oid_hex);
        assert_eq!(fs::read(cached).unwrap(), b"raw-converted");
    }
}
