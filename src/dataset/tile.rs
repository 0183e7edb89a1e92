//! The tile dataset codec: pointer blob paths derived from tile names, and
//! pointer summaries for diffs.

use serde_json::Value;

use crate::errors::StrataError;
use crate::lfs::PointerFile;
use crate::serialise::hexhash;

/// Extensions recognised as tile files, longest first so `.copc.laz` wins
/// over `.laz`.
const TILE_EXTENSIONS: &[&str] = &[".copc.laz", ".laz", ".las", ".tiff", ".tif"];

/// `auckland_3.laz` -> `auckland_3`.
pub fn remove_tile_extension(filename: &str) -> String {
    for ext in TILE_EXTENSIONS {
        if let Some(stripped) = filename.strip_suffix(ext) {
            return stripped.to_string();
        }
    }
    filename.to_string()
}

/// The tile's name from a source path: basename, extension removed.
pub fn tilename_from_path(source: &str) -> String {
    let basename = source
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(source);
    remove_tile_extension(basename)
}

/// The pointer blob path for a tile, relative to the dataset marker
/// directory: `tile/<aa>/<tilename>` with a hash-prefix fanout.
pub fn tilename_to_rel_path(tilename: &str) -> String {
    let prefix = &hexhash(tilename.as_bytes())[0..2];
    format!("tile/{prefix}/{tilename}")
}

/// Blob path -> tile name.
pub fn tilename_from_rel_path(rel_path: &str) -> String {
    rel_path
        .rsplit('/')
        .next()
        .unwrap_or(rel_path)
        .to_string()
}

/// Decode a pointer blob into the tile summary used in diffs: the pointer's
/// headers as a JSON map, minus the version header.
pub fn tile_summary_from_pointer_blob(blob: &[u8]) -> Result<Value, StrataError> {
    Ok(PointerFile::from_bytes(blob)?.to_json())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_tile_extension() {
        assert_eq!(remove_tile_extension("auckland_3.laz"), "auckland_3");
        assert_eq!(remove_tile_extension("auckland_3.copc.laz"), "auckland_3");
        assert_eq!(remove_tile_extension("dem.tif"), "dem");
        assert_eq!(remove_tile_extension("noext"), "noext");
    }

    #[test]
    fn test_tilename_from_path() {
        assert_eq!(tilename_from_path("/data/tiles/auckland_3.laz"), "auckland_3");
        assert_eq!(tilename_from_path("auckland_3.laz"), "auckland_3");
    }

    #[test]
    fn test_rel_path_is_deterministic() {
        let a = tilename_to_rel_path("auckland_3");
        assert_eq!(a, tilename_to_rel_path("auckland_3"));
        assert!(a.starts_with("tile/"));
        assert_eq!(tilename_from_rel_path(&a), "auckland_3");
    }

    #[test]
    fn test_summary_strips_version() {
        let mut pointer = PointerFile::new(&"ab".repeat(32), 7);
        pointer.extra.insert("format".into(), "laz-1.4".into());
        let summary = tile_summary_from_pointer_blob(&pointer.to_bytes()).unwrap();
        assert!(summary.get("version").is_none());
        assert_eq!(summary["size"], serde_json::json!(7));
        assert_eq!(summary["format"], serde_json::json!("laz-1.4"));
    }
}
