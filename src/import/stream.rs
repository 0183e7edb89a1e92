//! Writing the importer protocol: commit headers, inline blobs, by-OID
//! copies and deletions, plus the scoped runner that guarantees the stream
//! is terminated and the importer's exit is awaited on every path.

use std::io::Write;
use std::sync::Arc;

use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::importer::{ImporterHandle, streaming_importer};
use crate::odb::signature::Signature;
use crate::odb::store::ObjectDb;

/// Write one inline blob: `M 644 inline <path>` followed by its data block.
pub fn write_blob_to_stream(
    stream: &mut dyn Write,
    blob_path: &str,
    blob_data: &[u8],
) -> Result<(), StrataError> {
    write!(stream, "M 644 inline {blob_path}\ndata {}\n", blob_data.len())?;
    stream.write_all(blob_data)?;
    stream.write_all(b"\n")?;
    Ok(())
}

/// Write a sequence of `(path, data)` blobs.
pub fn write_blobs_to_stream(
    stream: &mut dyn Write,
    blobs: impl IntoIterator<Item = (String, Vec<u8>)>,
) -> Result<usize, StrataError> {
    let mut count = 0;
    for (blob_path, blob_data) in blobs {
        write_blob_to_stream(stream, &blob_path, &blob_data)?;
        count += 1;
    }
    Ok(count)
}

/// Reference an existing blob by OID instead of re-sending its bytes.
pub fn copy_existing_blob_to_stream(
    stream: &mut dyn Write,
    blob_path: &str,
    blob_oid: ObjectHash,
) -> Result<(), StrataError> {
    writeln!(stream, "M 644 {blob_oid} {blob_path}")?;
    Ok(())
}

/// Delete the blob (or entire subtree) at a path.
pub fn write_delete_to_stream(stream: &mut dyn Write, path: &str) -> Result<(), StrataError> {
    writeln!(stream, "D {path}")?;
    Ok(())
}

/// Generate the commit header for an import onto `dest_ref`.
pub fn generate_header(
    author: &Signature,
    committer: &Signature,
    message: &str,
    dest_ref: &str,
    from_commit: Option<ObjectHash>,
) -> String {
    let mut header = format!(
        "commit {dest_ref}\nauthor {author}\ncommitter {committer}\ndata {}\n{message}\n",
        message.len(),
    );
    if let Some(from) = from_commit {
        header.push_str(&format!("from {from}\n"));
    }
    header
}

/// Open a streaming importer, run `body` against its stream, then terminate
/// the stream and await the importer's exit.
///
/// The `done` terminator is only sent when `body` succeeds - on failure the
/// stream is torn down early, which the importer treats as a failed import,
/// so no partial commit reaches any ref. Either way the importer's exit is
/// always awaited.
pub fn with_streaming_importer<T>(
    odb: &Arc<ObjectDb>,
    body: impl FnOnce(&mut dyn Write) -> Result<T, StrataError>,
) -> Result<T, StrataError> {
    let mut handle: ImporterHandle = streaming_importer(odb.clone());
    let body_result = body(&mut handle.stdin);
    if body_result.is_ok() {
        handle.stdin.write_all(b"\ndone\n")?;
    }
    let exit_result = handle.finish();
    let value = body_result?;
    exit_result?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};
    use crate::odb::signature::SignatureType;

    fn sig(t: SignatureType) -> Signature {
        Signature {
            signature_type: t,
            name: "tester".into(),
            email: "t@example.com".into(),
            timestamp: 1700000000,
            timezone: "+0000".into(),
        }
    }

    #[test]
    fn test_header_format() {
        let header = generate_header(
            &sig(SignatureType::Author),
            &sig(SignatureType::Committer),
            "import stuff",
            "refs/strata-import/x",
            None,
        );
        assert!(header.starts_with("commit refs/strata-import/x\n"));
        assert!(header.contains("author tester <t@example.com> 1700000000 +0000\n"));
        assert!(header.contains("data 12\nimport stuff\n"));
        assert!(!header.contains("from "));
    }

    #[test]
    fn test_scoped_import_commits_on_success() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = Arc::new(ObjectDb::new());
        with_streaming_importer(&odb, |stream| {
            let header = generate_header(
                &sig(SignatureType::Author),
                &sig(SignatureType::Committer),
                "msg",
                "refs/heads/main",
                None,
            );
            stream.write_all(header.as_bytes())?;
            write_blob_to_stream(stream, "a", b"1")?;
            Ok(())
        })
        .unwrap();
        assert!(odb.get_ref("refs/heads/main").is_some());
    }

    #[test]
    fn test_scoped_import_aborts_on_body_error() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = Arc::new(ObjectDb::new());
        let result: Result<(), _> = with_streaming_importer(&odb, |stream| {
            let header = generate_header(
                &sig(SignatureType::Author),
                &sig(SignatureType::Committer),
                "msg",
                "refs/heads/main",
                None,
            );
            stream.write_all(header.as_bytes())?;
            Err(StrataError::InvalidOperation("simulated failure".into()))
        });
        assert!(matches!(result, Err(StrataError::InvalidOperation(_))));
        // The aborted import never touched the ref.
        assert!(odb.get_ref("refs/heads/main").is_none());
    }
}
