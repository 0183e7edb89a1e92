//! The streaming importer: consumes a `fast-import`-style command stream and
//! turns it into commits in the object store.
//!
//! The grammar accepted here is the text protocol the import pipeline
//! writes:
//!
//! ```text
//! commit <ref>
//! author <name> <email> <when> <tz>
//! committer <name> <email> <when> <tz>
//! data <len>
//! <message bytes>
//! [from <oid>]
//! (M 644 inline <path>
//!  data <len>
//!  <bytes>
//!  | M 644 <existing-oid> <path>
//!  | D <path>)*
//! done
//! ```
//!
//! The producer writes into a bounded channel and the parser applies the
//! commands on its own thread; the channel stands in for the pipe to an
//! external `git fast-import` process, and closing it early counts as a
//! failed import (exit-code semantics preserved). Writes after the parser
//! has died are tolerated like EPIPE - the failure surfaces when the
//! producer waits for the importer to finish.

use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use bstr::ByteSlice;

use crate::errors::StrataError;
use crate::hash::{ObjectHash, get_hash_kind, set_hash_kind};
use crate::odb::commit::Commit;
use crate::odb::signature::Signature;
use crate::odb::store::ObjectDb;

/// The write end handed to the producer. Implements `std::io::Write`;
/// a dead parser is tolerated silently, like writing to a broken pipe.
pub struct ImporterStdin {
    tx: Option<SyncSender<Vec<u8>>>,
}

impl Write for ImporterStdin {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(tx) = self.tx.take() {
            // A send failure means the parser exited early; drop the data
            // and let finish() report.
            if tx.send(buf.to_vec()).is_ok() {
                self.tx = Some(tx);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Handle to a running importer: the stream plus the await-exit half.
pub struct ImporterHandle {
    pub stdin: ImporterStdin,
    thread: JoinHandle<Result<(), StrataError>>,
}

impl ImporterHandle {
    /// Close the stream and wait for the importer to finish. A parse failure
    /// or early termination maps to a `Subprocess` error.
    pub fn finish(mut self) -> Result<(), StrataError> {
        self.stdin.tx = None;
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(StrataError::Subprocess {
                message: "importer thread panicked".to_string(),
                exit_code: 128,
            }),
        }
    }
}

/// Open a streaming importer over the given object store.
pub fn streaming_importer(odb: Arc<ObjectDb>) -> ImporterHandle {
    let (tx, rx) = sync_channel::<Vec<u8>>(64);
    let hash_kind = get_hash_kind();
    let thread = std::thread::spawn(move || {
        set_hash_kind(hash_kind);
        let mut parser = Parser {
            reader: ChannelReader::new(rx),
            odb,
        };
        parser.run()
    });
    ImporterHandle {
        stdin: ImporterStdin { tx: Some(tx) },
        thread,
    }
}

/// Buffered reader over the command channel.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> ChannelReader {
        ChannelReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Pull one more chunk into the buffer. False when the channel closed.
    fn fill(&mut self) -> bool {
        match self.rx.recv() {
            Ok(chunk) => {
                if self.pos > 0 && self.pos == self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                self.buf.extend(chunk);
                true
            }
            Err(_) => false,
        }
    }

    /// Next line without its trailing newline; `None` at end of stream.
    fn read_line(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(nl) = memchr::memchr(b'\n', &self.buf[self.pos..]) {
                let line = self.buf[self.pos..self.pos + nl].to_vec();
                self.pos += nl + 1;
                return Some(line);
            }
            if !self.fill() {
                if self.pos < self.buf.len() {
                    let line = self.buf[self.pos..].to_vec();
                    self.pos = self.buf.len();
                    return Some(line);
                }
                return None;
            }
        }
    }

    /// Exactly `n` bytes; `None` when the stream ends first.
    fn read_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.buf.len() - self.pos < n {
            if !self.fill() {
                return None;
            }
        }
        let data = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Some(data)
    }
}

/// One in-flight commit being assembled.
struct PendingCommit {
    dest_ref: String,
    author: Option<Signature>,
    committer: Option<Signature>,
    message: String,
    parents: Vec<ObjectHash>,
    /// Flat path -> blob OID index the M/D commands mutate.
    index: BTreeMap<String, ObjectHash>,
    /// `from` is only legal before the first file command.
    from_allowed: bool,
}

struct Parser {
    reader: ChannelReader,
    odb: Arc<ObjectDb>,
}

impl Parser {
    fn run(&mut self) -> Result<(), StrataError> {
        let mut pending: Option<PendingCommit> = None;
        let mut done = false;

        while let Some(line) = self.reader.read_line() {
            if line.is_empty() {
                continue;
            }
            if line == b"done" {
                done = true;
                break;
            }

            if let Some(dest_ref) = line.strip_prefix(b"commit ") {
                if let Some(prev) = pending.take() {
                    self.finalize(prev)?;
                }
                pending = Some(self.parse_commit_header(dest_ref)?);
                continue;
            }

            let commit = pending
                .as_mut()
                .ok_or_else(|| protocol_error("file command outside a commit"))?;

            if let Some(oid) = line.strip_prefix(b"from ") {
                if !commit.from_allowed {
                    return Err(protocol_error("`from` after file commands"));
                }
                let oid = ObjectHash::from_str(
                    oid.to_str().map_err(|_| protocol_error("non-utf8 oid"))?,
                )
                .map_err(StrataError::InvalidArgument)?;
                let parent = self.odb.read_commit(&oid)?;
                commit.index = self.odb.flatten_tree(parent.tree_id)?;
                commit.parents.push(oid);
                commit.from_allowed = false;
                continue;
            }
            commit.from_allowed = false;

            if let Some(rest) = line.strip_prefix(b"M ") {
                self.parse_modify(commit, rest)?;
            } else if let Some(path) = line.strip_prefix(b"D ") {
                let prefix = path.to_str().map_err(|_| protocol_error("non-utf8 path"))?;
                // D deletes a blob, or everything below a directory.
                commit.index.remove(prefix);
                let dir = format!("{prefix}/");
                commit.index.retain(|p, _| !p.starts_with(&dir));
            } else {
                return Err(protocol_error(&format!(
                    "unrecognised command: {:?}",
                    line.as_bstr()
                )));
            }
        }

        if !done {
            return Err(StrataError::Subprocess {
                message: "import stream ended before `done`".to_string(),
                exit_code: 1,
            });
        }
        if let Some(prev) = pending.take() {
            self.finalize(prev)?;
        }
        Ok(())
    }

    fn parse_commit_header(&mut self, dest_ref: &[u8]) -> Result<PendingCommit, StrataError> {
        let dest_ref = dest_ref
            .to_str()
            .map_err(|_| protocol_error("non-utf8 ref"))?
            .to_string();
        let mut commit = PendingCommit {
            dest_ref,
            author: None,
            committer: None,
            message: String::new(),
            parents: Vec::new(),
            index: BTreeMap::new(),
            from_allowed: true,
        };

        loop {
            let line = self
                .reader
                .read_line()
                .ok_or_else(|| protocol_error("truncated commit header"))?;
            if line.starts_with(b"author ") {
                commit.author = Some(Signature::from_data(&line)?);
            } else if line.starts_with(b"committer ") {
                commit.committer = Some(Signature::from_data(&line)?);
            } else if let Some(len) = line.strip_prefix(b"data ") {
                let len: usize = len
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| protocol_error("bad data length"))?;
                let message = self
                    .reader
                    .read_exact(len)
                    .ok_or_else(|| protocol_error("truncated commit message"))?;
                commit.message = message
                    .to_str()
                    .map_err(|_| protocol_error("non-utf8 commit message"))?
                    .to_string();
                break;
            } else {
                return Err(protocol_error("malformed commit header"));
            }
        }

        Ok(commit)
    }

    /// `644 inline <path>` followed by a data block, or `644 <oid> <path>`.
    fn parse_modify(&mut self, commit: &mut PendingCommit, rest: &[u8]) -> Result<(), StrataError> {
        let mut fields = rest.splitn_str(3, " ");
        let _mode = fields.next().ok_or_else(|| protocol_error("missing mode"))?;
        let spec = fields
            .next()
            .ok_or_else(|| protocol_error("missing blob spec"))?;
        let path = fields
            .next()
            .and_then(|p| p.to_str().ok())
            .ok_or_else(|| protocol_error("missing path"))?
            .to_string();

        let oid = if spec == b"inline" {
            let data_line = self
                .reader
                .read_line()
                .ok_or_else(|| protocol_error("truncated inline blob"))?;
            let len: usize = data_line
                .strip_prefix(b"data ")
                .and_then(|s| s.to_str().ok())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| protocol_error("bad inline data length"))?;
            let bytes = self
                .reader
                .read_exact(len)
                .ok_or_else(|| protocol_error("truncated inline blob"))?;
            self.odb.write_blob(bytes)
        } else {
            let oid = ObjectHash::from_str(
                spec.to_str().map_err(|_| protocol_error("non-utf8 oid"))?,
            )
            .map_err(StrataError::InvalidArgument)?;
            if !self.odb.contains(&oid) {
                return Err(StrataError::NotFound(format!(
                    "Blob {oid} referenced by import does not exist"
                )));
            }
            oid
        };
        commit.index.insert(path, oid);
        Ok(())
    }

    fn finalize(&mut self, pending: PendingCommit) -> Result<(), StrataError> {
        let author = pending
            .author
            .ok_or_else(|| protocol_error("commit without author"))?;
        let committer = pending
            .committer
            .ok_or_else(|| protocol_error("commit without committer"))?;
        let tree_oid = self.odb.build_tree(&pending.index)?;
        let message = format!("\n{}", pending.message);
        let commit = Commit::new(author, committer, tree_oid, pending.parents, &message);
        self.odb.write_commit(&commit)?;
        self.odb.set_ref(&pending.dest_ref, commit.id);
        tracing::debug!(dest_ref = %pending.dest_ref, commit = %commit.id, "import finalized");
        Ok(())
    }
}

fn protocol_error(message: &str) -> StrataError {
    StrataError::Subprocess {
        message: format!("importer protocol error: {message}"),
        exit_code: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};

    const HEADER: &str = "author Pam <p@example.com> 1700000000 +0000\n\
         committer Pam <p@example.com> 1700000000 +0000\n";

    fn write_commit_header(stdin: &mut impl Write, dest_ref: &str, message: &str) {
        write!(stdin, "commit {dest_ref}\n{HEADER}").unwrap();
        write!(stdin, "data {}\n{message}\n", message.len()).unwrap();
    }

    #[test]
    fn test_simple_import() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = Arc::new(ObjectDb::new());
        let mut handle = streaming_importer(odb.clone());
        write_commit_header(&mut handle.stdin, "refs/heads/main", "initial");
        write!(handle.stdin, "M 644 inline a/b\ndata 5\nhello\n").unwrap();
        write!(handle.stdin, "\ndone\n").unwrap();
        handle.finish().unwrap();

        let tip = odb.get_ref("refs/heads/main").unwrap();
        let commit = odb.read_commit(&tip).unwrap();
        assert_eq!(commit.format_message(), "initial");
        let blobs = odb.flatten_tree(commit.tree_id).unwrap();
        assert_eq!(
            odb.read_blob(blobs.get("a/b").unwrap()).unwrap().data,
            b"hello"
        );
    }

    #[test]
    fn test_from_and_delete() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = Arc::new(ObjectDb::new());

        let mut handle = streaming_importer(odb.clone());
        write_commit_header(&mut handle.stdin, "refs/heads/main", "base");
        write!(handle.stdin, "M 644 inline keep\ndata 1\nk\n").unwrap();
        write!(handle.stdin, "M 644 inline dir/drop\ndata 1\nd\n").unwrap();
        write!(handle.stdin, "\ndone\n").unwrap();
        handle.finish().unwrap();
        let base = odb.get_ref("refs/heads/main").unwrap();

        let mut handle = streaming_importer(odb.clone());
        write_commit_header(&mut handle.stdin, "refs/import/tmp", "next");
        write!(handle.stdin, "from {base}\n").unwrap();
        write!(handle.stdin, "D dir\n").unwrap();
        write!(handle.stdin, "\ndone\n").unwrap();
        handle.finish().unwrap();

        let tip = odb.get_ref("refs/import/tmp").unwrap();
        let commit = odb.read_commit(&tip).unwrap();
        assert_eq!(commit.parent_commit_ids, vec![base]);
        let blobs = odb.flatten_tree(commit.tree_id).unwrap();
        assert!(blobs.contains_key("keep"));
        assert!(!blobs.contains_key("dir/drop"));
    }

    #[test]
    fn test_copy_existing_blob_by_oid() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = Arc::new(ObjectDb::new());
        let existing = odb.write_blob(b"legend-bytes".to_vec());

        let mut handle = streaming_importer(odb.clone());
        write_commit_header(&mut handle.stdin, "refs/heads/main", "copy");
        write!(handle.stdin, "M 644 {existing} some/where\n").unwrap();
        write!(handle.stdin, "\ndone\n").unwrap();
        handle.finish().unwrap();

        let tip = odb.get_ref("refs/heads/main").unwrap();
        let blobs = odb
            .flatten_tree(odb.read_commit(&tip).unwrap().tree_id)
            .unwrap();
        assert_eq!(blobs.get("some/where"), Some(&existing));
    }

    #[test]
    fn test_stream_without_done_fails() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = Arc::new(ObjectDb::new());
        let mut handle = streaming_importer(odb.clone());
        write_commit_header(&mut handle.stdin, "refs/heads/main", "broken");
        let result = handle.finish();
        assert!(matches!(result, Err(StrataError::Subprocess { .. })));
        assert!(odb.get_ref("refs/heads/main").is_none());
    }
}
