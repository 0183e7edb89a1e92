//! Best-effort annotation store: a small SQLite database in the gitdir that
//! caches JSON summaries (e.g. diff counts) keyed by object id.
//!
//! The store is strictly an optimisation. A read-only database downgrades
//! writes to logged no-ops; a directory we cannot create a database in falls
//! back to an in-memory store that is marked read-only so callers never need
//! to special-case the failure. Sessions are thread-local and reentrant.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use rusqlite::Connection;
use serde_json::Value;
use tracing::info;

use crate::errors::StrataError;
use crate::repo::{Repo, RepoFiles};

const CREATE_TABLE: &str = "\
    CREATE TABLE IF NOT EXISTS strata_annotations (
        id INTEGER NOT NULL PRIMARY KEY,
        object_id TEXT NOT NULL,
        annotation_type TEXT NOT NULL,
        data TEXT NOT NULL,
        CONSTRAINT strata_annotations_multicol UNIQUE (annotation_type, object_id)
            ON CONFLICT REPLACE
    )";

/// An open annotations session.
pub struct AnnotationsSession {
    conn: Connection,
    is_readonly: bool,
}

impl AnnotationsSession {
    fn open(db_path: &Path) -> Result<AnnotationsSession, StrataError> {
        let conn = match Connection::open(db_path) {
            Ok(conn) => conn,
            Err(e) => {
                // Can't create a database in a read-only directory, but we
                // still need *some* session, so annotations code doesn't have
                // to handle this specifically.
                info!("Failed to open annotations db ({e}); falling back to in-memory storage");
                let conn = Connection::open_in_memory()
                    .map_err(|e| StrataError::InvalidOperation(e.to_string()))?;
                let mut session = AnnotationsSession {
                    conn,
                    is_readonly: false,
                };
                session.create_table();
                session.is_readonly = true;
                return Ok(session);
            }
        };
        conn.pragma_update(None, "journal_mode", "wal").ok();
        let mut session = AnnotationsSession {
            conn,
            is_readonly: false,
        };
        session.create_table();
        Ok(session)
    }

    fn create_table(&mut self) {
        if let Err(e) = self.conn.execute(CREATE_TABLE, []) {
            if is_readonly_error(&e) {
                info!("Can't create tables; annotations db is read-only");
                self.is_readonly = true;
            }
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.is_readonly
    }

    /// Fetch a stored annotation.
    pub fn get(&self, object_id: &str, annotation_type: &str) -> Option<Value> {
        let result: Result<String, _> = self.conn.query_row(
            "SELECT data FROM strata_annotations
             WHERE object_id = ?1 AND annotation_type = ?2",
            (object_id, annotation_type),
            |row| row.get(0),
        );
        result.ok().and_then(|data| serde_json::from_str(&data).ok())
    }

    /// Store an annotation. Write failures against a read-only database are
    /// swallowed with a logged info line.
    pub fn set(&self, object_id: &str, annotation_type: &str, data: &Value) {
        let result = self.conn.execute(
            "INSERT INTO strata_annotations (object_id, annotation_type, data)
             VALUES (?1, ?2, ?3)",
            (object_id, annotation_type, data.to_string()),
        );
        if let Err(e) = result {
            if is_readonly_error(&e) {
                info!("Can't store annotation; annotations db is read-only");
            } else {
                info!("Failed to store annotation: {e}");
            }
        }
    }
}

fn is_readonly_error(e: &rusqlite::Error) -> bool {
    e.to_string().contains("readonly database")
        || matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ReadOnly)
        )
}

thread_local! {
    /// The active session for this thread, letting callers re-enter without
    /// re-opening the database.
    static ACTIVE_SESSION: RefCell<Option<Rc<AnnotationsSession>>> = const { RefCell::new(None) };
}

/// Run `f` with an annotations session for this repository. Reentrant: a
/// nested call on the same thread reuses the outer session.
pub fn with_annotations_session<T>(
    repo: &Repo,
    f: impl FnOnce(&AnnotationsSession) -> T,
) -> Result<T, StrataError> {
    let existing = ACTIVE_SESSION.with(|slot| slot.borrow().clone());
    if let Some(session) = existing {
        return Ok(f(&session));
    }

    let session = Rc::new(AnnotationsSession::open(
        &repo.gitdir_file(RepoFiles::ANNOTATIONS),
    )?);
    ACTIVE_SESSION.with(|slot| *slot.borrow_mut() = Some(session.clone()));
    let result = f(&session);
    ACTIVE_SESSION.with(|slot| *slot.borrow_mut() = None);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::repo::Repo;

    #[test]
    fn test_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        with_annotations_session(&repo, |session| {
            assert!(session.get("abc123", "feature-change-counts").is_none());
            session.set("abc123", "feature-change-counts", &json!({"inserts": 3}));
            assert_eq!(
                session.get("abc123", "feature-change-counts"),
                Some(json!({"inserts": 3}))
            );
            // REPLACE semantics on the (type, object) pair.
            session.set("abc123", "feature-change-counts", &json!({"inserts": 4}));
            assert_eq!(
                session.get("abc123", "feature-change-counts"),
                Some(json!({"inserts": 4}))
            );
        })
        .unwrap();
    }

    #[test]
    fn test_session_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        with_annotations_session(&repo, |outer| {
            outer.set("oid", "t", &json!(1));
            with_annotations_session(&repo, |inner| {
                assert_eq!(inner.get("oid", "t"), Some(json!(1)));
            })
            .unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_unopenable_path_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        // Replace the gitdir annotations path with a directory so SQLite
        // cannot open it as a database file.
        std::fs::create_dir(repo.gitdir_file(RepoFiles::ANNOTATIONS)).unwrap();
        with_annotations_session(&repo, |session| {
            assert!(session.is_readonly());
            // Writes are swallowed, reads still work.
            session.set("oid", "t", &json!(1));
        })
        .unwrap();
    }
}
