//! Revision databases and revision-spec classification.
//!
//! A revision database is a virtual database named `base/revspec` exposing a
//! specific branch, tag, or commit of `base`. The spec is classified in
//! order: branch (local, then remote-tracking), tag, then commit hash, which
//! must both look like a hash and resolve to a known commit.

use dagdb_core::config::DB_REVISION_DELIMITER;
use dagdb_core::{is_valid_commit_hash, Db, Head};
use std::sync::Arc;

/// What kind of revision a `base/revspec` name points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionType {
    Branch,
    Tag,
    Commit,
}

/// A resolved revision: the spec as it will be addressed plus its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub spec: String,
    pub kind: RevisionType,
}

/// A database as handed to the SQL engine: a base database, optionally
/// narrowed to a revision, optionally wrapped read-only.
#[derive(Clone)]
pub struct SqlDatabase {
    db: Arc<Db>,
    name: String,
    revision: Option<Revision>,
    read_only: bool,
    foreign_key_checks_disabled: bool,
}

impl std::fmt::Debug for SqlDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDatabase")
            .field("name", &self.name)
            .field("revision", &self.revision)
            .field("read_only", &self.read_only)
            .field("foreign_key_checks_disabled", &self.foreign_key_checks_disabled)
            .finish()
    }
}

impl SqlDatabase {
    /// The base (unrevisioned) database.
    pub fn base(db: Arc<Db>) -> SqlDatabase {
        let name = db.name().to_string();
        SqlDatabase {
            db,
            name,
            revision: None,
            read_only: false,
            foreign_key_checks_disabled: false,
        }
    }

    /// A revision database addressed as `name` (case preserved from the
    /// request). Tag and commit revisions are inherently read-only.
    pub fn revision(db: Arc<Db>, name: impl Into<String>, revision: Revision) -> SqlDatabase {
        let read_only = matches!(revision.kind, RevisionType::Tag | RevisionType::Commit);
        SqlDatabase {
            db,
            name: name.into(),
            revision: Some(revision),
            read_only,
            foreign_key_checks_disabled: false,
        }
    }

    /// Name this database is addressed by, revision suffix included.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn revision_type(&self) -> Option<RevisionType> {
        self.revision.as_ref().map(|r| r.kind)
    }

    pub fn revision_spec(&self) -> Option<&str> {
        self.revision.as_ref().map(|r| r.spec.as_str())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Standby wrapping: the same database, refusing writes.
    pub fn into_read_only(mut self) -> SqlDatabase {
        self.read_only = true;
        self
    }

    pub fn foreign_key_checks_disabled(&self) -> bool {
        self.foreign_key_checks_disabled
    }

    pub(crate) fn with_foreign_key_checks_disabled(mut self, disabled: bool) -> SqlDatabase {
        self.foreign_key_checks_disabled = disabled;
        self
    }
}

/// Split `db/rev` on the first delimiter only; the base is everything before
/// it, the revision (case preserved) everything after.
pub fn split_revision_db_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(DB_REVISION_DELIMITER) {
        Some((base, rev)) => (base, Some(rev)),
        None => (name, None),
    }
}

/// Classify a revision spec against a database. Returns the revision with
/// its resolved spec (branch lookups are case-insensitive and return the
/// case-sensitive name), or `None` when nothing matches.
pub fn classify_revision(db: &Db, spec: &str) -> Option<Revision> {
    if let Some(branch) = db.has_branch(spec) {
        return Some(Revision {
            spec: branch,
            kind: RevisionType::Branch,
        });
    }
    if let Some(branch) = db.has_remote_tracking_branch(spec) {
        return Some(Revision {
            spec: branch,
            kind: RevisionType::Branch,
        });
    }
    if db.has_tag(spec) {
        return Some(Revision {
            spec: spec.to_string(),
            kind: RevisionType::Tag,
        });
    }
    if is_valid_commit_hash(spec) {
        // Hash shape alone is not enough; the commit has to exist.
        if let Some(head) = Head::parse(spec) {
            if db.commit_exists(head) {
                return Some(Revision {
                    spec: spec.to_string(),
                    kind: RevisionType::Commit,
                });
            }
        }
    }
    None
}
