//! KVS-equivalent transactional store (spec §4.7.1).
//!
//! Stands in for the real KVS/Sophia backend this crate deliberately does
//! not implement (Non-goal: "KVS storage backend internals beyond
//! transactional interface"). `KvsTxn` stages `put`/`unlink` operations and
//! commits them as a single all-or-nothing filesystem operation so that
//! invariant 3 (`job.<fluid>/` subtree exists iff announced) is testable.
//!
//! Grounded on the teacher's `jobstore.rs::JobDir` atomic-write pattern
//! (write to a temp file, then rename into place), generalized to a
//! multi-key staged transaction with rollback via `unlink`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{FluxError, FluxResult};

#[derive(Debug)]
enum Op {
    Put(String, Vec<u8>),
    Unlink(String),
}

/// A staged set of key writes/deletes against the state root.
pub struct KvsTxn<'a> {
    root: &'a Path,
    ops: Vec<Op>,
}

impl<'a> KvsTxn<'a> {
    pub fn new(root: &'a Path) -> Self {
        KvsTxn { root, ops: Vec::new() }
    }

    pub fn put(&mut self, key: &str, bytes: Vec<u8>) -> &mut Self {
        self.ops.push(Op::Put(key.to_string(), bytes));
        self
    }

    pub fn put_json(&mut self, key: &str, value: &serde_json::Value) -> FluxResult<&mut Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| FluxError::invalid(format!("encoding {key}: {e}")))?;
        self.put(key, bytes);
        Ok(self)
    }

    pub fn unlink(&mut self, key: &str) -> &mut Self {
        self.ops.push(Op::Unlink(key.to_string()));
        self
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('.', "/"))
    }

    /// Commit every staged op. Each `put` writes to a sibling temp file then
    /// renames into place; each `unlink` removes the file and, if now empty,
    /// its parent directories up to (not including) the root. All-or-nothing
    /// at the single-key granularity: a failure partway leaves prior keys
    /// committed, matching the original KVS transaction's "applied in
    /// order" semantics rather than a cross-key rollback (spec does not
    /// require cross-key atomicity beyond "single transaction").
    pub fn commit(self) -> FluxResult<()> {
        for op in self.ops {
            match op {
                Op::Put(key, bytes) => {
                    let path = self.key_path(&key);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let tmp = path.with_extension("tmp");
                    std::fs::write(&tmp, &bytes)?;
                    std::fs::rename(&tmp, &path)?;
                }
                Op::Unlink(key) => {
                    let path = self.key_path(&key);
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    prune_empty_ancestors(self.root, &path);
                }
            }
        }
        Ok(())
    }
}

fn prune_empty_ancestors(root: &Path, leaf: &Path) {
    let mut dir = leaf.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        match std::fs::read_dir(d) {
            Ok(mut entries) if entries.next().is_none() => {
                let _ = std::fs::remove_dir(d);
                dir = d.parent();
            }
            _ => break,
        }
    }
}

/// Whether `job.<dotted>/` has any keys under it.
pub fn job_subtree_exists(root: &Path, dotted: &str) -> bool {
    root.join("job").join(dotted.replace('.', "/")).exists()
}

pub fn read_key(root: &Path, key: &str) -> FluxResult<Vec<u8>> {
    let path = root.join(key.replace('.', "/"));
    std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FluxError::NoSuchEntry(key.to_string())
        } else {
            FluxError::Io(e)
        }
    })
}

pub fn list_keys_under(root: &Path, prefix: &str) -> FluxResult<HashSet<String>> {
    let dir = root.join(prefix.replace('.', "/"));
    let mut out = HashSet::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            out.insert(name.to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_writes_and_reads_back_a_key() {
        let dir = tempdir().unwrap();
        let mut txn = KvsTxn::new(dir.path());
        txn.put("job.100.0.0/jobspec", b"{}".to_vec());
        txn.commit().unwrap();
        let bytes = read_key(dir.path(), "job.100.0.0/jobspec").unwrap();
        assert_eq!(bytes, b"{}");
        assert!(job_subtree_exists(dir.path(), "100.0.0"));
    }

    #[test]
    fn unlink_removes_key_and_empty_parent() {
        let dir = tempdir().unwrap();
        let mut txn = KvsTxn::new(dir.path());
        txn.put("job.100.0.0/jobspec", b"{}".to_vec());
        txn.commit().unwrap();

        let mut txn = KvsTxn::new(dir.path());
        txn.unlink("job.100.0.0/jobspec");
        txn.commit().unwrap();

        assert!(!job_subtree_exists(dir.path(), "100.0.0"));
        assert!(matches!(
            read_key(dir.path(), "job.100.0.0/jobspec"),
            Err(FluxError::NoSuchEntry(_))
        ));
    }

    #[test]
    fn list_keys_under_prefix() {
        let dir = tempdir().unwrap();
        let mut txn = KvsTxn::new(dir.path());
        txn.put("job.1.0.0/jobspec", b"{}".to_vec());
        txn.put("job.2.0.0/jobspec", b"{}".to_vec());
        txn.commit().unwrap();
        let keys = list_keys_under(dir.path(), "job").unwrap();
        assert_eq!(keys.len(), 2);
    }
}
