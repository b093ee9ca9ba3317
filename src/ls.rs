//! Lock namespace rebasing.
//!
//! One in-memory lock service is shared by every user so that COPY and
//! MOVE keep consistent lock semantics across the process. [`RebasedLs`]
//! makes that sharing safe: it prefixes every lock name with the user's
//! root directory, so two users whose roots differ cannot collide on
//! identically-named subpaths. Locks handed back to the verb handler
//! carry the un-rebased names.

use std::path::Path;
use std::time::Duration;

use dav_server::davpath::DavPath;
use dav_server::ls::{DavLock, DavLockSystem};
use xmltree::Element;

use crate::fs::encode_url_path;

#[derive(Debug, Clone)]
pub struct RebasedLs {
    inner: Box<dyn DavLockSystem>,
    base: String,
}

impl RebasedLs {
    /// Wraps `inner`, prefixing every lock name with `root`.
    pub fn new(inner: Box<dyn DavLockSystem>, root: &Path) -> Box<RebasedLs> {
        Box::new(RebasedLs {
            inner,
            base: encode_url_path(&root.to_string_lossy()),
        })
    }

    // `base` only contains characters DavPath accepts, so parsing the
    // joined name cannot fail in practice; the fallback keeps the
    // original name rather than panicking in a lock path.
    fn rebase(&self, path: &DavPath) -> DavPath {
        let joined = format!("{}{}", self.base, path.as_url_string());
        DavPath::new(&joined).unwrap_or_else(|_| path.clone())
    }

    fn unrebase(&self, path: &DavPath) -> DavPath {
        let url = path.as_url_string();
        let stripped = url
            .strip_prefix(&self.base)
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(&url);
        DavPath::new(stripped).unwrap_or_else(|_| path.clone())
    }

    fn unrebase_lock(&self, mut lock: DavLock) -> DavLock {
        lock.path = self.unrebase(&lock.path);
        lock
    }
}

impl DavLockSystem for RebasedLs {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&Element>,
        timeout: Option<Duration>,
        shared: bool,
        deep: bool,
    ) -> Result<DavLock, DavLock> {
        let rebased = self.rebase(path);
        let original = path.clone();
        match self.inner.lock(&rebased, principal, owner, timeout, shared, deep) {
            Ok(mut lock) => {
                lock.path = original;
                Ok(lock)
            }
            Err(conflict) => Err(self.unrebase_lock(conflict)),
        }
    }

    fn unlock(&self, path: &DavPath, token: &str) -> Result<(), ()> {
        let rebased = self.rebase(path);
        self.inner.unlock(&rebased, token)
    }

    fn refresh(
        &self,
        path: &DavPath,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<DavLock, ()> {
        let rebased = self.rebase(path);
        let original = path.clone();
        let mut lock = self.inner.refresh(&rebased, token, timeout)?;
        lock.path = original;
        Ok(lock)
    }

    fn check(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> Result<(), DavLock> {
        let rebased = self.rebase(path);
        self.inner
            .check(&rebased, principal, ignore_principal, deep, submitted_tokens)
            .map_err(|conflict| self.unrebase_lock(conflict))
    }

    fn discover(&self, path: &DavPath) -> Vec<DavLock> {
        let rebased = self.rebase(path);
        self.inner
            .discover(&rebased)
            .into_iter()
            .map(|lock| self.unrebase_lock(lock))
            .collect()
    }

    fn delete(&self, path: &DavPath) -> Result<(), ()> {
        let rebased = self.rebase(path);
        self.inner.delete(&rebased)
    }
}
