//! Per-user filesystem access.
//!
//! [`WebdavFs`] is the local filesystem rooted at a user's directory. It
//! supplies the backend handed to the WebDAV verb handler plus the
//! existence and metadata probes the front-end needs for authorization
//! and the GET-on-collection coercion, addressed by decoded URL paths.

use std::path::Path;

use dav_server::davpath::DavPath;
use dav_server::fs::{DavFileSystem, DavMetaData, FsError, FsResult};
use dav_server::localfs::LocalFs;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::permissions::PathLookup;

// Encode everything except unreserved characters and '/', the set DavPath
// accepts. See RFC 3986.
const PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encode a decoded URL path so it round-trips through [`DavPath`].
pub(crate) fn encode_url_path(path: &str) -> String {
    percent_encode(path.as_bytes(), PATH_ENCODE_SET).to_string()
}

/// Local filesystem rooted at one user's directory.
#[derive(Clone)]
pub struct WebdavFs {
    inner: Box<LocalFs>,
}

impl WebdavFs {
    pub fn new(directory: &Path) -> WebdavFs {
        WebdavFs {
            inner: LocalFs::new(directory, false, false, false),
        }
    }

    /// The backend to register with the verb handler.
    pub fn backend(&self) -> Box<dyn DavFileSystem> {
        self.inner.clone()
    }

    /// Stat `path`, a decoded URL path relative to the root.
    pub async fn metadata(&self, path: &str) -> FsResult<Box<dyn DavMetaData>> {
        let dav_path =
            DavPath::new(&encode_url_path(path)).map_err(|_| FsError::NotFound)?;
        self.inner.metadata(&dav_path).await
    }
}

impl PathLookup for WebdavFs {
    // A path counts as existing unless the backend positively reports it
    // missing; other stat failures must not downgrade an Update check to
    // a Create check.
    fn exists<'a>(&'a self, path: &'a str) -> BoxFuture<'a, bool> {
        async move { !matches!(self.metadata(path).await, Err(FsError::NotFound)) }.boxed()
    }
}
