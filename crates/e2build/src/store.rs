//! The result store: finished artifacts keyed by buildid.
//!
//! Each artifact lives at `results/<buildid>/` on the configured results
//! server, reached through the cache so local/remote mirroring and
//! writeback policy apply. Artifact contents are opaque; the store only
//! moves archives. The working-copy sentinel is never stored or queried.

use std::path::PathBuf;

use crate::cache::Cache;
use crate::types::{Error, WORKING_COPY_ID};

pub const RESULTS_PREFIX: &str = "results";
pub const ARCHIVE_NAME: &str = "result.tar.gz";

pub struct ResultStore<'c> {
    cache: &'c Cache,
    server: String,
}

impl<'c> ResultStore<'c> {
    pub fn new(cache: &'c Cache, server: impl Into<String>) -> Self {
        Self {
            cache,
            server: server.into(),
        }
    }

    fn location(buildid: &str) -> String {
        format!("{RESULTS_PREFIX}/{buildid}/{ARCHIVE_NAME}")
    }

    fn reject_sentinel(buildid: &str, operation: &str) -> Result<(), Error> {
        if buildid == WORKING_COPY_ID {
            return Err(Error::Internal {
                reason: format!("attempted to {operation} a working-copy build"),
            });
        }
        Ok(())
    }

    /// Whether an artifact for this buildid is available. The sentinel is
    /// never cached, so it is never contained.
    pub fn contains(&self, buildid: &str) -> Result<bool, Error> {
        if buildid == WORKING_COPY_ID {
            return Ok(false);
        }
        self.cache.exists_file(&self.server, &Self::location(buildid))
    }

    /// Materialize the artifact archive locally and return its path.
    pub fn get(&self, buildid: &str) -> Result<PathBuf, Error> {
        Self::reject_sentinel(buildid, "fetch")?;
        self.cache.fetch_file(&self.server, &Self::location(buildid))
    }

    /// Store an artifact archive under its buildid. The underlying
    /// transport writes to a temp path and renames, so a partial upload
    /// never becomes visible.
    pub fn put(&self, archive: &PathBuf, buildid: &str) -> Result<(), Error> {
        Self::reject_sentinel(buildid, "store")?;
        self.cache.push_file(archive, &self.server, &Self::location(buildid))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::transport::SchemeTransport;
    use crate::types::ServerEntry;

    use super::*;

    fn results_cache(root: &Path) -> Cache {
        let entry = ServerEntry {
            name: "results".to_string(),
            url: format!("file://{}", root.join("remote").display()),
            cachable: true,
            cache: true,
            islocal: false,
            writeback: true,
            push_permissions: Some("ug+rw".to_string()),
            flags: BTreeMap::new(),
        };
        let template = format!("file://{}/%u", root.join("cache").display());
        Cache::new(
            &template,
            "builder",
            vec![entry],
            Arc::new(SchemeTransport::new()),
            &[],
        )
        .expect("cache")
    }

    fn some_buildid() -> String {
        "c".repeat(40)
    }

    #[test]
    fn put_then_contains_and_get() {
        let td = tempdir().expect("tempdir");
        let cache = results_cache(td.path());
        let store = ResultStore::new(&cache, "results");
        let buildid = some_buildid();

        assert!(!store.contains(&buildid).expect("contains"));

        let archive = td.path().join("result.tar.gz");
        fs::write(&archive, b"artifact bytes").expect("write");
        store.put(&archive, &buildid).expect("put");

        assert!(store.contains(&buildid).expect("contains"));
        let fetched = store.get(&buildid).expect("get");
        assert_eq!(fs::read(&fetched).expect("read"), b"artifact bytes");
    }

    #[test]
    fn artifacts_live_under_their_buildid() {
        let td = tempdir().expect("tempdir");
        let cache = results_cache(td.path());
        let store = ResultStore::new(&cache, "results");
        let buildid = some_buildid();

        let archive = td.path().join("result.tar.gz");
        fs::write(&archive, b"x").expect("write");
        store.put(&archive, &buildid).expect("put");

        let expected = td
            .path()
            .join("remote")
            .join(RESULTS_PREFIX)
            .join(&buildid)
            .join(ARCHIVE_NAME);
        assert!(expected.is_file());
    }

    #[test]
    fn the_sentinel_is_never_contained() {
        let td = tempdir().expect("tempdir");
        let cache = results_cache(td.path());
        let store = ResultStore::new(&cache, "results");
        assert!(!store.contains(WORKING_COPY_ID).expect("contains"));
    }

    #[test]
    fn storing_the_sentinel_is_an_internal_error() {
        let td = tempdir().expect("tempdir");
        let cache = results_cache(td.path());
        let store = ResultStore::new(&cache, "results");

        let archive = td.path().join("result.tar.gz");
        fs::write(&archive, b"x").expect("write");
        let err = store.put(&archive, WORKING_COPY_ID).expect_err("must fail");
        assert!(matches!(err, Error::Internal { .. }));

        let err = store.get(WORKING_COPY_ID).expect_err("must fail");
        assert!(matches!(err, Error::Internal { .. }));
    }
}
