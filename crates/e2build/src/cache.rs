//! The content-addressed local mirror over the transport layer.
//!
//! The cache directory comes from a URL template (`file:///var/cache/e2/%u`,
//! `%u` expands to the invoking user). For each configured server the entry
//! records whether its files may be cached, whether the server is local, and
//! the writeback/push policy.
//!
//! Fetches of the same `(server, location)` key serialize on a per-key lock:
//! concurrent callers coalesce onto one transport fetch and then share the
//! cached file. Pushes serialize on the same key.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::transport::{
    ServerUrl, Transport, TransportError, remove_trailing_slashes, with_retry_once,
};
use crate::types::{Error, RefKind, ServerEntry};

pub struct Cache {
    root: PathBuf,
    servers: RwLock<BTreeMap<String, ServerEntry>>,
    transport: Arc<dyn Transport>,
    key_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.root)
            .field("servers", &self.servers)
            .field("key_locks", &self.key_locks)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Build the cache from the URL template and server table.
    ///
    /// `queued_writeback` holds `set_writeback` requests that arrived before
    /// initialization; they are applied here, in order.
    pub fn new(
        template: &str,
        user: &str,
        servers: Vec<ServerEntry>,
        transport: Arc<dyn Transport>,
        queued_writeback: &[(String, bool)],
    ) -> Result<Self, Error> {
        let url = ServerUrl::parse(&template.replace("%u", user))?;
        let root = url.local_path().ok_or_else(|| Error::Validation {
            kind: RefKind::Server,
            name: template.to_string(),
            reason: "cache template must be a file:// url".to_string(),
        })?;

        let mut by_name = BTreeMap::new();
        for entry in servers {
            if by_name.insert(entry.name.clone(), entry.clone()).is_some() {
                return Err(Error::Validation {
                    kind: RefKind::Server,
                    name: entry.name,
                    reason: "duplicate server name".to_string(),
                });
            }
        }

        let cache = Self {
            root,
            servers: RwLock::new(by_name),
            transport,
            key_locks: Mutex::new(HashMap::new()),
        };
        for (server, enable) in queued_writeback {
            cache.set_writeback(server, *enable)?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Configured server names, sorted.
    pub fn servers(&self) -> Vec<String> {
        self.servers
            .read()
            .expect("server table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn server(&self, name: &str) -> Result<ServerEntry, Error> {
        self.servers
            .read()
            .expect("server table poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ReferenceNotFound {
                kind: RefKind::Server,
                name: name.to_string(),
                referrer: "cache".to_string(),
            })
    }

    /// Toggle writeback for one server at runtime.
    pub fn set_writeback(&self, server: &str, enable: bool) -> Result<(), Error> {
        let mut servers = self.servers.write().expect("server table poisoned");
        let entry = servers.get_mut(server).ok_or_else(|| Error::ReferenceNotFound {
            kind: RefKind::Server,
            name: server.to_string(),
            referrer: "set_writeback".to_string(),
        })?;
        entry.writeback = enable;
        Ok(())
    }

    /// The remote URL of a location on a server.
    pub fn remote_url(&self, server: &str, location: &str) -> Result<ServerUrl, Error> {
        let entry = self.server(server)?;
        let base = ServerUrl::parse(&entry.url)?;
        Ok(base.join(location))
    }

    /// Where a location lands in the local mirror.
    pub fn cache_path(&self, server: &str, location: &str) -> PathBuf {
        self.root
            .join(server)
            .join(remove_trailing_slashes(location))
    }

    fn key_lock(&self, server: &str, location: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("key lock map poisoned");
        locks
            .entry((server.to_string(), location.to_string()))
            .or_default()
            .clone()
    }

    /// Materialize `server:location` locally and return the path.
    ///
    /// Local servers answer with the remote path itself. Cachable servers
    /// answer from the mirror when they can; everything else is fetched
    /// through the transport into the mirror first.
    pub fn fetch_file(&self, server: &str, location: &str) -> Result<PathBuf, Error> {
        let entry = self.server(server)?;
        let remote = self.remote_url(server, location)?;

        if entry.islocal {
            let path = remote.local_path().ok_or_else(|| Error::Validation {
                kind: RefKind::Server,
                name: server.to_string(),
                reason: "islocal server must use a file:// url".to_string(),
            })?;
            if !path.exists() {
                return Err(TransportError::NotFound {
                    url: remote.to_string(),
                }
                .into());
            }
            return Ok(path);
        }

        let lock = self.key_lock(server, location);
        let _guard = lock.lock().expect("key lock poisoned");

        let cached = self.cache_path(server, location);
        if entry.cachable && entry.cache && cached.exists() {
            return Ok(cached);
        }
        with_retry_once(|| self.transport.fetch(&remote, &cached))?;
        Ok(cached)
    }

    /// Store `local` as `server:location`: into the mirror, and through to
    /// the remote when writeback is enabled. A push with writeback disabled
    /// succeeds into the local cache only.
    pub fn push_file(&self, local: &PathBuf, server: &str, location: &str) -> Result<(), Error> {
        let entry = self.server(server)?;
        let remote = self.remote_url(server, location)?;

        let lock = self.key_lock(server, location);
        let _guard = lock.lock().expect("key lock poisoned");

        if entry.islocal {
            let dest = remote.local_path().ok_or_else(|| Error::Validation {
                kind: RefKind::Server,
                name: server.to_string(),
                reason: "islocal server must use a file:// url".to_string(),
            })?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(local, &dest)?;
            return Ok(());
        }

        if entry.cache {
            let cached = self.cache_path(server, location);
            if let Some(parent) = cached.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(local, &cached)?;
        }

        if entry.writeback {
            if entry.push_permissions.is_none() {
                return Err(Error::Auth {
                    server: server.to_string(),
                    reason: "no push permissions configured".to_string(),
                });
            }
            let parent = parent_url(&remote);
            with_retry_once(|| self.transport.mkdir(&parent))?;
            with_retry_once(|| self.transport.push(local, &remote))?;
        }
        Ok(())
    }

    /// Whether `server:location` is available, preferring the mirror.
    pub fn exists_file(&self, server: &str, location: &str) -> Result<bool, Error> {
        let entry = self.server(server)?;
        if !entry.islocal && entry.cachable && entry.cache {
            let cached = self.cache_path(server, location);
            if cached.exists() {
                return Ok(true);
            }
        }
        let remote = self.remote_url(server, location)?;
        Ok(with_retry_once(|| self.transport.exists(&remote))?)
    }
}

fn parent_url(url: &ServerUrl) -> ServerUrl {
    let trimmed = remove_trailing_slashes(&url.path);
    let parent = match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => trimmed[..pos].to_string(),
    };
    ServerUrl {
        scheme: url.scheme.clone(),
        host: url.host.clone(),
        path: parent,
    }
}
