//! URL-addressed read/write/list operations on remote locations.
//!
//! A [`ServerUrl`] names a location as `{scheme, host, path}`; the
//! [`Transport`] trait provides synchronous `fetch`, `push`, `mkdir` and
//! `exists` over it. [`SchemeTransport`] dispatches on the scheme: local
//! filesystem copies, http(s) downloads, rsync and scp invocations. Git
//! schemes are URL projections only and never transported directly.
//!
//! Downloads are atomic: data lands in a temp path next to the target and is
//! renamed into place on success, so partial failures leave nothing visible.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::process::{rsync_program, run_tool, scp_program, ssh_program};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("not authorized for {url}")]
    Unauthorized { url: String },
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unsupported scheme {scheme}")]
    UnsupportedScheme { scheme: String },
    #[error("read-only transport {scheme}: cannot {operation}")]
    ReadOnly {
        scheme: String,
        operation: &'static str,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl TransportError {
    fn io(path: &Path, source: io::Error) -> Self {
        TransportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Errors worth one retry: transient connectivity, not policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable { .. } | TransportError::Io { .. }
        )
    }
}

/// A parsed server URL. `path` keeps its leading slash for host-less
/// schemes (`file`), and is host-relative otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl ServerUrl {
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = input.split_once("://").ok_or_else(|| {
            TransportError::InvalidUrl {
                url: input.to_string(),
                reason: "missing scheme separator".to_string(),
            }
        })?;
        if scheme.is_empty() {
            return Err(TransportError::InvalidUrl {
                url: input.to_string(),
                reason: "empty scheme".to_string(),
            });
        }
        let (host, path) = if let Some(stripped) = rest.strip_prefix('/') {
            // No authority part: `file:///var/cache` style.
            (String::new(), format!("/{stripped}"))
        } else {
            match rest.split_once('/') {
                Some((host, path)) => (host.to_string(), format!("/{path}")),
                None => (rest.to_string(), String::new()),
            }
        };
        if host.is_empty() && scheme != "file" {
            return Err(TransportError::InvalidUrl {
                url: input.to_string(),
                reason: format!("scheme {scheme} requires a host"),
            });
        }
        Ok(Self {
            scheme: scheme.to_string(),
            host,
            path,
        })
    }

    /// Append a location below this URL's path.
    pub fn join(&self, location: &str) -> ServerUrl {
        let base = remove_trailing_slashes(&self.path);
        ServerUrl {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            path: format!("{base}/{location}"),
        }
    }

    /// The local filesystem path, for `file` URLs.
    pub fn local_path(&self) -> Option<PathBuf> {
        (self.scheme == "file").then(|| PathBuf::from(&self.path))
    }

    /// Path without its leading slash, as remote tools want it.
    fn remote_path(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// `host:path` spec for scp/rsync-over-ssh invocations.
    fn ssh_spec(&self) -> String {
        format!("{}:{}", self.host, self.remote_path())
    }
}

impl std::fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)
    }
}

/// Strip trailing slashes. Idempotent.
pub fn remove_trailing_slashes(input: &str) -> &str {
    input.trim_end_matches('/')
}

/// Parse a `server:location` reference. The location must be relative and
/// must not escape upward.
pub fn parse_server_location(input: &str) -> Result<(String, String), TransportError> {
    let (server, location) = input.split_once(':').ok_or_else(|| {
        TransportError::InvalidUrl {
            url: input.to_string(),
            reason: "expected server:location".to_string(),
        }
    })?;
    if server.is_empty() || location.is_empty() {
        return Err(TransportError::InvalidUrl {
            url: input.to_string(),
            reason: "empty server or location".to_string(),
        });
    }
    if location.starts_with('/') {
        return Err(TransportError::InvalidUrl {
            url: input.to_string(),
            reason: "location must be relative".to_string(),
        });
    }
    if location.split('/').any(|part| part == "..") {
        return Err(TransportError::InvalidUrl {
            url: input.to_string(),
            reason: "location must not contain ..".to_string(),
        });
    }
    Ok((server.to_string(), location.to_string()))
}

pub fn format_server_location(server: &str, location: &str) -> String {
    format!("{server}:{location}")
}

/// Project a server URL to the form the git tooling wants.
pub fn git_url(url: &ServerUrl) -> Result<String, TransportError> {
    match url.scheme.as_str() {
        "ssh" | "scp" | "rsync+ssh" => Ok(format!("git+ssh://{}{}", url.host, url.path)),
        "file" => Ok(url.path.clone()),
        "http" | "https" | "git" | "git+ssh" => Ok(url.to_string()),
        other => Err(TransportError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}

/// Uniform synchronous operations on a URL. The trait seam exists so the
/// cache can be exercised against in-memory fakes.
pub trait Transport: Send + Sync {
    fn fetch(&self, url: &ServerUrl, local: &Path) -> Result<(), TransportError>;
    fn push(&self, local: &Path, url: &ServerUrl) -> Result<(), TransportError>;
    fn mkdir(&self, url: &ServerUrl) -> Result<(), TransportError>;
    fn exists(&self, url: &ServerUrl) -> Result<bool, TransportError>;
}

/// Retry `op` once when the first failure is transient.
pub fn with_retry_once<T>(
    mut op: impl FnMut() -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) if first.is_transient() => op(),
        Err(first) => Err(first),
    }
}

/// The production transport: dispatches on the URL scheme.
pub struct SchemeTransport {
    http: reqwest::blocking::Client,
}

impl Default for SchemeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemeTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::blocking::Client::new(),
        }
    }

    fn http_fetch(&self, url: &ServerUrl, local: &Path) -> Result<(), TransportError> {
        let target = url.to_string();
        let response = self
            .http
            .get(&target)
            .send()
            .map_err(|e| TransportError::Unreachable {
                url: target.clone(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(TransportError::NotFound { url: target });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TransportError::Unauthorized { url: target });
        }
        if !status.is_success() {
            return Err(TransportError::Unreachable {
                url: target,
                reason: format!("http status {status}"),
            });
        }
        write_atomically(local, |file| {
            let mut response = response;
            response
                .copy_to(file)
                .map(|_| ())
                .map_err(|e| io::Error::other(e.to_string()))
        })
    }

    fn remote_shell(
        &self,
        url: &ServerUrl,
        command: &str,
    ) -> Result<crate::process::ToolOutput, TransportError> {
        let ssh = ssh_program();
        run_tool(&ssh, &[url.host.as_str(), command], Path::new("."), &[], None).map_err(|e| {
            TransportError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

impl Transport for SchemeTransport {
    fn fetch(&self, url: &ServerUrl, local: &Path) -> Result<(), TransportError> {
        match url.scheme.as_str() {
            "file" => {
                let source = PathBuf::from(&url.path);
                if !source.exists() {
                    return Err(TransportError::NotFound {
                        url: url.to_string(),
                    });
                }
                write_atomically(local, |file| {
                    let mut reader = fs::File::open(&source)?;
                    io::copy(&mut reader, file).map(|_| ())
                })
            }
            "http" | "https" => self.http_fetch(url, local),
            "rsync+ssh" => copy_via_tool(&rsync_program(), &url.ssh_spec(), local, url, true),
            "ssh" | "scp" => copy_via_tool(&scp_program(), &url.ssh_spec(), local, url, true),
            "rsync" => {
                let spec = url.to_string();
                copy_via_tool(&rsync_program(), &spec, local, url, true)
            }
            other => Err(TransportError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    fn push(&self, local: &Path, url: &ServerUrl) -> Result<(), TransportError> {
        match url.scheme.as_str() {
            "file" => {
                let dest = PathBuf::from(&url.path);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| TransportError::io(parent, e))?;
                }
                write_atomically(&dest, |file| {
                    let mut reader = fs::File::open(local)?;
                    io::copy(&mut reader, file).map(|_| ())
                })
            }
            "http" | "https" => Err(TransportError::ReadOnly {
                scheme: url.scheme.clone(),
                operation: "push",
            }),
            "rsync+ssh" => copy_via_tool(&rsync_program(), &url.ssh_spec(), local, url, false),
            "ssh" | "scp" => copy_via_tool(&scp_program(), &url.ssh_spec(), local, url, false),
            "rsync" => {
                let spec = url.to_string();
                copy_via_tool(&rsync_program(), &spec, local, url, false)
            }
            other => Err(TransportError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    fn mkdir(&self, url: &ServerUrl) -> Result<(), TransportError> {
        match url.scheme.as_str() {
            "file" => fs::create_dir_all(&url.path)
                .map_err(|e| TransportError::io(Path::new(&url.path), e)),
            "http" | "https" => Err(TransportError::ReadOnly {
                scheme: url.scheme.clone(),
                operation: "mkdir",
            }),
            "rsync+ssh" | "rsync" | "ssh" | "scp" => {
                let out =
                    self.remote_shell(url, &format!("mkdir -p {}", shell_quote(&url.path)))?;
                if out.success() {
                    Ok(())
                } else {
                    Err(classify_tool_failure(url, &out.stderr))
                }
            }
            other => Err(TransportError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    fn exists(&self, url: &ServerUrl) -> Result<bool, TransportError> {
        match url.scheme.as_str() {
            "file" => Ok(Path::new(&url.path).exists()),
            "http" | "https" => {
                let target = url.to_string();
                let response = self.http.head(&target).send().map_err(|e| {
                    TransportError::Unreachable {
                        url: target.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let status = response.status();
                if status.is_success() {
                    Ok(true)
                } else if status.as_u16() == 404 {
                    Ok(false)
                } else if status.as_u16() == 401 || status.as_u16() == 403 {
                    Err(TransportError::Unauthorized { url: target })
                } else {
                    Err(TransportError::Unreachable {
                        url: target,
                        reason: format!("http status {status}"),
                    })
                }
            }
            "rsync+ssh" | "rsync" | "ssh" | "scp" => {
                let out =
                    self.remote_shell(url, &format!("test -e {}", shell_quote(&url.path)))?;
                Ok(out.exit_code == 0)
            }
            other => Err(TransportError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

/// Write to `.part` beside `dest`, rename into place on success. The temp
/// file is removed on any failure.
fn write_atomically(
    dest: &Path,
    write: impl FnOnce(&mut fs::File) -> io::Result<()>,
) -> Result<(), TransportError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| TransportError::io(parent, e))?;
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let tmp = dest.with_file_name(format!(".{}.{}.part", name, std::process::id()));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        write(&mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, dest)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TransportError::io(dest, e));
    }
    Ok(())
}

/// scp/rsync copy in either direction. For fetches the tool writes a temp
/// path which is renamed on success, matching the atomicity contract.
fn copy_via_tool(
    program: &str,
    remote_spec: &str,
    local: &Path,
    url: &ServerUrl,
    fetching: bool,
) -> Result<(), TransportError> {
    let mut args: Vec<String> = Vec::new();
    if url.scheme == "rsync+ssh" {
        args.push("-e".to_string());
        args.push(ssh_program());
    }

    let tmp;
    let (from, to) = if fetching {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| TransportError::io(parent, e))?;
        }
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        tmp = local.with_file_name(format!(".{}.{}.part", name, std::process::id()));
        (remote_spec.to_string(), tmp.to_string_lossy().to_string())
    } else {
        tmp = PathBuf::new();
        (local.to_string_lossy().to_string(), remote_spec.to_string())
    };
    args.push(from);
    args.push(to);

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let out = run_tool(program, &arg_refs, Path::new("."), &[], None).map_err(|e| {
        TransportError::Unreachable {
            url: url.to_string(),
            reason: e.to_string(),
        }
    })?;
    if !out.success() {
        if fetching {
            let _ = fs::remove_file(&tmp);
        }
        return Err(classify_tool_failure(url, &out.stderr));
    }
    if fetching {
        fs::rename(&tmp, local).map_err(|e| TransportError::io(local, e))?;
    }
    Ok(())
}

/// Map a remote tool's failure to the error taxonomy. Used only to choose
/// an error class for reporting; correctness never depends on the text.
fn classify_tool_failure(url: &ServerUrl, stderr: &str) -> TransportError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        TransportError::Unauthorized {
            url: url.to_string(),
        }
    } else if lower.contains("no such file") || lower.contains("not found") {
        TransportError::NotFound {
            url: url.to_string(),
        }
    } else {
        TransportError::Unreachable {
            url: url.to_string(),
            reason: stderr.trim().to_string(),
        }
    }
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}
