//! On-disk configuration: the project tree and the server table.
//!
//! A project root contains `.e2/e2version` plus per-entity subtrees:
//!
//! ```text
//! .e2/e2version          branch + tag, one line
//! proj/config.toml       project name, default results
//! proj/env.toml          project-wide environment
//! proj/chroot.toml       chroot groups
//! proj/licences.toml     licences
//! src/<name>/config.toml one source each
//! res/<name>/config.toml one result each
//! res/<name>/build-script
//! ```
//!
//! This module only reads files into raw TOML tables; `model` turns them
//! into the frozen typed records and validates every cross-reference.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::types::{Error, ServerEntry};
use crate::version::ReleaseId;

pub const PROJECT_DIR: &str = ".e2";
pub const SOURCES_DIR: &str = "src";
pub const RESULTS_DIR: &str = "res";
pub const BUILD_SCRIPT: &str = "build-script";

/// Everything the loader yields; consumed by `model::Project::from_raw`.
#[derive(Debug)]
pub struct RawProject {
    pub root: PathBuf,
    pub release: ReleaseId,
    pub config: toml::Table,
    pub env: toml::Table,
    pub chroot: toml::Table,
    pub licences: toml::Table,
    pub sources: Vec<(String, toml::Table)>,
    pub results: Vec<(String, toml::Table, PathBuf)>,
}

pub fn read_toml(path: &Path) -> Result<toml::Table, Error> {
    let content = fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| Error::Parse {
        what: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn read_toml_or_empty(path: &Path) -> Result<toml::Table, Error> {
    if path.exists() {
        read_toml(path)
    } else {
        Ok(toml::Table::new())
    }
}

/// Load the raw project description from a root directory.
pub fn load_project_raw(root: &Path) -> Result<RawProject, Error> {
    let e2_dir = root.join(PROJECT_DIR);
    if !e2_dir.is_dir() {
        return Err(Error::Parse {
            what: root.display().to_string(),
            reason: format!("not a project root: missing {PROJECT_DIR}/"),
        });
    }
    let release = ReleaseId::load(&e2_dir.join(crate::version::E2VERSION_FILE))?;

    let proj = root.join("proj");
    let config = read_toml_or_empty(&proj.join("config.toml"))?;
    let env = read_toml_or_empty(&proj.join("env.toml"))?;
    let chroot = read_toml_or_empty(&proj.join("chroot.toml"))?;
    let licences = read_toml_or_empty(&proj.join("licences.toml"))?;

    let sources = load_entity_dir(&root.join(SOURCES_DIR))?
        .into_iter()
        .map(|(name, dir)| Ok((name, read_toml(&dir.join("config.toml"))?)))
        .collect::<Result<Vec<_>, Error>>()?;

    let results = load_entity_dir(&root.join(RESULTS_DIR))?
        .into_iter()
        .map(|(name, dir)| {
            let table = read_toml(&dir.join("config.toml"))?;
            Ok((name, table, dir.join(BUILD_SCRIPT)))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(RawProject {
        root: root.to_path_buf(),
        release,
        config,
        env,
        chroot,
        licences,
        sources,
        results,
    })
}

/// Subdirectories of an entity tree, sorted by name.
fn load_entity_dir(dir: &Path) -> Result<Vec<(String, PathBuf)>, Error> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push((name, entry.path()));
        }
    }
    entries.sort();
    Ok(entries)
}

/// The server table plus the cache location template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServersConfig {
    /// Cache URL template; `%u` expands to the invoking user's name.
    pub cache: String,
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerEntry>,
}

impl ServersConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Parse {
            what: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// The server configuration file: `E2_CONFIG` wins, else `~/.e2/e2.conf`.
pub fn config_path() -> Result<PathBuf, Error> {
    if let Ok(path) = env::var("E2_CONFIG") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let (home, _user) = require_env()?;
    Ok(PathBuf::from(home).join(".e2").join("e2.conf"))
}

/// `HOME` and `USER` are required for every invocation.
pub fn require_env() -> Result<(String, String), Error> {
    let home = env::var("HOME").map_err(|_| Error::Parse {
        what: "environment".to_string(),
        reason: "HOME is not set".to_string(),
    })?;
    let user = env::var("USER").map_err(|_| Error::Parse {
        what: "environment".to_string(),
        reason: "USER is not set".to_string(),
    })?;
    Ok((home, user))
}

/// Temp root: `E2TMPDIR` over `TMPDIR` over `/tmp`.
pub fn tmp_dir() -> PathBuf {
    for var in ["E2TMPDIR", "TMPDIR"] {
        if let Ok(dir) = env::var(var) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
    }
    PathBuf::from("/tmp")
}


#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use crate::process::test_support::EnvGuard;

    use super::test_support::{create_project, write_file};
    use super::*;

    #[test]
    fn load_project_raw_reads_all_entity_classes() {
        let td = tempdir().expect("tempdir");
        create_project(td.path());

        let raw = load_project_raw(td.path()).expect("load");
        assert_eq!(raw.release.branch, "master");
        assert_eq!(raw.sources.len(), 2);
        assert_eq!(raw.results.len(), 3);
        assert!(raw.config.contains_key("name"));
        assert!(raw.env.contains_key("ARCH"));
    }

    #[test]
    fn load_project_raw_rejects_non_project_dirs() {
        let td = tempdir().expect("tempdir");
        let err = load_project_raw(td.path()).expect_err("must fail");
        assert!(err.to_string().contains("missing .e2/"));
    }

    #[test]
    fn entity_dirs_are_sorted_by_name() {
        let td = tempdir().expect("tempdir");
        create_project(td.path());
        let raw = load_project_raw(td.path()).expect("load");
        let names: Vec<&str> = raw.results.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(names, vec!["firmware", "libs", "toolchain"]);
    }

    #[test]
    fn servers_config_parses_entries_and_template() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("e2.conf");
        write_file(
            &path,
            r#"
cache = "file:///var/cache/e2/%u"

[[server]]
name = "upstream"
url = "http://archive.example.com/dist"
cachable = true
cache = true

[[server]]
name = "results"
url = "rsync+ssh://build.example.com/srv/results"
cachable = true
cache = true
writeback = true
push_permissions = "ug+rw"
"#,
        );

        let config = ServersConfig::load(&path).expect("load");
        assert_eq!(config.cache, "file:///var/cache/e2/%u");
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[1].writeback);
        assert_eq!(
            config.servers[1].push_permissions.as_deref(),
            Some("ug+rw")
        );
    }

    #[test]
    fn servers_config_rejects_unknown_keys() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("e2.conf");
        write_file(&path, "cache = \"file:///c/%u\"\nbogus = 1\n");
        assert!(ServersConfig::load(&path).is_err());
    }

    #[test]
    #[serial]
    fn config_path_honours_e2_config() {
        let _guard = EnvGuard::set("E2_CONFIG", "/etc/e2/e2.conf");
        assert_eq!(config_path().expect("path"), PathBuf::from("/etc/e2/e2.conf"));
    }

    #[test]
    #[serial]
    fn tmp_dir_prefers_e2tmpdir() {
        let _e2 = EnvGuard::set("E2TMPDIR", "/scratch/e2");
        let _tmp = EnvGuard::set("TMPDIR", "/tmp/other");
        assert_eq!(tmp_dir(), PathBuf::from("/scratch/e2"));
    }
}
