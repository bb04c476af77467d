//! The typed project model and its validator.
//!
//! Records are immutable once `Project::from_raw` returns; the pipeline
//! keeps its per-run state elsewhere. Validation checks every
//! cross-reference and rejects the model with a typed error naming the
//! offending entity. The exact-key-set rule for source declarations is
//! enforced during raw-table conversion (`deny_unknown_fields`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::RawProject;
use crate::dag;
use crate::env::Environment;
use crate::types::{Error, RefKind};
use crate::version::ReleaseId;

fn default_true() -> bool {
    true
}

/// Archive flavours a chroot group may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarType {
    Tar,
    TarGz,
    TarBz2,
}

impl TarType {
    pub fn parse(input: &str) -> Option<TarType> {
        match input {
            "tar" => Some(TarType::Tar),
            "tar.gz" | "tgz" => Some(TarType::TarGz),
            "tar.bz2" | "tbz2" => Some(TarType::TarBz2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TarType::Tar => "tar",
            TarType::TarGz => "tar.gz",
            TarType::TarBz2 => "tar.bz2",
        }
    }

    /// Flag for the tar invocation that extracts this flavour.
    pub fn tar_flag(&self) -> Option<&'static str> {
        match self {
            TarType::Tar => None,
            TarType::TarGz => Some("-z"),
            TarType::TarBz2 => Some("-j"),
        }
    }

    /// Guess the flavour from a file name.
    pub fn from_location(location: &str) -> Option<TarType> {
        if location.ends_with(".tar.gz") || location.ends_with(".tgz") {
            Some(TarType::TarGz)
        } else if location.ends_with(".tar.bz2") || location.ends_with(".tbz2") {
            Some(TarType::TarBz2)
        } else if location.ends_with(".tar") {
            Some(TarType::Tar)
        } else {
            None
        }
    }
}

/// One downloadable file of a `files` source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub server: String,
    pub location: String,
    pub sha1: String,
    /// Extract the archive instead of copying it; names the directory the
    /// archive unpacks to.
    pub unpack: Option<String>,
    /// Apply as a patch with the given `-p` level.
    pub patch: Option<String>,
}

/// One archive of a chroot group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    pub server: String,
    pub location: String,
    pub sha1: String,
    pub tartype: TarType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenceFile {
    pub server: String,
    pub location: String,
    pub sha1: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    pub location: String,
    pub branch: String,
    pub tag: String,
    /// Verify that the remote tag matches the local one before binding ids.
    pub check_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvnSource {
    pub location: String,
    pub branch: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesSource {
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Git(GitSource),
    Svn(SvnSource),
    Files(FilesSource),
}

impl SourceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceKind::Git(_) => "git",
            SourceKind::Svn(_) => "svn",
            SourceKind::Files(_) => "files",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    /// The server the repository lives on; `files` sources name servers per
    /// file instead.
    pub server: Option<String>,
    pub licences: Vec<String>,
    pub env: Environment,
    /// Working-copy path relative to the project root.
    pub working: PathBuf,
    pub kind: SourceKind,
}

/// Collect-project extras, composed into a result rather than inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectProject {
    pub default_result: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSpec {
    pub name: String,
    pub sources: Vec<String>,
    pub depends: Vec<String>,
    pub chroot_groups: Vec<String>,
    pub env: Environment,
    pub script: PathBuf,
    pub collect_project: Option<CollectProject>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootGroup {
    pub name: String,
    pub files: Vec<ArchiveRef>,
    /// Pins the group id instead of deriving it from the file list.
    pub groupid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Licence {
    pub name: String,
    pub files: Vec<LicenceFile>,
}

/// The frozen project model.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub name: String,
    pub release: ReleaseId,
    pub env: Environment,
    pub default_results: Vec<String>,
    pub sources: BTreeMap<String, Source>,
    pub results: BTreeMap<String, ResultSpec>,
    pub chroot_groups: BTreeMap<String, ChrootGroup>,
    pub licences: BTreeMap<String, Licence>,
}

// Raw table shapes. `deny_unknown_fields` enforces the exact allowed key
// set per record class.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProjectConfig {
    name: Option<String>,
    #[serde(default)]
    default_results: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGitSource {
    server: String,
    location: String,
    branch: String,
    tag: String,
    #[serde(default)]
    licences: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    working: Option<String>,
    #[serde(default = "default_true")]
    check_remote: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSvnSource {
    server: String,
    location: String,
    branch: String,
    tag: String,
    #[serde(default)]
    licences: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    working: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilesSource {
    #[serde(default)]
    licences: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(rename = "file", default)]
    files: Vec<RawFileRef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileRef {
    server: String,
    location: String,
    sha1: String,
    unpack: Option<String>,
    patch: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResult {
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    chroot: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    collect_project: Option<RawCollectProject>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCollectProject {
    default_result: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChrootGroup {
    name: String,
    groupid: Option<String>,
    #[serde(default)]
    files: Vec<RawArchiveRef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawArchiveRef {
    server: String,
    location: String,
    sha1: String,
    tartype: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLicence {
    name: String,
    #[serde(default)]
    files: Vec<RawLicenceFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLicenceFile {
    server: String,
    location: String,
    sha1: String,
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: RefKind,
    name: &str,
    table: toml::Table,
) -> Result<T, Error> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e| Error::Validation {
            kind,
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn env_from_map(map: BTreeMap<String, String>) -> Environment {
    map.into_iter().collect()
}

fn check_sha1(kind: RefKind, name: &str, sha1: &str) -> Result<(), Error> {
    if !e2build_hash::is_hex_id(sha1) {
        return Err(Error::Validation {
            kind,
            name: name.to_string(),
            reason: format!("bad sha1 {sha1:?}: want 40 lowercase hex chars"),
        });
    }
    Ok(())
}

impl Project {
    /// Load and validate a project against the configured server names.
    pub fn load(root: &Path, server_names: &BTreeSet<String>) -> Result<Self, Error> {
        let raw = crate::config::load_project_raw(root)?;
        Self::from_raw(raw, server_names)
    }

    pub fn from_raw(raw: RawProject, server_names: &BTreeSet<String>) -> Result<Self, Error> {
        let project_config: RawProjectConfig =
            decode(RefKind::Result, "proj/config.toml", raw.config)?;
        let name = project_config.name.unwrap_or_else(|| {
            raw.root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        });

        let env = raw
            .env
            .into_iter()
            .map(|(k, v)| match v {
                toml::Value::String(s) => Ok((k, s)),
                other => Err(Error::Validation {
                    kind: RefKind::Result,
                    name: "proj/env.toml".to_string(),
                    reason: format!("{k} must be a string, got {}", other.type_str()),
                }),
            })
            .collect::<Result<Environment, Error>>()?;

        let licences = load_licences(raw.licences, server_names)?;
        let chroot_groups = load_chroot_groups(raw.chroot, server_names)?;

        let mut sources = BTreeMap::new();
        for (source_name, table) in raw.sources {
            let source = load_source(&source_name, table, server_names, &licences)?;
            sources.insert(source_name, source);
        }

        let mut results = BTreeMap::new();
        for (result_name, table, script) in raw.results {
            let result = load_result(&result_name, table, script)?;
            results.insert(result_name, result);
        }

        let project = Self {
            root: raw.root,
            name,
            release: raw.release,
            env,
            default_results: project_config.default_results,
            sources,
            results,
            chroot_groups,
            licences,
        };
        project.validate()?;
        Ok(project)
    }

    /// Cross-reference validation. The model is rejected on the first
    /// failure, with the offending name in the error.
    fn validate(&self) -> Result<(), Error> {
        for name in &self.default_results {
            if !self.results.contains_key(name) {
                return Err(Error::ReferenceNotFound {
                    kind: RefKind::Result,
                    name: name.clone(),
                    referrer: "proj/config.toml".to_string(),
                });
            }
        }

        for (name, result) in &self.results {
            for source in &result.sources {
                if !self.sources.contains_key(source) {
                    return Err(Error::ReferenceNotFound {
                        kind: RefKind::Source,
                        name: source.clone(),
                        referrer: name.clone(),
                    });
                }
            }
            for group in &result.chroot_groups {
                if !self.chroot_groups.contains_key(group) {
                    return Err(Error::ReferenceNotFound {
                        kind: RefKind::ChrootGroup,
                        name: group.clone(),
                        referrer: name.clone(),
                    });
                }
            }
            for dep in &result.depends {
                if !self.results.contains_key(dep) {
                    return Err(Error::ReferenceNotFound {
                        kind: RefKind::Result,
                        name: dep.clone(),
                        referrer: name.clone(),
                    });
                }
            }
            if let Some(collect) = &result.collect_project {
                if !self.results.contains_key(&collect.default_result) {
                    return Err(Error::ReferenceNotFound {
                        kind: RefKind::Result,
                        name: collect.default_result.clone(),
                        referrer: name.clone(),
                    });
                }
            }
            if !result.script.is_file() {
                return Err(Error::Validation {
                    kind: RefKind::Result,
                    name: name.clone(),
                    reason: "build script is missing".to_string(),
                });
            }
        }

        // The depends relation must be acyclic; dsort finds any cycle.
        dag::dsort(&self.results)?;
        Ok(())
    }

    pub fn source(&self, name: &str) -> Result<&Source, Error> {
        self.sources.get(name).ok_or_else(|| Error::ReferenceNotFound {
            kind: RefKind::Source,
            name: name.to_string(),
            referrer: "selection".to_string(),
        })
    }

    pub fn result(&self, name: &str) -> Result<&ResultSpec, Error> {
        self.results.get(name).ok_or_else(|| Error::ReferenceNotFound {
            kind: RefKind::Result,
            name: name.to_string(),
            referrer: "selection".to_string(),
        })
    }

    /// Absolute working-copy path of a source.
    pub fn working_dir(&self, source: &Source) -> PathBuf {
        self.root.join(&source.working)
    }
}

fn load_source(
    name: &str,
    mut table: toml::Table,
    server_names: &BTreeSet<String>,
    licences: &BTreeMap<String, Licence>,
) -> Result<Source, Error> {
    if name.is_empty() {
        return Err(Error::Validation {
            kind: RefKind::Source,
            name: name.to_string(),
            reason: "empty source name".to_string(),
        });
    }
    let type_name = match table.remove("type") {
        Some(toml::Value::String(s)) => s,
        Some(_) | None => {
            return Err(Error::Validation {
                kind: RefKind::Source,
                name: name.to_string(),
                reason: "missing or non-string type".to_string(),
            });
        }
    };

    let check_server = |server: &str| -> Result<(), Error> {
        if !server_names.contains(server) {
            return Err(Error::ReferenceNotFound {
                kind: RefKind::Server,
                name: server.to_string(),
                referrer: name.to_string(),
            });
        }
        Ok(())
    };
    let check_licences = |list: &[String]| -> Result<(), Error> {
        for licence in list {
            if !licences.contains_key(licence) {
                return Err(Error::ReferenceNotFound {
                    kind: RefKind::Licence,
                    name: licence.clone(),
                    referrer: name.to_string(),
                });
            }
        }
        Ok(())
    };
    let default_working = || PathBuf::from("in").join(name);

    match type_name.as_str() {
        "git" => {
            let raw: RawGitSource = decode(RefKind::Source, name, table)?;
            check_server(&raw.server)?;
            check_licences(&raw.licences)?;
            if raw.branch.is_empty() || raw.tag.is_empty() {
                return Err(Error::Validation {
                    kind: RefKind::Source,
                    name: name.to_string(),
                    reason: "git sources need a non-empty branch and tag".to_string(),
                });
            }
            Ok(Source {
                name: name.to_string(),
                server: Some(raw.server),
                licences: raw.licences,
                env: env_from_map(raw.env),
                working: raw.working.map(PathBuf::from).unwrap_or_else(default_working),
                kind: SourceKind::Git(GitSource {
                    location: raw.location,
                    branch: raw.branch,
                    tag: raw.tag,
                    check_remote: raw.check_remote,
                }),
            })
        }
        "svn" => {
            let raw: RawSvnSource = decode(RefKind::Source, name, table)?;
            check_server(&raw.server)?;
            check_licences(&raw.licences)?;
            Ok(Source {
                name: name.to_string(),
                server: Some(raw.server),
                licences: raw.licences,
                env: env_from_map(raw.env),
                working: raw.working.map(PathBuf::from).unwrap_or_else(default_working),
                kind: SourceKind::Svn(SvnSource {
                    location: raw.location,
                    branch: raw.branch,
                    tag: raw.tag,
                }),
            })
        }
        "files" => {
            let raw: RawFilesSource = decode(RefKind::Source, name, table)?;
            check_licences(&raw.licences)?;
            if raw.files.is_empty() {
                return Err(Error::Validation {
                    kind: RefKind::Source,
                    name: name.to_string(),
                    reason: "files sources need at least one file".to_string(),
                });
            }
            let mut files = Vec::with_capacity(raw.files.len());
            for file in raw.files {
                check_server(&file.server)?;
                check_sha1(RefKind::Source, name, &file.sha1)?;
                files.push(FileRef {
                    server: file.server,
                    location: file.location,
                    sha1: file.sha1,
                    unpack: file.unpack,
                    patch: file.patch,
                });
            }
            Ok(Source {
                name: name.to_string(),
                server: None,
                licences: raw.licences,
                env: env_from_map(raw.env),
                working: default_working(),
                kind: SourceKind::Files(FilesSource { files }),
            })
        }
        other => Err(Error::Validation {
            kind: RefKind::Source,
            name: name.to_string(),
            reason: format!("unknown source type {other}"),
        }),
    }
}

fn load_result(name: &str, table: toml::Table, script: PathBuf) -> Result<ResultSpec, Error> {
    if name.is_empty() {
        return Err(Error::Validation {
            kind: RefKind::Result,
            name: name.to_string(),
            reason: "empty result name".to_string(),
        });
    }
    let raw: RawResult = decode(RefKind::Result, name, table)?;
    Ok(ResultSpec {
        name: name.to_string(),
        sources: raw.sources,
        depends: raw.depends,
        chroot_groups: raw.chroot,
        env: env_from_map(raw.env),
        script,
        collect_project: raw.collect_project.map(|c| CollectProject {
            default_result: c.default_result,
        }),
    })
}

fn load_chroot_groups(
    table: toml::Table,
    server_names: &BTreeSet<String>,
) -> Result<BTreeMap<String, ChrootGroup>, Error> {
    let mut groups = BTreeMap::new();
    let raw_groups: Vec<RawChrootGroup> = if table.is_empty() {
        Vec::new()
    } else {
        decode_list(RefKind::ChrootGroup, "proj/chroot.toml", table, "group")?
    };
    for raw in raw_groups {
        if raw.name.is_empty() {
            return Err(Error::Validation {
                kind: RefKind::ChrootGroup,
                name: raw.name,
                reason: "empty group name".to_string(),
            });
        }
        let mut files = Vec::with_capacity(raw.files.len());
        for file in &raw.files {
            if !server_names.contains(&file.server) {
                return Err(Error::ReferenceNotFound {
                    kind: RefKind::Server,
                    name: file.server.clone(),
                    referrer: raw.name.clone(),
                });
            }
            check_sha1(RefKind::ChrootGroup, &raw.name, &file.sha1)?;
            let tartype = TarType::parse(&file.tartype).ok_or_else(|| Error::Validation {
                kind: RefKind::ChrootGroup,
                name: raw.name.clone(),
                reason: format!("unknown tartype {}", file.tartype),
            })?;
            files.push(ArchiveRef {
                server: file.server.clone(),
                location: file.location.clone(),
                sha1: file.sha1.clone(),
                tartype,
            });
        }
        let group = ChrootGroup {
            name: raw.name.clone(),
            files,
            groupid: raw.groupid,
        };
        if groups.insert(raw.name.clone(), group).is_some() {
            return Err(Error::Validation {
                kind: RefKind::ChrootGroup,
                name: raw.name,
                reason: "duplicate group name".to_string(),
            });
        }
    }
    Ok(groups)
}

fn load_licences(
    table: toml::Table,
    server_names: &BTreeSet<String>,
) -> Result<BTreeMap<String, Licence>, Error> {
    let mut licences = BTreeMap::new();
    let raw_licences: Vec<RawLicence> = if table.is_empty() {
        Vec::new()
    } else {
        decode_list(RefKind::Licence, "proj/licences.toml", table, "licence")?
    };
    for raw in raw_licences {
        if raw.name.is_empty() {
            return Err(Error::Validation {
                kind: RefKind::Licence,
                name: raw.name,
                reason: "empty licence name".to_string(),
            });
        }
        let mut files = Vec::with_capacity(raw.files.len());
        for file in &raw.files {
            if !server_names.contains(&file.server) {
                return Err(Error::ReferenceNotFound {
                    kind: RefKind::Server,
                    name: file.server.clone(),
                    referrer: raw.name.clone(),
                });
            }
            check_sha1(RefKind::Licence, &raw.name, &file.sha1)?;
            files.push(LicenceFile {
                server: file.server.clone(),
                location: file.location.clone(),
                sha1: file.sha1.clone(),
            });
        }
        let licence = Licence {
            name: raw.name.clone(),
            files,
        };
        if licences.insert(raw.name.clone(), licence).is_some() {
            return Err(Error::Validation {
                kind: RefKind::Licence,
                name: raw.name,
                reason: "duplicate licence name".to_string(),
            });
        }
    }
    Ok(licences)
}

/// Decode `table[key]` as a list of records.
fn decode_list<T: serde::de::DeserializeOwned>(
    kind: RefKind,
    name: &str,
    mut table: toml::Table,
    key: &str,
) -> Result<Vec<T>, Error> {
    let value = table.remove(key).unwrap_or(toml::Value::Array(Vec::new()));
    if !table.is_empty() {
        let extra: Vec<&String> = table.keys().collect();
        return Err(Error::Validation {
            kind,
            name: name.to_string(),
            reason: format!("unexpected keys {extra:?}"),
        });
    }
    let entries = value.as_array().cloned().ok_or_else(|| Error::Validation {
        kind,
        name: name.to_string(),
        reason: format!("{key} must be a list"),
    })?;
    entries
        .into_iter()
        .map(|entry| {
            entry.try_into().map_err(|e: toml::de::Error| Error::Validation {
                kind,
                name: name.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}
