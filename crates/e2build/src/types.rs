use std::collections::{BTreeMap, BTreeSet};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// The sentinel id assigned to working-copy sources. It propagates through
/// every id derived from one, marking the whole subtree non-cachable.
pub const WORKING_COPY_ID: &str = "working-copy";

/// Selects which revision class of a source an id binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceSet {
    Tag,
    Branch,
    WorkingCopy,
    /// `tag`, unless the source's tag is the pseudo tag `^`, then `branch`.
    Lazytag,
}

impl SourceSet {
    /// Resolve `lazytag` against a source's tag. This is the only place the
    /// lazytag rule lives; every identity and prepare path goes through it.
    pub fn resolve(self, tag: &str) -> SourceSet {
        match self {
            SourceSet::Lazytag => {
                if tag == "^" {
                    SourceSet::Branch
                } else {
                    SourceSet::Tag
                }
            }
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSet::Tag => "tag",
            SourceSet::Branch => "branch",
            SourceSet::WorkingCopy => "working-copy",
            SourceSet::Lazytag => "lazytag",
        }
    }
}

impl std::fmt::Display for SourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build mode bundles the source-set selector with storage, signing and
/// deploy policy. The four standard modes cover every supported workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMode {
    pub name: &'static str,
    pub source_set: SourceSet,
    /// Push finished artifacts to writeback-enabled servers.
    pub push_results: bool,
    pub sign: bool,
    pub deploy: bool,
}

impl BuildMode {
    pub fn release() -> Self {
        Self {
            name: "release",
            source_set: SourceSet::Tag,
            push_results: true,
            sign: true,
            deploy: true,
        }
    }

    pub fn tag() -> Self {
        Self {
            name: "tag",
            source_set: SourceSet::Tag,
            push_results: true,
            sign: false,
            deploy: false,
        }
    }

    pub fn branch() -> Self {
        Self {
            name: "branch",
            source_set: SourceSet::Branch,
            push_results: true,
            sign: false,
            deploy: false,
        }
    }

    pub fn working_copy() -> Self {
        Self {
            name: "working-copy",
            source_set: SourceSet::WorkingCopy,
            push_results: false,
            sign: false,
            deploy: false,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "release" => Some(Self::release()),
            "tag" => Some(Self::tag()),
            "branch" => Some(Self::branch()),
            "working-copy" => Some(Self::working_copy()),
            _ => None,
        }
    }
}

/// One configured server, as read from the server configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub cachable: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub islocal: bool,
    #[serde(default)]
    pub writeback: bool,
    #[serde(default)]
    pub push_permissions: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

/// Warning categories. Toggled independently; warnings never change the
/// exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WarnCategory {
    Wdefault,
    Wdeprecated,
    Wother,
    Wpolicy,
    Whint,
}

impl WarnCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarnCategory::Wdefault => "WDEFAULT",
            WarnCategory::Wdeprecated => "WDEPRECATED",
            WarnCategory::Wother => "WOTHER",
            WarnCategory::Wpolicy => "WPOLICY",
            WarnCategory::Whint => "WHINT",
        }
    }
}

impl std::fmt::Display for WarnCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category warning toggles. `WDEFAULT` starts enabled.
#[derive(Debug, Clone)]
pub struct Warnings {
    enabled: BTreeSet<WarnCategory>,
}

impl Default for Warnings {
    fn default() -> Self {
        let mut enabled = BTreeSet::new();
        enabled.insert(WarnCategory::Wdefault);
        Self { enabled }
    }
}

impl Warnings {
    pub fn enable(&mut self, category: WarnCategory) {
        self.enabled.insert(category);
    }

    pub fn disable(&mut self, category: WarnCategory) {
        self.enabled.remove(&category);
    }

    pub fn is_enabled(&self, category: WarnCategory) -> bool {
        self.enabled.contains(&category)
    }
}

/// Sink for user-visible run output. Implemented by the front-end; tests use
/// a recording implementation.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, category: WarnCategory, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A reporter that drops everything. Useful as a default in tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _category: WarnCategory, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// The class of a cross-reference, for reference-not-found errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Server,
    Source,
    Result,
    ChrootGroup,
    Licence,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Server => "server",
            RefKind::Source => "source",
            RefKind::Result => "result",
            RefKind::ChrootGroup => "chroot group",
            RefKind::Licence => "licence",
        }
    }
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error taxonomy. Each variant carries the offending name or value;
/// nested causes hang off `source()` and are rendered innermost-first by
/// [`format_error_chain`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {kind} {name}: {reason}")]
    Validation {
        kind: RefKind,
        name: String,
        reason: String,
    },
    #[error("{referrer} references unknown {kind} {name}")]
    ReferenceNotFound {
        kind: RefKind,
        name: String,
        referrer: String,
    },
    #[error("parse error in {what}: {reason}")]
    Parse { what: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("not permitted to push to server {server}: {reason}")]
    Auth { server: String, reason: String },
    #[error("source {source_name}: {reason}")]
    Scm { source_name: String, reason: String },
    #[error("source {source_name}: working copy has uncommitted changes")]
    WorkingCopyDirty { source_name: String },
    #[error(
        "source {source_name}: tag {tag} resolves to {local} locally but {remote} on the remote"
    )]
    TagMismatch {
        source_name: String,
        tag: String,
        local: String,
        remote: String,
    },
    #[error("source {source_name}: detached HEAD, no branch to operate on")]
    DetachedHead { source_name: String },
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
    #[error("result {result}: dependency {dependency} failed")]
    DependencyFailed { result: String, dependency: String },
    #[error("result {result}: build script exited with status {status}")]
    BuildScriptFailed { result: String, status: i32 },
    #[error("build directory for {result} is locked by another process")]
    ChrootBusy { result: String },
    #[error("no cached artifact for build id {buildid}")]
    CacheMissStrict { buildid: String },
    #[error("cannot release with the pseudo tag `^`")]
    ReleaseGuard,
    #[error("interrupted")]
    Interrupted,
    #[error("internal invariant violated: {reason}")]
    Internal { reason: String },
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERNAL: i32 = 32;
pub const EXIT_INTERRUPTED: i32 = 130;

impl Error {
    /// The process exit status a front-end reports for this error.
    pub fn exit_status(&self) -> i32 {
        match self {
            Error::Interrupted => EXIT_INTERRUPTED,
            Error::Internal { .. } => EXIT_INTERNAL,
            _ => EXIT_FAILURE,
        }
    }
}

/// Exit status for a finished run: the error's status, or 0.
pub fn exit_status(outcome: &Result<(), anyhow::Error>) -> i32 {
    match outcome {
        Ok(()) => EXIT_OK,
        Err(err) => match err.downcast_ref::<Error>() {
            Some(e) => e.exit_status(),
            None => EXIT_FAILURE,
        },
    }
}

/// Render an error chain innermost-first, one cause per line.
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut lines: Vec<String> = err.chain().map(|c| c.to_string()).collect();
    lines.reverse();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn lazytag_resolves_to_tag_for_real_tags() {
        assert_eq!(SourceSet::Lazytag.resolve("v2.1"), SourceSet::Tag);
    }

    #[test]
    fn lazytag_resolves_to_branch_for_pseudo_tag() {
        assert_eq!(SourceSet::Lazytag.resolve("^"), SourceSet::Branch);
    }

    #[test]
    fn non_lazytag_selectors_ignore_the_tag() {
        assert_eq!(SourceSet::Tag.resolve("^"), SourceSet::Tag);
        assert_eq!(SourceSet::Branch.resolve("v1"), SourceSet::Branch);
        assert_eq!(
            SourceSet::WorkingCopy.resolve("^"),
            SourceSet::WorkingCopy
        );
    }

    #[test]
    fn standard_build_modes_have_expected_policy() {
        let release = BuildMode::release();
        assert_eq!(release.source_set, SourceSet::Tag);
        assert!(release.push_results);
        assert!(release.sign);

        let wc = BuildMode::working_copy();
        assert_eq!(wc.source_set, SourceSet::WorkingCopy);
        assert!(!wc.push_results);
        assert!(!wc.sign);
    }

    #[test]
    fn build_mode_by_name_covers_the_standard_modes() {
        for name in ["release", "tag", "branch", "working-copy"] {
            assert_eq!(BuildMode::by_name(name).expect("known mode").name, name);
        }
        assert!(BuildMode::by_name("nightly").is_none());
    }

    #[test]
    fn server_entry_deserializes_with_defaults() {
        let entry: ServerEntry = toml::from_str(
            r#"
name = "upstream"
url = "http://example.com/archive"
"#,
        )
        .expect("deserialize");
        assert_eq!(entry.name, "upstream");
        assert!(!entry.cachable);
        assert!(!entry.writeback);
        assert!(entry.push_permissions.is_none());
        assert!(entry.flags.is_empty());
    }

    #[test]
    fn warnings_default_enables_wdefault_only() {
        let w = Warnings::default();
        assert!(w.is_enabled(WarnCategory::Wdefault));
        assert!(!w.is_enabled(WarnCategory::Whint));
        assert!(!w.is_enabled(WarnCategory::Wpolicy));
    }

    #[test]
    fn warnings_toggle_independently() {
        let mut w = Warnings::default();
        w.enable(WarnCategory::Whint);
        w.disable(WarnCategory::Wdefault);
        assert!(w.is_enabled(WarnCategory::Whint));
        assert!(!w.is_enabled(WarnCategory::Wdefault));
    }

    #[test]
    fn exit_statuses_follow_the_contract() {
        assert_eq!(Error::Interrupted.exit_status(), EXIT_INTERRUPTED);
        assert_eq!(
            Error::Internal {
                reason: "x".into()
            }
            .exit_status(),
            EXIT_INTERNAL
        );
        assert_eq!(
            Error::BuildScriptFailed {
                result: "r".into(),
                status: 2
            }
            .exit_status(),
            EXIT_FAILURE
        );
        assert_eq!(exit_status(&Ok(())), EXIT_OK);
    }

    #[test]
    fn exit_status_sees_through_anyhow_context() {
        let err = anyhow::Error::from(Error::Interrupted).context("while building r1");
        assert_eq!(exit_status(&Err(err)), EXIT_INTERRUPTED);
    }

    #[test]
    fn error_chain_renders_innermost_first() {
        let err = anyhow::Error::from(Error::Parse {
            what: "e2version".into(),
            reason: "missing tag".into(),
        })
        .context("loading project")
        .context("building selected results");

        let rendered = format_error_chain(&err);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "parse error in e2version: missing tag");
        assert_eq!(lines[2], "building selected results");
    }

    #[test]
    fn cycle_error_lists_the_cycle() {
        let err = Error::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
