//! The SCM contract and its plug-ins.
//!
//! Sources are polymorphic over this capability set; the pipeline never
//! looks inside a source type. Dispatch is a static table keyed on the
//! source kind tag, one plug-in per supported type.

use std::fs;
use std::path::Path;

use crate::cache::Cache;
use crate::model::{Project, Source, SourceKind};
use crate::types::{Error, Reporter, SourceSet};

mod files;
mod git;
mod svn;

pub use files::FilesScm;
pub use git::GitScm;
pub use svn::SvnScm;

/// The uniform contract every SCM plug-in implements.
pub trait ScmPlugin: Send + Sync {
    /// The source type tag this plug-in serves.
    fn kind(&self) -> &'static str;

    /// The content id of the source under a source set. `working-copy`
    /// always yields the sentinel id.
    fn sourceid(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        licence_ids: &[String],
        cache: &Cache,
    ) -> Result<String, Error>;

    /// Make the source available locally (clone, checkout, download).
    fn fetch(&self, project: &Project, source: &Source, cache: &Cache) -> Result<(), Error>;

    /// Bring an existing working copy up to date. Conditions that make an
    /// update meaningless (detached HEAD, missing upstream) warn and skip.
    fn update(
        &self,
        project: &Project,
        source: &Source,
        reporter: &mut dyn Reporter,
    ) -> Result<(), Error>;

    /// Materialize the source tree for a build into `dest`.
    fn prepare(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        dest: &Path,
        cache: &Cache,
    ) -> Result<(), Error>;

    /// Whether a usable working copy is on disk right now.
    fn working_copy_available(&self, project: &Project, source: &Source) -> bool;

    /// Whether this source type has a working copy at all.
    fn has_working_copy(&self, source: &Source) -> bool;

    /// Verify the working copy matches the declared upstream.
    fn check_working_copy(
        &self,
        project: &Project,
        source: &Source,
        cache: &Cache,
    ) -> Result<(), Error>;

    /// Produce a standalone copy of the source under `dest`, returning the
    /// name of the entry created there.
    fn to_result(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        dest: &Path,
        cache: &Cache,
    ) -> Result<String, Error>;

    /// One-line human-readable description.
    fn display(&self, source: &Source) -> String;
}

static GIT: GitScm = GitScm;
static SVN: SvnScm = SvnScm;
static FILES: FilesScm = FilesScm;

/// Static dispatch table keyed on the source kind tag.
pub fn plugin_for(kind: &SourceKind) -> &'static dyn ScmPlugin {
    match kind {
        SourceKind::Git(_) => &GIT,
        SourceKind::Svn(_) => &SVN,
        SourceKind::Files(_) => &FILES,
    }
}

/// Recursively copy `from` into `to`, skipping `exclude` entries at any
/// depth (`.git`, `.svn`).
pub(crate) fn copy_tree_excluding(from: &Path, to: &Path, exclude: &[&str]) -> Result<(), Error> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if exclude.iter().any(|e| name.to_string_lossy() == *e) {
            continue;
        }
        let source = entry.path();
        let dest = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree_excluding(&source, &dest, exclude)?;
        } else if entry.file_type()?.is_symlink() {
            let target = fs::read_link(&source)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &dest)?;
            #[cfg(not(unix))]
            let _ = target;
        } else {
            fs::copy(&source, &dest)?;
        }
    }
    Ok(())
}
