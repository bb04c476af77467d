//! The svn plug-in.
//!
//! Tag and branch are repository subdirectories, svn-style. Identity binds
//! the last-changed revision of the selected subdirectory, queried with
//! `svn info --show-item` (structured, one line).

use std::fs;
use std::path::Path;

use e2build_hash::Hasher;

use crate::cache::Cache;
use crate::model::{Project, Source, SourceKind, SvnSource};
use crate::process::{ToolOutput, run_tool, svn_program};
use crate::transport::remove_trailing_slashes;
use crate::types::{Error, Reporter, SourceSet, WORKING_COPY_ID};

use super::copy_tree_excluding;

pub struct SvnScm;

fn svn_source(source: &Source) -> Result<&SvnSource, Error> {
    match &source.kind {
        SourceKind::Svn(svn) => Ok(svn),
        _ => Err(Error::Internal {
            reason: format!("source {} dispatched to the svn plug-in", source.name),
        }),
    }
}

fn scm_err(source: &Source, reason: impl Into<String>) -> Error {
    Error::Scm {
        source_name: source.name.clone(),
        reason: reason.into(),
    }
}

fn run_svn(source: &Source, dir: &Path, args: &[&str]) -> Result<ToolOutput, Error> {
    run_tool(&svn_program(), args, dir, &[], None)
        .map_err(|e| scm_err(source, format!("svn {:?}: {e:#}", args.first().unwrap_or(&""))))
}

fn repository_url(source: &Source, cache: &Cache) -> Result<String, Error> {
    let svn = svn_source(source)?;
    let server = source.server.as_deref().ok_or_else(|| Error::Internal {
        reason: format!("svn source {} has no server", source.name),
    })?;
    Ok(cache.remote_url(server, &svn.location)?.to_string())
}

/// The repository subdirectory a source set selects.
fn subdir_for<'a>(svn: &'a SvnSource, set: SourceSet) -> Result<&'a str, Error> {
    match set {
        SourceSet::Tag => Ok(&svn.tag),
        SourceSet::Branch => Ok(&svn.branch),
        SourceSet::WorkingCopy | SourceSet::Lazytag => Err(Error::Internal {
            reason: format!("unresolved source set {set}"),
        }),
    }
}

impl super::ScmPlugin for SvnScm {
    fn kind(&self) -> &'static str {
        "svn"
    }

    fn sourceid(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        licence_ids: &[String],
        cache: &Cache,
    ) -> Result<String, Error> {
        let svn = svn_source(source)?;
        let set = set.resolve(&svn.tag);
        if set == SourceSet::WorkingCopy {
            return Ok(WORKING_COPY_ID.to_string());
        }

        let subdir = subdir_for(svn, set)?;
        let url = format!(
            "{}/{subdir}",
            remove_trailing_slashes(&repository_url(source, cache)?)
        );
        let out = run_svn(
            source,
            &project.root,
            &["info", "--show-item", "last-changed-revision", &url],
        )?;
        if !out.success() {
            return Err(scm_err(source, format!("svn info {url} failed: {}", out.stderr.trim())));
        }
        let revision = out.first_line().to_string();
        if revision.is_empty() || !revision.chars().all(|c| c.is_ascii_digit()) {
            return Err(scm_err(source, format!("unexpected svn revision {revision:?}")));
        }

        let mut licence_ids = licence_ids.to_vec();
        licence_ids.sort();

        let mut hasher = Hasher::new();
        hasher.append(&source.name);
        hasher.append("svn");
        hasher.append(source.env.id());
        for id in &licence_ids {
            hasher.append(id);
        }
        if let Some(server) = &source.server {
            hasher.append(server);
        }
        hasher.append(&svn.location);
        hasher.append(subdir);
        hasher.append(&revision);
        Ok(hasher.finish())
    }

    fn fetch(&self, project: &Project, source: &Source, cache: &Cache) -> Result<(), Error> {
        let tree = project.working_dir(source);
        if self.working_copy_available(project, source) {
            return Ok(());
        }
        if let Some(parent) = tree.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = repository_url(source, cache)?;
        let tree_str = tree.to_string_lossy().to_string();
        let out = run_svn(source, &project.root, &["checkout", &url, &tree_str])?;
        if !out.success() {
            return Err(scm_err(source, format!("checkout of {url} failed: {}", out.stderr.trim())));
        }
        Ok(())
    }

    fn update(
        &self,
        project: &Project,
        source: &Source,
        _reporter: &mut dyn Reporter,
    ) -> Result<(), Error> {
        let tree = project.working_dir(source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }
        let out = run_svn(source, &tree, &["update"])?;
        if !out.success() {
            return Err(scm_err(source, format!("update failed: {}", out.stderr.trim())));
        }
        Ok(())
    }

    fn prepare(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        dest: &Path,
        _cache: &Cache,
    ) -> Result<(), Error> {
        let svn = svn_source(source)?;
        let set = set.resolve(&svn.tag);
        let tree = project.working_dir(source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }

        if set == SourceSet::WorkingCopy {
            return copy_tree_excluding(&tree, dest, &[".svn"]);
        }

        let subdir = subdir_for(svn, set)?;
        let from = tree.join(subdir);
        if !from.is_dir() {
            return Err(scm_err(
                source,
                format!("{subdir} does not exist in the working copy"),
            ));
        }
        let from_str = from.to_string_lossy().to_string();
        let dest_str = dest.to_string_lossy().to_string();
        let out = run_svn(
            source,
            &project.root,
            &["export", "--force", &from_str, &dest_str],
        )?;
        if !out.success() {
            return Err(scm_err(source, format!("export failed: {}", out.stderr.trim())));
        }
        Ok(())
    }

    fn working_copy_available(&self, project: &Project, source: &Source) -> bool {
        project.working_dir(source).join(".svn").exists()
    }

    fn has_working_copy(&self, _source: &Source) -> bool {
        true
    }

    fn check_working_copy(
        &self,
        project: &Project,
        source: &Source,
        cache: &Cache,
    ) -> Result<(), Error> {
        let tree = project.working_dir(source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }
        let out = run_svn(source, &tree, &["info", "--show-item", "url"])?;
        if !out.success() {
            return Err(scm_err(source, format!("svn info failed: {}", out.stderr.trim())));
        }
        let configured = out.first_line().to_string();
        let expected = repository_url(source, cache)?;
        if remove_trailing_slashes(&configured) != remove_trailing_slashes(&expected) {
            return Err(scm_err(
                source,
                format!("working copy url is {configured}, expected {expected}"),
            ));
        }
        Ok(())
    }

    fn to_result(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        dest: &Path,
        cache: &Cache,
    ) -> Result<String, Error> {
        let staged = dest.join(&source.name);
        self.prepare(project, source, set, &staged, cache)?;
        Ok(source.name.clone())
    }

    fn display(&self, source: &Source) -> String {
        match svn_source(source) {
            Ok(svn) => format!(
                "svn {}:{} (branch {}, tag {})",
                source.server.as_deref().unwrap_or("?"),
                svn.location,
                svn.branch,
                svn.tag
            ),
            Err(_) => format!("svn {}", source.name),
        }
    }
}
