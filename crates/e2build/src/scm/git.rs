//! The git plug-in.
//!
//! Identity work always passes explicit refs (`refs/heads/<b>`,
//! `refs/tags/<t>`) and only ever parses structured git output: one-line
//! `rev-parse` and `config` values, `<id>\t<ref>` pairs from `ls-remote`.

use std::fs;
use std::path::{Path, PathBuf};

use e2build_hash::Hasher;

use crate::cache::Cache;
use crate::model::{GitSource, Project, Source, SourceKind};
use crate::process::{ToolOutput, git_program, run_tool, tar_program};
use crate::transport::{git_url, remove_trailing_slashes};
use crate::types::{Error, Reporter, SourceSet, WORKING_COPY_ID, WarnCategory};

use super::copy_tree_excluding;

pub struct GitScm;

fn git_source(source: &Source) -> Result<&GitSource, Error> {
    match &source.kind {
        SourceKind::Git(git) => Ok(git),
        _ => Err(Error::Internal {
            reason: format!("source {} dispatched to the git plug-in", source.name),
        }),
    }
}

fn scm_err(source: &Source, reason: impl Into<String>) -> Error {
    Error::Scm {
        source_name: source.name.clone(),
        reason: reason.into(),
    }
}

fn work_tree(project: &Project, source: &Source) -> PathBuf {
    project.working_dir(source)
}

fn run_git(source: &Source, dir: &Path, args: &[&str]) -> Result<ToolOutput, Error> {
    run_tool(&git_program(), args, dir, &[], None)
        .map_err(|e| scm_err(source, format!("git {:?}: {e:#}", args.first().unwrap_or(&""))))
}

/// Resolve a ref to its commit id in the local working copy.
fn local_commit(source: &Source, tree: &Path, refname: &str) -> Result<String, Error> {
    let spec = format!("{refname}^{{commit}}");
    let out = run_git(source, tree, &["rev-parse", "--verify", "--quiet", &spec])?;
    if !out.success() {
        return Err(scm_err(source, format!("ref {refname} not found in working copy")));
    }
    let commit = out.first_line().to_string();
    if commit.len() != 40 {
        return Err(scm_err(source, format!("unexpected rev-parse output {commit:?}")));
    }
    Ok(commit)
}

/// Resolve a tag on the remote, preferring the peeled (`^{}`) entry.
fn remote_tag_commit(source: &Source, tree: &Path, url: &str, tag: &str) -> Result<String, Error> {
    let refname = format!("refs/tags/{tag}");
    let out = run_git(source, tree, &["ls-remote", url, &refname])?;
    if !out.success() {
        return Err(scm_err(source, format!("ls-remote {url} failed: {}", out.stderr.trim())));
    }
    let mut plain: Option<String> = None;
    for line in out.stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(id), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        if name == format!("{refname}^{{}}") {
            return Ok(id.to_string());
        }
        if name == refname {
            plain = Some(id.to_string());
        }
    }
    plain.ok_or_else(|| scm_err(source, format!("tag {tag} not found on remote {url}")))
}

fn repository_url(source: &Source, cache: &Cache) -> Result<String, Error> {
    let git = git_source(source)?;
    let server = source.server.as_deref().ok_or_else(|| Error::Internal {
        reason: format!("git source {} has no server", source.name),
    })?;
    let url = cache.remote_url(server, &git.location)?;
    Ok(git_url(&url)?)
}

fn refname_for(git: &GitSource, set: SourceSet) -> Result<String, Error> {
    match set {
        SourceSet::Tag => Ok(format!("refs/tags/{}", git.tag)),
        SourceSet::Branch => Ok(format!("refs/heads/{}", git.branch)),
        SourceSet::WorkingCopy | SourceSet::Lazytag => Err(Error::Internal {
            reason: format!("unresolved source set {set}"),
        }),
    }
}

impl super::ScmPlugin for GitScm {
    fn kind(&self) -> &'static str {
        "git"
    }

    fn sourceid(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        licence_ids: &[String],
        cache: &Cache,
    ) -> Result<String, Error> {
        let git = git_source(source)?;
        let set = set.resolve(&git.tag);
        if set == SourceSet::WorkingCopy {
            return Ok(WORKING_COPY_ID.to_string());
        }

        let tree = work_tree(project, source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }

        let refname = refname_for(git, set)?;
        let commit = local_commit(source, &tree, &refname)?;

        if set == SourceSet::Tag && git.check_remote {
            let url = repository_url(source, cache)?;
            let remote = remote_tag_commit(source, &tree, &url, &git.tag)?;
            if remote != commit {
                return Err(Error::TagMismatch {
                    source_name: source.name.clone(),
                    tag: git.tag.clone(),
                    local: commit,
                    remote,
                });
            }
        }

        let mut licence_ids = licence_ids.to_vec();
        licence_ids.sort();

        let mut hasher = Hasher::new();
        hasher.append(&source.name);
        hasher.append("git");
        hasher.append(source.env.id());
        for id in &licence_ids {
            hasher.append(id);
        }
        if let Some(server) = &source.server {
            hasher.append(server);
        }
        hasher.append(&git.location);
        hasher.append(source.working.to_string_lossy().as_bytes());
        hasher.append(&commit);
        Ok(hasher.finish())
    }

    fn fetch(&self, project: &Project, source: &Source, cache: &Cache) -> Result<(), Error> {
        let git = git_source(source)?;
        let tree = work_tree(project, source);
        if self.working_copy_available(project, source) {
            return Ok(());
        }
        if let Some(parent) = tree.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = repository_url(source, cache)?;
        let tree_str = tree.to_string_lossy().to_string();
        let out = run_git(source, &project.root, &["clone", "--quiet", &url, &tree_str])?;
        if !out.success() {
            return Err(scm_err(source, format!("clone of {url} failed: {}", out.stderr.trim())));
        }
        let out = run_git(source, &tree, &["checkout", "--quiet", &git.branch])?;
        if !out.success() {
            return Err(scm_err(
                source,
                format!("checkout of branch {} failed: {}", git.branch, out.stderr.trim()),
            ));
        }
        Ok(())
    }

    fn update(
        &self,
        project: &Project,
        source: &Source,
        reporter: &mut dyn Reporter,
    ) -> Result<(), Error> {
        let tree = work_tree(project, source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }

        let out = run_git(source, &tree, &["fetch", "--tags", "origin"])?;
        if !out.success() {
            return Err(scm_err(source, format!("fetch failed: {}", out.stderr.trim())));
        }

        let out = run_git(source, &tree, &["symbolic-ref", "-q", "--short", "HEAD"])?;
        if !out.success() {
            reporter.warn(
                WarnCategory::Wother,
                &format!("{}: detached HEAD, skipping update", source.name),
            );
            return Ok(());
        }
        let branch = out.first_line().to_string();

        let out = run_git(
            source,
            &tree,
            &["config", &format!("branch.{branch}.remote")],
        )?;
        if !out.success() || out.first_line() != "origin" {
            reporter.warn(
                WarnCategory::Wother,
                &format!("{}: branch {branch} does not track origin, skipping update", source.name),
            );
            return Ok(());
        }

        let out = run_git(
            source,
            &tree,
            &["config", &format!("branch.{branch}.merge")],
        )?;
        if !out.success() {
            reporter.warn(
                WarnCategory::Wother,
                &format!("{}: branch {branch} has no upstream, skipping update", source.name),
            );
            return Ok(());
        }
        let merge_branch = out
            .first_line()
            .strip_prefix("refs/heads/")
            .unwrap_or(out.first_line())
            .to_string();

        let upstream = format!("refs/remotes/origin/{merge_branch}");
        let out = run_git(source, &tree, &["merge", "--ff-only", &upstream])?;
        if !out.success() {
            return Err(scm_err(
                source,
                format!("fast-forward of {upstream} failed: {}", out.stderr.trim()),
            ));
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
        let git = git_source(source)?;
        let set = set.resolve(&git.tag);
        let tree = work_tree(project, source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }

        if set == SourceSet::WorkingCopy {
            return copy_tree_excluding(&tree, dest, &[".git"]);
        }

        let refname = refname_for(git, set)?;
        let commit = local_commit(source, &tree, &refname)?;
        fs::create_dir_all(dest)?;

        let tarball = dest.join(format!(".{}.{}.tar", source.name, std::process::id()));
        let tarball_str = tarball.to_string_lossy().to_string();
        let out = run_git(
            source,
            &tree,
            &["archive", "--format=tar", "-o", &tarball_str, &commit],
        )?;
        if !out.success() {
            return Err(scm_err(source, format!("archive of {commit} failed: {}", out.stderr.trim())));
        }

        let dest_str = dest.to_string_lossy().to_string();
        let out = run_tool(
            &tar_program(),
            &["-x", "-f", &tarball_str, "-C", &dest_str],
            &project.root,
            &[],
            None,
        )
        .map_err(|e| scm_err(source, format!("tar: {e:#}")))?;
        let _ = fs::remove_file(&tarball);
        if !out.success() {
            return Err(scm_err(source, format!("extraction failed: {}", out.stderr.trim())));
        }
        Ok(())
    }

    fn working_copy_available(&self, project: &Project, source: &Source) -> bool {
        work_tree(project, source).join(".git").exists()
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
        let git = git_source(source)?;
        let tree = work_tree(project, source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }

        let branch_ref = format!("refs/heads/{}", git.branch);
        let out = run_git(source, &tree, &["rev-parse", "--verify", "--quiet", &branch_ref])?;
        if !out.success() {
            return Err(scm_err(source, format!("branch {} does not exist", git.branch)));
        }

        let out = run_git(
            source,
            &tree,
            &["config", &format!("branch.{}.remote", git.branch)],
        )?;
        if !out.success() || out.first_line() != "origin" {
            return Err(scm_err(
                source,
                format!("branch {} must track remote origin", git.branch),
            ));
        }

        let out = run_git(source, &tree, &["config", "remote.origin.url"])?;
        if !out.success() {
            return Err(scm_err(source, "remote.origin.url is not configured"));
        }
        let configured = out.first_line().to_string();
        let expected = repository_url(source, cache)?;
        if remove_trailing_slashes(&configured) != remove_trailing_slashes(&expected) {
            return Err(scm_err(
                source,
                format!("remote.origin.url is {configured}, expected {expected}"),
            ));
        }

        let out = run_git(source, &tree, &["status", "--porcelain"])?;
        if !out.success() {
            return Err(scm_err(source, format!("git status failed: {}", out.stderr.trim())));
        }
        if !out.stdout.trim().is_empty() {
            return Err(Error::WorkingCopyDirty {
                source_name: source.name.clone(),
            });
        }
        Ok(())
    }

    fn to_result(
        &self,
        project: &Project,
        source: &Source,
        set: SourceSet,
        dest: &Path,
        _cache: &Cache,
    ) -> Result<String, Error> {
        let git = git_source(source)?;
        let set = set.resolve(&git.tag);
        let tree = work_tree(project, source);
        if !self.working_copy_available(project, source) {
            return Err(scm_err(source, "no working copy available; fetch the source first"));
        }
        fs::create_dir_all(dest)?;
        let archive_name = format!("{}.tar.gz", source.name);

        if set == SourceSet::WorkingCopy {
            let staged = dest.join(&source.name);
            copy_tree_excluding(&tree, &staged, &[".git"])?;
            let dest_str = dest.to_string_lossy().to_string();
            let out = run_tool(
                &tar_program(),
                &["-c", "-z", "-f", &archive_name, "-C", &dest_str, &source.name],
                dest,
                &[],
                None,
            )
            .map_err(|e| scm_err(source, format!("tar: {e:#}")))?;
            fs::remove_dir_all(&staged)?;
            if !out.success() {
                return Err(scm_err(source, format!("archive failed: {}", out.stderr.trim())));
            }
            return Ok(archive_name);
        }

        let refname = refname_for(git, set)?;
        let commit = local_commit(source, &tree, &refname)?;
        let out_path = dest.join(&archive_name);
        let out_str = out_path.to_string_lossy().to_string();
        let prefix = format!("--prefix={}/", source.name);
        let out = run_git(
            source,
            &tree,
            &["archive", "--format=tar.gz", &prefix, "-o", &out_str, &commit],
        )?;
        if !out.success() {
            return Err(scm_err(source, format!("archive of {commit} failed: {}", out.stderr.trim())));
        }
        Ok(archive_name)
    }

    fn display(&self, source: &Source) -> String {
        match git_source(source) {
            Ok(git) => format!(
                "git {}:{} (branch {}, tag {})",
                source.server.as_deref().unwrap_or("?"),
                git.location,
                git.branch,
                git.tag
            ),
            Err(_) => format!("git {}", source.name),
        }
    }
}
