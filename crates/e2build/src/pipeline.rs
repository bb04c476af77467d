//! The build pipeline: the per-result state machine and its driver.
//!
//! Results are processed in the topological order of the dependency graph;
//! a result begins only after all of its dependencies are stored. Build ids
//! are computed in a pre-pass so a cached artifact prunes its whole
//! dependency subtree before any work starts. Within one result the stages
//! are strictly sequential: fetch sources, prepare sources, install the
//! chroot, run the script, store the artifact.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::chroot::{BuildDir, ChrootManager};
use crate::context::RunContext;
use crate::dag;
use crate::events::{BuildEvent, EventKind};
use crate::ident::IdentEngine;
use crate::model::Project;
use crate::process::{run_tool, tar_program};
use crate::scm::plugin_for;
use crate::store::ResultStore;
use crate::types::{
    BuildMode, Error, RefKind, Reporter, WORKING_COPY_ID, WarnCategory, Warnings,
};

/// States a result moves through. `Failed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    New,
    Scheduled,
    Skipped,
    Prepared,
    Built,
    Stored,
    Done,
    Failed { reason: String },
}

impl BuildState {
    pub fn is_complete(&self) -> bool {
        matches!(self, BuildState::Done | BuildState::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BuildState::Failed { .. })
    }
}

/// What the user asked to build.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Build every result in the project.
    pub all: bool,
    /// Positional result names.
    pub names: Vec<String>,
}

impl Selection {
    pub fn all() -> Self {
        Self {
            all: true,
            names: Vec::new(),
        }
    }

    pub fn names(names: &[&str]) -> Self {
        Self {
            all: false,
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Resolve the selection to seed results, enforcing the front-end
    /// contract: `--all` excludes positional names, and working-copy mode
    /// needs an explicit selection.
    pub fn resolve(&self, project: &Project, mode: &BuildMode) -> Result<Vec<String>, Error> {
        if self.all && !self.names.is_empty() {
            return Err(Error::Validation {
                kind: RefKind::Result,
                name: self.names.join(", "),
                reason: "--all and positional result names are mutually exclusive".to_string(),
            });
        }
        if mode.source_set == crate::types::SourceSet::WorkingCopy
            && !self.all
            && self.names.is_empty()
        {
            return Err(Error::Validation {
                kind: RefKind::Result,
                name: "selection".to_string(),
                reason: "working-copy mode needs at least one selected result".to_string(),
            });
        }

        if self.all {
            return Ok(project.results.keys().cloned().collect());
        }
        if !self.names.is_empty() {
            for name in &self.names {
                project.result(name)?;
            }
            return Ok(self.names.clone());
        }
        if !project.default_results.is_empty() {
            return Ok(project.default_results.clone());
        }
        Ok(project.results.keys().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub mode: BuildMode,
    /// Rebuild even when a cached artifact exists.
    pub force_rebuild: bool,
    /// Leave the chroot in place after the build.
    pub keep_chroot: bool,
    /// Stop after `prepared`, leaving the chroot available. Single result
    /// only, and never in release mode.
    pub playground: bool,
    /// Refuse to build; only cached artifacts are acceptable.
    pub cache_only: bool,
    /// The server artifacts are stored on.
    pub results_server: String,
}

impl BuildOptions {
    pub fn new(mode: BuildMode, results_server: impl Into<String>) -> Self {
        Self {
            mode,
            force_rebuild: false,
            keep_chroot: false,
            playground: false,
            cache_only: false,
            results_server: results_server.into(),
        }
    }
}

/// Per-run state attached to one result.
#[derive(Debug, Clone)]
pub struct ResultRun {
    pub name: String,
    pub state: BuildState,
    pub buildid: Option<String>,
    pub fetched: bool,
    pub chroot_installed: bool,
    pub built: bool,
    /// Local copy of the artifact archive, when this run produced one.
    pub artifact: Option<PathBuf>,
    pub failure: Option<String>,
}

impl ResultRun {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: BuildState::New,
            buildid: None,
            fetched: false,
            chroot_installed: false,
            built: false,
            artifact: None,
            failure: None,
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    /// Results in processing order.
    pub order: Vec<String>,
    pub runs: BTreeMap<String, ResultRun>,
}

impl RunSummary {
    pub fn ok(&self) -> bool {
        self.order
            .iter()
            .all(|name| self.runs[name].state.is_complete())
    }

    pub fn exit_status(&self) -> i32 {
        if self.ok() {
            crate::types::EXIT_OK
        } else {
            crate::types::EXIT_FAILURE
        }
    }
}

/// Forwards to the user's reporter, dropping warnings whose category is
/// disabled. Warnings never change the exit status.
struct WarningFilter<'a> {
    inner: &'a mut dyn Reporter,
    warnings: &'a Warnings,
}

impl Reporter for WarningFilter<'_> {
    fn info(&mut self, msg: &str) {
        self.inner.info(msg);
    }

    fn warn(&mut self, category: WarnCategory, msg: &str) {
        if self.warnings.is_enabled(category) {
            self.inner.warn(category, msg);
        }
    }

    fn error(&mut self, msg: &str) {
        self.inner.error(msg);
    }
}

pub struct BuildDriver<'a> {
    project: &'a Project,
    ctx: &'a RunContext,
    opts: BuildOptions,
}

impl<'a> BuildDriver<'a> {
    pub fn new(project: &'a Project, ctx: &'a RunContext, opts: BuildOptions) -> Self {
        Self { project, ctx, opts }
    }

    /// Drive the selected results to completion.
    ///
    /// Build failures are recorded in the summary and propagate to
    /// dependents as `dependency-failed`; the driver keeps going for
    /// independent subtrees. Validation problems and interrupts abort the
    /// whole run with an error.
    pub fn run(
        &self,
        selection: &Selection,
        reporter: &mut dyn Reporter,
    ) -> Result<RunSummary, Error> {
        let mode = &self.opts.mode;
        if mode.name == "release" {
            self.project.release.release_guard()?;
        }

        let seeds = selection.resolve(self.project, mode)?;
        if self.opts.playground {
            if mode.name == "release" {
                return Err(Error::Validation {
                    kind: RefKind::Result,
                    name: "playground".to_string(),
                    reason: "playground is not available in release mode".to_string(),
                });
            }
            if seeds.len() != 1 {
                return Err(Error::Validation {
                    kind: RefKind::Result,
                    name: "playground".to_string(),
                    reason: "playground needs exactly one selected result".to_string(),
                });
            }
        }

        let order = dag::dlist_recursive(&self.project.results, &seeds)?;
        let ident = IdentEngine::new(self.project, &self.ctx.cache);
        let store = ResultStore::new(&self.ctx.cache, &self.opts.results_server);
        let chroots = ChrootManager::new(
            &self.ctx.cache,
            &self.ctx.locks,
            self.project.root.join(".e2").join("build"),
            self.opts.keep_chroot || self.opts.playground,
        );
        let mut reporter = WarningFilter {
            inner: reporter,
            warnings: &self.ctx.warnings,
        };

        self.ctx.record_event(BuildEvent::now("all", EventKind::RunStarted {
            mode: mode.name.to_string(),
            results: order.clone(),
        }));

        // Pre-pass: bind every buildid before any work starts, then prune
        // subtrees that only exist to materialize an already-cached
        // artifact.
        let mut runs: BTreeMap<String, ResultRun> = order
            .iter()
            .map(|name| (name.clone(), ResultRun::new(name)))
            .collect();
        for name in &order {
            self.ctx.interrupt.check()?;
            let buildid = ident.build_id(name, mode.source_set)?;
            self.ctx.record_event(BuildEvent::now(name.clone(), EventKind::ResultScheduled {
                buildid: buildid.clone(),
            }));
            let run = runs.get_mut(name).expect("run exists");
            run.buildid = Some(buildid);
            run.state = BuildState::Scheduled;
        }
        let needed = self.prune_cached(&seeds, &mut runs, &store, &mut reporter)?;

        // Results pruned away entirely (reachable only through a cached
        // artifact) are not part of this run.
        let processed: Vec<String> = order
            .iter()
            .filter(|name| needed.contains(*name) || runs[*name].state.is_complete())
            .cloned()
            .collect();

        for name in &processed {
            if !needed.contains(name) {
                continue;
            }
            if let Err(e) = self.ctx.interrupt.check() {
                self.fail(&mut runs, name, "interrupted", &mut reporter);
                self.ctx
                    .record_event(BuildEvent::now("all", EventKind::RunFinished { ok: false }));
                return Err(e);
            }

            // Dependency failures propagate without touching the chroot.
            let failed_dep = dag::dlist(&self.project.results, name)?
                .into_iter()
                .find(|dep| runs.get(dep).is_some_and(|r| r.state.is_failed()));
            if let Some(dep) = failed_dep {
                let reason = Error::DependencyFailed {
                    result: name.clone(),
                    dependency: dep,
                }
                .to_string();
                self.fail(&mut runs, name, &reason, &mut reporter);
                continue;
            }

            let is_seed = seeds.contains(name);
            match self.build_one(name, &mut runs, &store, &chroots, is_seed, &mut reporter) {
                Ok(()) => {}
                Err(Error::Interrupted) => {
                    self.fail(&mut runs, name, "interrupted", &mut reporter);
                    self.ctx
                        .record_event(BuildEvent::now("all", EventKind::RunFinished { ok: false }));
                    return Err(Error::Interrupted);
                }
                Err(e) => {
                    self.fail(&mut runs, name, &e.to_string(), &mut reporter);
                }
            }
        }

        let summary = RunSummary {
            order: processed,
            runs,
        };
        self.ctx.record_event(BuildEvent::now("all", EventKind::RunFinished {
            ok: summary.ok(),
        }));
        Ok(summary)
    }

    /// Mark cached results `skipped` and compute the set that still needs
    /// building. Dependencies that only exist to materialize a cached
    /// artifact stay out of the set entirely.
    fn prune_cached(
        &self,
        seeds: &[String],
        runs: &mut BTreeMap<String, ResultRun>,
        store: &ResultStore<'_>,
        reporter: &mut dyn Reporter,
    ) -> Result<std::collections::BTreeSet<String>, Error> {
        let mut needed = std::collections::BTreeSet::new();
        let mut visited = std::collections::BTreeSet::new();
        let mut stack: Vec<String> = seeds.to_vec();
        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let buildid = runs[&name].buildid.clone().expect("buildid bound");
            let cached = !self.opts.force_rebuild && store.contains(&buildid)?;
            if cached {
                let run = runs.get_mut(&name).expect("run exists");
                run.state = BuildState::Skipped;
                reporter.info(&format!("{name}: cached artifact found, skipping build"));
                self.ctx.record_event(BuildEvent::now(name.clone(), EventKind::ResultSkipped {
                    buildid,
                }));
                let run = runs.get_mut(&name).expect("run exists");
                run.state = BuildState::Done;
                continue;
            }
            if self.opts.cache_only {
                return Err(Error::CacheMissStrict { buildid });
            }
            needed.insert(name.clone());
            for dep in dag::dlist(&self.project.results, &name)? {
                stack.push(dep);
            }
        }
        Ok(needed)
    }

    fn fail(
        &self,
        runs: &mut BTreeMap<String, ResultRun>,
        name: &str,
        reason: &str,
        reporter: &mut dyn Reporter,
    ) {
        reporter.error(&format!("{name}: {reason}"));
        self.ctx.record_event(BuildEvent::now(name.to_string(), EventKind::ResultFailed {
            reason: reason.to_string(),
        }));
        if let Some(run) = runs.get_mut(name) {
            run.state = BuildState::Failed {
                reason: reason.to_string(),
            };
            run.failure = Some(reason.to_string());
        }
    }

    /// Drive one result from `scheduled` to `done`.
    fn build_one(
        &self,
        name: &str,
        runs: &mut BTreeMap<String, ResultRun>,
        store: &ResultStore<'_>,
        chroots: &ChrootManager<'_>,
        is_seed: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<(), Error> {
        let result = self.project.result(name)?;
        let buildid = runs[name].buildid.clone().expect("buildid bound");
        let cachable = buildid != WORKING_COPY_ID;
        let set = self.opts.mode.source_set;

        reporter.info(&format!("{name}: building"));
        let build = chroots.acquire(name)?;

        let outcome = (|| -> Result<(), Error> {
            // Fetch every source, then prepare every source; strictly in
            // that order.
            for source_name in &result.sources {
                self.ctx.interrupt.check()?;
                let source = self.project.source(source_name)?;
                plugin_for(&source.kind).fetch(self.project, source, &self.ctx.cache)?;
                self.ctx.record_event(BuildEvent::now(name.to_string(), EventKind::SourceFetched {
                    source: source_name.clone(),
                }));
            }
            if let Some(run) = runs.get_mut(name) {
                run.fetched = true;
            }

            for source_name in &result.sources {
                self.ctx.interrupt.check()?;
                let source = self.project.source(source_name)?;
                let dest = build.build_dir().join(source_name);
                plugin_for(&source.kind).prepare(self.project, source, set, &dest, &self.ctx.cache)?;
                self.ctx.record_event(BuildEvent::now(
                    name.to_string(),
                    EventKind::SourcePrepared {
                        source: source_name.clone(),
                    },
                ));
            }

            self.ctx.interrupt.check()?;
            chroots.install(self.project, &build, &result.chroot_groups)?;
            if let Some(run) = runs.get_mut(name) {
                run.chroot_installed = true;
            }
            self.ctx.record_event(BuildEvent::now(name.to_string(), EventKind::ChrootInstalled {
                groups: result.chroot_groups.clone(),
            }));

            // Stage the script, the output directory and the artifacts of
            // direct dependencies.
            fs::copy(&result.script, build.script_dir().join("build-script"))?;
            fs::create_dir_all(build.root().join("out"))?;
            self.stage_dependencies(name, runs, store, &build)?;

            if let Some(run) = runs.get_mut(name) {
                run.state = BuildState::Prepared;
            }
            self.ctx
                .record_event(BuildEvent::now(name.to_string(), EventKind::ResultPrepared));

            if self.opts.playground && is_seed {
                reporter.info(&format!(
                    "{name}: prepared, chroot left at {}",
                    build.root().display()
                ));
                return Ok(());
            }

            self.ctx.interrupt.check()?;
            let env = self.compose_env(name, &buildid);
            let out = chroots.run_script(&build, "script/build-script", &env)?;
            if !out.success() {
                return Err(Error::BuildScriptFailed {
                    result: name.to_string(),
                    status: out.exit_code,
                });
            }
            if let Some(run) = runs.get_mut(name) {
                run.state = BuildState::Built;
                run.built = true;
            }
            self.ctx
                .record_event(BuildEvent::now(name.to_string(), EventKind::ResultBuilt));

            // Collect: archive /out and move it into the store.
            let scratch = self.ctx.tmp.create_dir("collect")?;
            let archive = scratch.join(crate::store::ARCHIVE_NAME);
            let archive_str = archive.to_string_lossy().to_string();
            let out_dir = build.root().join("out");
            let out_dir_str = out_dir.to_string_lossy().to_string();
            let tar_out = run_tool(
                &tar_program(),
                &["-c", "-z", "-f", &archive_str, "-C", &out_dir_str, "."],
                &self.project.root,
                &[],
                None,
            )
            .map_err(|e| Error::Internal {
                reason: format!("tar: {e:#}"),
            })?;
            if !tar_out.success() {
                return Err(Error::Internal {
                    reason: format!("collecting {name} failed: {}", tar_out.stderr.trim()),
                });
            }

            if cachable && self.opts.mode.push_results {
                store.put(&archive, &buildid)?;
            }
            if let Some(run) = runs.get_mut(name) {
                run.state = BuildState::Stored;
                run.artifact = Some(archive);
            }
            self.ctx.record_event(BuildEvent::now(name.to_string(), EventKind::ResultStored {
                buildid: buildid.clone(),
            }));
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                if self.opts.playground && is_seed {
                    // The chroot stays up; the lock is released with the
                    // build handle.
                    drop(build);
                    return Ok(());
                }
                chroots.dismantle(build)?;
                if let Some(run) = runs.get_mut(name) {
                    run.state = BuildState::Done;
                }
                self.ctx
                    .record_event(BuildEvent::now(name.to_string(), EventKind::ResultDone));
                reporter.info(&format!("{name}: done"));
                Ok(())
            }
            Err(e) => {
                // Tear down on failure too, unless the user asked to keep
                // the chroot for inspection.
                let _ = chroots.dismantle(build);
                Err(e)
            }
        }
    }

    /// Make the artifacts of direct dependencies visible inside the root,
    /// under `deps/<name>/`.
    fn stage_dependencies(
        &self,
        name: &str,
        runs: &BTreeMap<String, ResultRun>,
        store: &ResultStore<'_>,
        build: &BuildDir,
    ) -> Result<(), Error> {
        for dep in dag::dlist(&self.project.results, name)? {
            let archive = match runs.get(&dep).and_then(|r| r.artifact.clone()) {
                Some(local) => local,
                None => {
                    let dep_buildid =
                        runs.get(&dep)
                            .and_then(|r| r.buildid.clone())
                            .ok_or_else(|| Error::Internal {
                                reason: format!("dependency {dep} has no bound buildid"),
                            })?;
                    store.get(&dep_buildid)?
                }
            };
            let dest = build.root().join("deps").join(&dep);
            fs::create_dir_all(&dest)?;
            fs::copy(&archive, dest.join(crate::store::ARCHIVE_NAME))?;
        }
        Ok(())
    }

    /// The script environment: project env with result overrides, plus the
    /// identity of what is being built.
    fn compose_env(&self, name: &str, buildid: &str) -> Vec<(String, String)> {
        let result = self.project.result(name).expect("result exists");
        let mut env = self.project.env.clone();
        env.merge(&result.env, true);
        let mut pairs: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.push(("E2_RESULT".to_string(), name.to_string()));
        pairs.push(("E2_BUILDID".to_string(), buildid.to_string()));
        pairs
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    use serial_test::serial;
    use tempfile::tempdir;

    use crate::context::{Interrupt, RunContext};
    use crate::env::Environment;
    use crate::events::EventLog;
    use crate::model::{FileRef, FilesSource, ResultSpec, Source, SourceKind};
    use crate::process::test_support::{EnvGuard, write_fake_tool};
    use crate::transport::SchemeTransport;
    use crate::types::{NullReporter, ServerEntry};
    use crate::version::ReleaseId;

    use super::*;

    struct RecordingReporter {
        infos: Vec<String>,
        errors: Vec<String>,
    }

    impl RecordingReporter {
        fn new() -> Self {
            Self {
                infos: Vec::new(),
                errors: Vec::new(),
            }
        }
    }

    impl Reporter for RecordingReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }
        fn warn(&mut self, _category: WarnCategory, msg: &str) {
            self.infos.push(msg.to_string());
        }
        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    /// A fake su helper that records every invocation, so tests can assert
    /// which privileged operations ran.
    fn fake_su(bin: &Path, trace: &Path) -> std::path::PathBuf {
        write_fake_tool(
            bin,
            "e2-su",
            &format!(
                r#"echo "$1" >> {trace}
cmd="$1"; shift
case "$cmd" in
  extract_tar_2_3)
    root="$1"; file="$3"
    tar -x -f "$file" -C "$root"
    ;;
  remove_chroot_2_3)
    rm -rf "$1"
    ;;
  chroot_2_3)
    root="$1"; shift
    cd "$root" && "$@"
    ;;
  *)
    exit 64
    ;;
esac
"#,
                trace = trace.display()
            ),
        )
    }

    struct Fixture {
        project: Project,
        ctx: RunContext,
        remote: std::path::PathBuf,
        su_trace: std::path::PathBuf,
    }

    /// `vendor` (one plain file) feeds `libs`; `firmware` depends on
    /// `libs`. Scripts copy their inputs to /out so artifacts are real.
    fn fixture(root: &Path) -> Fixture {
        let remote = root.join("remote");
        fs::create_dir_all(remote.join("pkg")).expect("mkdir");
        fs::write(remote.join("pkg/vendor.cfg"), b"vendor payload").expect("write");
        let vendor_sha1 =
            e2build_hash::hash_file(&remote.join("pkg/vendor.cfg")).expect("hash");

        // An empty chroot tarball keeps the root assembly path exercised.
        let stage = root.join("stage/etc");
        fs::create_dir_all(&stage).expect("mkdir");
        fs::write(stage.join("profile"), "# profile\n").expect("write");
        fs::create_dir_all(remote.join("chroot")).expect("mkdir");
        let status = std::process::Command::new("tar")
            .args([
                "-c",
                "-f",
                remote.join("chroot/base.tar").to_str().expect("utf8"),
                "-C",
                root.join("stage").to_str().expect("utf8"),
                "etc",
            ])
            .status()
            .expect("tar");
        assert!(status.success());
        let base_sha1 = e2build_hash::hash_file(&remote.join("chroot/base.tar")).expect("hash");

        let project_root = root.join("project");
        let write_script = |name: &str, content: &str| -> std::path::PathBuf {
            let path = project_root.join("res").join(name).join("build-script");
            fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            fs::write(&path, content).expect("write");
            path
        };

        let mut sources = BTreeMap::new();
        sources.insert(
            "vendor".to_string(),
            Source {
                name: "vendor".to_string(),
                server: None,
                licences: Vec::new(),
                env: Environment::new(),
                working: std::path::PathBuf::from("in/vendor"),
                kind: SourceKind::Files(FilesSource {
                    files: vec![FileRef {
                        server: "upstream".to_string(),
                        location: "pkg/vendor.cfg".to_string(),
                        sha1: vendor_sha1,
                        unpack: None,
                        patch: None,
                    }],
                }),
            },
        );

        let mut chroot_groups = BTreeMap::new();
        chroot_groups.insert(
            "base".to_string(),
            crate::model::ChrootGroup {
                name: "base".to_string(),
                files: vec![crate::model::ArchiveRef {
                    server: "upstream".to_string(),
                    location: "chroot/base.tar".to_string(),
                    sha1: base_sha1,
                    tartype: crate::model::TarType::Tar,
                }],
                groupid: None,
            },
        );

        let mut results = BTreeMap::new();
        results.insert(
            "libs".to_string(),
            ResultSpec {
                name: "libs".to_string(),
                sources: vec!["vendor".to_string()],
                depends: Vec::new(),
                chroot_groups: vec!["base".to_string()],
                env: Environment::new(),
                script: write_script(
                    "libs",
                    "#!/bin/sh\ncp build/vendor/vendor.cfg out/libs.bin\n",
                ),
                collect_project: None,
            },
        );
        results.insert(
            "firmware".to_string(),
            ResultSpec {
                name: "firmware".to_string(),
                sources: Vec::new(),
                depends: vec!["libs".to_string()],
                chroot_groups: vec!["base".to_string()],
                env: Environment::new().set("IMAGE", "lamp.img"),
                script: write_script(
                    "firmware",
                    "#!/bin/sh\ntest -f deps/libs/result.tar.gz\necho \"$IMAGE\" > out/image.name\n",
                ),
                collect_project: None,
            },
        );

        let project = Project {
            root: project_root,
            name: "demo".to_string(),
            release: ReleaseId {
                branch: "master".to_string(),
                tag: "v1".to_string(),
            },
            env: Environment::new().set("ARCH", "arm"),
            default_results: vec!["firmware".to_string()],
            sources,
            results,
            chroot_groups,
            licences: BTreeMap::new(),
        };

        let servers = vec![
            ServerEntry {
                name: "upstream".to_string(),
                url: format!("file://{}", remote.display()),
                cachable: true,
                cache: true,
                islocal: false,
                writeback: false,
                push_permissions: None,
                flags: BTreeMap::new(),
            },
            ServerEntry {
                name: "results".to_string(),
                url: format!("file://{}", root.join("store").display()),
                cachable: true,
                cache: true,
                islocal: false,
                writeback: true,
                push_permissions: Some("ug+rw".to_string()),
                flags: BTreeMap::new(),
            },
        ];
        let template = format!("file://{}/%u", root.join("cache").display());
        let ctx = RunContext::builder()
            .build(
                &template,
                "builder",
                servers,
                Arc::new(SchemeTransport::new()),
                root.join("tmp"),
                &root.join("log"),
            )
            .expect("context");

        Fixture {
            project,
            ctx,
            remote,
            su_trace: root.join("su-trace"),
        }
    }

    fn options() -> BuildOptions {
        BuildOptions::new(BuildMode::branch(), "results")
    }

    fn su_invocations(fx: &Fixture) -> Vec<String> {
        if !fx.su_trace.exists() {
            return Vec::new();
        }
        fs::read_to_string(&fx.su_trace)
            .expect("trace")
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    #[serial]
    fn a_full_run_builds_the_chain_and_stores_artifacts() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"), &fx.su_trace);
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let driver = BuildDriver::new(&fx.project, &fx.ctx, options());
        let mut reporter = RecordingReporter::new();
        let summary = driver
            .run(&Selection::names(&["firmware"]), &mut reporter)
            .expect("run");

        assert!(summary.ok());
        assert_eq!(summary.exit_status(), 0);
        assert_eq!(summary.order, vec!["libs", "firmware"]);
        for name in &summary.order {
            assert_eq!(summary.runs[name].state, BuildState::Done);
            assert!(summary.runs[name].built);
        }

        // Both artifacts are in the store, keyed by buildid.
        let store_dir = td.path().join("store/results");
        let firmware_id = summary.runs["firmware"].buildid.clone().expect("buildid");
        assert!(
            store_dir
                .join(&firmware_id)
                .join(crate::store::ARCHIVE_NAME)
                .is_file()
        );

        // The event log recorded the run.
        let log = EventLog::read_from_file(fx.ctx.log_path()).expect("log");
        assert!(log.for_result("firmware").count() > 3);
    }

    #[test]
    #[serial]
    fn cached_results_skip_chroot_and_script_entirely() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"), &fx.su_trace);
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        // First run populates the store.
        let driver = BuildDriver::new(&fx.project, &fx.ctx, options());
        driver
            .run(&Selection::names(&["firmware"]), &mut NullReporter)
            .expect("first run");
        fs::remove_file(&fx.su_trace).expect("reset trace");

        // Second run must do no privileged work at all.
        let summary = driver
            .run(&Selection::names(&["firmware"]), &mut NullReporter)
            .expect("second run");
        assert!(summary.ok());
        assert_eq!(summary.runs["firmware"].state, BuildState::Done);
        assert!(!summary.runs["firmware"].built);
        assert!(su_invocations(&fx).is_empty(), "no chroot work expected");
    }

    #[test]
    #[serial]
    fn force_rebuild_ignores_the_cache() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"), &fx.su_trace);
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let driver = BuildDriver::new(&fx.project, &fx.ctx, options());
        driver
            .run(&Selection::names(&["libs"]), &mut NullReporter)
            .expect("first run");

        let mut opts = options();
        opts.force_rebuild = true;
        let driver = BuildDriver::new(&fx.project, &fx.ctx, opts);
        let summary = driver
            .run(&Selection::names(&["libs"]), &mut NullReporter)
            .expect("second run");
        assert!(summary.runs["libs"].built);
    }

    #[test]
    #[serial]
    fn build_script_failure_propagates_to_dependents() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"), &fx.su_trace);
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        fs::write(
            &fx.project.results["libs"].script,
            "#!/bin/sh\nexit 3\n",
        )
        .expect("write");

        let driver = BuildDriver::new(&fx.project, &fx.ctx, options());
        let mut reporter = RecordingReporter::new();
        let summary = driver
            .run(&Selection::names(&["firmware"]), &mut reporter)
            .expect("run completes with failures recorded");

        assert!(!summary.ok());
        assert_eq!(summary.exit_status(), 1);
        assert!(summary.runs["libs"].state.is_failed());
        assert!(
            summary.runs["libs"]
                .failure
                .as_deref()
                .expect("failure")
                .contains("exited with status 3")
        );
        assert!(summary.runs["firmware"].state.is_failed());
        assert!(
            summary.runs["firmware"]
                .failure
                .as_deref()
                .expect("failure")
                .contains("dependency libs failed")
        );
        assert!(!reporter.errors.is_empty());
    }

    #[test]
    #[serial]
    fn working_copy_mode_never_touches_the_store() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"), &fx.su_trace);
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let opts = BuildOptions::new(BuildMode::working_copy(), "results");
        let driver = BuildDriver::new(&fx.project, &fx.ctx, opts);
        let summary = driver
            .run(&Selection::names(&["firmware"]), &mut NullReporter)
            .expect("run");

        assert!(summary.ok());
        assert_eq!(
            summary.runs["firmware"].buildid.as_deref(),
            Some(WORKING_COPY_ID)
        );
        // Neither read nor written.
        assert!(!td.path().join("store").exists());
    }

    #[test]
    #[serial]
    fn playground_stops_after_prepare_and_keeps_the_chroot() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"), &fx.su_trace);
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let mut opts = options();
        opts.playground = true;
        let driver = BuildDriver::new(&fx.project, &fx.ctx, opts);
        let summary = driver
            .run(&Selection::names(&["libs"]), &mut NullReporter)
            .expect("run");

        assert_eq!(summary.runs["libs"].state, BuildState::Prepared);
        assert!(!summary.runs["libs"].built);
        let root = fx.project.root.join(".e2/build/libs/chroot");
        assert!(root.join("script/build-script").is_file());
        assert!(root.join("build/vendor/vendor.cfg").is_file());
        // No script execution happened.
        assert!(!su_invocations(&fx).contains(&"chroot_2_3".to_string()));
    }

    #[test]
    fn playground_rejects_multi_result_selections() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let mut opts = options();
        opts.playground = true;
        let driver = BuildDriver::new(&fx.project, &fx.ctx, opts);
        let err = driver
            .run(&Selection::names(&["libs", "firmware"]), &mut NullReporter)
            .expect_err("must fail");
        assert!(err.to_string().contains("exactly one selected result"));
    }

    #[test]
    fn playground_rejects_release_mode() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let mut opts = BuildOptions::new(BuildMode::release(), "results");
        opts.playground = true;
        let driver = BuildDriver::new(&fx.project, &fx.ctx, opts);
        let err = driver
            .run(&Selection::names(&["libs"]), &mut NullReporter)
            .expect_err("must fail");
        assert!(err.to_string().contains("not available in release mode"));
    }

    #[test]
    fn release_mode_refuses_the_pseudo_tag() {
        let td = tempdir().expect("tempdir");
        let mut fx = fixture(td.path());
        fx.project.release.tag = "^".to_string();
        let driver =
            BuildDriver::new(&fx.project, &fx.ctx, BuildOptions::new(BuildMode::release(), "results"));
        let err = driver
            .run(&Selection::names(&["libs"]), &mut NullReporter)
            .expect_err("must fail");
        assert!(matches!(err, Error::ReleaseGuard));
    }

    #[test]
    fn selection_rejects_all_with_positional_names() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let selection = Selection {
            all: true,
            names: vec!["libs".to_string()],
        };
        let err = selection
            .resolve(&fx.project, &BuildMode::branch())
            .expect_err("must fail");
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn selection_requires_results_in_working_copy_mode() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let err = Selection::default()
            .resolve(&fx.project, &BuildMode::working_copy())
            .expect_err("must fail");
        assert!(err.to_string().contains("at least one selected result"));
    }

    #[test]
    fn selection_defaults_to_the_project_default_results() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let seeds = Selection::default()
            .resolve(&fx.project, &BuildMode::branch())
            .expect("resolve");
        assert_eq!(seeds, vec!["firmware"]);
    }

    #[test]
    fn selection_rejects_unknown_results() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let err = Selection::names(&["ghost"])
            .resolve(&fx.project, &BuildMode::branch())
            .expect_err("must fail");
        assert!(matches!(err, Error::ReferenceNotFound { .. }));
    }

    #[test]
    #[serial]
    fn cache_only_mode_errors_on_a_miss() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let mut opts = options();
        opts.cache_only = true;
        let driver = BuildDriver::new(&fx.project, &fx.ctx, opts);
        let err = driver
            .run(&Selection::names(&["libs"]), &mut NullReporter)
            .expect_err("must fail");
        assert!(matches!(err, Error::CacheMissStrict { .. }));
    }

    #[test]
    #[serial]
    fn an_interrupt_stops_the_run_with_the_interrupted_error() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        fx.ctx.interrupt.trip();

        let driver = BuildDriver::new(&fx.project, &fx.ctx, options());
        let err = driver
            .run(&Selection::names(&["firmware"]), &mut NullReporter)
            .expect_err("must fail");
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(Error::Interrupted.exit_status(), 130);
    }

    #[test]
    fn interrupt_flag_is_shared_between_clones() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        interrupt.trip();
        assert!(clone.is_tripped());
    }
}
