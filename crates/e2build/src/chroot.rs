//! Build-root provisioning and teardown.
//!
//! Each result builds inside an exclusive directory guarded by a filesystem
//! lock; the root filesystem is assembled by extracting the result's chroot
//! group archives in declared order. Anything that touches the root as a
//! privileged operation goes through the `e2-su-2.2` helper, which is the
//! privilege boundary.
//!
//! Layout under the build directory:
//!
//! ```text
//! <base>/<result>.lock    the exclusive lock
//! <base>/<result>/chroot  the assembled root filesystem
//!   …/script/build-script the staged script
//!   …/build/<source>/     prepared source trees
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use e2build_lock::{DirLock, LockError, LockRegistry};

use crate::cache::Cache;
use crate::model::{Project, TarType};
use crate::process::{ToolOutput, run_tool, su_program};
use crate::types::Error;

/// Wrapper for the setuid helper that performs privileged chroot work.
pub struct SuHelper {
    program: String,
}

impl Default for SuHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl SuHelper {
    pub fn new() -> Self {
        Self {
            program: su_program(),
        }
    }

    fn run(&self, args: &[&str], cwd: &Path) -> Result<ToolOutput, Error> {
        run_tool(&self.program, args, cwd, &[], None).map_err(|e| Error::Internal {
            reason: format!("{} failed to start: {e:#}", self.program),
        })
    }

    /// Extract an archive into the root, preserving ownership.
    pub fn extract_tar(&self, root: &Path, tartype: TarType, archive: &Path) -> Result<(), Error> {
        let root_str = root.to_string_lossy().to_string();
        let archive_str = archive.to_string_lossy().to_string();
        let out = self.run(
            &["extract_tar_2_3", &root_str, tartype.as_str(), &archive_str],
            root,
        )?;
        if !out.success() {
            return Err(Error::Internal {
                reason: format!(
                    "extracting {} into {} failed: {}",
                    archive.display(),
                    root.display(),
                    out.stderr.trim()
                ),
            });
        }
        Ok(())
    }

    /// Remove an assembled root, including files owned by other users.
    pub fn remove_root(&self, root: &Path) -> Result<(), Error> {
        let root_str = root.to_string_lossy().to_string();
        let parent = root.parent().unwrap_or(Path::new("."));
        let out = self.run(&["remove_chroot_2_3", &root_str], parent)?;
        if !out.success() {
            return Err(Error::Internal {
                reason: format!("removing {} failed: {}", root.display(), out.stderr.trim()),
            });
        }
        Ok(())
    }

    /// Run the staged build script inside the root under a scrubbed
    /// environment. Returns the script's exit status.
    pub fn run_script(
        &self,
        root: &Path,
        script: &str,
        env: &[(String, String)],
    ) -> Result<ToolOutput, Error> {
        let root_str = root.to_string_lossy().to_string();
        let mut args: Vec<String> = vec![
            "chroot_2_3".to_string(),
            root_str,
            "/usr/bin/env".to_string(),
            "-i".to_string(),
        ];
        for (k, v) in env {
            args.push(format!("{k}={v}"));
        }
        args.push("/bin/sh".to_string());
        args.push("-e".to_string());
        args.push(script.to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs, root)
    }
}

/// An acquired build directory. The lock is released on dismantle or drop.
#[derive(Debug)]
pub struct BuildDir {
    pub result: String,
    path: PathBuf,
    lock: DirLock,
}

impl BuildDir {
    /// The assembled root filesystem.
    pub fn root(&self) -> PathBuf {
        self.path.join("chroot")
    }

    /// Where source trees are prepared, inside the root.
    pub fn build_dir(&self) -> PathBuf {
        self.root().join("build")
    }

    /// Where the build script is staged, inside the root.
    pub fn script_dir(&self) -> PathBuf {
        self.root().join("script")
    }
}

pub struct ChrootManager<'a> {
    cache: &'a Cache,
    registry: &'a LockRegistry,
    base: PathBuf,
    su: SuHelper,
    keep_chroot: bool,
}

impl<'a> ChrootManager<'a> {
    pub fn new(
        cache: &'a Cache,
        registry: &'a LockRegistry,
        base: PathBuf,
        keep_chroot: bool,
    ) -> Self {
        Self {
            cache,
            registry,
            base,
            su: SuHelper::new(),
            keep_chroot,
        }
    }

    /// Acquire the exclusive build directory for a result.
    pub fn acquire(&self, result: &str) -> Result<BuildDir, Error> {
        fs::create_dir_all(&self.base)?;
        let lock_path = self.base.join(format!("{result}.lock"));
        let lock = DirLock::acquire_registered(&lock_path, self.registry).map_err(|e| match e {
            LockError::Busy(_) => Error::ChrootBusy {
                result: result.to_string(),
            },
            LockError::Io { source, .. } => Error::Io(source),
        })?;

        let path = self.base.join(result);
        let build = BuildDir {
            result: result.to_string(),
            path,
            lock,
        };
        fs::create_dir_all(build.root())?;
        fs::create_dir_all(build.build_dir())?;
        fs::create_dir_all(build.script_dir())?;
        Ok(build)
    }

    /// Assemble the root by extracting each group archive in declared order.
    pub fn install(
        &self,
        project: &Project,
        build: &BuildDir,
        groups: &[String],
    ) -> Result<(), Error> {
        let root = build.root();
        for group_name in groups {
            let group = project
                .chroot_groups
                .get(group_name)
                .ok_or_else(|| Error::ReferenceNotFound {
                    kind: crate::types::RefKind::ChrootGroup,
                    name: group_name.clone(),
                    referrer: build.result.clone(),
                })?;
            for archive in &group.files {
                let local = self.cache.fetch_file(&archive.server, &archive.location)?;
                let actual = e2build_hash::hash_file(&local)?;
                if actual != archive.sha1 {
                    return Err(Error::Validation {
                        kind: crate::types::RefKind::ChrootGroup,
                        name: group_name.clone(),
                        reason: format!(
                            "checksum mismatch for {}:{}: declared {}, got {actual}",
                            archive.server, archive.location, archive.sha1
                        ),
                    });
                }
                self.su.extract_tar(&root, archive.tartype, &local)?;
            }
        }
        Ok(())
    }

    /// Run the staged script inside the root.
    pub fn run_script(
        &self,
        build: &BuildDir,
        script: &str,
        env: &[(String, String)],
    ) -> Result<ToolOutput, Error> {
        self.su.run_script(&build.root(), script, env)
    }

    /// Tear the build directory down and release the lock. With
    /// `keep_chroot` the root survives for inspection; the lock is released
    /// either way.
    pub fn dismantle(&self, mut build: BuildDir) -> Result<(), Error> {
        if !self.keep_chroot {
            self.su.remove_root(&build.root())?;
            let _ = fs::remove_dir_all(&build.path);
        }
        build.lock.release().map_err(|e| match e {
            LockError::Busy(_) => Error::Internal {
                reason: "lock busy on release".to_string(),
            },
            LockError::Io { source, .. } => Error::Io(source),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serial_test::serial;
    use tempfile::tempdir;

    use crate::env::Environment;
    use crate::model::{ArchiveRef, ChrootGroup};
    use crate::process::test_support::{EnvGuard, write_fake_tool};
    use crate::transport::SchemeTransport;
    use crate::types::ServerEntry;
    use crate::version::ReleaseId;

    use super::*;

    /// A fake su helper: extracts with plain tar, removes with rm, and runs
    /// commands relative to the root instead of chrooting.
    fn fake_su(bin: &Path) -> PathBuf {
        write_fake_tool(
            bin,
            "e2-su",
            r#"cmd="$1"; shift
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
        )
    }

    struct Fixture {
        project: Project,
        cache: Cache,
        registry: LockRegistry,
        base: PathBuf,
    }

    fn fixture(root: &Path) -> Fixture {
        // Publish a base chroot tarball on the fake upstream server.
        let stage = root.join("stage/bin");
        fs::create_dir_all(&stage).expect("mkdir");
        fs::write(stage.join("sh"), "#!/bin/sh\n").expect("write");
        let remote = root.join("remote/chroot");
        fs::create_dir_all(&remote).expect("mkdir");
        let status = std::process::Command::new("tar")
            .args([
                "-c",
                "-f",
                remote.join("base.tar").to_str().expect("utf8"),
                "-C",
                root.join("stage").to_str().expect("utf8"),
                "bin",
            ])
            .status()
            .expect("tar");
        assert!(status.success());
        let base_sha1 = e2build_hash::hash_file(&remote.join("base.tar")).expect("hash");

        let mut chroot_groups = BTreeMap::new();
        chroot_groups.insert(
            "base".to_string(),
            ChrootGroup {
                name: "base".to_string(),
                files: vec![ArchiveRef {
                    server: "upstream".to_string(),
                    location: "chroot/base.tar".to_string(),
                    sha1: base_sha1,
                    tartype: TarType::Tar,
                }],
                groupid: None,
            },
        );

        let project = Project {
            root: root.to_path_buf(),
            name: "demo".to_string(),
            release: ReleaseId {
                branch: "master".to_string(),
                tag: "v1".to_string(),
            },
            env: Environment::new(),
            default_results: Vec::new(),
            sources: BTreeMap::new(),
            results: BTreeMap::new(),
            chroot_groups,
            licences: BTreeMap::new(),
        };

        let entry = ServerEntry {
            name: "upstream".to_string(),
            url: format!("file://{}", root.join("remote").display()),
            cachable: true,
            cache: true,
            islocal: false,
            writeback: false,
            push_permissions: None,
            flags: BTreeMap::new(),
        };
        let template = format!("file://{}/%u", root.join("cache").display());
        let cache = Cache::new(
            &template,
            "builder",
            vec![entry],
            Arc::new(SchemeTransport::new()),
            &[],
        )
        .expect("cache");

        Fixture {
            project,
            cache,
            registry: LockRegistry::new(),
            base: root.join("build"),
        }
    }

    #[test]
    fn acquire_is_exclusive_per_result() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), false);

        let held = manager.acquire("firmware").expect("acquire");
        let err = manager.acquire("firmware").expect_err("second must fail");
        assert!(matches!(err, Error::ChrootBusy { ref result } if result == "firmware"));

        // A different result is unaffected.
        let other = manager.acquire("libs").expect("acquire other");
        drop(other);
        drop(held);
    }

    #[test]
    fn acquire_creates_the_standard_layout() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), false);

        let build = manager.acquire("firmware").expect("acquire");
        assert!(build.root().is_dir());
        assert!(build.build_dir().is_dir());
        assert!(build.script_dir().is_dir());
    }

    #[test]
    #[serial]
    fn install_extracts_group_archives_in_order() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"));
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), false);
        let build = manager.acquire("firmware").expect("acquire");
        manager
            .install(&fx.project, &build, &["base".to_string()])
            .expect("install");
        assert!(build.root().join("bin/sh").is_file());
    }

    #[test]
    #[serial]
    fn run_script_executes_inside_the_root_with_the_given_env() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"));
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), false);
        let build = manager.acquire("firmware").expect("acquire");
        fs::write(
            build.script_dir().join("build-script"),
            "#!/bin/sh\necho \"$IMAGE\" > script/out\n",
        )
        .expect("write");

        let out = manager
            .run_script(
                &build,
                "script/build-script",
                &[("IMAGE".to_string(), "lamp.img".to_string())],
            )
            .expect("run");
        assert!(out.success());
        assert_eq!(
            fs::read_to_string(build.script_dir().join("out"))
                .expect("read")
                .trim(),
            "lamp.img"
        );
    }

    #[test]
    #[serial]
    fn run_script_reports_the_exit_status() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"));
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), false);
        let build = manager.acquire("firmware").expect("acquire");
        fs::write(build.script_dir().join("build-script"), "#!/bin/sh\nexit 7\n")
            .expect("write");

        let out = manager
            .run_script(&build, "script/build-script", &[])
            .expect("run");
        assert_eq!(out.exit_code, 7);
    }

    #[test]
    #[serial]
    fn dismantle_removes_the_root_and_releases_the_lock() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"));
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), false);
        let build = manager.acquire("firmware").expect("acquire");
        let root = build.root();
        manager.dismantle(build).expect("dismantle");
        assert!(!root.exists());
        assert!(fx.registry.held().is_empty());

        // Reacquire works after release.
        let again = manager.acquire("firmware").expect("reacquire");
        drop(again);
    }

    #[test]
    #[serial]
    fn keep_chroot_retains_the_root() {
        let td = tempdir().expect("tempdir");
        let fx = fixture(td.path());
        let fake = fake_su(&td.path().join("bin"));
        let _guard = EnvGuard::set("E2_SU_BIN", fake.to_str().expect("utf8"));

        let manager = ChrootManager::new(&fx.cache, &fx.registry, fx.base.clone(), true);
        let build = manager.acquire("firmware").expect("acquire");
        let root = build.root();
        manager.dismantle(build).expect("dismantle");
        assert!(root.is_dir());
        assert!(fx.registry.held().is_empty());
    }
}
