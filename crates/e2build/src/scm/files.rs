//! The files plug-in: sources made of individually downloaded, verified
//! files. During prepare each file is copied, unpacked or applied as a
//! patch, in declared order.

use std::fs;
use std::path::{Path, PathBuf};

use e2build_hash::Hasher;

use crate::cache::Cache;
use crate::model::{FileRef, FilesSource, Project, Source, SourceKind, TarType};
use crate::process::{patch_program, run_tool, tar_program};
use crate::types::{Error, Reporter, SourceSet, WORKING_COPY_ID};

pub struct FilesScm;

fn files_source(source: &Source) -> Result<&FilesSource, Error> {
    match &source.kind {
        SourceKind::Files(files) => Ok(files),
        _ => Err(Error::Internal {
            reason: format!("source {} dispatched to the files plug-in", source.name),
        }),
    }
}

fn scm_err(source: &Source, reason: impl Into<String>) -> Error {
    Error::Scm {
        source_name: source.name.clone(),
        reason: reason.into(),
    }
}

/// Download one file through the cache and verify its declared checksum.
fn fetch_verified(source: &Source, file: &FileRef, cache: &Cache) -> Result<PathBuf, Error> {
    let local = cache.fetch_file(&file.server, &file.location)?;
    let actual = e2build_hash::hash_file(&local)?;
    if actual != file.sha1 {
        return Err(scm_err(
            source,
            format!(
                "checksum mismatch for {}:{}: declared {}, got {actual}",
                file.server, file.location, file.sha1
            ),
        ));
    }
    Ok(local)
}

fn file_name_of(file: &FileRef) -> &str {
    file.location.rsplit('/').next().unwrap_or(&file.location)
}

impl super::ScmPlugin for FilesScm {
    fn kind(&self) -> &'static str {
        "files"
    }

    fn sourceid(
        &self,
        _project: &Project,
        source: &Source,
        set: SourceSet,
        licence_ids: &[String],
        _cache: &Cache,
    ) -> Result<String, Error> {
        let files = files_source(source)?;
        if set == SourceSet::WorkingCopy {
            return Ok(WORKING_COPY_ID.to_string());
        }

        let mut licence_ids = licence_ids.to_vec();
        licence_ids.sort();

        let mut hasher = Hasher::new();
        hasher.append(&source.name);
        hasher.append("files");
        hasher.append(source.env.id());
        for id in &licence_ids {
            hasher.append(id);
        }
        for file in &files.files {
            hasher.append(&file.server);
            hasher.append(&file.location);
            hasher.append(&file.sha1);
            match (&file.unpack, &file.patch) {
                (Some(dir), _) => {
                    hasher.append("unpack=");
                    hasher.append(dir);
                }
                (None, Some(level)) => {
                    hasher.append("patch=");
                    hasher.append(level);
                }
                (None, None) => hasher.append("copy"),
            }
        }
        Ok(hasher.finish())
    }

    fn fetch(&self, _project: &Project, source: &Source, cache: &Cache) -> Result<(), Error> {
        let files = files_source(source)?;
        for file in &files.files {
            fetch_verified(source, file, cache)?;
        }
        Ok(())
    }

    fn update(
        &self,
        _project: &Project,
        _source: &Source,
        _reporter: &mut dyn Reporter,
    ) -> Result<(), Error> {
        // Downloaded files are pinned by checksum; nothing to bring up to
        // date.
        Ok(())
    }

    fn prepare(
        &self,
        _project: &Project,
        source: &Source,
        _set: SourceSet,
        dest: &Path,
        cache: &Cache,
    ) -> Result<(), Error> {
        let files = files_source(source)?;
        fs::create_dir_all(dest)?;
        let dest_str = dest.to_string_lossy().to_string();

        for file in &files.files {
            let local = fetch_verified(source, file, cache)?;
            let local_str = local.to_string_lossy().to_string();

            if let Some(unpack_dir) = &file.unpack {
                let tartype = TarType::from_location(&file.location).ok_or_else(|| {
                    scm_err(
                        source,
                        format!("cannot unpack {}: unknown archive type", file.location),
                    )
                })?;
                let mut args = vec!["-x"];
                if let Some(flag) = tartype.tar_flag() {
                    args.push(flag);
                }
                args.extend_from_slice(&["-f", &local_str, "-C", &dest_str]);
                let out = run_tool(&tar_program(), &args, dest, &[], None)
                    .map_err(|e| scm_err(source, format!("tar: {e:#}")))?;
                if !out.success() {
                    return Err(scm_err(
                        source,
                        format!("extraction of {} failed: {}", file.location, out.stderr.trim()),
                    ));
                }
                if !dest.join(unpack_dir).is_dir() {
                    return Err(scm_err(
                        source,
                        format!("archive {} did not unpack to {unpack_dir}", file.location),
                    ));
                }
            } else if let Some(level) = &file.patch {
                let level_arg = format!("-p{level}");
                let out = run_tool(
                    &patch_program(),
                    &[&level_arg, "-d", &dest_str, "-i", &local_str],
                    dest,
                    &[],
                    None,
                )
                .map_err(|e| scm_err(source, format!("patch: {e:#}")))?;
                if !out.success() {
                    return Err(scm_err(
                        source,
                        format!("patch {} failed: {}", file.location, out.stderr.trim()),
                    ));
                }
            } else {
                fs::copy(&local, dest.join(file_name_of(file)))?;
            }
        }
        Ok(())
    }

    fn working_copy_available(&self, _project: &Project, _source: &Source) -> bool {
        false
    }

    fn has_working_copy(&self, _source: &Source) -> bool {
        false
    }

    fn check_working_copy(
        &self,
        _project: &Project,
        _source: &Source,
        _cache: &Cache,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn to_result(
        &self,
        _project: &Project,
        source: &Source,
        _set: SourceSet,
        dest: &Path,
        cache: &Cache,
    ) -> Result<String, Error> {
        let files = files_source(source)?;
        let staged = dest.join(&source.name);
        fs::create_dir_all(&staged)?;
        for file in &files.files {
            let local = fetch_verified(source, file, cache)?;
            fs::copy(&local, staged.join(file_name_of(file)))?;
        }
        Ok(source.name.clone())
    }

    fn display(&self, source: &Source) -> String {
        match files_source(source) {
            Ok(files) => format!("files ({} files)", files.files.len()),
            Err(_) => format!("files {}", source.name),
        }
    }
}
