//! The identity engine: every entity's content id, memoized.
//!
//! Each id is the hash of a canonical byte stream. Canonical order:
//!
//! - environment: `k=v` in key order (see `env`)
//! - licence: name, then each file's sha1, declared order
//! - chroot group: name, then per file server/location/sha1/tartype,
//!   declared order; a `groupid` pin wins outright
//! - source: per-SCM schema (see `scm`)
//! - result: name, composed environment id, sorted sourceids, sorted
//!   chroot group ids, sorted licence ids, build-script hash
//! - build: resultid, then sorted buildids of direct dependencies
//!
//! The working-copy sentinel short-circuits and propagates: any result
//! whose transitive sources contain it gets the sentinel as its buildid and
//! is never cached.

use std::collections::HashMap;
use std::sync::Mutex;

use e2build_hash::Hasher;

use crate::cache::Cache;
use crate::dag;
use crate::model::Project;
use crate::scm::plugin_for;
use crate::types::{Error, RefKind, SourceSet, WORKING_COPY_ID};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MemoKey {
    Licence(String),
    ChrootGroup(String),
    Source(String, SourceSet),
    Result(String, SourceSet),
    Build(String, SourceSet),
}

pub struct IdentEngine<'p> {
    project: &'p Project,
    cache: &'p Cache,
    memo: Mutex<HashMap<MemoKey, String>>,
}

impl<'p> IdentEngine<'p> {
    pub fn new(project: &'p Project, cache: &'p Cache) -> Self {
        Self {
            project,
            cache,
            memo: Mutex::new(HashMap::new()),
        }
    }

    fn memoized(
        &self,
        key: MemoKey,
        compute: impl FnOnce() -> Result<String, Error>,
    ) -> Result<String, Error> {
        if let Some(id) = self.memo.lock().expect("memo poisoned").get(&key) {
            return Ok(id.clone());
        }
        let id = compute()?;
        self.memo
            .lock()
            .expect("memo poisoned")
            .insert(key, id.clone());
        Ok(id)
    }

    pub fn licence_id(&self, name: &str) -> Result<String, Error> {
        self.memoized(MemoKey::Licence(name.to_string()), || {
            let licence =
                self.project
                    .licences
                    .get(name)
                    .ok_or_else(|| Error::ReferenceNotFound {
                        kind: RefKind::Licence,
                        name: name.to_string(),
                        referrer: "identity".to_string(),
                    })?;
            let mut hasher = Hasher::new();
            hasher.append(&licence.name);
            for file in &licence.files {
                hasher.append(&file.sha1);
            }
            Ok(hasher.finish())
        })
    }

    pub fn chroot_group_id(&self, name: &str) -> Result<String, Error> {
        self.memoized(MemoKey::ChrootGroup(name.to_string()), || {
            let group =
                self.project
                    .chroot_groups
                    .get(name)
                    .ok_or_else(|| Error::ReferenceNotFound {
                        kind: RefKind::ChrootGroup,
                        name: name.to_string(),
                        referrer: "identity".to_string(),
                    })?;
            if let Some(pinned) = &group.groupid {
                return Ok(pinned.clone());
            }
            let mut hasher = Hasher::new();
            hasher.append(&group.name);
            for file in &group.files {
                hasher.append(&file.server);
                hasher.append(&file.location);
                hasher.append(&file.sha1);
                hasher.append(file.tartype.as_str());
            }
            Ok(hasher.finish())
        })
    }

    pub fn source_id(&self, name: &str, set: SourceSet) -> Result<String, Error> {
        self.memoized(MemoKey::Source(name.to_string(), set), || {
            let source = self.project.source(name)?;
            if set == SourceSet::WorkingCopy {
                return Ok(WORKING_COPY_ID.to_string());
            }
            let mut licence_ids = Vec::with_capacity(source.licences.len());
            for licence in &source.licences {
                licence_ids.push(self.licence_id(licence)?);
            }
            licence_ids.sort();
            plugin_for(&source.kind).sourceid(self.project, source, set, &licence_ids, self.cache)
        })
    }

    pub fn result_id(&self, name: &str, set: SourceSet) -> Result<String, Error> {
        self.memoized(MemoKey::Result(name.to_string(), set), || {
            let result = self.project.result(name)?;

            let mut source_ids = Vec::with_capacity(result.sources.len());
            for source in &result.sources {
                let id = self.source_id(source, set)?;
                if id == WORKING_COPY_ID {
                    return Ok(WORKING_COPY_ID.to_string());
                }
                source_ids.push(id);
            }
            source_ids.sort();

            let mut group_ids = Vec::with_capacity(result.chroot_groups.len());
            for group in &result.chroot_groups {
                group_ids.push(self.chroot_group_id(group)?);
            }
            group_ids.sort();

            let mut licence_ids = Vec::new();
            for source in &result.sources {
                for licence in &self.project.source(source)?.licences {
                    licence_ids.push(self.licence_id(licence)?);
                }
            }
            licence_ids.sort();
            licence_ids.dedup();

            let mut env = self.project.env.clone();
            env.merge(&result.env, true);

            let script_hash = e2build_hash::hash_file(&result.script)?;

            let mut hasher = Hasher::new();
            hasher.append(&result.name);
            hasher.append(env.id());
            for id in &source_ids {
                hasher.append(id);
            }
            for id in &group_ids {
                hasher.append(id);
            }
            for id in &licence_ids {
                hasher.append(id);
            }
            hasher.append(script_hash);
            Ok(hasher.finish())
        })
    }

    /// The buildid: resultid plus the sorted buildids of every direct
    /// dependency. The sentinel wins over everything.
    pub fn build_id(&self, name: &str, set: SourceSet) -> Result<String, Error> {
        self.memoized(MemoKey::Build(name.to_string(), set), || {
            let result_id = self.result_id(name, set)?;
            if result_id == WORKING_COPY_ID {
                return Ok(WORKING_COPY_ID.to_string());
            }

            let mut dep_ids = Vec::new();
            for dep in dag::dlist(&self.project.results, name)? {
                let id = self.build_id(&dep, set)?;
                if id == WORKING_COPY_ID {
                    return Ok(WORKING_COPY_ID.to_string());
                }
                dep_ids.push(id);
            }
            dep_ids.sort();

            let mut hasher = Hasher::new();
            hasher.append(&result_id);
            for id in &dep_ids {
                hasher.append(id);
            }
            Ok(hasher.finish())
        })
    }
}
