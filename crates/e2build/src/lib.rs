//! # e2build
//!
//! The core of a reproducible embedded-systems build tool.
//!
//! A project declares a graph of *results* built inside pinned root
//! filesystems (*chroot groups*) from versioned *sources* under a defined
//! *environment*. e2build drives each result deterministically to a binary
//! artifact identified by a content-addressed *buildid*; a content-addressed
//! result store, mirrored through a pluggable cache/transport layer,
//! short-circuits any build whose inputs have not changed.
//!
//! ## Pipeline
//!
//! The core flow is **load → identify → order → build**:
//!
//! 1. [`model::Project::load`] reads the on-disk project description and
//!    validates every cross-reference.
//! 2. [`ident::IdentEngine`] binds each source to a revision under the
//!    selected source set and computes sourceids, resultids and buildids.
//! 3. [`dag`] orders the requested results so dependencies always come
//!    first.
//! 4. [`pipeline::BuildDriver`] walks that order through the per-result
//!    state machine: fetch sources, prepare them into the build tree,
//!    assemble the chroot, run the build script, collect and store the
//!    artifact. A cached artifact skips its whole subtree.
//!
//! ## Determinism
//!
//! Every id is a hash over a canonical byte stream, so equal inputs give
//! equal ids: environments hash order-independently, build scripts by
//! content, git sources by commit id, downloaded files by declared
//! checksum. The `working-copy` source set is the deliberate exception: it
//! yields a sentinel id that poisons caching for everything it reaches.
//!
//! ## Modules
//!
//! - [`model`] — typed project records and the cross-reference validator
//! - [`config`] — the on-disk project/server configuration loader
//! - [`ident`] — sourceid / resultid / buildid computation, memoized
//! - [`dag`] — cycle detection, topological order, reachability
//! - [`pipeline`] — the per-result state machine and build driver
//! - [`chroot`] — build-root provisioning via the `e2-su-2.2` helper
//! - [`scm`] — the SCM contract and the git/svn/files plug-ins
//! - [`cache`] — the content mirror with per-server writeback policy
//! - [`transport`] — URL-addressed fetch/push over file, http, rsync, scp
//! - [`store`] — the artifact store keyed by buildid
//! - [`env`] — build environments with order-independent identity
//! - [`events`] — the append-only JSONL run log
//! - [`context`] — per-invocation state with deferred cleanup
//! - [`version`] — the `e2version` release identity
//! - [`types`] — shared records, warnings and the error taxonomy
//!
//! The command-line front-end is a separate crate; this library exposes
//! everything it needs, including selection validation and the
//! exit-status mapping in [`types`].

/// The content-mirror cache over the transport layer.
pub mod cache;

/// Build-root provisioning, assembly and teardown.
pub mod chroot;

/// On-disk configuration loading (project tree, server table).
pub mod config;

/// Per-invocation run state: cache, temp paths, locks, events, interrupt.
pub mod context;

/// Operations on the result dependency graph.
pub mod dag;

/// Build environments with order-independent identity.
pub mod env;

/// Append-only JSONL log of build-run events.
pub mod events;

/// The identity engine: content ids for every entity.
pub mod ident;

/// The typed project model and its validator.
pub mod model;

/// The build pipeline: state machine and driver.
pub mod pipeline;

/// External tool execution.
pub mod process;

/// The SCM contract and plug-ins.
pub mod scm;

/// The artifact store keyed by buildid.
pub mod store;

/// URL-addressed operations on remote locations.
pub mod transport;

/// Shared records and the error taxonomy.
pub mod types;

/// The `e2version` release identity.
pub mod version;

pub use types::{Error, Reporter};
