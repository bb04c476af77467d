//! The project release identity: the `.e2/e2version` file.
//!
//! Grammar: one line, two whitespace-delimited tokens, `<branch> <tag>`.
//! The pseudo tag `^` marks a project that has not been tagged for release
//! yet; release mode refuses to build it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::Error;

pub const E2VERSION_FILE: &str = "e2version";

/// The pseudo tag: "no release tag yet, use the branch".
pub const PSEUDO_TAG: &str = "^";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseId {
    pub branch: String,
    pub tag: String,
}

impl ReleaseId {
    /// Parse the one-line `<branch> <tag>` grammar.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let line = input.lines().next().unwrap_or("");
        let mut tokens = line.split_whitespace();
        let branch = tokens.next().ok_or_else(|| Error::Parse {
            what: E2VERSION_FILE.to_string(),
            reason: "missing branch token".to_string(),
        })?;
        let tag = tokens.next().ok_or_else(|| Error::Parse {
            what: E2VERSION_FILE.to_string(),
            reason: "missing tag token".to_string(),
        })?;
        if tokens.next().is_some() {
            return Err(Error::Parse {
                what: E2VERSION_FILE.to_string(),
                reason: "trailing tokens after branch and tag".to_string(),
            });
        }
        Ok(Self {
            branch: branch.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Serialize back to the on-disk form. `parse(format(x)) == x`.
    pub fn format(&self) -> String {
        format!("{} {}\n", self.branch, self.tag)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Apply `E2_LOCAL_BRANCH` / `E2_LOCAL_TAG` overrides, for working-copy
    /// workflows that build against a locally chosen revision.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(branch) = std::env::var("E2_LOCAL_BRANCH") {
            if !branch.is_empty() {
                self.branch = branch;
            }
        }
        if let Ok(tag) = std::env::var("E2_LOCAL_TAG") {
            if !tag.is_empty() {
                self.tag = tag;
            }
        }
        self
    }

    pub fn is_pseudo_tag(&self) -> bool {
        self.tag == PSEUDO_TAG
    }

    /// Release mode must not build the pseudo tag.
    pub fn release_guard(&self) -> Result<(), Error> {
        if self.is_pseudo_tag() {
            return Err(Error::ReleaseGuard);
        }
        Ok(())
    }
}
