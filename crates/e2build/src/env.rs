//! Build environments: ordered `name=value` mappings with a stable identity.
//!
//! The identity is the content hash over `k=v` pairs in lexicographic key
//! order, so two environments with the same mapping have the same id no
//! matter how they were assembled.

use std::collections::BTreeMap;

use e2build_hash::Hasher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, builder-style.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Set a variable in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate pairs in lexicographic key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other` into `self`. With `override_existing`, `other` wins on
    /// shared keys; without it, existing entries are left untouched.
    pub fn merge(&mut self, other: &Environment, override_existing: bool) {
        for (k, v) in other.iter() {
            if override_existing || !self.vars.contains_key(k) {
                self.vars.insert(k.to_string(), v.to_string());
            }
        }
    }

    /// The content id: hash over `k=v` pairs in key order, no separators.
    pub fn id(&self) -> String {
        let mut hasher = Hasher::new();
        for (k, v) in self.iter() {
            hasher.append(k);
            hasher.append("=");
            hasher.append(v);
        }
        hasher.finish()
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
