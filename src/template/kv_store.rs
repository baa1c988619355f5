use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use glob::MatchOptions;
use glob::Pattern;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;
use crate::TemplateError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

/// Flat key → value projection of the backend keys of one resource.
///
/// Keys are absolute slash-separated paths. Clones share the same data, so
/// the template functions observe every generation the processor installs.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(
        &self,
        key: &str,
    ) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<KvPair> {
        self.data.read().get(key).map(|v| KvPair {
            key: key.to_string(),
            value: v.clone(),
        })
    }

    /// Value of `key`, or `default` when the key is absent
    pub fn get_value(
        &self,
        key: &str,
        default: Option<&str>,
    ) -> Option<String> {
        self.data
            .read()
            .get(key)
            .cloned()
            .or_else(|| default.map(str::to_string))
    }

    /// All pairs whose key matches the glob `pattern`, ordered by key
    pub fn get_all(
        &self,
        pattern: &str,
    ) -> Result<Vec<KvPair>> {
        let pattern = Pattern::new(pattern).map_err(TemplateError::Pattern)?;
        Ok(self
            .data
            .read()
            .iter()
            .filter(|(k, _)| pattern.matches_with(k, MATCH_OPTIONS))
            .map(|(k, v)| KvPair {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    /// Values of every key matching `pattern`, sorted by value
    pub fn get_all_values(
        &self,
        pattern: &str,
    ) -> Result<Vec<String>> {
        let mut values: Vec<String> = self.get_all(pattern)?.into_iter().map(|kv| kv.value).collect();
        values.sort();
        Ok(values)
    }

    /// Names of the entries directly under `path`, files and directories alike
    pub fn list(
        &self,
        path: &str,
    ) -> Vec<String> {
        let prefix = path_terms(path);
        let mut names = BTreeSet::new();
        for key in self.data.read().keys() {
            if key == path {
                if let Some(base) = path_terms(key).last() {
                    names.insert(base.to_string());
                }
                continue;
            }
            let terms = path_terms(key);
            if terms.len() > prefix.len() && terms.starts_with(&prefix) {
                names.insert(terms[prefix.len()].to_string());
            }
        }
        names.into_iter().collect()
    }

    /// Names of the directory-like entries directly under `path`
    pub fn list_dir(
        &self,
        path: &str,
    ) -> Vec<String> {
        let prefix = path_terms(path);
        let mut names = BTreeSet::new();
        for key in self.data.read().keys() {
            let terms = path_terms(key);
            if terms.is_empty() {
                continue;
            }
            let dir = &terms[..terms.len() - 1];
            if dir.len() > prefix.len() && dir.starts_with(&prefix) {
                names.insert(dir[prefix.len()].to_string());
            }
        }
        names.into_iter().collect()
    }

    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.data.write().insert(key.into(), value.into());
    }

    pub fn del(
        &self,
        key: &str,
    ) {
        self.data.write().remove(key);
    }

    pub fn purge(&self) {
        self.data.write().clear();
    }

    /// Swaps the whole content under one write lock.
    ///
    /// Readers see either the previous generation or the new one, never a mix.
    pub fn replace_all(
        &self,
        entries: HashMap<String, String>,
    ) {
        let mut guard = self.data.write();
        guard.clear();
        guard.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

fn path_terms(path: &str) -> Vec<&str> {
    path.split('/').filter(|t| !t.is_empty()).collect()
}
