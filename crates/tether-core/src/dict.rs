use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// The shared execution context of one forward pass: named tensors.
///
/// Keys iterate in sorted order, which keeps logging and metric output
/// stable across runs.
#[derive(Clone, Debug, Default)]
pub struct DataDict {
    entries: BTreeMap<String, Tensor>,
}

impl DataDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    /// Look up `key`, failing with `MissingKey` naming whoever asked.
    pub fn require(&self, key: &str, context: &str) -> Result<&Tensor> {
        self.entries.get(key).ok_or_else(|| Error::MissingKey {
            key: key.to_string(),
            context: context.to_string(),
        })
    }

    /// Insert a value, returning whatever was stored under the key before.
    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) -> Option<Tensor> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` into this dictionary; `other` wins on
    /// shared keys.
    pub fn merge(&mut self, other: &DataDict) {
        for (k, v) in other.iter() {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Move the entry at `from` to `to`. Returns false if `from` was absent.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.entries.remove(from) {
            Some(v) => {
                self.entries.insert(to.into(), v);
                true
            }
            None => false,
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Tensor)> for DataDict {
    fn from_iter<I: IntoIterator<Item = (K, Tensor)>>(iter: I) -> Self {
        DataDict {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl<K: Into<String>> Extend<(K, Tensor)> for DataDict {
    fn extend<I: IntoIterator<Item = (K, Tensor)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.entries.insert(k.into(), v);
        }
    }
}

impl IntoIterator for DataDict {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a DataDict {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_names_context() {
        let d = DataDict::new();
        let err = d.require("x", "node 'f'").unwrap_err();
        assert!(matches!(err, Error::MissingKey { ref key, ref context }
            if key == "x" && context == "node 'f'"));
    }

    #[test]
    fn test_merge_and_rename() {
        let mut a: DataDict = [("x", Tensor::scalar(1.0))].into_iter().collect();
        let b: DataDict = [("x", Tensor::scalar(2.0)), ("y", Tensor::scalar(3.0))]
            .into_iter()
            .collect();
        a.merge(&b);
        assert_eq!(a.get("x").unwrap().to_scalar_f64().unwrap(), 2.0);
        assert!(a.rename("y", "z"));
        assert!(!a.rename("y", "w"));
        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["x", "z"]);
    }
}
