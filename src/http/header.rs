//! Owned header multimap with lowercase-normalised names.
//!
//! SPDY header blocks require lowercase names on the wire, and a name may
//! carry multiple values (joined by NUL bytes in the block). Iteration
//! order is deterministic so that encoding a block is stable.

use std::collections::BTreeMap;

/// A set of headers: name → one or more values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    map: BTreeMap<String, Vec<String>>,
}

fn canon(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map
            .get(&canon(name))
            .and_then(|vs| vs.first())
            .map(String::as_str)
    }

    /// All values for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.map.get(&canon(name)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(canon(name), vec![value.into()]);
    }

    /// Append a value for `name`.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.map.entry(canon(name)).or_default().push(value.into());
    }

    /// Remove `name`, returning its values if present.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.map.remove(&canon(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&canon(name))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate names and value lists in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Merge every entry of `other` into `self`, appending values.
    pub fn extend(&mut self, other: &Headers) {
        for (name, values) in other.iter() {
            for v in values {
                self.add(name, v.clone());
            }
        }
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut h = Headers::new();
        for (name, value) in pairs {
            h.add(name, value);
        }
        h
    }
}
