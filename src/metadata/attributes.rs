use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An ordered key/value attribute set for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, Vec<u8>>);

impl Attributes {
    pub fn new() -> Self { Self(BTreeMap::new()) }

    pub fn get(&self, key: &str) -> Option<&[u8]> { self.0.get(key).map(|v| v.as_slice()) }

    pub fn string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| String::from_utf8(v.clone()).ok())
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.string(key).and_then(|s| s.parse::<i64>().ok())
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.string(key).and_then(|s| s.parse::<u64>().ok())
    }

    pub fn set<K: Into<String>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_string<K: Into<String>>(&mut self, key: K, value: &str) {
        self.0.insert(key.into(), value.as_bytes().to_vec());
    }

    pub fn set_i64<K: Into<String>>(&mut self, key: K, value: i64) {
        self.set_string(key, &value.to_string());
    }

    pub fn set_u64<K: Into<String>>(&mut self, key: K, value: u64) {
        self.set_string(key, &value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> { self.0.remove(key) }
    pub fn contains_key(&self, key: &str) -> bool { self.0.contains_key(key) }
    pub fn keys(&self) -> impl Iterator<Item = &String> { self.0.keys() }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> { self.0.iter() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn extend(&mut self, other: &Attributes) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Entries whose key starts with `prefix`.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
        self.0.iter().filter(move |(k, _)| k.starts_with(prefix))
    }

    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.0.retain(|k, _| keep(k));
    }
}

impl FromIterator<(String, Vec<u8>)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
