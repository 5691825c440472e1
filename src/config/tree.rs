use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;

/// A flat, ordered key / value view of a hierarchical configuration. Nesting is expressed
///  through dotted key prefixes, so any declarative format (files, environment, a registry)
///  can be mapped onto it by the host.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ConfigTree {
    entries: BTreeMap<String, String>,
}

/// `save` and `load` against a [ConfigTree] below a given key prefix. `load` falls back to
///  defaults for missing keys, and fails only for keys that are present but malformed.
pub trait TreeConfig: Sized {
    fn save(&self, tree: &mut ConfigTree, prefix: &str);
    fn load(tree: &ConfigTree, prefix: &str) -> anyhow::Result<Self>;
}

pub fn key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    }
    else {
        format!("{}.{}", prefix, name)
    }
}

impl ConfigTree {
    pub fn new() -> ConfigTree {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> anyhow::Result<Option<T>>
    where <T as FromStr>::Err: std::fmt::Display
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("invalid value {:?} for configuration key {}: {}", raw, key, e)),
        }
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> anyhow::Result<T>
    where <T as FromStr>::Err: std::fmt::Display
    {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    /// durations are stored as milliseconds
    pub fn set_duration(&mut self, key: impl Into<String>, value: Duration) {
        self.set(key, value.as_millis());
    }

    pub fn get_duration_or(&self, key: &str, default: Duration) -> anyhow::Result<Duration> {
        Ok(self.get_parsed::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    /// lists are stored as `<key>.count` plus `<key>.0`, `<key>.1`, ..., so items may contain
    ///  any character
    pub fn set_list<'a>(&mut self, key: &str, items: impl IntoIterator<Item = &'a String>) {
        let mut count = 0usize;
        for item in items {
            self.set(format!("{}.{}", key, count), item);
            count += 1;
        }
        self.set(format!("{}.count", key), count);
    }

    pub fn get_list(&self, key: &str) -> anyhow::Result<Option<Vec<String>>> {
        let count_key = format!("{}.count", key);
        let count = match self.get_parsed::<usize>(&count_key)? {
            None => return Ok(None),
            Some(count) => count,
        };

        let mut result = Vec::with_capacity(count);
        for i in 0..count {
            let item_key = format!("{}.{}", key, i);
            match self.get(&item_key) {
                Some(item) => result.push(item.to_string()),
                None => return Err(anyhow!("configuration key {} is required by {}", item_key, count_key)),
            }
        }
        Ok(Some(result))
    }
}
