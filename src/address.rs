//! Stable identifiers for random-choice sites.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
    sync::{PoisonError, RwLock},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PplError, Result};

/// Identifies one random-choice site of a program. Two traces of the same
/// program use the same address for the same site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Address(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Address {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address(value)
    }
}

/// Description of a random-choice call site, handed to
/// [`TraceContext::sample_at`](crate::TraceContext::sample_at).
///
/// By default a site is addressed automatically as
/// `{name}__{distribution}__{instance}`, where `instance` counts how often
/// the same name and distribution were visited in the current execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    name: String,
    exact: bool,
    replace: bool,
    control: bool,
}

impl Site {
    pub fn new(name: impl Into<String>) -> Self {
        Site {
            name: name.into(),
            exact: false,
            replace: false,
            control: true,
        }
    }

    /// Use `address` verbatim. Visiting it twice in one execution is an
    /// [`PplError::AddressCollision`].
    pub fn exact(address: impl Into<String>) -> Self {
        Site {
            exact: true,
            ..Site::new(address)
        }
    }

    /// Replaced sites keep only their last draw, which is what rejection
    /// sampling loops inside a model need.
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    /// Uncontrolled sites are always drawn fresh from their prior and are
    /// never proposed or reused by inference.
    pub fn control(mut self, control: bool) -> Self {
        self.control = control;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn is_replaced(&self) -> bool {
        self.replace
    }

    pub fn is_controlled(&self) -> bool {
        self.control
    }
}

impl From<&str> for Site {
    fn from(value: &str) -> Self {
        Site::new(value)
    }
}

impl From<String> for Site {
    fn from(value: String) -> Self {
        Site::new(value)
    }
}

/// Maps a call site to the base of its address.
///
/// Implementations are shared read-only between executions and chains.
pub trait AddressIndex: Send + Sync {
    fn resolve(&self, site: &str, distribution: &str) -> Result<String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DictionaryEntries {
    ids: HashMap<String, String>,
}

/// Address index that assigns short ids (`A1`, `A2`, ...) to call sites
/// in the order they are first seen. Can be saved and reloaded so that
/// addresses stay stable across processes.
#[derive(Debug, Default)]
pub struct AddressDictionary {
    entries: RwLock<DictionaryEntries>,
}

impl AddressDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Could not open address dictionary {}", path.display()))?;
        let entries: DictionaryEntries = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Could not parse address dictionary {}", path.display()))?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let entries = self
            .entries
            .read()
            .map_err(|_| PplError::AddressIndex("poisoned lock".into()))?;
        let file = File::create(path)
            .with_context(|| format!("Could not create address dictionary {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &*entries)
            .context("Could not write address dictionary")?;
        Ok(())
    }

    /// Number of registered call sites.
    ///
    /// Still counts entries after a panic poisoned the lock: ids are only
    /// ever added by a single map insert, so the map cannot be left half
    /// updated.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddressIndex for AddressDictionary {
    fn resolve(&self, site: &str, distribution: &str) -> Result<String> {
        let key = format!("{site}__{distribution}");
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| PplError::AddressIndex("poisoned lock".into()))?;
            if let Some(id) = entries.ids.get(&key) {
                return Ok(id.clone());
            }
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| PplError::AddressIndex("poisoned lock".into()))?;
        let next = entries.ids.len() + 1;
        let id = entries
            .ids
            .entry(key)
            .or_insert_with_key(|key| {
                let id = format!("A{next}");
                debug!(site = key.as_str(), id = id.as_str(), "registered address");
                id
            })
            .clone();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn site_builders() {
        let site = Site::new("x").replace(true).control(false);
        assert!(site.is_replaced());
        assert!(!site.is_controlled());
        assert!(!site.is_exact());
        assert!(Site::exact("y").is_exact());
    }

    #[test]
    fn dictionary_assigns_stable_ids() {
        let dict = AddressDictionary::new();
        assert_eq!(dict.resolve("mu", "Normal").unwrap(), "A1");
        assert_eq!(dict.resolve("sigma", "Gamma").unwrap(), "A2");
        assert_eq!(dict.resolve("mu", "Normal").unwrap(), "A1");
        assert_eq!(dict.resolve("mu", "Uniform").unwrap(), "A3");
        assert_eq!(dict.len(), 3);
    }

    #[test]
    fn poisoned_dictionary_keeps_its_count() {
        let dict = AddressDictionary::new();
        dict.resolve("mu", "Normal").unwrap();
        dict.resolve("sigma", "Gamma").unwrap();
        let poisoned = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = dict.entries.write().unwrap();
            panic!("writer failed");
        }));
        assert!(poisoned.is_err());
        assert!(dict.entries.is_poisoned());

        assert_eq!(dict.len(), 2);
        assert!(!dict.is_empty());
        assert!(matches!(
            dict.resolve("tau", "Normal"),
            Err(PplError::AddressIndex(_))
        ));
    }

    #[test]
    fn dictionary_round_trips_through_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("addresses.json");
        let dict = AddressDictionary::new();
        dict.resolve("a", "Normal")?;
        dict.resolve("b", "Normal")?;
        dict.save(&path)?;

        let loaded = AddressDictionary::load(&path)?;
        assert_eq!(loaded.resolve("b", "Normal")?, "A2");
        assert_eq!(loaded.resolve("c", "Normal")?, "A3");
        Ok(())
    }
}
