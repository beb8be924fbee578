// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::str::FromStr;

use super::Error;
use super::validation::{validate_component, validate_dataset_name, validate_name};

/// The default dataset holding one child dataset per jail.
pub const DEFAULT_JAIL_ROOT: &str = "zroot/JAIL";

/// The default dataset holding free-standing jail environments.
pub const DEFAULT_POOL: &str = "zroot/JE";

/// An already-validated ZFS dataset name, e.g. `zroot/JAIL/www` or
/// `zroot/JE/14.1@jectl`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetName {
    inner: String,
}

impl DatasetName {
    pub fn new(name: &str) -> Result<Self, Error> {
        validate_dataset_name(name)?;
        Ok(Self {
            inner: name.to_string(),
        })
    }

    /// Build the name of a child dataset.
    pub fn append(&self, child: &str) -> Result<Self, Error> {
        if self.is_snapshot() {
            return Err(Error::InvalidName {
                name: format!("{}/{}", self.inner, child),
                reason: "snapshots cannot have children".to_string(),
            });
        }
        validate_component(child, true)?;
        Self::new(&format!("{}/{}", self.inner, child))
    }

    /// Build the name of a snapshot of this dataset.
    pub fn snapshot(&self, label: &str) -> Result<Self, Error> {
        if self.is_snapshot() {
            return Err(Error::InvalidName {
                name: format!("{}@{}", self.inner, label),
                reason: "cannot snapshot a snapshot".to_string(),
            });
        }
        validate_component(label, false)?;
        Self::new(&format!("{}@{}", self.inner, label))
    }

    pub fn is_snapshot(&self) -> bool {
        self.inner.contains('@')
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// The last component, e.g. `14.1` for `zroot/JE/14.1`.
    pub fn basename(&self) -> &str {
        match self.inner.rfind('/') {
            Some(slash_pos) => &self.inner[slash_pos + 1..],
            None => &self.inner,
        }
    }

    /// The parent dataset, or `None` for a pool's root dataset.
    pub fn parent(&self) -> Option<DatasetName> {
        // The parent of a snapshot is the filesystem it was taken of.
        if let Some((filesystem, _)) = self.inner.split_once('@') {
            return Some(DatasetName::from_validated(filesystem));
        }
        self.inner
            .rfind('/')
            .map(|index| DatasetName::from_validated(&self.inner[..index]))
    }

    /// Whether `self` lies strictly beneath `other` in the dataset tree.
    pub fn is_descendant_of(&self, other: &DatasetName) -> bool {
        self.inner.len() > other.inner.len()
            && self.inner.starts_with(&other.inner)
            && matches!(self.inner.as_bytes()[other.inner.len()], b'/' | b'@')
    }

    /// Prefixes of a validated name are themselves valid.
    fn from_validated(name: &str) -> Self {
        Self {
            inner: name.to_string(),
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl FromStr for DatasetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetName::new(s)
    }
}

impl AsRef<str> for DatasetName {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

/// Where jails and the environment pool live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub jail_root: DatasetName,
    pub pool: DatasetName,
}

impl Layout {
    pub fn new(jail_root: &str, pool: &str) -> Result<Self, Error> {
        let jail_root = DatasetName::new(jail_root)?;
        let pool = DatasetName::new(pool)?;
        for root in [&jail_root, &pool] {
            if root.is_snapshot() {
                return Err(Error::InvalidName {
                    name: root.to_string(),
                    reason: "a snapshot cannot hold datasets".to_string(),
                });
            }
        }
        if jail_root == pool
            || jail_root.is_descendant_of(&pool)
            || pool.is_descendant_of(&jail_root)
        {
            return Err(Error::InvalidName {
                name: pool.to_string(),
                reason: format!("pool must not overlap the jail root '{}'", jail_root),
            });
        }
        Ok(Self { jail_root, pool })
    }

    /// The dataset of the named jail, `<jail-root>/<name>`.
    pub fn jail_path(&self, jail_name: &str) -> Result<DatasetName, Error> {
        validate_name(jail_name, self.jail_root.as_str())?;
        self.jail_root.append(jail_name)
    }

    /// The dataset of a free-standing environment, `<pool>/<name>`.
    pub fn pool_path(&self, je_name: &str) -> Result<DatasetName, Error> {
        validate_name(je_name, self.pool.as_str())?;
        self.pool.append(je_name)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            jail_root: DatasetName::from_validated(DEFAULT_JAIL_ROOT),
            pool: DatasetName::from_validated(DEFAULT_POOL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::default();
        assert_eq!(layout.jail_path("www").unwrap().as_str(), "zroot/JAIL/www");
        assert_eq!(layout.pool_path("14.1").unwrap().as_str(), "zroot/JE/14.1");

        assert!(layout.jail_path("").is_err());
        assert!(layout.pool_path("").is_err());
        assert!(layout.jail_path("www/db").is_err());
        assert!(layout.pool_path("base@jectl").is_err());
    }

    #[test]
    fn test_layout_rejects_overlap() {
        assert!(Layout::new("tank/JAIL", "tank/JE").is_ok());
        assert!(Layout::new("tank/JAIL", "tank/JAIL").is_err());
        assert!(Layout::new("tank/JAIL", "tank/JAIL/JE").is_err());
        assert!(Layout::new("tank/J", "tank/JAIL").is_ok());
        assert!(Layout::new("tank/JAIL@snap", "tank/JE").is_err());
    }

    #[test]
    fn test_basename_and_parent() {
        let name = DatasetName::new("zroot/JAIL/www/base").unwrap();
        assert_eq!(name.basename(), "base");
        assert_eq!(name.parent().unwrap().as_str(), "zroot/JAIL/www");
        assert_eq!(DatasetName::new("zroot").unwrap().parent(), None);

        let snap = DatasetName::new("zroot/JE/base@jectl").unwrap();
        assert_eq!(snap.basename(), "base@jectl");
        assert_eq!(snap.parent().unwrap().as_str(), "zroot/JE/base");
    }

    #[test]
    fn test_append_and_snapshot() {
        let pool = DatasetName::new("zroot/JE").unwrap();
        let je = pool.append("base").unwrap();
        assert_eq!(je.as_str(), "zroot/JE/base");
        let snap = je.snapshot("jectl").unwrap();
        assert_eq!(snap.as_str(), "zroot/JE/base@jectl");
        assert!(snap.is_snapshot());

        assert!(snap.append("child").is_err());
        assert!(snap.snapshot("again").is_err());
        assert!(pool.append("").is_err());
        assert!(pool.snapshot("").is_err());
    }

    #[test]
    fn test_is_descendant_of() {
        let jail = DatasetName::new("zroot/JAIL/www").unwrap();
        assert!(DatasetName::new("zroot/JAIL/www/base").unwrap().is_descendant_of(&jail));
        assert!(DatasetName::new("zroot/JAIL/www@snap").unwrap().is_descendant_of(&jail));
        assert!(!DatasetName::new("zroot/JAIL/wwwdata").unwrap().is_descendant_of(&jail));
        assert!(!jail.is_descendant_of(&jail));
    }
}
