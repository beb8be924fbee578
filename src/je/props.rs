// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to the `je:` user properties.
//!
//! On disk every property is a free-form string and an empty string means
//! the property was unset. Nothing outside this module sees an empty
//! string: reads return `None` for both cases.

use std::collections::BTreeMap;
use std::fmt;

use super::{Backend, DatasetName, Error};

/// The user properties `jectl` understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Property {
    /// On a jail: the full dataset name of its active environment.
    Active,
    /// Branch or lineage label.
    Branch,
    /// `__FreeBSD_version` of the environment; the upgrade axis.
    FreebsdVersion,
    /// Name of the poudriere jail the environment was built from.
    JailName,
    /// poudriere overlay directory.
    OverlayDir,
    /// poudriere package list.
    PackageList,
    /// Set on an imported stream to request a new jail; the value names the
    /// environment to activate.
    Create,
}

impl Property {
    pub const ALL: [Property; 7] = [
        Property::Active,
        Property::Branch,
        Property::FreebsdVersion,
        Property::JailName,
        Property::OverlayDir,
        Property::PackageList,
        Property::Create,
    ];

    /// Properties that must match exactly for two environments to belong to
    /// the same lineage.
    pub const DESCRIPTORS: [Property; 3] = [
        Property::JailName,
        Property::OverlayDir,
        Property::PackageList,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Property::Active => "je:active",
            Property::Branch => "je:version",
            Property::FreebsdVersion => "je:poudriere:freebsd_version",
            Property::JailName => "je:poudriere:jailname",
            Property::OverlayDir => "je:poudriere:overlaydir",
            Property::PackageList => "je:poudriere:packagelist",
            Property::Create => "je:poudriere:create",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Property::ALL.into_iter().find(|prop| prop.key() == key)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Read a property. Absent and empty are both `None`.
pub fn get<B: Backend + ?Sized>(
    backend: &B,
    dataset: &DatasetName,
    prop: Property,
) -> Result<Option<String>, Error> {
    Ok(backend
        .user_property(dataset, prop.key())?
        .filter(|value| !value.is_empty()))
}

/// Write a property. An empty `value` unsets it.
pub fn set<B: Backend + ?Sized>(
    backend: &B,
    dataset: &DatasetName,
    prop: Property,
    value: &str,
) -> Result<(), Error> {
    backend
        .set_properties(dataset, &[(prop.key(), value)])
        .map_err(|err| Error::PropertyWriteFailed {
            name: dataset.to_string(),
            property: prop.key().to_string(),
            source: Box::new(err),
        })
}

pub fn clear<B: Backend + ?Sized>(
    backend: &B,
    dataset: &DatasetName,
    prop: Property,
) -> Result<(), Error> {
    set(backend, dataset, prop, "")
}

/// Read every recognized property of a dataset in one request.
pub fn load<B: Backend + ?Sized>(backend: &B, dataset: &DatasetName) -> Result<Properties, Error> {
    let mut values = BTreeMap::new();
    for (key, value) in backend.user_properties(dataset)? {
        if value.is_empty() {
            continue;
        }
        if let Some(prop) = Property::from_key(&key) {
            values.insert(prop, value);
        }
    }
    Ok(Properties { values })
}

/// A snapshot of the recognized properties of one dataset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<Property, String>,
}

impl Properties {
    pub fn get(&self, prop: Property) -> Option<&str> {
        self.values.get(&prop).map(String::as_str)
    }

    /// The numeric upgrade axis. Content that is not an unsigned integer is
    /// an error rather than zero.
    pub fn freebsd_version(&self) -> Result<Option<u64>, Error> {
        match self.get(Property::FreebsdVersion) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::invalid_prop(Property::FreebsdVersion.key(), value)),
        }
    }

    /// Whether every descriptor property is equal, or absent on both sides.
    pub fn same_lineage(&self, other: &Properties) -> bool {
        Property::DESCRIPTORS
            .into_iter()
            .all(|prop| self.get(prop) == other.get(prop))
    }
}

impl FromIterator<(Property, String)> for Properties {
    fn from_iter<I: IntoIterator<Item = (Property, String)>>(iter: I) -> Self {
        Properties {
            values: iter
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .collect(),
        }
    }
}
