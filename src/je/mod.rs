// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error as ThisError;

pub mod activate;
pub mod copy;
pub mod import;
pub mod mock;
pub mod mount;
pub mod path;
pub mod props;
pub mod relocate;
pub mod report;
pub mod update;
pub mod validation;
#[cfg(feature = "libzfs")]
pub mod zfs;

pub use activate::Activation;
pub use import::Imported;
pub use mount::Mounted;
pub use path::{DatasetName, Layout};
pub use props::{Properties, Property};
pub use update::Update;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("'{name}' not found")]
    NotFound { name: String },

    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid property '{name}={value}'")]
    InvalidProp { name: String, value: String },

    #[error("Jail '{jail}' has no active jail environment")]
    NoActiveEnvironment { jail: String },

    #[error("Cannot snapshot '{name}'")]
    SnapshotFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Cannot clone '{snapshot}' to '{target}'")]
    CloneFailed {
        snapshot: String,
        target: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Cannot open '{name}'")]
    OpenFailed { name: String },

    #[error(
        "Moved {} of {} child datasets from '{from}' to '{to}'; not moved: {}",
        .moved.len(),
        .moved.len() + .failed.len(),
        .failed.join(", ")
    )]
    RelocationPartial {
        from: String,
        to: String,
        moved: Vec<String>,
        failed: Vec<String>,
    },

    #[error("Cannot unmount '{name}'")]
    UnmountFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Cannot mount '{name}' at '{mountpoint}'")]
    MountFailed {
        name: String,
        mountpoint: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Cannot set property '{property}' on '{name}'")]
    PropertyWriteFailed {
        name: String,
        property: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Cannot receive replication stream into '{name}': {reason}")]
    ReceiveFailed { name: String, reason: String },

    #[error("Dataset '{name}' is busy")]
    Busy { name: String },

    #[error("{message}")]
    Backend { message: String },

    #[cfg(feature = "libzfs")]
    #[error(transparent)]
    LibzfsError(#[from] zfs::LibzfsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(name: &str) -> Self {
        Error::NotFound {
            name: name.to_string(),
        }
    }

    pub fn already_exists(name: &str) -> Self {
        Error::AlreadyExists {
            name: name.to_string(),
        }
    }

    pub fn invalid_prop(name: &str, value: &str) -> Self {
        Error::InvalidProp {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn no_active(jail: &DatasetName) -> Self {
        Error::NoActiveEnvironment {
            jail: jail.basename().to_string(),
        }
    }

    pub fn busy(name: &DatasetName) -> Self {
        Error::Busy {
            name: name.to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Error::Backend {
            message: message.into(),
        }
    }
}

/// Dataset names collected when the iterating call was made. Iterating
/// again means calling again.
pub type Datasets = std::vec::IntoIter<DatasetName>;

/// The storage primitives the engine is built on. Every call is a fresh,
/// blocking request; implementations keep no state between calls that the
/// engine relies on.
pub trait Backend {
    fn exists(&self, name: &DatasetName) -> Result<bool, Error>;

    /// Create a filesystem with the given native or user properties.
    fn create(&self, name: &DatasetName, properties: &[(&str, &str)]) -> Result<(), Error>;

    /// Take a (non-recursive) snapshot; `snapshot` is `fs@label`.
    fn snapshot(&self, snapshot: &DatasetName) -> Result<(), Error>;

    fn clone_snapshot(&self, snapshot: &DatasetName, target: &DatasetName) -> Result<(), Error>;

    /// Rename a filesystem along with everything beneath it.
    fn rename(&self, name: &DatasetName, new_name: &DatasetName) -> Result<(), Error>;

    fn destroy(&self, name: &DatasetName, recursive: bool) -> Result<(), Error>;

    /// Raw user properties set on or received by the dataset; inherited
    /// values are left out. Values may be empty strings.
    fn user_properties(&self, name: &DatasetName) -> Result<Vec<(String, String)>, Error>;

    /// A raw user property. An empty string is returned as-is.
    fn user_property(&self, name: &DatasetName, key: &str) -> Result<Option<String>, Error>;

    /// Set several properties in one request.
    fn set_properties(&self, name: &DatasetName, properties: &[(&str, &str)])
    -> Result<(), Error>;

    /// Immediate child filesystems.
    fn children(&self, name: &DatasetName) -> Result<Datasets, Error>;

    /// Every filesystem beneath `name` at any depth, parents first.
    fn descendants(&self, name: &DatasetName) -> Result<Datasets, Error>;

    /// Where the dataset would be mounted, or `None` if it cannot be
    /// mounted (`canmount=off`, `mountpoint=none` or `legacy`).
    fn mountpoint(&self, name: &DatasetName) -> Result<Option<PathBuf>, Error>;

    /// Where the dataset is currently mounted, if it is.
    fn mounted(&self, name: &DatasetName) -> Result<Option<PathBuf>, Error>;

    /// Mount a single dataset at its mountpoint.
    fn mount(&self, name: &DatasetName) -> Result<(), Error>;

    /// Unmount a dataset and everything mounted beneath it.
    fn unmount_all(&self, name: &DatasetName, force: bool) -> Result<(), Error>;

    /// Receive a replication stream into a new dataset without mounting it.
    fn receive(&self, name: &DatasetName, stream: &mut dyn Read) -> Result<(), Error>;

    /// Write the backend's native listing of the given dataset trees.
    fn list(&self, roots: &[DatasetName], out: &mut dyn Write) -> Result<(), Error>;
}

/// Jail environment administration on top of a storage backend.
pub struct Engine<B: Backend> {
    backend: B,
    layout: Layout,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, layout: Layout) -> Self {
        Self { backend, layout }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Create the jail root and environment pool if they are missing.
    /// Returns the datasets that were created.
    pub fn init_root(&self) -> Result<Vec<DatasetName>, Error> {
        let mut created = Vec::new();
        for root in [&self.layout.jail_root, &self.layout.pool] {
            if self.backend.exists(root)? {
                continue;
            }
            self.backend
                .create(root, &[("canmount", "off"), ("mountpoint", "none")])?;
            tracing::info!(dataset = %root, "created");
            created.push(root.clone());
        }
        Ok(created)
    }

    /// The dataset of an existing jail.
    pub fn jail(&self, jail_name: &str) -> Result<DatasetName, Error> {
        let jail = self.layout.jail_path(jail_name)?;
        if !self.backend.exists(&jail)? {
            return Err(Error::not_found(jail_name));
        }
        Ok(jail)
    }

    /// The environment the jail's active pointer names. A pointer to a
    /// dataset that no longer exists counts as no active environment.
    pub fn active_environment(&self, jail: &DatasetName) -> Result<Option<DatasetName>, Error> {
        let Some(value) = props::get(&self.backend, jail, Property::Active)? else {
            return Ok(None);
        };
        let active =
            DatasetName::new(&value).map_err(|_| Error::invalid_prop(Property::Active.key(), &value))?;
        if !self.backend.exists(&active)? {
            tracing::warn!(jail = %jail, active = %active, "active jail environment is missing");
            return Ok(None);
        }
        Ok(Some(active))
    }

    /// Like [`Engine::active_environment`], but having one is required.
    pub fn require_active(&self, jail: &DatasetName) -> Result<DatasetName, Error> {
        self.active_environment(jail)?
            .ok_or_else(|| Error::no_active(jail))
    }
}
