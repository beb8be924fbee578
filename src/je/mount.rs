// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use super::{Backend, DatasetName, Engine, Error};

/// What [`Engine::mount`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mounted {
    /// The environment was already mounted; only its mountpoint property
    /// was updated.
    Already { environment: DatasetName },
    /// The datasets that were mounted, in mount order.
    Mounted { datasets: Vec<(DatasetName, PathBuf)> },
}

impl<B: Backend> Engine<B> {
    /// Mount the jail's active environment and its dependent datasets at
    /// `mountpoint`.
    pub fn mount(&self, jail_name: &str, mountpoint: &str) -> Result<Mounted, Error> {
        let jail = self.jail(jail_name)?;
        let environment = self.require_active(&jail)?;

        self.backend
            .set_properties(&environment, &[("mountpoint", mountpoint)])
            .map_err(|err| Error::PropertyWriteFailed {
                name: environment.to_string(),
                property: "mountpoint".to_string(),
                source: Box::new(err),
            })?;
        if self.backend.mounted(&environment)?.is_some() {
            tracing::debug!(dataset = %environment, "already mounted");
            return Ok(Mounted::Already { environment });
        }

        // Parents sort before their children by mountpoint path.
        let mut members = Vec::new();
        let tree = std::iter::once(environment.clone()).chain(self.backend.descendants(&environment)?);
        for dataset in tree {
            match self.backend.mountpoint(&dataset)? {
                Some(path) => members.push((dataset, path)),
                None => tracing::debug!(dataset = %dataset, "not mountable"),
            }
        }
        members.sort_by(|a, b| a.1.cmp(&b.1));

        let mut mounted = Vec::new();
        for (dataset, path) in members {
            if self.backend.mounted(&dataset)?.is_some() {
                continue;
            }
            self.backend
                .mount(&dataset)
                .map_err(|err| Error::MountFailed {
                    name: dataset.to_string(),
                    mountpoint: path.display().to_string(),
                    source: Box::new(err),
                })?;
            tracing::info!(dataset = %dataset, mountpoint = %path.display(), "mounted");
            mounted.push((dataset, path));
        }
        Ok(Mounted::Mounted { datasets: mounted })
    }

    /// Unmount the jail's active environment. Returns whether anything was
    /// mounted.
    pub fn unmount(&self, jail_name: &str, force: bool) -> Result<bool, Error> {
        let jail = self.jail(jail_name)?;
        let environment = self.require_active(&jail)?;
        self.unmount_environment(&environment, force)
    }

    /// Unmount an environment along with everything mounted beneath it.
    /// Returns `false` if it was not mounted.
    pub fn unmount_environment(&self, environment: &DatasetName, force: bool) -> Result<bool, Error> {
        if self.backend.mounted(environment)?.is_none() {
            return Ok(false);
        }
        self.backend
            .unmount_all(environment, force)
            .map_err(|err| Error::UnmountFailed {
                name: environment.to_string(),
                source: Box::new(err),
            })?;
        tracing::info!(dataset = %environment, force, "unmounted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::je::Layout;
    use crate::je::mock::{Call, EmulatorBackend};

    fn name(s: &str) -> DatasetName {
        DatasetName::new(s).unwrap()
    }

    #[test]
    fn test_mount_orders_by_mountpoint() {
        let backend = EmulatorBackend::sampled();
        // A dataset mounted outside the jail sorts first.
        backend.add_filesystem("zroot/JAIL/www/14.0/var/db", &[]);
        backend.add_filesystem("zroot/JAIL/www/14.0/data", &[("mountpoint", "/data/www")]);
        backend.add_filesystem("zroot/JAIL/www/14.0/swap", &[("canmount", "off")]);
        let engine = Engine::new(backend, Layout::default());

        let Mounted::Mounted { datasets } = engine.mount("www", "/jails/www").unwrap() else {
            panic!("Expected Mounted");
        };
        let order: Vec<(&str, PathBuf)> = datasets
            .iter()
            .map(|(ds, path)| (ds.as_str(), path.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("zroot/JAIL/www/14.0/data", PathBuf::from("/data/www")),
                ("zroot/JAIL/www/14.0", PathBuf::from("/jails/www")),
                ("zroot/JAIL/www/14.0/home", PathBuf::from("/jails/www/home")),
                ("zroot/JAIL/www/14.0/var", PathBuf::from("/jails/www/var")),
                ("zroot/JAIL/www/14.0/var/db", PathBuf::from("/jails/www/var/db")),
            ]
        );
        assert_eq!(
            engine.backend().native_property(&name("zroot/JAIL/www/14.0"), "mountpoint").as_deref(),
            Some("/jails/www")
        );
    }

    #[test]
    fn test_mount_when_already_mounted() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.mount("www", "/jails/www").unwrap();
        engine.backend().clear_calls();

        let result = engine.mount("www", "/jails/www").unwrap();
        assert_eq!(
            result,
            Mounted::Already {
                environment: name("zroot/JAIL/www/14.0")
            }
        );
        assert!(
            !engine
                .backend()
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Mount(_)))
        );
    }

    #[test]
    fn test_mount_skips_mounted_members() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().mount_at(&name("zroot/JAIL/www/14.0/var"), "/elsewhere");

        let Mounted::Mounted { datasets } = engine.mount("www", "/jails/www").unwrap() else {
            panic!("Expected Mounted");
        };
        let names: Vec<&str> = datasets.iter().map(|(ds, _)| ds.as_str()).collect();
        assert_eq!(names, vec!["zroot/JAIL/www/14.0", "zroot/JAIL/www/14.0/home"]);
    }

    #[test]
    fn test_mount_failure() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().fail_mounts_of(&name("zroot/JAIL/www/14.0/var"));

        let result = engine.mount("www", "/jails/www");
        assert!(matches!(
            result,
            Err(Error::MountFailed { name, mountpoint, .. })
                if name == "zroot/JAIL/www/14.0/var" && mountpoint == "/jails/www/var"
        ));
        // Members mounted before the failure stay mounted.
        assert!(engine.backend().mounted(&name("zroot/JAIL/www/14.0/home")).unwrap().is_some());
    }

    #[test]
    fn test_mount_without_active_environment() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().add_filesystem("zroot/JAIL/db", &[]);
        assert!(matches!(
            engine.mount("db", "/jails/db"),
            Err(Error::NoActiveEnvironment { .. })
        ));
        assert!(matches!(engine.unmount("db", false), Err(Error::NoActiveEnvironment { .. })));
    }

    #[test]
    fn test_unmount() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        assert!(!engine.unmount("www", false).unwrap());

        engine.mount("www", "/jails/www").unwrap();
        assert!(engine.unmount("www", false).unwrap());
        for ds in ["zroot/JAIL/www/14.0", "zroot/JAIL/www/14.0/home", "zroot/JAIL/www/14.0/var"] {
            assert_eq!(engine.backend().mounted(&name(ds)).unwrap(), None);
        }
    }

    #[test]
    fn test_unmount_busy() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.mount("www", "/jails/www").unwrap();
        engine.backend().set_busy(&name("zroot/JAIL/www/14.0/var"), true);

        let result = engine.unmount("www", false);
        match result {
            Err(Error::UnmountFailed { name, source }) => {
                assert_eq!(name, "zroot/JAIL/www/14.0");
                assert!(matches!(*source, Error::Busy { .. }));
            }
            other => panic!("Expected UnmountFailed, got {:?}", other),
        }
        assert!(engine.unmount("www", true).unwrap());
    }
}
