// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{Backend, DatasetName, Engine, Error};

/// The snapshot every clone of an environment is taken from.
pub const SNAPSHOT_LABEL: &str = "jectl";

impl<B: Backend> Engine<B> {
    /// Make a copy-on-write clone of `source` named `namespace/<basename>`,
    /// carrying over its user properties. An existing dataset of that name
    /// is returned as-is.
    pub fn materialize(
        &self,
        source: &DatasetName,
        namespace: &DatasetName,
    ) -> Result<DatasetName, Error> {
        let dest = namespace.append(source.basename())?;
        if self.backend.exists(&dest)? {
            tracing::debug!(dataset = %dest, "already materialized");
            return Ok(dest);
        }

        let snapshot = source.snapshot(SNAPSHOT_LABEL)?;
        if !self.backend.exists(&snapshot)? {
            self.backend
                .snapshot(&snapshot)
                .map_err(|err| Error::SnapshotFailed {
                    name: snapshot.to_string(),
                    source: Box::new(err),
                })?;
            tracing::info!(snapshot = %snapshot, "created snapshot");
        }

        self.backend
            .clone_snapshot(&snapshot, &dest)
            .map_err(|err| Error::CloneFailed {
                snapshot: snapshot.to_string(),
                target: dest.to_string(),
                source: Box::new(err),
            })?;
        tracing::info!(origin = %snapshot, dataset = %dest, "created clone");

        if let Err(err) = self.copy_properties(source, &dest) {
            if let Err(cleanup) = self.backend.destroy(&dest, true) {
                tracing::warn!(dataset = %dest, error = %cleanup, "failed to destroy partial clone");
            }
            return Err(err);
        }
        Ok(dest)
    }

    /// Copy every user property of `source` onto `dest` and make `dest`
    /// mount only on request, in one property write.
    fn copy_properties(&self, source: &DatasetName, dest: &DatasetName) -> Result<(), Error> {
        if !self.backend.exists(dest)? {
            return Err(Error::OpenFailed {
                name: dest.to_string(),
            });
        }
        let user_props = self.backend.user_properties(source)?;
        let mut properties: Vec<(&str, &str)> = user_props
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        properties.push(("canmount", "noauto"));

        self.backend
            .set_properties(dest, &properties)
            .map_err(|err| Error::PropertyWriteFailed {
                name: dest.to_string(),
                property: "canmount".to_string(),
                source: Box::new(err),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::je::mock::{Call, EmulatorBackend};
    use crate::je::{Layout, props, Property};

    fn name(s: &str) -> DatasetName {
        DatasetName::new(s).unwrap()
    }

    #[test]
    fn test_materialize_clones_from_pool() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let source = name("zroot/JE/14.1");
        let jail = name("zroot/JAIL/www");

        let dest = engine.materialize(&source, &jail).unwrap();
        assert_eq!(dest, name("zroot/JAIL/www/14.1"));
        assert_eq!(
            engine.backend().calls()[..2],
            [
                Call::Snapshot("zroot/JE/14.1@jectl".to_string()),
                Call::Clone {
                    snapshot: "zroot/JE/14.1@jectl".to_string(),
                    target: "zroot/JAIL/www/14.1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let source = name("zroot/JE/14.1");
        let jail = name("zroot/JAIL/www");

        let first = engine.materialize(&source, &jail).unwrap();
        engine.backend().clear_calls();
        let second = engine.materialize(&source, &jail).unwrap();

        assert_eq!(first, second);
        assert!(engine.backend().calls().is_empty());
    }

    #[test]
    fn test_materialize_reuses_snapshot() {
        // 14.0 already has a jectl snapshot in the sample.
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().add_filesystem("zroot/JAIL/db", &[]);

        engine
            .materialize(&name("zroot/JE/14.0"), &name("zroot/JAIL/db"))
            .unwrap();
        assert!(
            !engine
                .backend()
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Snapshot(_)))
        );
    }

    #[test]
    fn test_materialize_copies_properties() {
        let backend = EmulatorBackend::sampled();
        let source = name("zroot/JE/14.1");
        backend.set_user_property(&source, "je:poudriere:overlaydir", "/overlay");
        backend.set_user_property(&source, "org.example:note", "kept too");
        let engine = Engine::new(backend, Layout::default());

        let dest = engine.materialize(&source, &name("zroot/JAIL/www")).unwrap();

        let backend = engine.backend();
        assert_eq!(
            backend.user_properties(&dest).unwrap(),
            backend.user_properties(&source).unwrap()
        );
        assert_eq!(
            props::load(backend, &dest).unwrap(),
            props::load(backend, &source).unwrap()
        );
        assert_eq!(
            props::get(backend, &dest, Property::FreebsdVersion).unwrap().as_deref(),
            Some("1401000")
        );
        // Pool environments are canmount=noauto too; make sure it is set on
        // the clone itself regardless.
        assert_eq!(backend.native_property(&dest, "canmount").as_deref(), Some("noauto"));
    }

    #[test]
    fn test_materialize_sets_noauto_on_mountable_source() {
        let backend = EmulatorBackend::sampled();
        backend.add_filesystem("zroot/JE/custom", &[("canmount", "on")]);
        let engine = Engine::new(backend, Layout::default());

        let dest = engine
            .materialize(&name("zroot/JE/custom"), &name("zroot/JAIL/www"))
            .unwrap();
        assert_eq!(
            engine.backend().native_property(&dest, "canmount").as_deref(),
            Some("noauto")
        );
    }

    #[test]
    fn test_materialize_missing_source() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let result = engine.materialize(&name("zroot/JE/nope"), &name("zroot/JAIL/www"));
        assert!(matches!(result, Err(Error::SnapshotFailed { .. })));
        assert!(!engine.backend().exists(&name("zroot/JAIL/www/nope")).unwrap());
    }

    #[test]
    fn test_materialize_removes_clone_on_property_failure() {
        let backend = EmulatorBackend::sampled();
        backend.fail_property_writes(&name("zroot/JAIL/www/14.1"));
        let engine = Engine::new(backend, Layout::default());

        let result = engine.materialize(&name("zroot/JE/14.1"), &name("zroot/JAIL/www"));
        assert!(matches!(result, Err(Error::PropertyWriteFailed { .. })));
        assert!(!engine.backend().exists(&name("zroot/JAIL/www/14.1")).unwrap());
    }
}
