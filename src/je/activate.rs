// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::props::{self, Property};
use super::{Backend, DatasetName, Engine, Error};

/// What [`Engine::swap_in`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Activation {
    /// The jail had no active environment.
    First,
    /// The environment was already active; nothing changed.
    AlreadyActive,
    /// `previous` was unmounted and its child datasets moved over.
    Swapped { previous: DatasetName },
}

impl<B: Backend> Engine<B> {
    /// Make `candidate` the active environment of `jail`.
    ///
    /// Writing `je:active` is the last step: if unmounting or relocating
    /// fails, the jail still points at its previous environment.
    pub fn swap_in(&self, jail: &DatasetName, candidate: &DatasetName) -> Result<Activation, Error> {
        let Some(current) = self.active_environment(jail)? else {
            props::set(&self.backend, jail, Property::Active, candidate.as_str())?;
            tracing::info!(jail = %jail, active = %candidate, "activated");
            return Ok(Activation::First);
        };
        if &current == candidate {
            tracing::debug!(jail = %jail, active = %candidate, "already active");
            return Ok(Activation::AlreadyActive);
        }

        self.unmount_environment(&current, false)?;
        self.unmount_environment(candidate, false)?;
        self.relocate_children(&current, candidate)?;

        props::set(&self.backend, jail, Property::Active, candidate.as_str())?;
        tracing::info!(jail = %jail, previous = %current, active = %candidate, "activated");
        Ok(Activation::Swapped { previous: current })
    }

    /// Activate environment `env_name` for jail `jail_name`. An environment
    /// not yet in the jail is taken from the pool.
    pub fn activate(&self, jail_name: &str, env_name: &str) -> Result<Activation, Error> {
        let jail = self.jail(jail_name)?;
        let in_jail = jail.append(env_name)?;

        let candidate = if self.backend.exists(&in_jail)? {
            in_jail
        } else {
            let in_pool = self.layout.pool_path(env_name)?;
            if !self.backend.exists(&in_pool)? {
                return Err(Error::not_found(env_name));
            }
            self.materialize(&in_pool, &jail)?
        };
        self.swap_in(&jail, &candidate)
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

    fn active(engine: &Engine<EmulatorBackend>) -> Option<String> {
        props::get(engine.backend(), &name("zroot/JAIL/www"), Property::Active).unwrap()
    }

    #[test]
    fn test_activate_already_active() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().mount_at(&name("zroot/JAIL/www/14.0"), "/jails/www");

        let activation = engine.activate("www", "14.0").unwrap();
        assert_eq!(activation, Activation::AlreadyActive);
        assert!(engine.backend().calls().is_empty());
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.0"));
        assert!(engine.backend().mounted(&name("zroot/JAIL/www/14.0")).unwrap().is_some());
    }

    #[test]
    fn test_activate_first() {
        let backend = EmulatorBackend::sampled();
        backend.add_filesystem("zroot/JAIL/db", &[]);
        let engine = Engine::new(backend, Layout::default());

        let activation = engine.activate("db", "14.1").unwrap();
        assert_eq!(activation, Activation::First);
        assert_eq!(
            props::get(engine.backend(), &name("zroot/JAIL/db"), Property::Active)
                .unwrap()
                .as_deref(),
            Some("zroot/JAIL/db/14.1")
        );
        assert!(engine.backend().exists(&name("zroot/JAIL/db/14.1")).unwrap());
    }

    #[test]
    fn test_activate_swaps_from_pool() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().mount_at(&name("zroot/JAIL/www/14.0"), "/jails/www");

        let activation = engine.activate("www", "14.1").unwrap();
        assert_eq!(
            activation,
            Activation::Swapped {
                previous: name("zroot/JAIL/www/14.0")
            }
        );
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.1"));

        let backend = engine.backend();
        assert_eq!(backend.mounted(&name("zroot/JAIL/www/14.0")).unwrap(), None);
        assert!(backend.exists(&name("zroot/JAIL/www/14.1/home")).unwrap());
        assert!(backend.exists(&name("zroot/JAIL/www/14.1/var")).unwrap());
        assert!(!backend.exists(&name("zroot/JAIL/www/14.0/home")).unwrap());
        // The previous environment stays in the jail for rolling back.
        assert!(backend.exists(&name("zroot/JAIL/www/14.0")).unwrap());

        // The pointer moves last.
        let calls = backend.calls();
        assert!(matches!(
            calls.last(),
            Some(Call::SetProperties { name, .. }) if name == "zroot/JAIL/www"
        ));
    }

    #[test]
    fn test_activate_prefers_jail_copy() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.activate("www", "14.1").unwrap();
        engine.backend().clear_calls();

        // Back to 14.0, which is already in the jail: no new clone.
        engine.activate("www", "14.0").unwrap();
        assert!(
            !engine
                .backend()
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Clone { .. } | Call::Snapshot(_)))
        );
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.0"));
        assert!(engine.backend().exists(&name("zroot/JAIL/www/14.0/var")).unwrap());
    }

    #[test]
    fn test_activate_not_found() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        assert!(matches!(
            engine.activate("www", "15.0"),
            Err(Error::NotFound { name }) if name == "15.0"
        ));
        assert!(matches!(
            engine.activate("nope", "14.1"),
            Err(Error::NotFound { name }) if name == "nope"
        ));
        assert!(matches!(engine.activate("www", "a/b"), Err(Error::InvalidName { .. })));
    }

    #[test]
    fn test_partial_relocation_keeps_pointer() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        engine.backend().fail_renames_of(&name("zroot/JAIL/www/14.0/var"));

        let result = engine.activate("www", "14.1");
        assert!(matches!(result, Err(Error::RelocationPartial { .. })));
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.0"));
    }

    #[test]
    fn test_busy_unmount_aborts_swap() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let current = name("zroot/JAIL/www/14.0");
        engine.backend().mount_at(&current, "/jails/www");
        engine.backend().set_busy(&current, true);

        let result = engine.activate("www", "14.1");
        assert!(matches!(result, Err(Error::UnmountFailed { .. })));
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.0"));
        assert!(engine.backend().exists(&name("zroot/JAIL/www/14.0/var")).unwrap());
        assert!(
            !engine
                .backend()
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Rename { .. }))
        );
    }

    #[test]
    fn test_mounted_candidate_is_unmounted() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let candidate = engine
            .materialize(&name("zroot/JE/14.1"), &name("zroot/JAIL/www"))
            .unwrap();
        engine.backend().mount_at(&candidate, "/mnt/14.1");

        let activation = engine.activate("www", "14.1").unwrap();
        assert_eq!(
            activation,
            Activation::Swapped {
                previous: name("zroot/JAIL/www/14.0")
            }
        );
        assert_eq!(engine.backend().mounted(&candidate).unwrap(), None);
        assert!(
            engine
                .backend()
                .calls()
                .contains(&Call::Unmount("zroot/JAIL/www/14.1".to_string()))
        );
    }

    #[test]
    fn test_busy_candidate_aborts_swap() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let candidate = engine
            .materialize(&name("zroot/JE/14.1"), &name("zroot/JAIL/www"))
            .unwrap();
        engine.backend().mount_at(&candidate, "/mnt/14.1");
        engine.backend().set_busy(&candidate, true);

        let result = engine.activate("www", "14.1");
        assert!(matches!(
            result,
            Err(Error::UnmountFailed { name, .. }) if name == "zroot/JAIL/www/14.1"
        ));
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.0"));
        assert!(engine.backend().mounted(&candidate).unwrap().is_some());
        assert!(
            !engine
                .backend()
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Rename { .. }))
        );
    }

    #[test]
    fn test_dangling_pointer_counts_as_first() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        let jail = name("zroot/JAIL/www");
        engine
            .backend()
            .set_user_property(&jail, "je:active", "zroot/JAIL/www/destroyed");

        let activation = engine.swap_in(&jail, &name("zroot/JAIL/www/14.0")).unwrap();
        assert_eq!(activation, Activation::First);
        assert_eq!(active(&engine).as_deref(), Some("zroot/JAIL/www/14.0"));
    }
}
