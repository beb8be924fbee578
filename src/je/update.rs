// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::props::{self, Properties};
use super::{Backend, DatasetName, Engine, Error};

/// What [`Engine::update`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    /// No newer environment of the same lineage is in the pool.
    UpToDate,
    Updated { from: DatasetName, to: DatasetName },
}

impl<B: Backend> Engine<B> {
    /// Find the pool environment with the highest `__FreeBSD_version` that
    /// belongs to the same lineage as the jail's active environment and is
    /// newer than it.
    pub fn find_upgrade(&self, jail: &DatasetName) -> Result<Option<DatasetName>, Error> {
        let current = self.require_active(jail)?;
        let mut best = current.clone();
        let mut best_props = props::load(&self.backend, &current)?;

        for candidate in self.backend.children(&self.layout.pool)? {
            if candidate == best {
                continue;
            }
            let candidate_props = props::load(&self.backend, &candidate)?;
            if !best_props.same_lineage(&candidate_props) {
                tracing::debug!(candidate = %candidate, "different lineage");
                continue;
            }
            if is_newer(&best, &best_props, &candidate, &candidate_props) {
                best = candidate;
                best_props = candidate_props;
            }
        }

        Ok(if best != current { Some(best) } else { None })
    }

    /// Roll the jail forward to the newest environment of its lineage.
    pub fn update(&self, jail_name: &str) -> Result<Update, Error> {
        let jail = self.jail(jail_name)?;
        let Some(candidate) = self.find_upgrade(&jail)? else {
            tracing::info!(jail = %jail, "no update available");
            return Ok(Update::UpToDate);
        };

        let from = self.require_active(&jail)?;
        let to = self.materialize(&candidate, &jail)?;
        self.swap_in(&jail, &to)?;
        Ok(Update::Updated { from, to })
    }
}

/// Whether `candidate` has a strictly greater version than `best`. Missing
/// or malformed versions are never newer.
fn is_newer(
    best: &DatasetName,
    best_props: &Properties,
    candidate: &DatasetName,
    candidate_props: &Properties,
) -> bool {
    let best_version = match best_props.freebsd_version() {
        Ok(Some(version)) => version,
        Ok(None) => return false,
        Err(err) => {
            tracing::warn!(dataset = %best, error = %err, "ignoring malformed version");
            return false;
        }
    };
    match candidate_props.freebsd_version() {
        Ok(Some(version)) => version > best_version,
        Ok(None) => false,
        Err(err) => {
            tracing::warn!(dataset = %candidate, error = %err, "skipping candidate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::je::mock::{Call, EmulatorBackend};
    use crate::je::{Layout, Property};

    fn name(s: &str) -> DatasetName {
        DatasetName::new(s).unwrap()
    }

    /// A jail `j` running `A` (jailname `p`, version 12) plus the given pool
    /// environments.
    fn engine_with(pool: &[(&str, &str, &str)]) -> Engine<EmulatorBackend> {
        let backend = EmulatorBackend::new();
        backend.add_filesystem("zroot", &[]);
        backend.add_filesystem("zroot/JAIL", &[]);
        backend.add_filesystem("zroot/JE", &[]);
        backend.add_filesystem("zroot/JAIL/j", &[("je:active", "zroot/JAIL/j/A")]);
        backend.add_filesystem(
            "zroot/JAIL/j/A",
            &[
                ("je:poudriere:jailname", "p"),
                ("je:poudriere:freebsd_version", "12"),
            ],
        );
        for (je, jailname, version) in pool {
            backend.add_filesystem(
                &format!("zroot/JE/{}", je),
                &[
                    ("je:poudriere:jailname", jailname),
                    ("je:poudriere:freebsd_version", version),
                ],
            );
        }
        Engine::new(backend, Layout::default())
    }

    #[test]
    fn test_lineage_gates_upgrade() {
        let engine = engine_with(&[("B", "p", "13"), ("C", "q", "99")]);
        assert_eq!(
            engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(),
            Some(name("zroot/JE/B"))
        );
    }

    #[test]
    fn test_highest_version_wins() {
        let engine = engine_with(&[("B", "p", "15"), ("C", "p", "13"), ("D", "p", "14")]);
        assert_eq!(
            engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(),
            Some(name("zroot/JE/B"))
        );
    }

    #[test]
    fn test_equal_version_is_not_newer() {
        let engine = engine_with(&[("B", "p", "12")]);
        assert_eq!(engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(), None);
    }

    #[test]
    fn test_up_to_date() {
        let engine = engine_with(&[("B", "p", "11"), ("C", "q", "99")]);
        assert_eq!(engine.update("j").unwrap(), Update::UpToDate);
        assert!(engine.backend().calls().is_empty());
        assert_eq!(
            props::get(engine.backend(), &name("zroot/JAIL/j"), Property::Active)
                .unwrap()
                .as_deref(),
            Some("zroot/JAIL/j/A")
        );
    }

    #[test]
    fn test_malformed_candidate_is_skipped() {
        let engine = engine_with(&[("B", "p", "13.0"), ("C", "p", "13")]);
        assert_eq!(
            engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(),
            Some(name("zroot/JE/C"))
        );
    }

    #[test]
    fn test_missing_version_never_upgrades() {
        let engine = engine_with(&[("B", "p", "")]);
        assert_eq!(engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(), None);

        let engine = engine_with(&[("B", "p", "13")]);
        engine
            .backend()
            .set_user_property(&name("zroot/JAIL/j/A"), "je:poudriere:freebsd_version", "");
        assert_eq!(engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(), None);
    }

    #[test]
    fn test_descriptor_absent_on_one_side() {
        let engine = engine_with(&[("B", "p", "13")]);
        engine
            .backend()
            .set_user_property(&name("zroot/JE/B"), "je:poudriere:overlaydir", "/overlay");
        assert_eq!(engine.find_upgrade(&name("zroot/JAIL/j")).unwrap(), None);
    }

    #[test]
    fn test_no_active_environment() {
        let engine = engine_with(&[("B", "p", "13")]);
        engine.backend().add_filesystem("zroot/JAIL/empty", &[]);
        assert!(matches!(
            engine.update("empty"),
            Err(Error::NoActiveEnvironment { jail }) if jail == "empty"
        ));
    }

    #[test]
    fn test_update_activates_candidate() {
        let engine = engine_with(&[("B", "p", "13"), ("C", "p", "15")]);
        engine.backend().add_filesystem("zroot/JAIL/j/A/home", &[]);

        let result = engine.update("j").unwrap();
        assert_eq!(
            result,
            Update::Updated {
                from: name("zroot/JAIL/j/A"),
                to: name("zroot/JAIL/j/C"),
            }
        );
        let backend = engine.backend();
        assert_eq!(
            props::get(backend, &name("zroot/JAIL/j"), Property::Active)
                .unwrap()
                .as_deref(),
            Some("zroot/JAIL/j/C")
        );
        assert!(backend.exists(&name("zroot/JAIL/j/C/home")).unwrap());
        assert!(
            backend
                .calls()
                .contains(&Call::Snapshot("zroot/JE/C@jectl".to_string()))
        );
    }

    #[test]
    fn test_sampled_jail_updates_to_newest_release() {
        let engine = Engine::new(EmulatorBackend::sampled(), Layout::default());
        assert_eq!(
            engine.find_upgrade(&name("zroot/JAIL/www")).unwrap(),
            Some(name("zroot/JE/14.1"))
        );
    }
}
