// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Read;

use super::activate::Activation;
use super::props::{self, Property};
use super::{Backend, DatasetName, Engine, Error};

/// Prefix of the dataset a stream is received into before it is inspected.
const TEMPORARY_PREFIX: &str = "jectl.";

/// What [`Engine::import`] created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Imported {
    /// A new jail, with the environment its stream asked for activated.
    Jail {
        dataset: DatasetName,
        activation: Activation,
    },
    /// A new environment in the pool.
    Environment { dataset: DatasetName },
}

impl<B: Backend> Engine<B> {
    /// Receive a replication stream as a new jail or pool environment named
    /// `name`.
    ///
    /// A stream whose top-level dataset carries `je:poudriere:create`
    /// becomes a jail, and the environment named by that property is
    /// activated in it. Anything else becomes an environment in the pool.
    pub fn import(&self, name: &str, stream: &mut dyn Read) -> Result<Imported, Error> {
        let jail_target = self.layout.jail_path(name)?;
        let pool_target = self.layout.pool_path(name)?;

        let temporary = self.temporary_dataset()?;
        self.backend.receive(&temporary, stream)?;
        tracing::info!(dataset = %temporary, "received replication stream");

        let marker = match props::get(&self.backend, &temporary, Property::Create) {
            Ok(marker) => marker,
            Err(err) => {
                self.discard(&temporary);
                return Err(err);
            }
        };
        let target = if marker.is_some() {
            jail_target
        } else {
            pool_target
        };

        match self.backend.exists(&target) {
            Ok(false) => {}
            Ok(true) => {
                self.discard(&temporary);
                return Err(Error::already_exists(target.as_str()));
            }
            Err(err) => {
                self.discard(&temporary);
                return Err(err);
            }
        }
        if let Err(err) = self.backend.rename(&temporary, &target) {
            self.discard(&temporary);
            return Err(err);
        }
        tracing::info!(dataset = %target, "imported");

        match marker {
            Some(environment) => {
                self.set_import_properties(&target, &[
                    ("canmount", "off"),
                    ("mountpoint", "none"),
                    (Property::Create.key(), ""),
                ])?;
                let activation = self.activate(name, &environment)?;
                Ok(Imported::Jail {
                    dataset: target,
                    activation,
                })
            }
            None => {
                self.set_import_properties(&target, &[("canmount", "noauto"), ("mountpoint", "none")])?;
                Ok(Imported::Environment { dataset: target })
            }
        }
    }

    /// Pick an unused `<jail-root>/jectl.XXXXXX` name.
    fn temporary_dataset(&self) -> Result<DatasetName, Error> {
        const ATTEMPTS: usize = 8;
        for _ in 0..ATTEMPTS {
            let candidate = self
                .layout
                .jail_root
                .append(&format!("{}{}", TEMPORARY_PREFIX, random_suffix()?))?;
            if !self.backend.exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(Error::backend("cannot pick a temporary dataset name"))
    }

    /// Destroy a received dataset that will not be kept.
    fn discard(&self, dataset: &DatasetName) {
        match self.backend.destroy(dataset, true) {
            Ok(()) => tracing::debug!(dataset = %dataset, "discarded"),
            Err(err) => tracing::warn!(dataset = %dataset, error = %err, "failed to discard"),
        }
    }

    fn set_import_properties(
        &self,
        dataset: &DatasetName,
        properties: &[(&str, &str)],
    ) -> Result<(), Error> {
        self.backend
            .set_properties(dataset, properties)
            .map_err(|err| Error::PropertyWriteFailed {
                name: dataset.to_string(),
                property: properties
                    .iter()
                    .map(|(key, _)| *key)
                    .collect::<Vec<_>>()
                    .join(","),
                source: Box::new(err),
            })
    }
}

/// Six random alphanumeric characters, as mktemp(3) would use.
fn random_suffix() -> Result<String, Error> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut bytes = [0u8; 6];
    getrandom::fill(&mut bytes)
        .map_err(|err| Error::backend(format!("cannot generate a temporary name: {}", err)))?;
    Ok(bytes
        .iter()
        .map(|byte| ALPHABET[*byte as usize % ALPHABET.len()] as char)
        .collect())
}
