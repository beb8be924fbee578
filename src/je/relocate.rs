// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{Backend, DatasetName, Engine, Error};

impl<B: Backend> Engine<B> {
    /// Move every immediate child filesystem of `source` beneath
    /// `destination`, keeping its name. Nested datasets travel with their
    /// parent.
    ///
    /// Every child is attempted. If any rename fails, the children already
    /// moved stay where they are and [`Error::RelocationPartial`] lists both
    /// sets.
    pub fn relocate_children(
        &self,
        source: &DatasetName,
        destination: &DatasetName,
    ) -> Result<Vec<DatasetName>, Error> {
        let mut moved = Vec::new();
        let mut failed = Vec::new();

        for child in self.backend.children(source)? {
            let leaf = child.basename().to_string();
            let target = destination.append(&leaf)?;
            match self.backend.rename(&child, &target) {
                Ok(()) => {
                    tracing::info!(from = %child, to = %target, "relocated");
                    moved.push(target);
                }
                Err(err) => {
                    tracing::warn!(dataset = %child, error = %err, "failed to relocate");
                    failed.push(leaf);
                }
            }
        }

        if !failed.is_empty() {
            return Err(Error::RelocationPartial {
                from: source.to_string(),
                to: destination.to_string(),
                moved: moved.iter().map(|ds| ds.basename().to_string()).collect(),
                failed,
            });
        }
        Ok(moved)
    }
}
