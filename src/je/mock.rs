// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Backend, DatasetName, Datasets, Error};

/// A backend request, as recorded by [`EmulatorBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Snapshot(String),
    Clone { snapshot: String, target: String },
    Rename { from: String, to: String },
    Destroy(String),
    SetProperties { name: String, properties: Vec<(String, String)> },
    Mount(String),
    Unmount(String),
    Receive(String),
}

#[derive(Clone, Debug, Default)]
struct DatasetState {
    /// Locally-set properties, native and user alike. User property names
    /// always contain a ':'.
    properties: BTreeMap<String, String>,
    /// User properties that arrived with a replication stream. A local
    /// value of the same name takes precedence.
    received: BTreeMap<String, String>,
    mounted: Option<PathBuf>,
    busy: bool,
}

#[derive(Default)]
struct State {
    datasets: BTreeMap<String, DatasetState>,
    calls: Vec<Call>,
    failing_renames: BTreeSet<String>,
    failing_writes: BTreeSet<String>,
    failing_mounts: BTreeSet<String>,
    failing_lookups: BTreeSet<String>,
}

/// A storage backend that operates entirely in memory with no side effects.
///
/// Every mutating request is recorded, and lookups, renames, property
/// writes and mounts can be made to fail for chosen datasets.
pub struct EmulatorBackend {
    state: RwLock<State>,
}

impl EmulatorBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// A jail `www` running environment `14.0` (with `home` and `var`
    /// datasets), and a pool holding `13.2`, `14.0` and `14.1`.
    pub fn sampled() -> Self {
        let backend = Self::new();
        backend.add_filesystem("zroot", &[]);
        backend.add_filesystem("zroot/JAIL", &[("canmount", "off"), ("mountpoint", "none")]);
        backend.add_filesystem("zroot/JE", &[("canmount", "off"), ("mountpoint", "none")]);

        let lineage_14 = [
            ("je:poudriere:jailname", "14amd64"),
            ("je:poudriere:packagelist", "/usr/local/etc/poudriere.d/www-pkglist"),
        ];
        for (name, branch, version) in [("14.0", "releng/14.0", "1400097"), ("14.1", "releng/14.1", "1401000")] {
            let mut props = vec![
                ("canmount", "noauto"),
                ("mountpoint", "none"),
                ("je:version", branch),
                ("je:poudriere:freebsd_version", version),
            ];
            props.extend(lineage_14);
            backend.add_filesystem(&format!("zroot/JE/{}", name), &props);
        }
        backend.add_filesystem(
            "zroot/JE/13.2",
            &[
                ("canmount", "noauto"),
                ("mountpoint", "none"),
                ("je:version", "releng/13.2"),
                ("je:poudriere:freebsd_version", "1302001"),
                ("je:poudriere:jailname", "13amd64"),
            ],
        );
        backend.add_filesystem("zroot/JE/14.0@jectl", &[]);

        backend.add_filesystem(
            "zroot/JAIL/www",
            &[("je:active", "zroot/JAIL/www/14.0")],
        );
        let mut active = vec![
            ("canmount", "noauto"),
            ("mountpoint", "none"),
            ("origin", "zroot/JE/14.0@jectl"),
            ("je:version", "releng/14.0"),
            ("je:poudriere:freebsd_version", "1400097"),
        ];
        active.extend(lineage_14);
        backend.add_filesystem("zroot/JAIL/www/14.0", &active);
        backend.add_filesystem("zroot/JAIL/www/14.0/home", &[]);
        backend.add_filesystem("zroot/JAIL/www/14.0/var", &[]);
        backend
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap()
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap()
    }

    /// Add a dataset (or `fs@snapshot`) directly, without recording a call.
    pub fn add_filesystem(&self, name: &str, properties: &[(&str, &str)]) {
        let dataset = DatasetState {
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        self.write().datasets.insert(name.to_string(), dataset);
    }

    pub fn set_user_property(&self, name: &DatasetName, key: &str, value: &str) {
        if let Some(ds) = self.write().datasets.get_mut(name.as_str()) {
            ds.properties.insert(key.to_string(), value.to_string());
        }
    }

    /// A locally-set property, native or user, exactly as stored.
    pub fn native_property(&self, name: &DatasetName, key: &str) -> Option<String> {
        self.read()
            .datasets
            .get(name.as_str())
            .and_then(|ds| ds.properties.get(key).cloned())
    }

    /// A received user property, whether or not a local value overrides it.
    pub fn received_property(&self, name: &DatasetName, key: &str) -> Option<String> {
        self.read()
            .datasets
            .get(name.as_str())
            .and_then(|ds| ds.received.get(key).cloned())
    }

    /// Pretend the dataset is mounted at `path`.
    pub fn mount_at(&self, name: &DatasetName, path: &str) {
        if let Some(ds) = self.write().datasets.get_mut(name.as_str()) {
            ds.mounted = Some(PathBuf::from(path));
        }
    }

    /// Make unmounting the dataset fail unless forced.
    pub fn set_busy(&self, name: &DatasetName, busy: bool) {
        if let Some(ds) = self.write().datasets.get_mut(name.as_str()) {
            ds.busy = busy;
        }
    }

    pub fn fail_renames_of(&self, name: &DatasetName) {
        self.write().failing_renames.insert(name.to_string());
    }

    pub fn fail_property_writes(&self, name: &DatasetName) {
        self.write().failing_writes.insert(name.to_string());
    }

    pub fn fail_mounts_of(&self, name: &DatasetName) {
        self.write().failing_mounts.insert(name.to_string());
    }

    /// Make existence checks of the dataset fail.
    pub fn fail_lookups_of(&self, name: &DatasetName) {
        self.write().failing_lookups.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.read().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.write().calls.clear();
    }

    /// Every dataset and snapshot name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.read().datasets.keys().cloned().collect()
    }
}

impl Default for EmulatorBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `name` lies strictly beneath `ancestor` (children and snapshots).
fn is_beneath(name: &str, ancestor: &str) -> bool {
    name.len() > ancestor.len()
        && name.starts_with(ancestor)
        && matches!(name.as_bytes()[ancestor.len()], b'/' | b'@')
}

impl DatasetState {
    /// Received user properties overlaid with local ones.
    fn user_properties(&self) -> BTreeMap<&str, &str> {
        let local = self.properties.iter().filter(|(key, _)| key.contains(':'));
        self.received
            .iter()
            .chain(local)
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }
}

impl State {
    fn dataset(&self, name: &DatasetName) -> Result<&DatasetState, Error> {
        self.datasets
            .get(name.as_str())
            .ok_or_else(|| Error::not_found(name.as_str()))
    }

    fn require_parent(&self, name: &DatasetName) -> Result<(), Error> {
        match name.parent() {
            Some(parent) if !self.datasets.contains_key(parent.as_str()) => {
                Err(Error::not_found(parent.as_str()))
            }
            _ => Ok(()),
        }
    }

    fn effective_mountpoint(&self, name: &str) -> Option<PathBuf> {
        // Walk up until some dataset sets the mountpoint locally; the
        // components walked past are appended to it.
        let mut current = name;
        let mut suffix: Vec<&str> = Vec::new();
        loop {
            if let Some(value) = self
                .datasets
                .get(current)
                .and_then(|ds| ds.properties.get("mountpoint"))
            {
                if value == "none" || value == "legacy" {
                    return None;
                }
                let mut path = PathBuf::from(value);
                path.extend(suffix.iter().rev());
                return Some(path);
            }
            match current.rfind('/') {
                Some(index) => {
                    suffix.push(&current[index + 1..]);
                    current = &current[..index];
                }
                None => return Some(Path::new("/").join(name)),
            }
        }
    }
}

impl Backend for EmulatorBackend {
    fn exists(&self, name: &DatasetName) -> Result<bool, Error> {
        let state = self.read();
        if state.failing_lookups.contains(name.as_str()) {
            return Err(Error::backend(format!("cannot open '{}': injected failure", name)));
        }
        Ok(state.datasets.contains_key(name.as_str()))
    }

    fn create(&self, name: &DatasetName, properties: &[(&str, &str)]) -> Result<(), Error> {
        let mut state = self.write();
        if state.datasets.contains_key(name.as_str()) {
            return Err(Error::already_exists(name.as_str()));
        }
        state.require_parent(name)?;
        state.datasets.insert(
            name.to_string(),
            DatasetState {
                properties: properties
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
        );
        state.calls.push(Call::Create(name.to_string()));
        Ok(())
    }

    fn snapshot(&self, snapshot: &DatasetName) -> Result<(), Error> {
        let mut state = self.write();
        if !snapshot.is_snapshot() {
            return Err(Error::backend(format!("'{}' is not a snapshot name", snapshot)));
        }
        if state.datasets.contains_key(snapshot.as_str()) {
            return Err(Error::already_exists(snapshot.as_str()));
        }
        state.require_parent(snapshot)?;
        state
            .datasets
            .insert(snapshot.to_string(), DatasetState::default());
        state.calls.push(Call::Snapshot(snapshot.to_string()));
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &DatasetName, target: &DatasetName) -> Result<(), Error> {
        let mut state = self.write();
        state.dataset(snapshot)?;
        if state.datasets.contains_key(target.as_str()) {
            return Err(Error::already_exists(target.as_str()));
        }
        state.require_parent(target)?;
        let mut clone = DatasetState::default();
        clone
            .properties
            .insert("origin".to_string(), snapshot.to_string());
        state.datasets.insert(target.to_string(), clone);
        state.calls.push(Call::Clone {
            snapshot: snapshot.to_string(),
            target: target.to_string(),
        });
        Ok(())
    }

    fn rename(&self, name: &DatasetName, new_name: &DatasetName) -> Result<(), Error> {
        let mut state = self.write();
        if state.failing_renames.contains(name.as_str()) {
            return Err(Error::backend(format!("cannot rename '{}': injected failure", name)));
        }
        state.dataset(name)?;
        if state.datasets.contains_key(new_name.as_str()) {
            return Err(Error::already_exists(new_name.as_str()));
        }
        if new_name.is_descendant_of(name) {
            return Err(Error::backend(format!(
                "cannot rename '{}' beneath itself",
                name
            )));
        }
        state.require_parent(new_name)?;

        let moving: Vec<String> = state
            .datasets
            .keys()
            .filter(|key| key.as_str() == name.as_str() || is_beneath(key, name.as_str()))
            .cloned()
            .collect();
        for old in moving {
            if let Some(ds) = state.datasets.remove(&old) {
                let renamed = format!("{}{}", new_name, &old[name.as_str().len()..]);
                state.datasets.insert(renamed, ds);
            }
        }
        state.calls.push(Call::Rename {
            from: name.to_string(),
            to: new_name.to_string(),
        });
        Ok(())
    }

    fn destroy(&self, name: &DatasetName, recursive: bool) -> Result<(), Error> {
        let mut state = self.write();
        state.dataset(name)?;
        let beneath: Vec<String> = state
            .datasets
            .keys()
            .filter(|key| is_beneath(key, name.as_str()))
            .cloned()
            .collect();
        if !beneath.is_empty() && !recursive {
            return Err(Error::backend(format!(
                "cannot destroy '{}': filesystem has children",
                name
            )));
        }
        for key in beneath {
            state.datasets.remove(&key);
        }
        state.datasets.remove(name.as_str());
        state.calls.push(Call::Destroy(name.to_string()));
        Ok(())
    }

    fn user_properties(&self, name: &DatasetName) -> Result<Vec<(String, String)>, Error> {
        let state = self.read();
        Ok(state
            .dataset(name)?
            .user_properties()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect())
    }

    fn user_property(&self, name: &DatasetName, key: &str) -> Result<Option<String>, Error> {
        let state = self.read();
        Ok(state
            .dataset(name)?
            .user_properties()
            .get(key)
            .map(|value| value.to_string()))
    }

    fn set_properties(
        &self,
        name: &DatasetName,
        properties: &[(&str, &str)],
    ) -> Result<(), Error> {
        let mut state = self.write();
        if state.failing_writes.contains(name.as_str()) {
            return Err(Error::backend(format!(
                "cannot set properties on '{}': injected failure",
                name
            )));
        }
        let ds = state
            .datasets
            .get_mut(name.as_str())
            .ok_or_else(|| Error::not_found(name.as_str()))?;
        for (key, value) in properties {
            ds.properties.insert(key.to_string(), value.to_string());
        }
        state.calls.push(Call::SetProperties {
            name: name.to_string(),
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(())
    }

    fn children(&self, name: &DatasetName) -> Result<Datasets, Error> {
        let state = self.read();
        state.dataset(name)?;
        let prefix = format!("{}/", name);
        Ok(state
            .datasets
            .keys()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.contains('/') && !rest.contains('@'))
            })
            .map(|key| DatasetName::new(key))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter())
    }

    fn descendants(&self, name: &DatasetName) -> Result<Datasets, Error> {
        let state = self.read();
        state.dataset(name)?;
        // BTreeMap order puts every parent before its children.
        Ok(state
            .datasets
            .keys()
            .filter(|key| is_beneath(key, name.as_str()) && !key.contains('@'))
            .map(|key| DatasetName::new(key))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter())
    }

    fn mountpoint(&self, name: &DatasetName) -> Result<Option<PathBuf>, Error> {
        let state = self.read();
        let ds = state.dataset(name)?;
        if ds.properties.get("canmount").map(String::as_str) == Some("off") {
            return Ok(None);
        }
        Ok(state.effective_mountpoint(name.as_str()))
    }

    fn mounted(&self, name: &DatasetName) -> Result<Option<PathBuf>, Error> {
        Ok(self.read().dataset(name)?.mounted.clone())
    }

    fn mount(&self, name: &DatasetName) -> Result<(), Error> {
        let mut state = self.write();
        state.dataset(name)?;
        if state.failing_mounts.contains(name.as_str()) {
            return Err(Error::backend(format!("cannot mount '{}': injected failure", name)));
        }
        let mountpoint = state
            .effective_mountpoint(name.as_str())
            .ok_or_else(|| Error::backend(format!("cannot mount '{}': no mountpoint", name)))?;
        if let Some(ds) = state.datasets.get_mut(name.as_str()) {
            ds.mounted = Some(mountpoint);
        }
        state.calls.push(Call::Mount(name.to_string()));
        Ok(())
    }

    fn unmount_all(&self, name: &DatasetName, force: bool) -> Result<(), Error> {
        let mut state = self.write();
        let Some(top) = state.dataset(name)?.mounted.clone() else {
            return Ok(());
        };
        // Everything mounted at or below the dataset's mount path.
        let targets: Vec<String> = state
            .datasets
            .iter()
            .filter(|(_, ds)| ds.mounted.as_ref().is_some_and(|mp| mp.starts_with(&top)))
            .map(|(key, _)| key.clone())
            .collect();
        if !force {
            if let Some(busy) = targets.iter().find(|key| state.datasets[*key].busy) {
                return Err(Error::Busy { name: busy.clone() });
            }
        }
        for key in targets {
            if let Some(ds) = state.datasets.get_mut(&key) {
                ds.mounted = None;
            }
        }
        state.calls.push(Call::Unmount(name.to_string()));
        Ok(())
    }

    /// The emulator's stream format is one dataset per line: a path relative
    /// to the receiving dataset (`.` for the dataset itself) followed by
    /// `key=value` properties. User properties are stored as received.
    fn receive(&self, name: &DatasetName, stream: &mut dyn Read) -> Result<(), Error> {
        let mut content = String::new();
        stream.read_to_string(&mut content)?;
        let failed = |reason: &str| Error::ReceiveFailed {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let mut entries: Vec<(String, DatasetState)> = Vec::new();
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(relative) = fields.next() else {
                continue;
            };
            let full = if relative == "." {
                name.to_string()
            } else {
                format!("{}/{}", name, relative)
            };
            DatasetName::new(&full).map_err(|_| failed("malformed dataset entry"))?;
            let mut dataset = DatasetState::default();
            for field in fields {
                let (key, value) = field
                    .split_once('=')
                    .ok_or_else(|| failed("malformed property entry"))?;
                let properties = if key.contains(':') {
                    &mut dataset.received
                } else {
                    &mut dataset.properties
                };
                properties.insert(key.to_string(), value.to_string());
            }
            entries.push((full, dataset));
        }
        if entries.first().map(|(full, _)| full.as_str()) != Some(name.as_str()) {
            return Err(failed("stream does not begin with its top-level dataset"));
        }

        let mut state = self.write();
        if state.datasets.contains_key(name.as_str()) {
            return Err(Error::already_exists(name.as_str()));
        }
        state.require_parent(name)?;
        for (full, dataset) in entries {
            if !full.starts_with(name.as_str()) || state.datasets.contains_key(&full) {
                return Err(failed("duplicate dataset in stream"));
            }
            state.datasets.insert(full, dataset);
        }
        state.calls.push(Call::Receive(name.to_string()));
        Ok(())
    }

    fn list(&self, roots: &[DatasetName], out: &mut dyn Write) -> Result<(), Error> {
        let state = self.read();
        let mut rows = Vec::new();
        for root in roots {
            state.dataset(root)?;
            for (key, _) in state.datasets.iter().filter(|(key, _)| {
                (key.as_str() == root.as_str() || is_beneath(key, root.as_str()))
                    && !key.contains('@')
            }) {
                let mountpoint = match state.effective_mountpoint(key) {
                    Some(path) => path.display().to_string(),
                    None => "none".to_string(),
                };
                rows.push((key.clone(), mountpoint));
            }
        }
        let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0).max(4);
        writeln!(out, "{:<width$}  MOUNTPOINT", "NAME", width = width)?;
        for (name, mountpoint) in rows {
            writeln!(out, "{:<width$}  {}", name, mountpoint, width = width)?;
        }
        Ok(())
    }
}
