// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use super::props::{self, Property};
use super::{Backend, DatasetName, Engine, Error};

/// A read-only view of jails and their environments.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize))]
pub struct Report {
    pub jails: Vec<JailReport>,
    /// The pool, when every jail was reported.
    #[cfg_attr(feature = "json", serde(skip_serializing_if = "Option::is_none"))]
    pub available: Option<Vec<EnvironmentReport>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize))]
pub struct JailReport {
    pub name: String,
    pub dataset: String,
    pub environments: Vec<EnvironmentReport>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "json", derive(serde::Serialize))]
pub struct EnvironmentReport {
    pub name: String,
    pub dataset: String,
    pub active: bool,
    pub branch: Option<String>,
    pub version: Option<String>,
    pub poudriere_jail: Option<String>,
    pub overlay: Option<String>,
    pub package_list: Option<String>,
}

impl<B: Backend> Engine<B> {
    /// Describe one jail, or every jail that has an active environment
    /// followed by the pool.
    pub fn report(&self, jail_name: Option<&str>) -> Result<Report, Error> {
        let Some(jail_name) = jail_name else {
            let mut jails = Vec::new();
            for jail in self.backend.children(&self.layout.jail_root)? {
                if self.active_environment(&jail)?.is_none() {
                    tracing::debug!(jail = %jail, "no active environment, skipping");
                    continue;
                }
                jails.push(self.jail_report(&jail)?);
            }
            let available = self.environment_reports(&self.layout.pool, None)?;
            return Ok(Report {
                jails,
                available: Some(available),
            });
        };

        let jail = self.jail(jail_name)?;
        Ok(Report {
            jails: vec![self.jail_report(&jail)?],
            available: None,
        })
    }

    fn jail_report(&self, jail: &DatasetName) -> Result<JailReport, Error> {
        let active = self.active_environment(jail)?;
        Ok(JailReport {
            name: jail.basename().to_string(),
            dataset: jail.to_string(),
            environments: self.environment_reports(jail, active.as_ref())?,
        })
    }

    fn environment_reports(
        &self,
        parent: &DatasetName,
        active: Option<&DatasetName>,
    ) -> Result<Vec<EnvironmentReport>, Error> {
        let mut reports = Vec::new();
        for environment in self.backend.children(parent)? {
            let properties = props::load(&self.backend, &environment)?;
            let value = |prop| properties.get(prop).map(str::to_string);
            reports.push(EnvironmentReport {
                name: environment.basename().to_string(),
                dataset: environment.to_string(),
                active: active == Some(&environment),
                branch: value(Property::Branch),
                version: value(Property::FreebsdVersion),
                poudriere_jail: value(Property::JailName),
                overlay: value(Property::OverlayDir),
                package_list: value(Property::PackageList),
            });
        }
        Ok(reports)
    }
}

fn write_environments(f: &mut fmt::Formatter<'_>, environments: &[EnvironmentReport]) -> fmt::Result {
    for (index, environment) in environments.iter().enumerate() {
        let marker = if environment.active { " (ACTIVE)" } else { "" };
        writeln!(f, "{}.  Name:              {}{}", index + 1, environment.name, marker)?;
        for (label, value) in [
            ("branch", &environment.branch),
            ("version", &environment.version),
            ("poudriere-jail", &environment.poudriere_jail),
            ("overlay", &environment.overlay),
            ("packagelist", &environment.package_list),
        ] {
            if let Some(value) = value {
                writeln!(f, "    {:<19}{}", format!("{}:", label), value)?;
            }
        }
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for jail in &self.jails {
            writeln!(f, "Jail name: {}", jail.name)?;
            writeln!(f, "Environments:")?;
            write_environments(f, &jail.environments)?;
            writeln!(f)?;
        }
        if let Some(available) = &self.available {
            writeln!(f, "Available jail environments:")?;
            write_environments(f, available)?;
        }
        Ok(())
    }
}
