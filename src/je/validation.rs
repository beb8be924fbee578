use super::Error;

/// Validates a jail or jail environment name, which becomes a single
/// component beneath `root`.
pub(crate) fn validate_name(name: &str, root: &str) -> Result<(), Error> {
    // The full dataset name (root + '/' + name) must fit in 255 bytes.
    if root.len() + name.len() > 254 {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name too long".to_string(),
        });
    }
    validate_component(name, true)
}

/// Validates a full dataset name, optionally followed by `@snapshot`.
pub(crate) fn validate_dataset_name(name: &str) -> Result<(), Error> {
    let (filesystem, snapshot) = match name.split_once('@') {
        Some((filesystem, snapshot)) => (filesystem, Some(snapshot)),
        None => (name, None),
    };

    if filesystem.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }
    for (i, comp) in filesystem.split('/').enumerate() {
        if comp.is_empty() {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: if i == 0 {
                    "leading slash".to_string()
                } else {
                    "empty component".to_string()
                },
            });
        }
        validate_component(comp, true).map_err(|err| with_name(err, name))?;
    }
    if let Some(snapshot) = snapshot {
        validate_component(snapshot, false).map_err(|err| with_name(err, name))?;
    }
    Ok(())
}

/// Report a component error against the full dataset name.
fn with_name(err: Error, name: &str) -> Error {
    match err {
        Error::InvalidName { reason, .. } => Error::InvalidName {
            name: name.to_string(),
            reason,
        },
        other => other,
    }
}

/// Validates a single ZFS name component (part of a dataset or snapshot
/// name).
pub(crate) fn validate_component(name: &str, is_dataset: bool) -> Result<(), Error> {
    // Components match [a-zA-Z0-9][a-zA-Z0-9-_:.]*. Snapshot labels may
    // start with any of the allowed characters.
    if name.len() > 255 {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name too long".to_string(),
        });
    }

    let mut chars = name.chars();
    let Some(first_char) = chars.next() else {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    };

    if is_dataset && !first_char.is_ascii_alphanumeric() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!("name cannot begin with '{}'", first_char),
        });
    }

    for c in std::iter::once(first_char).chain(chars) {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ':' {
            return Err(Error::InvalidName {
                name: name.to_string(),
                reason: format!("invalid character '{}' in name", c),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(validate_name("www", "zroot/JAIL").is_ok());
        assert!(validate_name("14.1-RELEASE", "zroot/JE").is_ok());
        assert!(validate_name("base_140", "zroot/JE").is_ok());
        assert!(validate_name("jectl.a1b2c3", "zroot/JAIL").is_ok());

        assert!(validate_name(&"a".repeat(245), "zroot/JAIL").is_err()); // too long with root
        assert!(validate_name("", "zroot/JAIL").is_err());
        assert!(validate_name("-www", "zroot/JAIL").is_err());
        assert!(validate_name(".www", "zroot/JAIL").is_err());
        assert!(validate_name("www/db", "zroot/JAIL").is_err());
        assert!(validate_name("www@snap", "zroot/JAIL").is_err());
        assert!(validate_name("my jail", "zroot/JAIL").is_err());
    }

    #[test]
    fn test_dataset_name_validation() {
        assert!(validate_dataset_name("zroot").is_ok());
        assert!(validate_dataset_name("zroot/JAIL/www").is_ok());
        assert!(validate_dataset_name("zroot/JE/14.1@jectl").is_ok());

        assert!(validate_dataset_name("").is_err());
        assert!(validate_dataset_name("/zroot").is_err());
        assert!(validate_dataset_name("zroot/").is_err());
        assert!(validate_dataset_name("zroot//JE").is_err());
        assert!(validate_dataset_name("zroot/JE@").is_err()); // empty snapshot
        assert!(validate_dataset_name("@jectl").is_err());
        assert!(validate_dataset_name("zroot/JE@a@b").is_err());
        assert!(validate_dataset_name("zroot/_JE").is_err());
    }

    #[test]
    fn test_component_validation() {
        assert!(validate_component("JAIL", true).is_ok());
        assert!(validate_component("ns:tagged", true).is_ok());
        assert!(validate_component("-label", false).is_ok());
        assert!(validate_component(".hidden", false).is_ok());

        assert!(validate_component("", true).is_err());
        assert!(validate_component("", false).is_err());
        assert!(validate_component(":x", true).is_err());
        assert!(validate_component("a#b", false).is_err());
        assert!(validate_component(&"a".repeat(256), false).is_err());
    }

    #[test]
    fn test_error_names_full_dataset() {
        match validate_dataset_name("zroot/-bad/JE") {
            Err(Error::InvalidName { name, .. }) => assert_eq!(name, "zroot/-bad/JE"),
            _ => panic!("Expected InvalidName error"),
        }
    }
}
