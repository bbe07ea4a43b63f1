//! Volume and snapshot naming rules

use crate::error::{Error, Result};

/// Separator between the tenant ID and the rest of a volume name
pub const TENANT_SEPARATOR: char = '_';

/// Reject names that cannot be used as a single path component
///
/// Leading dots are reserved for driver-internal staging directories.
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(Error::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Tenant a volume belongs to: the name up to the first separator
pub fn tenant_of(volume_name: &str) -> &str {
    volume_name
        .split(TENANT_SEPARATOR)
        .next()
        .unwrap_or(volume_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("volume", "app1").is_ok());
        assert!(validate_name("volume", "app1_logs").is_ok());
        assert!(validate_name("snapshot", "app1_2026-10-19").is_ok());

        for bad in ["", ".", "..", ".hidden", "a/b", "a\\b", "nul\0"] {
            assert!(validate_name("volume", bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_tenant_of() {
        assert_eq!(tenant_of("app1"), "app1");
        assert_eq!(tenant_of("app1_logs"), "app1");
        assert_eq!(tenant_of("app1_logs_old"), "app1");
    }
}
