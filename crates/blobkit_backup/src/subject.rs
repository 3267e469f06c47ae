//! Authorization of backup and restore callers.
//!
//! The engine doesn't know about users or roles. It asks a [`Subject`]
//! whether it holds a [`Permission`] and refuses before any I/O if not.

use crate::error::{BackupError, BackupResult};
use std::fmt;

/// Operations a subject can be allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Export every store to an archive.
    Backup,
    /// Replace store contents from an archive.
    Restore,
}

impl Permission {
    /// Returns the permission's name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller of a backup or restore, as seen by the host application.
pub trait Subject: Send + Sync {
    /// A human-readable identity for logs and errors.
    fn describe(&self) -> String;

    /// Returns true if the subject holds `permission`.
    fn is_allowed(&self, permission: Permission) -> bool;
}

/// Fails with [`BackupError::Unauthorized`] unless `subject` holds
/// `permission`.
pub(crate) fn authorize(subject: &dyn Subject, permission: Permission) -> BackupResult<()> {
    if subject.is_allowed(permission) {
        Ok(())
    } else {
        tracing::warn!(subject = %subject.describe(), %permission, "unauthorized");
        Err(BackupError::Unauthorized {
            subject: subject.describe(),
            permission,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Only(Permission);

    impl Subject for Only {
        fn describe(&self) -> String {
            format!("only-{}", self.0)
        }

        fn is_allowed(&self, permission: Permission) -> bool {
            permission == self.0
        }
    }

    #[test]
    fn authorize_checks_permission() {
        assert!(authorize(&Only(Permission::Backup), Permission::Backup).is_ok());
        let err = authorize(&Only(Permission::Backup), Permission::Restore).unwrap_err();
        assert!(matches!(
            err,
            BackupError::Unauthorized {
                permission: Permission::Restore,
                ..
            }
        ));
    }
}
