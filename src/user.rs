//! User records and password verification.

use crate::permissions::UserPermissions;

/// Prefix marking a stored password as a bcrypt hash.
const BCRYPT_PREFIX: &str = "{bcrypt}";

/// A configured account with its effective permission envelope.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password: String,
    pub permissions: UserPermissions,
}

impl User {
    /// Verifies a presented password against the stored secret.
    ///
    /// Secrets of the form `{bcrypt}<hash>` are verified with bcrypt; an
    /// unparseable hash is a non-match, not an error. Anything else is
    /// compared byte-exact.
    pub fn check_password(&self, input: &str) -> bool {
        match self.password.strip_prefix(BCRYPT_PREFIX) {
            Some(hash) => bcrypt::verify(input, hash).unwrap_or(false),
            None => self.password == input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Permissions;
    use std::path::PathBuf;

    fn user(password: &str) -> User {
        User {
            username: "basic".to_string(),
            password: password.to_string(),
            permissions: UserPermissions {
                directory: PathBuf::from("/"),
                permissions: Permissions::READ,
                rules: vec![],
            },
        }
    }

    #[test]
    fn plaintext_password() {
        let u = user("secret");
        assert!(u.check_password("secret"));
        assert!(!u.check_password("wrong"));
        assert!(!u.check_password(""));
    }

    #[test]
    fn bcrypt_password() {
        // Minimum cost keeps the test fast; verification reads the cost
        // from the hash itself.
        let hash = bcrypt::hash("secret", 4).unwrap();
        let u = user(&format!("{{bcrypt}}{hash}"));
        assert!(u.check_password("secret"));
        assert!(!u.check_password("wrong"));
    }

    #[test]
    fn invalid_bcrypt_hash_is_a_mismatch() {
        let u = user("{bcrypt}not-a-hash");
        assert!(!u.check_password("not-a-hash"));
        assert!(!u.check_password("anything"));
    }
}
