use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::config::ServersConfig;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("unable to hash password: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("invalid password hash: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// A parsed login name, Dovecot master-proxy style: the username field may
/// carry `<real_user>\x00<auth_user>`, in which case `auth_user` must match
/// the configured master account and the presented password must be the
/// master password, and the session then runs as `real_user`.
#[derive(Debug, PartialEq, Eq)]
pub struct LoginName<'a> {
    pub address: &'a str,
    pub proxy_user: Option<&'a str>,
}

impl<'a> LoginName<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once('\0') {
            Some((address, proxy_user)) => Self {
                address,
                proxy_user: Some(proxy_user),
            },
            None => Self {
                address: raw,
                proxy_user: None,
            },
        }
    }

    /// Whether this login is a valid master-proxy authentication for the
    /// given server configuration and presented password.
    pub fn is_master_login(&self, servers: &ServersConfig, password: &str) -> bool {
        match (self.proxy_user, &servers.master_username, &servers.master_password) {
            (Some(proxy), Some(master_user), Some(master_pass)) => {
                proxy == master_user && password == master_pass
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> ServersConfig {
        toml::from_str(
            r#"
master_username = "master"
master_password = "m4ster"
"#,
        )
        .unwrap()
    }

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("secret").unwrap();
        assert!(verify_password("secret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn plain_login_name() {
        let l = LoginName::parse("alice@example.com");
        assert_eq!(l.address, "alice@example.com");
        assert_eq!(l.proxy_user, None);
        assert!(!l.is_master_login(&servers(), "m4ster"));
    }

    #[test]
    fn master_proxy_login_name() {
        let l = LoginName::parse("alice@example.com\0master");
        assert_eq!(l.address, "alice@example.com");
        assert_eq!(l.proxy_user, Some("master"));
        assert!(l.is_master_login(&servers(), "m4ster"));
        assert!(!l.is_master_login(&servers(), "guess"));
    }
}
