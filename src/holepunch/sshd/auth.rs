use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error("public key not authorized")]
    KeyNotAuthorized,
}

/// Exactly one user, exactly one key. Keys match when their wire encodings
/// are byte-for-byte equal; the comment of the authorized_keys line is ignored.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    username: String,
    authorized_blob: Vec<u8>,
}

impl AuthPolicy {
    pub fn new(username: impl Into<String>, authorized_key: &str) -> anyhow::Result<Self> {
        let key = parse_authorized_key(authorized_key)?;
        let authorized_blob = key
            .to_bytes()
            .map_err(|err| anyhow::anyhow!("sshd: encode authorized key: {err}"))?;
        Ok(Self {
            username: username.into(),
            authorized_blob,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn check(&self, user: &str, key: &PublicKey) -> Result<(), AuthError> {
        if user != self.username {
            return Err(AuthError::UnknownUser(user.to_string()));
        }
        match key.to_bytes() {
            Ok(blob) if blob == self.authorized_blob => Ok(()),
            _ => Err(AuthError::KeyNotAuthorized),
        }
    }
}

/// Parses one authorized_keys line (`ssh-ed25519 AAAA... comment`).
pub fn parse_authorized_key(line: &str) -> anyhow::Result<PublicKey> {
    PublicKey::from_openssh(line.trim()).map_err(|err| anyhow::anyhow!("sshd: parse client public key: {err}"))
}

/// Parses an unencrypted OpenSSH/PEM private key.
pub fn parse_host_key(pem: &str) -> anyhow::Result<PrivateKey> {
    russh::keys::decode_secret_key(pem, None).map_err(|err| anyhow::anyhow!("sshd: parse host key: {err}"))
}

/// Timeouts handed to russh for every connection.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    /// Zero disables it.
    pub inactivity: Duration,
    /// Zero disables it.
    pub keepalive_interval: Duration,
    pub auth_rejection: Duration,
}

pub fn server_config(host_key: PrivateKey, timeouts: &SessionTimeouts) -> russh::server::Config {
    let non_zero = |d: Duration| (!d.is_zero()).then_some(d);
    russh::server::Config {
        keys: vec![host_key],
        auth_rejection_time: timeouts.auth_rejection,
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: non_zero(timeouts.inactivity),
        keepalive_interval: non_zero(timeouts.keepalive_interval),
        nodelay: true,
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod testkeys {
    pub const HOST: &str = include_str!("../../../testdata/host_ed25519");
    pub const CLIENT: &str = include_str!("../../../testdata/client_ed25519");
    pub const CLIENT_PUB: &str = include_str!("../../../testdata/client_ed25519.pub");
    pub const INTRUDER: &str = include_str!("../../../testdata/intruder_ed25519");
    pub const INTRUDER_PUB: &str = include_str!("../../../testdata/intruder_ed25519.pub");
}

#[cfg(test)]
mod tests {
    use super::{testkeys::*, *};

    #[test]
    fn accepts_only_the_configured_user_and_key() {
        let policy = AuthPolicy::new("hp", CLIENT_PUB).unwrap();
        let client = parse_authorized_key(CLIENT_PUB).unwrap();
        let intruder = parse_authorized_key(INTRUDER_PUB).unwrap();

        assert!(policy.check("hp", &client).is_ok());
        assert!(matches!(policy.check("root", &client), Err(AuthError::UnknownUser(u)) if u == "root"));
        assert!(matches!(policy.check("hp", &intruder), Err(AuthError::KeyNotAuthorized)));
    }

    #[test]
    fn comment_does_not_affect_key_identity() {
        let policy = AuthPolicy::new("hp", CLIENT_PUB).unwrap();
        let mut fields = CLIENT_PUB.split_whitespace();
        let bare = format!("{} {}", fields.next().unwrap(), fields.next().unwrap());
        let key = parse_authorized_key(&bare).unwrap();
        assert!(policy.check("hp", &key).is_ok());
    }

    #[test]
    fn private_key_matches_its_public_half() {
        let host = parse_host_key(HOST).unwrap();
        let client = parse_host_key(CLIENT).unwrap();
        let policy = AuthPolicy::new("hp", CLIENT_PUB).unwrap();

        assert!(policy.check("hp", client.public_key()).is_ok());
        assert!(policy.check("hp", host.public_key()).is_err());
    }

    #[test]
    fn garbage_keys_fail_closed() {
        assert!(AuthPolicy::new("hp", "ssh-ed25519 not-base64").is_err());
        assert!(AuthPolicy::new("hp", "").is_err());
        assert!(parse_host_key("-----BEGIN NOTHING-----").is_err());
        assert!(parse_host_key(INTRUDER_PUB).is_err());
    }
}
