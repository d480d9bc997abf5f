//! Login identity

use super::SessionError;
use crate::crypto::auth_key;
use crate::msg::Login;
use tracing::info;

/// Protocol version announced at login
pub const PROTOCOL_VERSION: &str = "0.43.0";

/// Who we are to the broker.
///
/// `run_id` is derived from a stable hardware identifier so the broker
/// recognizes reconnects; once a login succeeds it is pinned to whatever
/// the broker confirmed and never regenerated within the session. The
/// privilege key is recomputed for every login attempt and never stored.
#[derive(Debug, Clone)]
pub struct LoginIdentity {
    pub version: String,
    pub hostname: Option<String>,
    pub os: String,
    pub arch: String,
    pub user: Option<String>,
    pub run_id: String,
    pub timestamp: i64,
    pub pool_count: u32,
    pub logged: bool,
}

impl LoginIdentity {
    /// Identity with the given session identifier
    pub fn new(run_id: String) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            hostname: None,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: None,
            run_id,
            timestamp: 0,
            pool_count: 1,
            logged: false,
        }
    }

    /// Identity keyed by the device's network MAC
    pub fn from_hardware() -> Result<Self, SessionError> {
        let run_id = device_run_id()?;
        info!(%run_id, version = PROTOCOL_VERSION, "login identity initialized");
        Ok(Self::new(run_id))
    }

    /// Build the login payload, stamping the timestamp and computing a
    /// fresh privilege key over `token ‖ timestamp`.
    pub fn login_payload(&mut self, token: &str, now: i64) -> Login {
        self.timestamp = now;
        Login {
            version: self.version.clone(),
            hostname: self.hostname.clone().unwrap_or_default(),
            os: self.os.clone(),
            arch: self.arch.clone(),
            user: self.user.clone().unwrap_or_default(),
            privilege_key: auth_key(token, now),
            timestamp: now,
            run_id: self.run_id.clone(),
            pool_count: self.pool_count,
            metas: None,
        }
    }
}

/// Derive the session identifier from the first network MAC:
/// twelve uppercase hex characters.
pub fn device_run_id() -> Result<String, SessionError> {
    let mac = mac_address::get_mac_address()
        .map_err(|e| SessionError::Identity(e.to_string()))?
        .ok_or_else(|| SessionError::Identity("no network interface with a MAC".to_string()))?;

    let mut run_id = String::with_capacity(12);
    for byte in mac.bytes() {
        run_id.push_str(&format!("{byte:02X}"));
    }
    Ok(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_payload_stamps_fresh_key() {
        let mut identity = LoginIdentity::new("AABBCCDDEEFF".to_string());

        let first = identity.login_payload("52010", 1700000000);
        let second = identity.login_payload("52010", 1700000060);

        assert_eq!(first.run_id, "AABBCCDDEEFF");
        assert_eq!(first.timestamp, 1700000000);
        assert_eq!(second.timestamp, 1700000060);
        // a new timestamp means a new privilege key
        assert_ne!(first.privilege_key, second.privilege_key);
        assert_eq!(identity.timestamp, 1700000060);
    }

    #[test]
    fn test_identity_defaults() {
        let identity = LoginIdentity::new("AABBCCDDEEFF".to_string());
        assert_eq!(identity.version, PROTOCOL_VERSION);
        assert_eq!(identity.pool_count, 1);
        assert!(!identity.logged);
        assert!(identity.hostname.is_none());
    }

    #[test]
    fn test_unset_fields_serialize_empty() {
        let mut identity = LoginIdentity::new("AABBCCDDEEFF".to_string());
        let payload = identity.login_payload("52010", 1700000000);
        assert_eq!(payload.hostname, "");
        assert_eq!(payload.user, "");
    }
}
