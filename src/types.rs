//! Data model shared between the control-plane client and the tunnel selector.

use std::collections::HashMap;

use serde::Deserialize;

/// Profile returned by the control plane in the `X-User` response header.
///
/// Decoding is best-effort: a malformed or absent header yields `User::default()`,
/// which has `simultaneity_cap == 0` and therefore denies every request rather
/// than silently granting unlimited concurrency.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub simultaneity_cap: u32,
}

impl User {
    /// Mirrors the original's `structs.IsZero` check: true when every field
    /// is still at its zero value, i.e. decoding never populated anything.
    pub fn is_zero(&self) -> bool {
        *self == User::default()
    }
}

/// One entry of the tunnel roster.
#[derive(Debug, Clone, Deserialize)]
pub struct Tunnel {
    #[serde(rename = "SSHUser")]
    pub ssh_user: String,
    #[serde(rename = "SSHHost")]
    pub ssh_host: String,
}

impl Tunnel {
    /// The SSH port tunnels listen on is fixed by the control plane.
    pub const SSH_PORT: u32 = 80;
}

/// Mapping from opaque tunnel id to [`Tunnel`]; ids are unique within one
/// fetch but carry no meaning across fetches.
pub type Roster = HashMap<String, Tunnel>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_is_zero() {
        assert!(User::default().is_zero());
    }

    #[test]
    fn populated_user_is_not_zero() {
        let user = User {
            id: "u1".into(),
            simultaneity_cap: 4,
        };
        assert!(!user.is_zero());
    }

    #[test]
    fn tunnel_deserializes_from_json_style_tags() {
        let json = r#"{"SSHUser": "root", "SSHHost": "1.2.3.4"}"#;
        let tunnel: Tunnel = serde_json::from_str(json).unwrap();
        assert_eq!(tunnel.ssh_user, "root");
        assert_eq!(tunnel.ssh_host, "1.2.3.4");
    }
}
