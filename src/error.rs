//! Error types for the proxy gateway.

/// Top-level error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("could not load private key: {0}")]
    BadKey(String),

    #[error("control plane unreachable: {0}")]
    BackendUnreachable(#[from] reqwest_middleware::Error),

    #[error("control plane request timed out")]
    BackendTimeout,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("control plane rejected the request with status {0}")]
    BackendRejected(reqwest::StatusCode),

    #[error("could not decode tunnel roster: {0}")]
    RosterDecode(#[from] rmp_serde::decode::Error),

    #[error("no tunnel could be dialed after {0} attempts")]
    NoTunnel(u32),

    #[error("failed to hijack client connection: {0}")]
    Hijack(String),

    #[error("failed to dial upstream tunnel: {0}")]
    UpstreamDial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),
}
