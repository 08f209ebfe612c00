//! Server runtime (component G): wires configuration, the control-plane
//! client, the signer, the selector, and the admission gate together and
//! drives the proxy listener until it exits.

use std::sync::Arc;

use log::{info, warn};

use crate::admission::AdmissionGate;
use crate::config::Config;
use crate::controlplane::ControlPlaneClient;
use crate::error::GatewayError;
use crate::key::Signer;
use crate::proxy::ProxyHandler;
use crate::selector::Selector;

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Prepare and fire the gateway. Mirrors the original `Server.Run`:
    /// validate configuration, authenticate once up front to prime the
    /// cache and resolve the user's `simultaneity_cap`, then listen forever.
    pub async fn run(self) -> Result<(), GatewayError> {
        info!("server has been initialized...");

        let signer = Signer::from_pkcs1_pem(&std::fs::read_to_string(&self.config.private_key_path).map_err(
            |e| GatewayError::BadKey(format!("could not read {}: {e}", self.config.private_key_path)),
        )?)?;
        info!("signer ready: {}", signer.authorized_keys_line());

        let control_plane = Arc::new(ControlPlaneClient::new(
            self.config.backend_url.clone(),
            self.config.license.clone(),
        ));

        info!("auth flow has begun...");
        let auth = control_plane.auth().await?;
        let user = auth.user;
        info!("user {} was successfully authenticated to backend", user.id);

        // Drain the body so the cache layer persists this response; the
        // first real roster fetch from the selector can then hit cache.
        drain_body(auth.response).await;

        let admission = AdmissionGate::new(user.simultaneity_cap)?;
        let selector = Arc::new(Selector::new(Arc::clone(&control_plane), Arc::new(signer)));
        let handler = Arc::new(ProxyHandler::new(admission, selector, self.config.auth.clone()));

        handler.serve(&self.config.addr).await
    }
}

/// Read the response to completion so the cache middleware persists the
/// entry; mirrors the original's `io.Copy(ioutil.Discard, resp.Body)`.
async fn drain_body(response: reqwest::Response) {
    if let Err(e) = response.bytes().await {
        warn!("failed to drain initial auth response body: {e}");
    }
}
