//! Mutual TLS setup for the bus server: client and server certificates
//! chained to an operator-provided CA. Envelope signing keys are Ed25519
//! and live entirely outside this module — transport identity and content
//! identity are deliberately distinct key material.

use std::path::Path;

use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::Result;

/// Loads `server.crt`/`server.key`/`ca.crt` from `tls_dir` and builds a
/// `ServerTlsConfig` that requires and verifies a client certificate
/// chained to the same CA.
pub fn load_server_tls(tls_dir: &Path) -> Result<ServerTlsConfig> {
    let cert = std::fs::read(tls_dir.join("server.crt"))?;
    let key = std::fs::read(tls_dir.join("server.key"))?;
    let ca = std::fs::read(tls_dir.join("ca.crt"))?;

    let identity = Identity::from_pem(cert, key);
    let client_ca = Certificate::from_pem(ca);

    Ok(ServerTlsConfig::new().identity(identity).client_ca_root(client_ca))
}
