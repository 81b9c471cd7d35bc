//! Transport credential construction.
//!
//! One config file yields credentials for both roles this process plays:
//! the server side of the forwarding listener, and the client side used
//! for the signup dial-back (and by tasks dialling out through their local
//! process). One-way proves only the server's identity; two-way
//! additionally authenticates peers against the CA pool, with this
//! process presenting its own certificate in the client role too.

use std::fs;
use std::path::{Path, PathBuf};

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::debug;

use crate::conf::{Cipher, CredentialConfig, GmsslFiles, Mode, SslFiles};
use crate::Error;

/// Server- and client-side credentials derived from one config file.
/// Both sides absent means the process runs insecure.
#[derive(Debug, Clone, Default)]
pub struct TransportSecurity {
    server: Option<ServerTlsConfig>,
    client: Option<ClientTlsConfig>,
}

impl TransportSecurity {
    /// Plaintext transport in both roles.
    pub fn insecure() -> Self {
        Self::default()
    }

    /// Builds both roles' credentials from a loaded config file.
    pub fn from_config(config: &CredentialConfig) -> Result<Self, Error> {
        match config.cipher {
            Cipher::Ssl => {
                let files = config
                    .ssl
                    .as_ref()
                    .ok_or(Error::ConfigIncomplete { section: "ssl" })?;
                Self::standard_tls(config.mode, files)
            }
            Cipher::Gmssl => {
                let files = config
                    .gmssl
                    .as_ref()
                    .ok_or(Error::ConfigIncomplete { section: "gmssl" })?;
                Self::gm_tls(config.mode, files)
            }
        }
    }

    fn standard_tls(mode: Mode, files: &SslFiles) -> Result<Self, Error> {
        let (server, client) = match mode {
            Mode::OneWay => {
                debug!("building one-way TLS credentials");
                (
                    server_tls_one_way(&files.via_cert, &files.via_key)?,
                    client_tls_one_way(&files.ca_cert)?,
                )
            }
            Mode::TwoWay => {
                debug!("building two-way TLS credentials");
                (
                    server_tls_two_way(&files.ca_cert, &files.via_cert, &files.via_key)?,
                    client_tls_two_way(&files.ca_cert, &files.via_cert, &files.via_key)?,
                )
            }
        };
        Ok(TransportSecurity {
            server: Some(server),
            client: Some(client),
        })
    }

    /// The national-cipher material is loaded and checked so that broken
    /// paths stay fatal at startup, but no GM-capable TLS backend is
    /// available to hand it to.
    fn gm_tls(_mode: Mode, files: &GmsslFiles) -> Result<Self, Error> {
        let _sign = load_identity("via sign", &files.via_sign_cert, &files.via_sign_key)?;
        let _encrypt = load_identity(
            "via encrypt",
            &files.via_encrypt_cert,
            &files.via_encrypt_key,
        )?;
        let _ca = load_certificate("ca", &files.ca_cert)?;
        Err(Error::GmTlsUnsupported)
    }

    pub fn server_tls(&self) -> Option<&ServerTlsConfig> {
        self.server.as_ref()
    }

    pub fn client_tls(&self) -> Option<&ClientTlsConfig> {
        self.client.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.server.is_some()
    }
}

/// Server credentials that only prove this process's identity.
pub fn server_tls_one_way(
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<ServerTlsConfig, Error> {
    Ok(ServerTlsConfig::new().identity(load_identity("via", cert, key)?))
}

/// Server credentials that additionally require and verify peer
/// certificates against the CA pool.
pub fn server_tls_two_way(
    ca_cert: impl AsRef<Path>,
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<ServerTlsConfig, Error> {
    Ok(ServerTlsConfig::new()
        .identity(load_identity("via", cert, key)?)
        .client_ca_root(load_certificate("ca", ca_cert)?))
}

/// Client credentials that only verify the server against the CA pool.
pub fn client_tls_one_way(ca_cert: impl AsRef<Path>) -> Result<ClientTlsConfig, Error> {
    Ok(ClientTlsConfig::new().ca_certificate(load_certificate("ca", ca_cert)?))
}

/// Client credentials that also present this process's certificate.
pub fn client_tls_two_way(
    ca_cert: impl AsRef<Path>,
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<ClientTlsConfig, Error> {
    Ok(ClientTlsConfig::new()
        .ca_certificate(load_certificate("ca", ca_cert)?)
        .identity(load_identity("via", cert, key)?))
}

fn load_identity(
    role: &'static str,
    cert: impl AsRef<Path>,
    key: impl AsRef<Path>,
) -> Result<Identity, Error> {
    let cert_pem = read_pem(role, cert.as_ref())?;
    let key_pem = read_pem(role, key.as_ref())?;
    Ok(Identity::from_pem(cert_pem, key_pem))
}

fn load_certificate(role: &'static str, path: impl AsRef<Path>) -> Result<Certificate, Error> {
    Ok(Certificate::from_pem(read_pem(role, path.as_ref())?))
}

fn read_pem(role: &'static str, path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|source| Error::CredentialRead {
        role,
        path: PathBuf::from(path),
        source,
    })
}
