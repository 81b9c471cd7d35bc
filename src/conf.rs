//! Credential configuration file loading.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::Error;

/// Shape of the YAML file handed to `--ssl`.
///
/// Unknown `cipher` or `mode` values, unknown keys, and a missing section
/// for the selected cipher are all fatal at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    pub cipher: Cipher,
    pub mode: Mode,
    #[serde(default)]
    pub ssl: Option<SslFiles>,
    #[serde(default)]
    pub gmssl: Option<GmsslFiles>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cipher {
    Ssl,
    Gmssl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    OneWay,
    TwoWay,
}

/// Certificate material for the standard TLS variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslFiles {
    pub via_cert: String,
    pub via_key: String,
    pub ca_cert: String,
}

/// Certificate material for the national-cipher variant, which carries
/// separate sign and encrypt pairs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GmsslFiles {
    pub via_sign_cert: String,
    pub via_sign_key: String,
    pub via_encrypt_cert: String,
    pub via_encrypt_key: String,
    pub ca_cert: String,
}

impl CredentialConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        let config = Self::parse(&raw).map_err(|source| Error::ConfigParse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    fn validate(&self) -> Result<(), Error> {
        match self.cipher {
            Cipher::Ssl if self.ssl.is_none() => Err(Error::ConfigIncomplete { section: "ssl" }),
            Cipher::Gmssl if self.gmssl.is_none() => {
                Err(Error::ConfigIncomplete { section: "gmssl" })
            }
            _ => Ok(()),
        }
    }
}
