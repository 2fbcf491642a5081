//! Error types for the TLS backend and the command-line driver.

use std::{io, path::PathBuf};

use mtstress_core::PoolError;
use rustls::{pki_types::InvalidDnsNameError, server::VerifierBuilderError};
use thiserror::Error;

/// Failure to load or generate certificates and keys.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A credential file or directory could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A PEM source holds no certificate.
    #[error("no certificate found in {0}")]
    NoCertificate(String),

    /// A PEM source holds no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// Self-signed certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

/// Failure to build the TLS library.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Credentials could not be loaded.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// rustls rejected the configuration.
    #[error("tls configuration: {0}")]
    Config(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    /// The server name is not a valid DNS name or IP address.
    #[error("invalid server name: {0}")]
    ServerName(#[from] InvalidDnsNameError),

    /// Peer verification was requested but no trust anchor was supplied.
    #[error("{0} verification requested but no CA file or directory holds a certificate")]
    NoTrustAnchors(&'static str),
}

/// Failure of the `mtstress` binary.
#[derive(Debug, Error)]
pub enum RunError {
    /// The TLS library could not be built.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The worker pool could not be started.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The report could not be written.
    #[error("cannot write report: {0}")]
    Output(#[from] io::Error),
}
