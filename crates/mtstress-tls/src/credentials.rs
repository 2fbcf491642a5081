//! Certificate and key loading.
//!
//! An [`Identity`] is a certificate chain plus its private key, read from a
//! single PEM file or generated as a self-signed certificate. Trust anchors
//! come from a PEM bundle or from every PEM file in a directory.

use std::{
    fs,
    io::BufReader,
    path::{Path, PathBuf},
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::error::CredentialError;

/// A certificate chain and its private key.
#[derive(Debug)]
pub struct Identity {
    /// Leaf first
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key of the leaf
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Read chain and key from one PEM file.
    pub fn load_pem(path: &Path) -> Result<Self, CredentialError> {
        let bytes = read(path)?;
        Self::from_pem(&bytes, &path.display().to_string())
    }

    /// Parse chain and key from PEM `bytes`; `origin` names the source in
    /// errors.
    pub fn from_pem(bytes: &[u8], origin: &str) -> Result<Self, CredentialError> {
        let chain = parse_certs(bytes);
        if chain.is_empty() {
            return Err(CredentialError::NoCertificate(origin.to_string()));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(bytes))
            .ok()
            .flatten()
            .ok_or_else(|| CredentialError::NoPrivateKey(origin.to_string()))?;

        Ok(Self { chain, key })
    }

    /// Generate a self-signed certificate for `name`.
    pub fn self_signed(name: &str) -> Result<Self, CredentialError> {
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()])?;
        debug!(name, "generated self-signed certificate");
        Ok(Self {
            chain: vec![certified.cert.der().clone()],
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into(),
        })
    }

    /// Load from `path` when given, otherwise generate for `name`.
    pub fn load_or_generate(path: Option<&Path>, name: &str) -> Result<Self, CredentialError> {
        match path {
            Some(path) => Self::load_pem(path),
            None => Self::self_signed(name),
        }
    }

    /// Leaf certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }
}

/// Certificates in a PEM bundle.
pub fn load_ca_file(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    Ok(parse_certs(&read(path)?))
}

/// Certificates in every `.pem` or `.crt` file of `dir`, in file name order.
pub fn load_ca_dir(dir: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let io_err = |source| CredentialError::Io { path: dir.to_path_buf(), source };

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().and_then(|e| e.to_str()).is_some_and(|e| e == "pem" || e == "crt")
        })
        .collect();
    files.sort();

    let mut certs = Vec::new();
    for file in files {
        certs.extend(load_ca_file(&file)?);
    }
    Ok(certs)
}

/// Trust anchors from an optional CA file and an optional CA directory.
pub fn load_anchors(
    file: Option<&Path>,
    dir: Option<&Path>,
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let mut anchors = Vec::new();
    if let Some(file) = file {
        anchors.extend(load_ca_file(file)?);
    }
    if let Some(dir) = dir {
        anchors.extend(load_ca_dir(dir)?);
    }
    Ok(anchors)
}

fn read(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| CredentialError::Io { path: path.to_path_buf(), source })
}

fn parse_certs(bytes: &[u8]) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut BufReader::new(bytes)).filter_map(Result::ok).collect()
}
