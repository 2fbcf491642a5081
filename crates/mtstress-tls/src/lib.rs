//! rustls backend for the multi-threaded session stress harness.
//!
//! [`TlsLibrary`] implements the harness's session seam on top of rustls
//! client and server connections speaking TLS 1.3 over the in-memory pipes.
//! Certificates are loaded from PEM files or generated on the fly, and the
//! server session cache plus per-context statistics are serialized through
//! the locking callback the worker pool installs.

#![forbid(unsafe_code)]

pub mod cache;
pub mod credentials;
pub mod error;
pub mod library;

pub use cache::SessionCache;
pub use credentials::{Identity, load_anchors, load_ca_dir, load_ca_file};
pub use error::{CredentialError, RunError, TlsError};
pub use library::{TlsContext, TlsLibrary, TlsLock, TlsSession, TlsSettings};
