//! Network layer subsystem.
//!
//! The front-end listener is axum's; this module only loads TLS material
//! for it. PEM files are checked before rustls sees them so a bad path or
//! an empty file fails startup with a precise error.

pub mod tls;

pub use tls::{load_tls_config, TlsError};
