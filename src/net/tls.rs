//! TLS configuration and certificate loading.

use axum_server::tls_rustls::RustlsConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("no certificate in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key in {0}")]
    NoPrivateKey(PathBuf),

    #[error("rustls config: {0}")]
    Config(std::io::Error),
}

fn reader(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Check that the files hold at least one certificate and a private key.
/// Returns the number of certificates in the chain.
pub fn validate_pem(cert_path: &Path, key_path: &Path) -> Result<usize, TlsError> {
    let chain = rustls_pemfile::certs(&mut reader(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut reader(key_path)?).map_err(|source| TlsError::Read {
        path: key_path.to_path_buf(),
        source,
    })?;
    if key.is_none() {
        return Err(TlsError::NoPrivateKey(key_path.to_path_buf()));
    }
    Ok(chain.len())
}

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, TlsError> {
    let certs = validate_pem(cert_path, key_path)?;
    tracing::info!(cert = %cert_path.display(), certs, "Loading TLS certificate");
    RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(TlsError::Config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_and_empty_files() {
        let missing = validate_pem(Path::new("/no/cert.pem"), Path::new("/no/key.pem"));
        assert!(matches!(missing, Err(TlsError::Read { .. })));

        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "not a pem file").unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            validate_pem(cert.path(), key.path()),
            Err(TlsError::NoCertificate(_))
        ));
    }
}
