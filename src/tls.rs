//! TLS material for database connections.
//!
//! CA, client certificate and client key are read from disk once, at pool
//! creation, and validated as PEM. Any failure here stops startup before a
//! single connection is attempted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use x509_parser::pem::parse_x509_pem;

/// Paths to the PEM files making up a TLS bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Error types for TLS material loading
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// A file could not be read
    #[error("Error reading ssl file {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    /// A file was read but is not the expected PEM content
    #[error("Malformed ssl file {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Validated PEM contents handed to drivers.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsBundle {
    /// Read and validate all three files.
    pub fn load(files: &TlsFiles) -> Result<Self, TlsError> {
        info!(ca = %files.ca.display(), cert = %files.cert.display(), "Loading database TLS material");

        let ca_pem = read_pem(&files.ca)?;
        let cert_pem = read_pem(&files.cert)?;
        let key_pem = read_pem(&files.key)?;

        check_certificate(&files.ca, &ca_pem)?;
        check_certificate(&files.cert, &cert_pem)?;
        check_private_key(&files.key, &key_pem)?;

        debug!("Database TLS material validated");

        Ok(Self {
            ca_pem,
            cert_pem,
            key_pem,
        })
    }
}

fn read_pem(path: &Path) -> Result<String, TlsError> {
    fs::read_to_string(path).map_err(|source| TlsError::Unreadable {
        path: path.display().to_string(),
        source,
    })
}

fn malformed(path: &Path, reason: impl Into<String>) -> TlsError {
    TlsError::Malformed {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn check_certificate(path: &Path, contents: &str) -> Result<(), TlsError> {
    let (_, pem) =
        parse_x509_pem(contents.as_bytes()).map_err(|e| malformed(path, format!("not PEM: {e}")))?;

    if pem.label != "CERTIFICATE" {
        return Err(malformed(
            path,
            format!("expected a CERTIFICATE block, found {}", pem.label),
        ));
    }

    pem.parse_x509()
        .map_err(|e| malformed(path, format!("invalid X.509 certificate: {e}")))?;

    Ok(())
}

fn check_private_key(path: &Path, contents: &str) -> Result<(), TlsError> {
    let (_, pem) =
        parse_x509_pem(contents.as_bytes()).map_err(|e| malformed(path, format!("not PEM: {e}")))?;

    // PKCS#8 ("PRIVATE KEY"), PKCS#1 ("RSA PRIVATE KEY") and SEC1 ("EC PRIVATE KEY")
    if !pem.label.ends_with("PRIVATE KEY") {
        return Err(malformed(
            path,
            format!("expected a PRIVATE KEY block, found {}", pem.label),
        ));
    }
    if pem.contents.is_empty() {
        return Err(malformed(path, "empty private key"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CA_PEM: &str = include_str!("../testdata/tls/ca.pem");
    const CLIENT_CERT_PEM: &str = include_str!("../testdata/tls/client-cert.pem");
    const CLIENT_KEY_PEM: &str = include_str!("../testdata/tls/client-key.pem");

    fn create_temp_file_with_content(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_bundle() {
        let ca = create_temp_file_with_content(CA_PEM);
        let cert = create_temp_file_with_content(CLIENT_CERT_PEM);
        let key = create_temp_file_with_content(CLIENT_KEY_PEM);

        let bundle = TlsBundle::load(&TlsFiles {
            ca: ca.path().to_path_buf(),
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        })
        .unwrap();

        assert_eq!(bundle.ca_pem, CA_PEM);
        assert!(bundle.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_unreadable_cert_path() {
        let ca = create_temp_file_with_content(CA_PEM);
        let key = create_temp_file_with_content(CLIENT_KEY_PEM);

        let err = TlsBundle::load(&TlsFiles {
            ca: ca.path().to_path_buf(),
            cert: PathBuf::from("/nonexistent/client-cert.pem"),
            key: key.path().to_path_buf(),
        })
        .unwrap_err();

        match err {
            TlsError::Unreadable { path, .. } => assert!(path.contains("client-cert.pem")),
            other => panic!("expected Unreadable, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_certificate_is_malformed() {
        let ca = create_temp_file_with_content("this is not a certificate");
        let cert = create_temp_file_with_content(CLIENT_CERT_PEM);
        let key = create_temp_file_with_content(CLIENT_KEY_PEM);

        let err = TlsBundle::load(&TlsFiles {
            ca: ca.path().to_path_buf(),
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        })
        .unwrap_err();

        assert!(matches!(err, TlsError::Malformed { .. }));
    }

    #[test]
    fn test_key_in_cert_slot_is_malformed() {
        let ca = create_temp_file_with_content(CA_PEM);
        let cert = create_temp_file_with_content(CLIENT_KEY_PEM);
        let key = create_temp_file_with_content(CLIENT_KEY_PEM);

        let err = TlsBundle::load(&TlsFiles {
            ca: ca.path().to_path_buf(),
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        })
        .unwrap_err();

        match err {
            TlsError::Malformed { reason, .. } => assert!(reason.contains("CERTIFICATE")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_cert_in_key_slot_is_malformed() {
        let ca = create_temp_file_with_content(CA_PEM);
        let cert = create_temp_file_with_content(CLIENT_CERT_PEM);
        let key = create_temp_file_with_content(CLIENT_CERT_PEM);

        let err = TlsBundle::load(&TlsFiles {
            ca: ca.path().to_path_buf(),
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
        })
        .unwrap_err();

        match err {
            TlsError::Malformed { reason, .. } => assert!(reason.contains("PRIVATE KEY")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_bundle_debug_hides_key() {
        let bundle = TlsBundle {
            ca_pem: "ca".to_string(),
            cert_pem: "cert".to_string(),
            key_pem: "secret-key".to_string(),
        };
        assert!(!format!("{bundle:?}").contains("secret-key"));
    }
}
