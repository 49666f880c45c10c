//! TLS support (feature-gated).
//!
//! TLS is negotiated by sending an `SSLRequest` before the startup message
//! and then upgrading the TCP stream in place with rustls.
//!
//! The upgraded stream can be cloned into a read handle and a write handle.
//! COPY and LISTEN read the socket from a background thread while the
//! foreground keeps writing, so the rustls session sits behind a mutex and
//! blocking socket reads happen outside of it.

#![allow(clippy::result_large_err)]

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use kbwire_core::Error;
use kbwire_core::error::{ConnectionError, ConnectionErrorKind};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, Error as RustlsError,
    RootCertStore, SignatureScheme,
};

use crate::config::{KbConfig, SslMode};

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    host.to_string()
        .try_into()
        .map_err(|e| tls_error(format!("Invalid server name '{host}': {e}")))
}

// ==================== Client Config ====================

/// Build a rustls `ClientConfig` for the configured SSL mode.
///
/// - `NoVerify`: encrypt, accept any certificate
/// - `VerifyCa`: validate the chain against the root pool, ignore the host name
/// - `VerifyFull`: validate the chain and the host name
///
/// The root pool is `sslrootcert` when set, the webpki roots otherwise.
pub(crate) fn build_client_config(config: &KbConfig) -> Result<ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {e}")))?;

    let builder = match config.ssl_mode {
        SslMode::Disable => {
            return Err(tls_error("TLS config requested with SslMode::Disable"));
        }
        SslMode::NoVerify => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier)),
        SslMode::VerifyCa => {
            let roots = Arc::new(root_store(config.ssl_root_cert.as_deref())?);
            let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| tls_error(format!("Failed to build certificate verifier: {e}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier { inner }))
        }
        SslMode::VerifyFull => {
            builder.with_root_certificates(root_store(config.ssl_root_cert.as_deref())?)
        }
    };

    match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = load_private_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error(format!("Invalid client certificate: {e}")))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(tls_error("sslcert and sslkey must be set together")),
    }
}

fn root_store(path: Option<&Path>) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    match path {
        Some(path) => {
            let (added, _ignored) = roots.add_parsable_certificates(load_certs(path)?);
            if added == 0 {
                return Err(tls_error(format!(
                    "no usable certificates in {}",
                    path.display()
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(open_pem(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(open_pem(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(format!("Failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| tls_error(format!("no private key in {}", path.display())))
}

fn open_pem(path: &Path) -> Result<File, Error> {
    File::open(path).map_err(|e| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Ssl,
            message: format!("Failed to open {}: {e}", path.display()),
            source: Some(Box::new(e)),
        })
    })
}

// ==================== Verifiers ====================

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Full chain validation with the host-name check removed.
///
/// webpki checks the chain before the name, so a name mismatch can only be
/// reported for a certificate whose chain already verified.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(RustlsError::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ==================== Stream ====================

struct Session {
    conn: ClientConnection,
    /// Write half of the socket; only touched under the lock
    sock: TcpStream,
}

/// A TLS session over TCP that can be cloned into read and write handles.
///
/// At most one handle may read at a time; any number may write.
pub(crate) struct TlsStream {
    session: Arc<Mutex<Session>>,
    /// Read half of the socket; blocking reads happen without the lock
    sock: TcpStream,
    scratch: Box<[u8]>,
}

impl TlsStream {
    /// Run the handshake over `tcp` and return the established session.
    pub(crate) fn connect(mut tcp: TcpStream, config: &KbConfig) -> Result<Self, Error> {
        let client_config = build_client_config(config)?;
        let mut conn = ClientConnection::new(Arc::new(client_config), server_name(&config.host)?)
            .map_err(|e| tls_error(format!("Failed to create TLS connection: {e}")))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Ssl,
                    message: format!("TLS handshake failed: {e}"),
                    source: Some(Box::new(e)),
                })
            })?;
        }

        let write_half = tcp.try_clone()?;
        Ok(Self {
            session: Arc::new(Mutex::new(Session {
                conn,
                sock: write_half,
            })),
            sock: tcp,
            scratch: vec![0u8; 16 * 1024].into_boxed_slice(),
        })
    }

    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            session: Arc::clone(&self.session),
            sock: self.sock.try_clone()?,
            scratch: vec![0u8; self.scratch.len()].into_boxed_slice(),
        })
    }

    pub(crate) fn tcp(&self) -> &TcpStream {
        &self.sock
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        self.sock.shutdown(Shutdown::Both)
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| io::Error::other("TLS session lock poisoned"))
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut session = self.lock()?;
                match session.conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            let n = self.sock.read(&mut self.scratch)?;
            let mut session = self.lock()?;
            let Session { conn, sock } = &mut *session;
            if n == 0 {
                // Peer closed without close_notify
                return Ok(0);
            }
            let mut incoming = &self.scratch[..n];
            while !incoming.is_empty() {
                conn.read_tls(&mut incoming)?;
                conn.process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            // Key updates and alerts produced while reading
            while conn.wants_write() {
                conn.write_tls(sock)?;
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut session = self.lock()?;
        let Session { conn, sock } = &mut *session;
        conn.writer().write_all(buf)?;
        while conn.wants_write() {
            conn.write_tls(sock)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut session = self.lock()?;
        let Session { conn, sock } = &mut *session;
        conn.writer().flush()?;
        while conn.wants_write() {
            conn.write_tls(sock)?;
        }
        sock.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: SslMode) -> KbConfig {
        KbConfig::new("db.example.com", "system", "test").ssl_mode(mode)
    }

    #[test]
    fn test_disable_has_no_client_config() {
        let err = build_client_config(&config(SslMode::Disable)).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Ssl,
                ..
            })
        ));
    }

    #[test]
    fn test_verifying_modes_build() {
        for mode in [SslMode::NoVerify, SslMode::VerifyCa, SslMode::VerifyFull] {
            assert!(build_client_config(&config(mode)).is_ok(), "{mode:?}");
        }
    }

    #[test]
    fn test_missing_root_cert_file() {
        let cfg = config(SslMode::VerifyFull).ssl_root_cert("/nonexistent/kbwire/root.crt");
        let err = build_client_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("root.crt"));
    }

    #[test]
    fn test_empty_root_cert_file() {
        let path = std::env::temp_dir().join(format!("kbwire-empty-{}.pem", std::process::id()));
        std::fs::write(&path, b"not a certificate\n").unwrap();
        let err = build_client_config(&config(SslMode::VerifyCa).ssl_root_cert(&path)).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad host name").is_err());
    }
}
