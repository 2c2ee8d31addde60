//! # Certificates
//!
//! Two independent credentials, both living in the state directory:
//!
//! - the **server** keypair (`server.{crt,key}`) — stable per node,
//!   generated on first start, presented as the *client* certificate
//!   when this member calls its peers;
//! - the **cluster** keypair (`cluster.{crt,key}`, optional sibling
//!   `cluster.ca` / `cluster.crl`) — shared by every member, presented
//!   by every network listener, rotated by rewriting the files and
//!   calling [`CertHolder::reload_cluster`].
//!
//! ## TLS Assembly
//!
//! All rustls construction lives here:
//!
//! - [`KeyPairInfo::server_config`] — listener config with the cluster
//!   (or pre-init server) identity. Client certificates are requested
//!   but not chain-validated; trust is enforced per request against
//!   the trust store, which is what actually knows the membership.
//! - [`client_config`] — peer-call config: presents the server
//!   keypair, pins the remote end to the exact cluster certificate
//!   (whole-DER comparison, no PKI walk). Every member holds the same
//!   cluster certificate, so pinning is both necessary and sufficient.
//!
//! Fingerprints are `SHA-256(cert_der)` in lowercase hex.

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::CertError;
use crate::layout::{
    OsLayout, CLUSTER_CERT_FILE, CLUSTER_KEY_FILE, SERVER_CERT_FILE, SERVER_KEY_FILE,
};

/// Installs the process-wide rustls crypto provider. Safe to call more
/// than once; later calls are ignored.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

// ════════════════════════════════════════════════════════════════════════════
// KEYPAIR MATERIAL
// ════════════════════════════════════════════════════════════════════════════

/// An X.509 keypair plus optional CA chain and CRL, with the leaf
/// certificate pre-parsed for fingerprinting and pinning.
///
/// Immutable once constructed; shared as `Arc<KeyPairInfo>` so readers
/// never alias the holder's lock.
#[derive(Clone)]
pub struct KeyPairInfo {
    cert_pem: String,
    key_pem: String,
    ca_pem: Option<String>,
    crl_pem: Option<String>,
    leaf_der: Vec<u8>,
    fingerprint: String,
}

impl KeyPairInfo {
    /// Loads a keypair from PEM files, plus `.ca`/`.crl` siblings of
    /// the certificate when present.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert_pem = read_pem(cert_path)?;
        let key_pem = read_pem(key_path)?;
        let ca_pem = read_optional_pem(&cert_path.with_extension("ca"))?;
        let crl_pem = read_optional_pem(&cert_path.with_extension("crl"))?;
        Self::from_pem(cert_pem, key_pem, ca_pem, crl_pem)
    }

    /// Builds a keypair from in-memory PEM strings.
    pub fn from_pem(
        cert_pem: String,
        key_pem: String,
        ca_pem: Option<String>,
        crl_pem: Option<String>,
    ) -> Result<Self, CertError> {
        let leaf_der = leaf_der_from_pem(&cert_pem)?;
        let fingerprint = fingerprint_hex(&leaf_der);
        Ok(Self { cert_pem, key_pem, ca_pem, crl_pem, leaf_der, fingerprint })
    }

    /// Generates a self-signed keypair and persists it: certificate
    /// 0644, key 0600, both fsynced.
    pub fn generate(
        common_name: &str,
        subject_alt_names: &[String],
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self, CertError> {
        let key_pair =
            rcgen::KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(subject_alt_names.to_vec())
            .map_err(|e| CertError::Generate(e.to_string()))?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::Generate(e.to_string()))?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        write_pem(cert_path, &cert_pem, 0o644)?;
        write_pem(key_path, &key_pem, 0o600)?;

        Self::from_pem(cert_pem, key_pem, None, None)
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn ca_pem(&self) -> Option<&str> {
        self.ca_pem.as_deref()
    }

    pub fn crl_pem(&self) -> Option<&str> {
        self.crl_pem.as_deref()
    }

    /// DER bytes of the leaf certificate.
    pub fn leaf_der(&self) -> &[u8] {
        &self.leaf_der
    }

    /// `SHA-256(leaf_der)` in lowercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn cert_chain(&self) -> Result<Vec<CertificateDer<'static>>, CertError> {
        let mut reader = std::io::Cursor::new(self.cert_pem.as_bytes());
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Parse(e.to_string()))
    }

    fn private_key(&self) -> Result<PrivateKeyDer<'static>, CertError> {
        let mut reader = std::io::Cursor::new(self.key_pem.as_bytes());
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| CertError::Parse(e.to_string()))?
            .ok_or_else(|| CertError::Parse("no private key in PEM".into()))
    }

    /// Listener-side TLS configuration presenting this keypair.
    pub fn server_config(&self) -> Result<rustls::ServerConfig, CertError> {
        let provider = provider();
        let verifier = Arc::new(AcceptAnyClient { provider: Arc::clone(&provider) });

        rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| CertError::Tls(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain()?, self.private_key()?)
            .map_err(|e| CertError::Tls(e.to_string()))
    }
}

impl fmt::Debug for KeyPairInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("KeyPairInfo")
            .field("fingerprint", &self.fingerprint)
            .field("has_ca", &self.ca_pem.is_some())
            .field("has_crl", &self.crl_pem.is_some())
            .finish()
    }
}

/// Peer-call TLS configuration: presents `identity` (the server
/// keypair) as the client certificate and accepts exactly the pinned
/// cluster certificate from the remote end.
pub fn client_config(
    identity: &KeyPairInfo,
    pinned_cluster: &KeyPairInfo,
) -> Result<rustls::ClientConfig, CertError> {
    let provider = provider();
    let verifier = Arc::new(PinnedServerVerifier {
        pinned_der: pinned_cluster.leaf_der().to_vec(),
        provider: Arc::clone(&provider),
    });

    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CertError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(identity.cert_chain()?, identity.private_key()?)
        .map_err(|e| CertError::Tls(e.to_string()))
}

/// Computes `SHA-256(der)` as lowercase hex.
pub fn fingerprint_hex(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Extracts and validates the first certificate in a PEM bundle,
/// returning its DER bytes.
pub fn leaf_der_from_pem(pem: &str) -> Result<Vec<u8>, CertError> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| CertError::Parse(e.to_string()))?;
    x509_parser::parse_x509_certificate(&parsed.contents)
        .map_err(|e| CertError::Parse(e.to_string()))?;
    Ok(parsed.contents)
}

// ════════════════════════════════════════════════════════════════════════════
// CERTIFICATE HOLDER
// ════════════════════════════════════════════════════════════════════════════

/// Owns the node's two credentials. The server keypair is loaded once;
/// the cluster keypair is swapped under a write lock on reload and
/// handed out as fresh `Arc` clones.
pub struct CertHolder {
    state_dir: PathBuf,
    server: Arc<KeyPairInfo>,
    cluster: RwLock<Option<Arc<KeyPairInfo>>>,
}

impl CertHolder {
    /// Loads `server.{crt,key}`, generating a self-signed pair on
    /// first start. An already-present cluster keypair is loaded too
    /// (restart of a bootstrapped node).
    pub fn new(layout: &OsLayout, name: &str) -> Result<Self, CertError> {
        let state_dir = layout.state_dir().to_path_buf();
        let cert_path = state_dir.join(SERVER_CERT_FILE);
        let key_path = state_dir.join(SERVER_KEY_FILE);

        let server = if cert_path.exists() && key_path.exists() {
            KeyPairInfo::load(&cert_path, &key_path)?
        } else {
            tracing::info!(name, "generating server certificate");
            let sans = vec![name.to_string(), "127.0.0.1".to_string(), "::1".to_string()];
            KeyPairInfo::generate(name, &sans, &cert_path, &key_path)?
        };

        let cluster_path = state_dir.join(CLUSTER_CERT_FILE);
        let cluster = if cluster_path.exists() {
            Some(Arc::new(KeyPairInfo::load(
                &cluster_path,
                &state_dir.join(CLUSTER_KEY_FILE),
            )?))
        } else {
            None
        };

        Ok(Self {
            state_dir,
            server: Arc::new(server),
            cluster: RwLock::new(cluster),
        })
    }

    pub fn server(&self) -> Arc<KeyPairInfo> {
        Arc::clone(&self.server)
    }

    /// The current cluster keypair, or [`CertError::ClusterNotLoaded`]
    /// before bootstrap/join.
    pub fn cluster(&self) -> Result<Arc<KeyPairInfo>, CertError> {
        self.cluster
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(CertError::ClusterNotLoaded)
    }

    /// Generates `cluster.{crt,key}` if absent (bootstrap path). Does
    /// not touch the in-memory copy; callers follow up with
    /// [`Self::reload_cluster`].
    pub fn ensure_cluster_on_disk(&self, name: &str) -> Result<(), CertError> {
        let cert_path = self.state_dir.join(CLUSTER_CERT_FILE);
        let key_path = self.state_dir.join(CLUSTER_KEY_FILE);
        if cert_path.exists() && key_path.exists() {
            return Ok(());
        }

        tracing::info!(name, "generating cluster certificate");
        let sans = vec![name.to_string(), "127.0.0.1".to_string(), "::1".to_string()];
        KeyPairInfo::generate(name, &sans, &cert_path, &key_path)?;
        Ok(())
    }

    /// Re-reads the cluster keypair from disk and swaps it in. Joining
    /// nodes must have received the files out-of-band before this is
    /// called.
    pub fn reload_cluster(&self) -> Result<Arc<KeyPairInfo>, CertError> {
        let cert_path = self.state_dir.join(CLUSTER_CERT_FILE);
        let key_path = self.state_dir.join(CLUSTER_KEY_FILE);
        if !cert_path.exists() {
            return Err(CertError::Missing(cert_path));
        }

        let fresh = Arc::new(KeyPairInfo::load(&cert_path, &key_path)?);
        *self.cluster.write() = Some(Arc::clone(&fresh));
        Ok(fresh)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VERIFIERS
// ════════════════════════════════════════════════════════════════════════════

/// Requests a client certificate but accepts any; per-request handlers
/// compare the presented fingerprint against the trust store.
#[derive(Debug)]
struct AcceptAnyClient {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClient {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts exactly one server certificate: the shared cluster cert,
/// compared by whole DER. Hostname and chain are irrelevant because
/// the certificate is distributed out-of-band to every member.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned_der: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned_der.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FILE I/O
// ════════════════════════════════════════════════════════════════════════════

fn read_pem(path: &Path) -> Result<String, CertError> {
    if !path.exists() {
        return Err(CertError::Missing(path.to_path_buf()));
    }

    fs::read_to_string(path)
        .map_err(|e| CertError::Io { path: path.to_path_buf(), message: e.to_string() })
}

fn read_optional_pem(path: &Path) -> Result<Option<String>, CertError> {
    if !path.exists() {
        return Ok(None);
    }

    read_pem(path).map(Some)
}

fn write_pem(path: &Path, pem: &str, mode: u32) -> Result<(), CertError> {
    let io_err =
        |e: std::io::Error| CertError::Io { path: path.to_path_buf(), message: e.to_string() };

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(pem.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err)?;
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
