//! Certificate authority for TLS interception.
//!
//! The proxy owns a single root identity for its whole lifetime. On startup
//! the root is loaded from a PEM certificate/key pair on disk; if neither
//! file exists yet, a fresh root is generated and persisted so that a
//! once-trusted certificate keeps working across restarts. Every intercepted
//! HTTPS connection then gets a fresh leaf certificate for its target host,
//! signed by the root.
//!
//! Leaf certificates are deliberately not cached: issuing one per connection
//! keeps the authority stateless, at the cost of key generation latency on
//! each handshake.
//!
//! # Example
//!
//! ```ignore
//! use holdpoint::ca::CertificateAuthority;
//!
//! let ca = CertificateAuthority::open(&cert_path, &key_path)?;
//! let leaf = ca.issue_leaf("api.example.com")?;
//! ```

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType,
    SerialNumber,
};
use rand::Rng;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Root certificate validity (10 years).
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Leaf certificate validity (1 year).
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Errors from certificate authority operations.
#[derive(Debug, Error)]
pub enum CaError {
    /// Reading or writing the root PEM files failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key generation, signing, or parsing failed inside rcgen.
    #[error("certificate error: {0}")]
    Rcgen(#[from] rcgen::Error),

    /// An existing root certificate file did not parse as PEM.
    #[error("failed to parse root certificate: {0}")]
    ParseCertificate(String),

    /// Exactly one of the root certificate/key files exists on disk.
    #[error("inconsistent root state: {0}")]
    InconsistentState(String),
}

/// The proxy's root identity and leaf issuance.
///
/// Immutable after `open()`; the root key is only ever read, so the
/// authority is safe to share across connection tasks.
pub struct CertificateAuthority {
    /// Issuer built from the root params and key, used to sign leaves.
    issuer: Issuer<'static, KeyPair>,
    /// DER-encoded root certificate (appended to every leaf chain).
    cert_der: CertificateDer<'static>,
    /// PEM-encoded root certificate, exactly as on disk.
    cert_pem: String,
    /// PEM-encoded root private key, exactly as on disk.
    key_pem: String,
    /// Path of the persisted root certificate.
    cert_path: PathBuf,
}

/// A freshly issued per-host leaf identity.
///
/// Lives for a single TLS handshake/session and is never persisted.
pub struct LeafIdentity {
    /// The host the certificate was issued for.
    pub host: String,
    /// DER-encoded leaf certificate.
    pub cert_der: CertificateDer<'static>,
    /// DER-encoded PKCS#8 private key.
    pub key_der: Vec<u8>,
}

impl CertificateAuthority {
    /// Load the root identity from disk, or generate and persist a new one.
    ///
    /// Both files present: load them. Parse failure is an error, not a
    /// regeneration trigger; silently replacing a trusted root would strand
    /// the platform trust store. Both absent: generate a 2048-bit RSA root
    /// valid for ten years and write it out. One present without the other
    /// is an error.
    pub fn open(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => Self::load(cert_path, key_path),
            (false, false) => Self::generate(cert_path, key_path),
            (cert, _) => Err(CaError::InconsistentState(format!(
                "found {} without {}",
                if cert { "certificate" } else { "key" },
                if cert { "key" } else { "certificate" },
            ))),
        }
    }

    fn generate(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        info!("Generating root CA certificate");

        let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("Holdpoint Proxy CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Holdpoint Proxy".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        let cert_der = cert.der().clone();

        if let Some(parent) = cert_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, &key_pem)?;

        debug!("Root CA written to {:?} / {:?}", cert_path, key_path);

        Ok(Self {
            issuer: Issuer::new(params, key_pair),
            cert_der,
            cert_pem,
            key_pem,
            cert_path: cert_path.to_path_buf(),
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        info!("Loading root CA certificate from {:?}", cert_path);

        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let cert_der =
            CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|e| {
                CaError::ParseCertificate(format!("{}: {e:?}", cert_path.display()))
            })?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            key_pem,
            cert_path: cert_path.to_path_buf(),
        })
    }

    /// Issue a fresh leaf certificate for `host`, signed by the root.
    ///
    /// An IP literal gets an IP subject-alternative-name entry, anything
    /// else a DNS entry, never both. No state is touched; every call
    /// generates a new key and a new random 128-bit serial.
    pub fn issue_leaf(&self, host: &str) -> Result<LeafIdentity, CaError> {
        debug!("Issuing leaf certificate for {}", host);

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Holdpoint Proxy".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut serial = [0u8; 16];
        rand::thread_rng().fill(&mut serial[..]);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into()?));
        }

        let cert = params.signed_by(&key_pair, &self.issuer)?;

        Ok(LeafIdentity {
            host: host.to_string(),
            cert_der: cert.der().clone(),
            key_der: key_pair.serialize_der(),
        })
    }

    /// Path of the persisted root certificate, for trust-store seeding.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// PEM-encoded root certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded root private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// DER-encoded root certificate.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

/// Platform trust-store seam.
///
/// Installing the root certificate into the OS or browser trust store is an
/// external collaborator's job (it needs platform tooling and possibly
/// elevation). The core only calls through this trait once, near CA init.
pub trait TrustStore: Send + Sync {
    /// Whether the certificate at `cert_path` is already trusted.
    fn is_trusted(&self, cert_path: &Path) -> bool;

    /// Install the certificate at `cert_path` into the trust store.
    fn install(&self, cert_path: &Path) -> Result<(), CaError>;
}

/// Trust-store implementation that only reports the certificate path.
///
/// Used when no platform integration is wired in; the operator (or an
/// external launcher) installs the certificate with their own tooling.
pub struct LogOnlyTrustStore;

impl TrustStore for LogOnlyTrustStore {
    fn is_trusted(&self, _cert_path: &Path) -> bool {
        false
    }

    fn install(&self, cert_path: &Path) -> Result<(), CaError> {
        info!(
            "Root certificate at {:?} must be trusted by the client; install is delegated to platform tooling",
            cert_path
        );
        Ok(())
    }
}
