use claudish_core::error::ProxyError;
use claudish_core::paths::{self, Paths};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Minimum remaining CA validity before it is regenerated on load.
const CA_RENEWAL_MARGIN_DAYS: i64 = 30;

const RSA_KEY_BITS: usize = 2048;

/// Generate an RSA-2048 signing key.
///
/// `rcgen` only generates ECDSA/Ed25519 keys itself, so the keypair is
/// produced externally and handed over as PKCS#8 DER.
fn generate_rsa_key_pair() -> Result<KeyPair, ProxyError> {
    let private_key = RsaPrivateKey::new(&mut rand_core::OsRng, RSA_KEY_BITS)
        .map_err(|e| ProxyError::Cert(format!("RSA key generation: {e}")))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Cert(format!("RSA key encoding: {e}")))?;
    KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(der.as_bytes()),
        &rcgen::PKCS_RSA_SHA256,
    )
    .map_err(|e| ProxyError::Cert(format!("RSA key import: {e}")))
}

/// A minted per-host certificate with both wire encodings.
pub struct LeafCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub not_after_unix: i64,
}

impl LeafCert {
    /// Build a rustls server context for this leaf, ALPN pinned to
    /// `http/1.1` so the decrypted stream stays parseable.
    pub fn build_server_config(&self) -> Result<ServerConfig, ProxyError> {
        let chain = vec![CertificateDer::from(self.cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ProxyError::Cert(format!("server context: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// The root CA: loaded from disk when present and valid, generated fresh
/// otherwise. Key material never leaves this struct.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
    not_after_unix: i64,
}

impl CertificateAuthority {
    pub fn load_or_create(paths: &Paths) -> Result<Self, ProxyError> {
        paths::ensure_private_dir(&paths.proxy_dir())?;
        paths::ensure_private_dir(&paths.certs_dir())?;

        let cert_path = paths.ca_cert();
        let key_path = paths.ca_key();

        if cert_path.exists() && key_path.exists() {
            match Self::load(paths) {
                Ok(ca) => return Ok(ca),
                Err(e) => {
                    tracing::warn!("stored CA unusable ({e}), regenerating");
                    let _ = std::fs::remove_file(&cert_path);
                    let _ = std::fs::remove_file(&key_path);
                }
            }
        }

        Self::generate(paths)
    }

    fn load(paths: &Paths) -> Result<Self, ProxyError> {
        let cert_pem = std::fs::read_to_string(paths.ca_cert())
            .map_err(|e| ProxyError::Cert(format!("read CA cert: {e}")))?;
        let key_pem = std::fs::read_to_string(paths.ca_key())
            .map_err(|e| ProxyError::Cert(format!("read CA key: {e}")))?;

        let ca_key = KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| ProxyError::Cert(format!("parse CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| ProxyError::Cert(format!("parse CA cert: {e}")))?;

        let not_after = params.not_after;
        if not_after < OffsetDateTime::now_utc() + Duration::days(CA_RENEWAL_MARGIN_DAYS) {
            return Err(ProxyError::Cert("CA expired or near expiry".to_string()));
        }

        // The fingerprint must describe the on-disk certificate, so hash
        // the stored DER rather than a re-signed copy.
        let ca_cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| ProxyError::Cert(format!("decode CA cert: {e}")))?
            .to_vec();

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::Cert(format!("rebuild CA cert: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            ca_cert_der,
            not_after_unix: not_after.unix_timestamp(),
        })
    }

    fn generate(paths: &Paths) -> Result<Self, ProxyError> {
        let ca_key = generate_rsa_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Claudish Proxy Root CA");
        dn.push(DnType::OrganizationName, "Claudish");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());

        let not_after_unix = params.not_after.unix_timestamp();
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::Cert(format!("CA generation: {e}")))?;

        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();

        paths::write_atomic(&paths.ca_key(), ca_key_pem.as_bytes(), 0o600)?;
        paths::write_atomic(&paths.ca_cert(), ca_cert_pem.as_bytes(), 0o644)?;
        tracing::info!("generated proxy root CA at {}", paths.ca_cert().display());

        let ca_cert_der = ca_cert.der().to_vec();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            ca_cert_der,
            not_after_unix,
        })
    }

    /// Mint a leaf for `host`: SAN carries exactly that DNS name, issuer
    /// is the CA subject, validity one year, random 8-byte serial.
    pub fn mint_leaf(&self, host: &str) -> Result<LeafCert, ProxyError> {
        let leaf_key = generate_rsa_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            Ia5String::try_from(host.to_string())
                .map_err(|e| ProxyError::Cert(format!("invalid hostname {host}: {e}")))?,
        )];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());

        let not_after_unix = params.not_after.unix_timestamp();
        let cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::Cert(format!("leaf for {host}: {e}")))?;

        Ok(LeafCert {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            cert_der: cert.der().to_vec(),
            key_der: leaf_key.serialize_der(),
            not_after_unix,
        })
    }

    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.ca_cert_der);
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn not_after_unix(&self) -> i64 {
        self.not_after_unix
    }
}

fn random_serial() -> SerialNumber {
    let bytes: [u8; 8] = rand::random();
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> (tempfile::TempDir, CertificateAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let ca = CertificateAuthority::load_or_create(&paths).unwrap();
        (dir, ca)
    }

    #[test]
    fn test_ca_structure() {
        let (_dir, ca) = authority();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        // Validity at least ten years out (minus the backdated day).
        let horizon = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS - 2);
        assert!(ca.not_after_unix() > horizon.unix_timestamp());
    }

    #[test]
    fn test_ca_files_restrictive_modes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let _ca = CertificateAuthority::load_or_create(&paths).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let key_mode =
                std::fs::metadata(paths.ca_key()).unwrap().permissions().mode() & 0o777;
            let cert_mode =
                std::fs::metadata(paths.ca_cert()).unwrap().permissions().mode() & 0o777;
            let dir_mode = std::fs::metadata(paths.certs_dir())
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(key_mode, 0o600);
            assert_eq!(cert_mode, 0o644);
            assert_eq!(dir_mode, 0o700);
        }
    }

    #[test]
    fn test_load_preserves_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let first = CertificateAuthority::load_or_create(&paths).unwrap();
        let second = CertificateAuthority::load_or_create(&paths).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_corrupt_ca_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_home(dir.path());
        let first = CertificateAuthority::load_or_create(&paths).unwrap();
        std::fs::write(paths.ca_key(), "not a key").unwrap();
        let second = CertificateAuthority::load_or_create(&paths).unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_leaf_validity_and_san() {
        let (_dir, ca) = authority();
        let leaf = ca.mint_leaf("api.anthropic.com").unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("PRIVATE KEY"));
        // At least eleven months of validity.
        let horizon = OffsetDateTime::now_utc() + Duration::days(330);
        assert!(leaf.not_after_unix > horizon.unix_timestamp());
    }

    #[test]
    fn test_keys_are_rsa_2048() {
        use rsa::pkcs8::DecodePrivateKey;

        let (_dir, ca) = authority();
        let leaf = ca.mint_leaf("a.example").unwrap();
        let key = RsaPrivateKey::from_pkcs8_der(&leaf.key_der)
            .expect("leaf key must parse as RSA");
        assert_eq!(rsa::traits::PublicKeyParts::size(&key) * 8, 2048);
    }

    #[test]
    fn test_leaf_serials_unique() {
        let (_dir, ca) = authority();
        let a = ca.mint_leaf("a.example").unwrap();
        let b = ca.mint_leaf("a.example").unwrap();
        // Fresh serial and key per mint.
        assert_ne!(a.cert_der, b.cert_der);
    }
}
