use crate::c2::C2Error;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ED25519};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

/// Key algorithm for the ephemeral listener certificate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum KeyKind {
    #[default]
    EcdsaP256,
    Ed25519,
}

impl KeyKind {
    pub fn from_name(name: &str) -> Option<KeyKind> {
        match name.to_lowercase().as_str() {
            "ecdsa" | "ecdsa-p256" => Some(KeyKind::EcdsaP256),
            "ed25519" => Some(KeyKind::Ed25519),
            _ => None,
        }
    }
}

/// Self-signed certificate generated fresh for one server lifetime.
/// Emulated TLS protocols only need a certificate that exists, not one
/// that chains anywhere.
pub struct EphemeralCertificate {
    pub cert_pem: String,
    #[allow(dead_code)]
    pub key_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
}

impl EphemeralCertificate {
    pub fn generate(kind: KeyKind) -> Result<Self, C2Error> {
        let key_pair = match kind {
            KeyKind::EcdsaP256 => KeyPair::generate()?,
            KeyKind::Ed25519 => KeyPair::generate_for(&PKCS_ED25519)?,
        };

        let mut params =
            CertificateParams::new(vec!["localhost".to_string()])?;
        params
            .distinguished_name
            .push(DnType::OrganizationName, "mockingbird");

        let cert = params.self_signed(&key_pair)?;

        Ok(EphemeralCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        })
    }

    /// Build a rustls server configuration carrying this certificate.
    pub fn server_config(&self) -> Result<ServerConfig, C2Error> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![self.cert_der.clone()],
                PrivateKeyDer::Pkcs8(self.key_der.clone_key()),
            )?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_kind_names() {
        assert_eq!(KeyKind::from_name("ecdsa"), Some(KeyKind::EcdsaP256));
        assert_eq!(KeyKind::from_name("ED25519"), Some(KeyKind::Ed25519));
        assert_eq!(KeyKind::from_name("rsa-4096"), None);
    }

    #[test]
    fn test_generate_produces_pem_pair() {
        let cert = EphemeralCertificate::generate(KeyKind::EcdsaP256).unwrap();

        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_certificates_are_unique_per_generation() {
        let a = EphemeralCertificate::generate(KeyKind::EcdsaP256).unwrap();
        let b = EphemeralCertificate::generate(KeyKind::EcdsaP256).unwrap();

        assert_ne!(a.cert_pem, b.cert_pem);
    }

    #[test]
    fn test_server_config_builds() {
        let cert = EphemeralCertificate::generate(KeyKind::EcdsaP256).unwrap();
        assert!(cert.server_config().is_ok());
    }

    #[test]
    fn test_ed25519_server_config_builds() {
        let cert = EphemeralCertificate::generate(KeyKind::Ed25519).unwrap();
        assert!(cert.server_config().is_ok());
    }
}
