use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, ProtocolVersion, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use thiserror::Error;

use ftgate_core::TlsVersion;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to load PEM material from {path}: {detail}")]
    PemRead { path: PathBuf, detail: String },
    #[error("certificate file {path} contains no certificates")]
    EmptyCertificateChain { path: PathBuf },
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("invalid TLS server name {name:?}")]
    InvalidServerName { name: String },
}

pub fn supported_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Vec<&'static SupportedProtocolVersion> {
    [TlsVersion::Tls12, TlsVersion::Tls13]
        .into_iter()
        .filter(|version| *version >= min && *version <= max)
        .map(as_supported)
        .collect()
}

fn as_supported(version: TlsVersion) -> &'static SupportedProtocolVersion {
    match version {
        TlsVersion::Tls12 => &rustls::version::TLS12,
        TlsVersion::Tls13 => &rustls::version::TLS13,
    }
}

pub fn tls_version_from_protocol(protocol: ProtocolVersion) -> Option<TlsVersion> {
    match protocol {
        ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
        ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
        _ => None,
    }
}

pub fn load_server_config(
    cert_file: &Path,
    key_file: &Path,
    min: TlsVersion,
    max: TlsVersion,
) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let chain = CertificateDer::pem_file_iter(cert_file)
        .map_err(|error| TlsSetupError::PemRead {
            path: cert_file.to_path_buf(),
            detail: error.to_string(),
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| TlsSetupError::PemRead {
            path: cert_file.to_path_buf(),
            detail: error.to_string(),
        })?;
    if chain.is_empty() {
        return Err(TlsSetupError::EmptyCertificateChain {
            path: cert_file.to_path_buf(),
        });
    }

    let key = PrivateKeyDer::from_pem_file(key_file).map_err(|error| TlsSetupError::PemRead {
        path: key_file.to_path_buf(),
        detail: error.to_string(),
    })?;

    let config = ServerConfig::builder_with_protocol_versions(&supported_versions(min, max))
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

pub fn origin_client_config(min: TlsVersion, max: TlsVersion) -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_protocol_versions(&supported_versions(min, max))
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipOriginVerification))
        .with_no_client_auth();
    Arc::new(config)
}

pub fn pinned_origin_client_config(version: TlsVersion) -> Arc<ClientConfig> {
    origin_client_config(version, version)
}

pub fn origin_server_name(host: &str) -> Result<ServerName<'static>, TlsSetupError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsSetupError::InvalidServerName {
        name: host.to_string(),
    })
}

// Origin certificates are never verified; the backend is operator-controlled.
#[derive(Debug)]
struct SkipOriginVerification;

impl ServerCertVerifier for SkipOriginVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
