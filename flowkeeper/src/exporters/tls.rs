use std::{fs, io::BufReader, path::Path, sync::Arc};

use rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use rustls_pemfile::{certs, private_key};
use tracing::{debug, warn};

use crate::exporters::{ExportError, opts::KafkaTlsConf};

fn load_certs_from_pem(path: &Path) -> Result<Vec<CertificateDer<'static>>, ExportError> {
    let file = fs::File::open(path).map_err(|e| {
        ExportError::Tls(format!(
            "failed to open certificate file '{}': {e}",
            path.display()
        ))
    })?;
    let mut reader = BufReader::new(file);

    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ExportError::Tls(format!(
                "failed to parse certificates from '{}': {e}",
                path.display()
            ))
        })
}

fn load_private_key_from_pem(path: &Path) -> Result<PrivateKeyDer<'static>, ExportError> {
    let file = fs::File::open(path).map_err(|e| {
        ExportError::Tls(format!(
            "failed to open private key file '{}': {e}",
            path.display()
        ))
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| {
            ExportError::Tls(format!(
                "failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| ExportError::Tls(format!("no private key found in '{}'", path.display())))
}

/// Skips chain and hostname checks but still verifies handshake signatures.
/// Only reachable through `insecure_skip_verify`.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Builds the client TLS configuration for the Kafka brokers.
///
/// Trust anchors come from `ca_cert_path` when set, the system store otherwise.
/// A client certificate and key enable mutual TLS.
pub fn client_config(conf: &KafkaTlsConf) -> Result<Arc<ClientConfig>, ExportError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ExportError::Tls(format!("failed to configure tls protocol versions: {e}")))?;

    let builder = if conf.insecure_skip_verify {
        warn!(
            event.name = "exporter.kafka.insecure_mode_enabled",
            security.risk = "man-in-the-middle",
            "kafka tls certificate verification is disabled. Do not use in production."
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
    } else {
        builder.with_root_certificates(root_store(conf.ca_cert_path.as_deref())?)
    };

    let config = match (&conf.user_cert_path, &conf.user_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let client_certs = load_certs_from_pem(cert_path)?;
            if client_certs.is_empty() {
                return Err(ExportError::Tls(format!(
                    "no valid certificates found in client certificate file '{}'",
                    cert_path.display()
                )));
            }
            debug!(
                event.name = "exporter.kafka.mtls_loaded",
                certificates = client_certs.len(),
                "loaded client certificate for mutual tls"
            );
            let client_key = load_private_key_from_pem(key_path)?;
            builder
                .with_client_auth_cert(client_certs, client_key)
                .map_err(|e| {
                    ExportError::Tls(format!("failed to configure client certificate: {e}"))
                })?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ExportError::Tls(
                "both user_cert_path and user_key_path must be provided for mutual tls".to_string(),
            ));
        }
    };

    Ok(Arc::new(config))
}

fn root_store(ca_cert_path: Option<&Path>) -> Result<RootCertStore, ExportError> {
    let mut store = RootCertStore::empty();

    match ca_cert_path {
        Some(path) => {
            for cert in load_certs_from_pem(path)? {
                store.add(cert).map_err(|e| {
                    ExportError::Tls(format!(
                        "failed to add ca certificate from '{}': {e}",
                        path.display()
                    ))
                })?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            if let Some(err) = native.errors.first() {
                warn!(
                    event.name = "exporter.kafka.system_certs_partial",
                    error = %err,
                    "some system certificates failed to load"
                );
            }
            let (added, _ignored) = store.add_parsable_certificates(native.certs);
            debug!(
                event.name = "exporter.kafka.system_certs_loaded",
                certificates = added,
                "loaded system root certificates"
            );
        }
    }

    if store.is_empty() {
        return Err(ExportError::Tls(
            "no trusted ca certificate available, set kafka.tls.ca_cert_path".to_string(),
        ));
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "not a pem bundle").expect("write");

        let conf = KafkaTlsConf {
            enable: true,
            ca_cert_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(client_config(&conf), Err(ExportError::Tls(_))));
    }

    #[test]
    fn insecure_mode_needs_no_trust_anchors() {
        let conf = KafkaTlsConf {
            enable: true,
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(client_config(&conf).is_ok());
    }

    #[test]
    fn half_configured_mtls_is_rejected() {
        let conf = KafkaTlsConf {
            enable: true,
            insecure_skip_verify: true,
            user_cert_path: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        assert!(matches!(client_config(&conf), Err(ExportError::Tls(_))));
    }
}
