//! Certificate trust decisions for TLS connections.
//!
//! A [`TrustPolicy`] is turned into a [`TrustEvaluator`], a pure predicate
//! over the presented chain. [`PolicyVerifier`] plugs the evaluator into
//! rustls: it asks webpki for the standard verdict first, then consults the
//! evaluator once per certificate from the root-most one down to the end
//! entity. The handshake fails on the first rejection.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::Level;

use crate::config::{ClientOptions, DebugThreshold};
use crate::error::{Error, Result};

/// Initialize rustls crypto provider (must be called once before building configs)
pub(crate) fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// The chain presented by the server, positioned at the certificate
/// currently being evaluated.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    /// End entity first, as sent on the wire.
    certificates: Vec<CertificateDer<'static>>,
    depth: usize,
}

impl CertificateChain {
    pub fn new(certificates: Vec<CertificateDer<'static>>) -> Self {
        Self {
            certificates,
            depth: 0,
        }
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Position of the current certificate: 0 is the end entity.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn current(&self) -> Option<&CertificateDer<'static>> {
        self.certificates.get(self.depth)
    }

    pub fn end_entity(&self) -> Option<&CertificateDer<'static>> {
        self.certificates.first()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    fn at_depth(&mut self, depth: usize) {
        self.depth = depth;
    }
}

/// Predicate consulted by [`TrustPolicy::CustomCallback`]. The second
/// argument is the standard verification verdict.
pub type TrustPredicate = dyn Fn(&CertificateChain, bool) -> bool + Send + Sync;

/// Rules for accepting a server certificate chain.
#[derive(Clone, Default)]
pub enum TrustPolicy {
    /// Standard chain validation against the trust anchors plus a name check
    /// for the connection's TLS name.
    #[default]
    HostnameVerification,
    /// The predicate decides alone.
    CustomCallback(Arc<TrustPredicate>),
    /// **DANGEROUS**: accepts any chain. Only for development against
    /// servers with self-signed certificates.
    Disabled,
}

impl TrustPolicy {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&CertificateChain, bool) -> bool + Send + Sync + 'static,
    {
        TrustPolicy::CustomCallback(Arc::new(predicate))
    }
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::HostnameVerification => f.write_str("HostnameVerification"),
            TrustPolicy::CustomCallback(_) => f.write_str("CustomCallback(..)"),
            TrustPolicy::Disabled => f.write_str("Disabled"),
        }
    }
}

#[derive(Debug)]
pub struct TrustEvaluator {
    policy: TrustPolicy,
    tls_name: String,
}

impl TrustEvaluator {
    pub fn new(policy: TrustPolicy, tls_name: impl Into<String>) -> Self {
        Self {
            policy,
            tls_name: tls_name.into(),
        }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn tls_name(&self) -> &str {
        &self.tls_name
    }

    /// Accept or reject the certificate at `chain.depth()`.
    pub fn verify(&self, chain: &CertificateChain, preverified: bool) -> bool {
        match &self.policy {
            TrustPolicy::HostnameVerification => preverified,
            TrustPolicy::CustomCallback(predicate) => predicate(chain, preverified),
            TrustPolicy::Disabled => true,
        }
    }
}

/// rustls verifier that defers the accept/reject decision to a
/// [`TrustEvaluator`]. Handshake signatures are always checked.
#[derive(Debug)]
pub struct PolicyVerifier {
    evaluator: Arc<TrustEvaluator>,
    /// `None` when there are no trust anchors: nothing preverifies.
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    threshold: DebugThreshold,
}

impl PolicyVerifier {
    pub fn new(
        evaluator: Arc<TrustEvaluator>,
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
        threshold: DebugThreshold,
    ) -> Result<Self> {
        let webpki = if roots.is_empty() {
            if matches!(evaluator.policy(), TrustPolicy::HostnameVerification) {
                log_at!(
                    threshold,
                    Level::WARN,
                    tls_name = evaluator.tls_name(),
                    "No trust anchors available, every certificate will be rejected"
                );
            }
            None
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| {
                        Error::Configuration(format!("failed to build certificate verifier: {}", e))
                    })?;
            Some(verifier)
        };

        Ok(Self {
            evaluator,
            webpki,
            provider,
            threshold,
        })
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verdict = match &self.webpki {
            Some(webpki) => {
                webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        };
        let preverified = verdict.is_ok();

        let certificates = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|cert| cert.clone().into_owned())
            .collect();
        let mut chain = CertificateChain::new(certificates);

        for depth in (0..chain.len()).rev() {
            chain.at_depth(depth);
            if !self.evaluator.verify(&chain, preverified) {
                log_at!(
                    self.threshold,
                    Level::DEBUG,
                    tls_name = self.evaluator.tls_name(),
                    depth,
                    preverified,
                    "Certificate rejected by trust policy"
                );
                return Err(match verdict {
                    Err(e) => e,
                    Ok(_) => rustls::Error::InvalidCertificate(
                        CertificateError::ApplicationVerificationFailure,
                    ),
                });
            }
        }

        log_at!(
            self.threshold,
            Level::DEBUG,
            tls_name = self.evaluator.tls_name(),
            chain_len = chain.len(),
            preverified,
            "Certificate chain accepted"
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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

/// Trust anchors: the platform's native roots (if enabled) plus the
/// configured extra roots.
fn load_roots(options: &ClientOptions) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    if options.use_native_roots {
        let native_certs = rustls_native_certs::load_native_certs();
        for e in &native_certs.errors {
            log_at!(
                options.debug_threshold,
                Level::WARN,
                error = %e,
                "Failed to load some native root certificates"
            );
        }
        let (added, ignored) = roots.add_parsable_certificates(native_certs.certs);
        log_at!(
            options.debug_threshold,
            Level::DEBUG,
            added,
            ignored,
            "Loaded native root certificates"
        );
    }

    for cert in &options.extra_root_certificates {
        roots
            .add(cert.clone())
            .map_err(|e| Error::Configuration(format!("invalid root certificate: {}", e)))?;
    }

    Ok(roots)
}

/// Create a TLS connector whose certificate decisions go through `evaluator`.
pub fn create_tls_connector(
    evaluator: Arc<TrustEvaluator>,
    options: &ClientOptions,
) -> Result<TlsConnector> {
    init_crypto_provider();

    if matches!(evaluator.policy(), TrustPolicy::Disabled) {
        log_at!(
            options.debug_threshold,
            Level::WARN,
            tls_name = evaluator.tls_name(),
            "TLS certificate verification DISABLED"
        );
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = PolicyVerifier::new(
        evaluator,
        load_roots(options)?,
        provider,
        options.debug_threshold,
    )?;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
