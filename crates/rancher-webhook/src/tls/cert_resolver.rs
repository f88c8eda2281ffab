use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwapOption;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio_rustls::rustls::{
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use x509_cert::{Certificate, der::Decode};

use crate::constants::{TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

type Result<T, E = CertificateResolverError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CertificateResolverError {
    #[snafu(display("secret {secret:?} has no {key:?} entry"))]
    MissingSecretData { secret: String, key: &'static str },

    #[snafu(display("failed to parse PEM encoded certificate chain"))]
    ParseCertificatePem {
        source: tokio_rustls::rustls::pki_types::pem::Error,
    },

    #[snafu(display("the certificate chain is empty"))]
    EmptyCertificateChain,

    #[snafu(display("failed to parse PEM encoded private key"))]
    ParsePrivateKeyPem {
        source: tokio_rustls::rustls::pki_types::pem::Error,
    },

    #[snafu(display("failed to decode leaf certificate"))]
    DecodeLeafCertificate { source: x509_cert::der::Error },

    #[snafu(display("the leaf certificate expired {expired_for:?} ago"))]
    ExpiredCertificate { expired_for: Duration },

    #[snafu(display("failed to decode CertifiedKey from DER"))]
    DecodeCertifiedKeyFromDer { source: tokio_rustls::rustls::Error },
}

/// This struct serves as [`ResolvesServerCert`] to always hand out the current certificate for TLS
/// client connections.
///
/// The certificate is swapped whenever the serving certificate secret changes, see
/// [`Self::load_from_secret`]. Until the first certificate is loaded every handshake fails.
#[derive(Debug)]
pub struct CertificateResolver {
    /// Using a [`ArcSwapOption`] (over e.g. [`tokio::sync::RwLock`]), so that the synchronous
    /// TLS handshake never waits on a writer.
    current_certified_key: ArcSwapOption<CertifiedKey>,
    provider: Arc<CryptoProvider>,

    /// The lifetime the certificate issuer is expected to use.
    expected_lifetime: Duration,
}

impl CertificateResolver {
    pub fn new(provider: Arc<CryptoProvider>, certificate_expiration_days: u32) -> Self {
        Self {
            current_certified_key: ArcSwapOption::empty(),
            provider,
            expected_lifetime: Duration::from_secs(
                u64::from(certificate_expiration_days) * SECONDS_PER_DAY,
            ),
        }
    }

    pub fn has_certificate(&self) -> bool {
        self.current_certified_key.load().is_some()
    }

    /// Loads the certificate chain and private key stored in a `kubernetes.io/tls` secret.
    pub fn load_from_secret(&self, secret: &Secret) -> Result<()> {
        let data = secret.data.as_ref();
        let entry = |key: &'static str| {
            data.and_then(|data| data.get(key))
                .filter(|value| !value.0.is_empty())
                .with_context(|| MissingSecretDataSnafu {
                    secret: secret.name_any(),
                    key,
                })
        };

        let certificate_pem = entry(TLS_CERT_KEY)?;
        let private_key_pem = entry(TLS_PRIVATE_KEY_KEY)?;

        self.load_pem(&certificate_pem.0, &private_key_pem.0)
    }

    /// Parses and validates a PEM encoded certificate chain and private key and, if both are
    /// valid, hands them out for all following handshakes.
    pub fn load_pem(&self, certificate_pem: &[u8], private_key_pem: &[u8]) -> Result<()> {
        let chain = CertificateDer::pem_slice_iter(certificate_pem)
            .collect::<Result<Vec<_>, _>>()
            .context(ParseCertificatePemSnafu)?;
        let leaf = chain.first().context(EmptyCertificateChainSnafu)?;
        let private_key = PrivateKeyDer::from_pem_slice(private_key_pem)
            .context(ParsePrivateKeyPemSnafu)?;

        let leaf = Certificate::from_der(leaf.as_ref()).context(DecodeLeafCertificateSnafu)?;
        let validity = Validity::of(&leaf);
        validity.ensure_not_expired(unix_now())?;

        if let Some(lifetime) = validity.shorter_than(self.expected_lifetime) {
            tracing::warn!(
                lifetime_days = lifetime.as_secs() / SECONDS_PER_DAY,
                expected_days = self.expected_lifetime.as_secs() / SECONDS_PER_DAY,
                "serving certificate is valid for a shorter period than configured"
            );
        }

        let certified_key = CertifiedKey::from_der(chain, private_key, &self.provider)
            .context(DecodeCertifiedKeyFromDerSnafu)?;

        self.current_certified_key.store(Some(Arc::new(certified_key)));
        tracing::info!("loaded serving certificate");

        Ok(())
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let certified_key = self.current_certified_key.load_full();
        if certified_key.is_none() {
            tracing::debug!("rejecting TLS handshake, no serving certificate loaded yet");
        }
        certified_key
    }
}

/// Validity period of a certificate as durations since the UNIX epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Validity {
    not_before: Duration,
    not_after: Duration,
}

impl Validity {
    fn of(certificate: &Certificate) -> Self {
        let validity = &certificate.tbs_certificate.validity;
        Self {
            not_before: validity.not_before.to_unix_duration(),
            not_after: validity.not_after.to_unix_duration(),
        }
    }

    fn ensure_not_expired(&self, now: Duration) -> Result<()> {
        ensure!(
            now <= self.not_after,
            ExpiredCertificateSnafu {
                expired_for: now.saturating_sub(self.not_after),
            }
        );
        Ok(())
    }

    /// Returns the lifetime if it is shorter than `expected`.
    fn shorter_than(&self, expected: Duration) -> Option<Duration> {
        let lifetime = self.not_after.saturating_sub(self.not_before);
        (lifetime < expected).then_some(lifetime)
    }
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
