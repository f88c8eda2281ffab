//! Contains various constant definitions, mostly well-known object names, HTTP paths and the
//! default ports and socket addresses.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// The default HTTPS port `9443` the webhook listener binds to.
pub const DEFAULT_HTTPS_PORT: u16 = 9443;

/// The default IP address [`Ipv4Addr::UNSPECIFIED`] (`0.0.0.0`) the webhook server binds to,
/// which represents binding on all network addresses.
pub const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// The default socket address `0.0.0.0:9443` the webhook server binds to.
pub const DEFAULT_SOCKET_ADDRESS: SocketAddr =
    SocketAddr::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_HTTPS_PORT);

/// The port of the Kubernetes service the API server uses to reach the webhook.
pub const SERVICE_CLIENT_PORT: u16 = 443;

pub const DEFAULT_NAMESPACE: &str = "cattle-system";
pub const DEFAULT_SERVICE_NAME: &str = "rancher-webhook";

/// The secret containing the CA bundle which signed the serving certificate.
pub const CA_SECRET_NAME: &str = "cattle-webhook-ca";

/// The secret containing the serving certificate and private key of the listener.
pub const SERVING_SECRET_NAME: &str = "cattle-webhook-tls";

/// Data key of `kubernetes.io/tls` secrets holding the PEM encoded certificate (chain).
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Data key of `kubernetes.io/tls` secrets holding the PEM encoded private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

pub const VALIDATION_PATH: &str = "/v1/webhook/validation";
pub const MUTATION_PATH: &str = "/v1/webhook/mutation";

/// Name of both the `ValidatingWebhookConfiguration` and the `MutatingWebhookConfiguration`.
pub const WEBHOOK_CONFIGURATION_NAME: &str = "rancher.cattle.io";

/// The field manager used for server-side applies.
pub const FIELD_MANAGER: &str = "rancher-webhook";

pub const OWNER_NAME_ANNOTATION: &str = "webhook.cattle.io/owner-name";
pub const OWNER_NAMESPACE_ANNOTATION: &str = "webhook.cattle.io/owner-namespace";

/// Annotation recording which user created an object.
pub const CREATOR_ID_ANNOTATION: &str = "field.cattle.io/creatorId";

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(15);

/// Settle delays below this are rejected, cache priming regularly takes longer.
pub const MINIMUM_SETTLE_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_SLOW_ADMISSION_THRESHOLD: Duration = Duration::from_secs(2);
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Ten years, the serving certificate is never expected to be rotated externally.
pub const DEFAULT_CERTIFICATE_EXPIRATION_DAYS: u32 = 3650;
