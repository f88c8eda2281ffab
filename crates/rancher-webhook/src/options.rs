//! Contains the [`WebhookOptions`] which configure every part of the webhook.
//!
//! The options are constructed exactly once at startup (usually from the CLI arguments, see
//! [`crate::cli`]) and are then shared read-only with the admission dispatcher, the handler
//! registry, the TLS server and the webhook configuration reconciler.
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use crate::constants::{
    DEFAULT_ADMISSION_TIMEOUT, DEFAULT_CERTIFICATE_EXPIRATION_DAYS, DEFAULT_NAMESPACE,
    DEFAULT_SERVICE_NAME, DEFAULT_SETTLE_DELAY, DEFAULT_SLOW_ADMISSION_THRESHOLD,
    DEFAULT_SOCKET_ADDRESS,
};

/// Specifies available webhook options.
///
/// The [`Default`] implementation for this struct contains the following values:
///
/// - The socket binds to 0.0.0.0 on port 9443 (HTTPS)
/// - The service `rancher-webhook` in the `cattle-system` namespace
/// - Multi-cluster management is disabled
/// - A settle delay of 15 seconds
///
/// ### Example with Custom Options
///
/// ```
/// use std::time::Duration;
///
/// use rancher_webhook::WebhookOptions;
///
/// let options = WebhookOptions::builder()
///     .bind_port(12345)
///     .multi_cluster_management(true)
///     .settle_delay(Duration::from_secs(30))
///     .build();
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookOptions {
    /// The HTTPS socket address the [`TcpListener`][tokio::net::TcpListener] binds to.
    pub socket_addr: SocketAddr,

    /// The namespace the webhook runs in. The CA and serving certificate secrets live here.
    pub namespace: String,

    /// The name of the Kubernetes service which points to the webhook.
    pub service_name: String,

    /// Enables the handlers (and webhook rules) only needed with multi-cluster management.
    pub multi_cluster_management: bool,

    /// How long to wait after observing a CA bundle before applying the webhook configurations.
    pub settle_delay: Duration,

    /// Admission decisions taking longer than this are logged.
    pub slow_admission_threshold: Duration,

    /// Deadline of a single admission call if the API server did not send one.
    pub admission_timeout: Duration,

    /// The lifetime in days the external certificate issuer is expected to use.
    pub certificate_expiration_days: u32,

    /// Never apply the webhook configurations, someone else maintains them.
    pub disable_webhook_configuration_maintenance: bool,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WebhookOptions {
    /// Returns the default [`WebhookOptionsBuilder`] which allows to selectively customize the
    /// options. See the documentation for [`WebhookOptions`] for more information on available
    /// functions.
    pub fn builder() -> WebhookOptionsBuilder {
        WebhookOptionsBuilder::default()
    }
}

/// The [`WebhookOptionsBuilder`] which allows to selectively customize the [`WebhookOptions`].
///
/// Usually, this struct is not constructed manually, but instead by calling
/// [`WebhookOptions::builder()`] or [`WebhookOptionsBuilder::default()`].
#[derive(Debug, Default)]
pub struct WebhookOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    namespace: Option<String>,
    service_name: Option<String>,
    multi_cluster_management: bool,
    settle_delay: Option<Duration>,
    slow_admission_threshold: Option<Duration>,
    admission_timeout: Option<Duration>,
    certificate_expiration_days: Option<u32>,
    disable_webhook_configuration_maintenance: bool,
}

impl WebhookOptionsBuilder {
    /// Sets the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    /// Sets the port of the socket address the webhook server uses to bind for HTTPS.
    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_port(bind_port);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn multi_cluster_management(mut self, enabled: bool) -> Self {
        self.multi_cluster_management = enabled;
        self
    }

    pub fn settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = Some(settle_delay);
        self
    }

    pub fn slow_admission_threshold(mut self, threshold: Duration) -> Self {
        self.slow_admission_threshold = Some(threshold);
        self
    }

    pub fn admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = Some(timeout);
        self
    }

    pub fn certificate_expiration_days(mut self, days: u32) -> Self {
        self.certificate_expiration_days = Some(days);
        self
    }

    pub fn disable_webhook_configuration_maintenance(mut self, disabled: bool) -> Self {
        self.disable_webhook_configuration_maintenance = disabled;
        self
    }

    /// Builds the final [`WebhookOptions`] by using default values for any not explicitly set
    /// option.
    pub fn build(self) -> WebhookOptions {
        WebhookOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            namespace: self
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned()),
            service_name: self
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_owned()),
            multi_cluster_management: self.multi_cluster_management,
            settle_delay: self.settle_delay.unwrap_or(DEFAULT_SETTLE_DELAY),
            slow_admission_threshold: self
                .slow_admission_threshold
                .unwrap_or(DEFAULT_SLOW_ADMISSION_THRESHOLD),
            admission_timeout: self.admission_timeout.unwrap_or(DEFAULT_ADMISSION_TIMEOUT),
            certificate_expiration_days: self
                .certificate_expiration_days
                .unwrap_or(DEFAULT_CERTIFICATE_EXPIRATION_DAYS),
            disable_webhook_configuration_maintenance: self
                .disable_webhook_configuration_maintenance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = WebhookOptions::default();

        assert_eq!(options.socket_addr.port(), 9443);
        assert_eq!(options.namespace, "cattle-system");
        assert_eq!(options.settle_delay, Duration::from_secs(15));
        assert_eq!(options.certificate_expiration_days, 3650);
        assert!(!options.multi_cluster_management);
        assert_eq!(options.service_name, "rancher-webhook");
    }

    #[test]
    fn bind_port_keeps_default_ip() {
        let options = WebhookOptions::builder().bind_port(8443).build();
        assert_eq!(options.socket_addr.to_string(), "0.0.0.0:8443");
    }
}
