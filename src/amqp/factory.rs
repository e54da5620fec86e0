use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::rabbit_mq::RabbitMqConnection;
use crate::amqp::transport::{Transport, TransportConnection};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials connections to a RabbitMq broker with [`lapin`].
///
/// This is the [`Transport`] behind [`Pool::from_settings`](crate::pool::Pool::from_settings).
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    timeout: Duration,
    /// Reported to the broker, shows up in the management UI.
    connection_name: Option<String>,
    /// Plain TCP when `None`.
    tls: Option<Arc<TlsTarget>>,
}

struct TlsTarget {
    connector: NativeTlsConnector,
    /// The name expected on the server certificate.
    server_name: String,
}

impl ConnectionFactory {
    /// Build a factory from `settings`, loading the TLS root certificates if TLS is configured.
    ///
    /// The connection timeout defaults to 10 seconds.
    pub fn from_settings(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = match &settings.tls {
            None => None,
            Some(tls) => {
                let mut builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls.ca_certificate_chain()? {
                    builder.add_root_certificate(certificate);
                }
                Some(Arc::new(TlsTarget {
                    connector: builder.build().context("TLS configuration failed")?,
                    server_name: tls.domain.clone().unwrap_or_else(|| settings.host.clone()),
                }))
            }
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            connection_name: settings.connection_name.clone(),
            tls,
        })
    }

    /// Encrypt connections with `connector`, expecting `server_name` on the broker certificate.
    #[must_use]
    pub fn with_tls(mut self, connector: NativeTlsConnector, server_name: impl Into<String>) -> Self {
        self.tls = Some(Arc::new(TlsTarget {
            connector,
            server_name: server_name.into(),
        }));
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a new connection, giving up after the connection timeout.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host, tls = self.uses_tls()))]
    pub async fn new_connection(&self) -> Result<RabbitMqConnection, anyhow::Error> {
        let connection = tokio::time::timeout(self.timeout, self.dial())
            .await
            .map_err(|_| anyhow::anyhow!("Timed out after {:?} connecting to RabbitMQ", self.timeout))?
            .context("Failed to connect to RabbitMQ")?;
        Ok(RabbitMqConnection::new(connection))
    }

    fn properties(&self) -> ConnectionProperties {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }

    async fn dial(&self) -> Result<lapin::Connection, lapin::Error> {
        let Some(tls) = self.tls.clone() else {
            return lapin::Connection::connect_uri(self.uri.clone(), self.properties()).await;
        };
        // Plain AMQP over TCP first, then the TLS handshake against our own connector.
        let connect = move |uri: &AMQPUri| {
            let mut plain = uri.clone();
            plain.scheme = AMQPScheme::AMQP;
            plain
                .connect()
                .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.server_name))
        };
        lapin::Connection::connector(self.uri.clone(), Box::new(connect), self.properties()).await
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn TransportConnection>, anyhow::Error> {
        Ok(Box::new(self.new_connection().await?))
    }
}
