use std::sync::Arc;
use std::time::Duration;

use ftgate_core::{ProxyConfig, SecureCommandSet};
use ftgate_observe::{EventSink, NoopEventSink};
use ftgate_tls::load_server_config;

use crate::errors::ProxyError;
use crate::handler::{CommandHandler, CommandHandlers};
use crate::metrics::ProxyMetricsStore;
use crate::server::FtpProxy;
use crate::session::{SessionRuntime, TlsRuntime};

pub struct FtpProxyBuilder {
    config: ProxyConfig,
    handlers: CommandHandlers,
    sink: Arc<dyn EventSink>,
}

impl FtpProxyBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            handlers: CommandHandlers::default(),
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn register<H: CommandHandler>(mut self, command: &str, handler: H) -> Self {
        self.handlers.register(command, Arc::new(handler));
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<FtpProxy, ProxyError> {
        self.config.validate()?;

        let listen_address = self
            .config
            .listen_address
            .parse()
            .map_err(|error| ProxyError::InvalidConfig(format!("listen_address: {error}")))?;

        let tls = match &self.config.tls {
            Some(settings) => Some(TlsRuntime {
                server_config: load_server_config(
                    &settings.cert_file,
                    &settings.key_file,
                    settings.min_version,
                    settings.max_version,
                )?,
                min_version: settings.min_version,
                max_version: settings.max_version,
            }),
            None => None,
        };

        let idle_timeout = (self.config.idle_timeout_seconds > 0)
            .then(|| Duration::from_secs(self.config.idle_timeout_seconds));

        let runtime = Arc::new(SessionRuntime {
            default_origin: self.config.default_origin_address.clone(),
            idle_timeout,
            proxy_protocol: self.config.proxy_protocol_enabled,
            secure_commands: SecureCommandSet::new(&self.config.secure_commands),
            tls,
            handlers: self.handlers,
            sink: self.sink,
            metrics: Arc::new(ProxyMetricsStore::default()),
        });

        Ok(FtpProxy {
            listen_address,
            max_connections: self.config.max_connections,
            runtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use ftgate_core::ProxyConfig;

    use super::FtpProxyBuilder;
    use crate::errors::ProxyError;

    #[test]
    fn build_rejects_invalid_configs() {
        let config = ProxyConfig {
            listen_address: "127.0.0.1:2121".to_string(),
            ..ProxyConfig::default()
        };
        let error = FtpProxyBuilder::new(config).build().expect_err("no origin");
        assert!(matches!(error, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn build_accepts_a_minimal_config() {
        let config = ProxyConfig {
            listen_address: "127.0.0.1:0".to_string(),
            default_origin_address: "127.0.0.1:2121".to_string(),
            ..ProxyConfig::default()
        };
        let proxy = FtpProxyBuilder::new(config).build().expect("build");
        assert_eq!(proxy.metrics().total_sessions, 0);
    }
}
