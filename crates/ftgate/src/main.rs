use std::sync::Arc;
use std::time::Duration;

use ftgate::{
    EventSink, FtpProxyBuilder, JsonLineSink, NoopEventSink, ProxyConfig, ProxyError,
    RouteTableHandler,
};

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./ftgate.json".to_string());
    let config = ProxyConfig::load_from_file(&config_path)?;

    let sink: Arc<dyn EventSink> = match &config.event_log_path {
        Some(path) => Arc::new(JsonLineSink::create(path)?),
        None => Arc::new(NoopEventSink),
    };

    let mut builder = FtpProxyBuilder::new(config.clone()).with_event_sink(sink);
    if !config.routes.is_empty() {
        builder = builder.register("USER", RouteTableHandler::new(config.routes.clone()));
    }

    let handle = builder.build()?.start().await?;
    eprintln!("ftgate listening on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    handle.shutdown(Duration::from_secs(5)).await
}
