mod builder;
mod errors;
mod flow;
mod handler;
mod metrics;
mod origin;
mod pump;
mod server;
mod session;
mod stream;
mod switch;

pub use builder::FtpProxyBuilder;
pub use errors::{HandlerError, ProxyError};
pub use handler::{CommandHandler, RouteContext, RouteTableHandler};
pub use metrics::ProxyMetrics;
pub use server::{FtpProxy, FtpProxyHandle};

pub use ftgate_core::{ProxyConfig, TlsSettings, TlsVersion};
pub use ftgate_observe::{
    Event, EventSink, EventType, JsonLineSink, NoopEventSink, SessionScope, VecEventSink,
};
