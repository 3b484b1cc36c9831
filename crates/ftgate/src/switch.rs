use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use ftgate_core::{reply_severity, CommandLine, TlsVersion};
use ftgate_tls::pinned_origin_client_config;
use tokio::io::AsyncWriteExt;

use crate::errors::ProxyError;
use crate::flow::FlowControl;
use crate::origin::{connect_origin, read_reply_line, wrap_origin_tls, OriginLink, PumpShutdown};
use crate::stream::{OriginStream, SharedClientWriter};

pub(crate) struct SwitchRequest<'a> {
    pub(crate) client_addr: SocketAddr,
    pub(crate) new_addr: String,
    pub(crate) tls_version: Option<TlsVersion>,
    pub(crate) previous_tls_commands: &'a [Bytes],
    pub(crate) proxy_protocol: bool,
    pub(crate) idle_timeout: Option<Duration>,
}

pub(crate) struct SwitchFailure {
    pub(crate) kept: Option<OriginLink>,
    pub(crate) error: ProxyError,
}

// Either the new origin comes back fully installed with the recorded TLS
// state replayed, or the old link is handed back untouched.
pub(crate) async fn switch_origin(
    mut origin: OriginLink,
    control: &Arc<FlowControl>,
    client_writer: &SharedClientWriter,
    request: SwitchRequest<'_>,
) -> Result<OriginLink, SwitchFailure> {
    let suspended = if control.pass_through() {
        match control.suspend(request.idle_timeout).await {
            Ok(guard) => Some(guard),
            Err(error) => {
                return Err(SwitchFailure {
                    kept: Some(origin),
                    error,
                })
            }
        }
    } else {
        None
    };

    let old_reader = match origin.stop_pump().await {
        PumpShutdown::Recovered(reader) => reader,
        PumpShutdown::OriginClosed => {
            return Err(SwitchFailure {
                kept: None,
                error: ProxyError::SwitchFailed {
                    addr: request.new_addr,
                    detail: "current origin closed the control connection".to_string(),
                },
            })
        }
        PumpShutdown::Failed(error) => {
            return Err(SwitchFailure {
                kept: None,
                error: ProxyError::Io(error),
            })
        }
    };
    let (old_addr, mut old_writer) = origin.into_parts();

    match establish_new_origin(&request, control, client_writer).await {
        Ok(new_link) => {
            let _ = old_writer.shutdown().await;
            drop(old_reader);
            drop(suspended);
            Ok(new_link)
        }
        Err(error) => {
            let kept = OriginLink::from_parts(
                old_addr,
                old_reader,
                old_writer,
                Arc::clone(client_writer),
                Arc::clone(control),
                request.idle_timeout,
            );
            Err(SwitchFailure {
                kept: Some(kept),
                error,
            })
        }
    }
}

async fn establish_new_origin(
    request: &SwitchRequest<'_>,
    control: &Arc<FlowControl>,
    client_writer: &SharedClientWriter,
) -> Result<OriginLink, ProxyError> {
    let tcp = connect_origin(
        &request.new_addr,
        request.client_addr,
        request.proxy_protocol,
        request.idle_timeout,
    )
    .await?;
    let mut stream = OriginStream::Plain { stream: tcp };

    // the fresh origin greets first; the client never sees this line
    read_reply_line(&mut stream, request.idle_timeout).await?;

    for raw in request.previous_tls_commands {
        stream.write_all(raw).await?;
        stream.flush().await?;
        let reply = read_reply_line(&mut stream, request.idle_timeout).await?;

        let command = CommandLine::parse(raw.clone());
        if command.name() == "AUTH" {
            if reply_severity(&reply) == Some(5) {
                return Err(ProxyError::SwitchFailed {
                    addr: request.new_addr.clone(),
                    detail: "origin refused the replayed AUTH command".to_string(),
                });
            }
            let version = request.tls_version.ok_or_else(|| ProxyError::SwitchFailed {
                addr: request.new_addr.clone(),
                detail: "no negotiated TLS version recorded for replay".to_string(),
            })?;
            stream = wrap_origin_tls(
                stream,
                &request.new_addr,
                pinned_origin_client_config(version),
            )
            .await?;
        }
    }

    Ok(OriginLink::establish(
        request.new_addr.clone(),
        stream,
        Arc::clone(client_writer),
        Arc::clone(control),
        request.idle_timeout,
    ))
}
