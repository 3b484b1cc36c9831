use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use ftgate_core::{parse_host_port, proxy_header_v1, CONTROL_BUFFER_SIZE};
use ftgate_tls::origin_server_name;

use crate::errors::ProxyError;
use crate::flow::FlowControl;
use crate::pump::{read_with_idle_timeout, spawn_response_pump, PumpExit};
use crate::stream::{split_origin, OriginReader, OriginStream, OriginWriter, SharedClientWriter};

pub(crate) struct OriginLink {
    pub(crate) addr: String,
    pub(crate) writer: OriginWriter,
    stop: watch::Sender<bool>,
    pump: Option<JoinHandle<io::Result<PumpExit<OriginReader>>>>,
}

pub(crate) enum PumpShutdown {
    Recovered(OriginReader),
    OriginClosed,
    Failed(io::Error),
}

impl OriginLink {
    pub(crate) fn establish(
        addr: String,
        stream: OriginStream,
        client_writer: SharedClientWriter,
        control: Arc<FlowControl>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let (reader, writer) = split_origin(stream);
        Self::from_parts(addr, reader, writer, client_writer, control, idle_timeout)
    }

    pub(crate) fn from_parts(
        addr: String,
        reader: OriginReader,
        writer: OriginWriter,
        client_writer: SharedClientWriter,
        control: Arc<FlowControl>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let (stop, task) = spawn_response_pump(reader, client_writer, control, idle_timeout);
        OriginLink {
            addr,
            writer,
            stop,
            pump: Some(task),
        }
    }

    pub(crate) fn pump_task_mut(&mut self) -> &mut JoinHandle<io::Result<PumpExit<OriginReader>>> {
        self.pump.as_mut().expect("origin pump already joined")
    }

    pub(crate) fn mark_pump_joined(&mut self) {
        self.pump = None;
    }

    pub(crate) async fn stop_pump(&mut self) -> PumpShutdown {
        let Some(task) = self.pump.take() else {
            return PumpShutdown::OriginClosed;
        };
        let _ = self.stop.send(true);
        match task.await {
            Ok(Ok(PumpExit::Stopped(reader))) => PumpShutdown::Recovered(reader),
            Ok(Ok(PumpExit::Eof)) => PumpShutdown::OriginClosed,
            Ok(Err(error)) => PumpShutdown::Failed(error),
            Err(join_error) => PumpShutdown::Failed(io::Error::other(join_error.to_string())),
        }
    }

    pub(crate) fn into_parts(self) -> (String, OriginWriter) {
        (self.addr, self.writer)
    }

    pub(crate) async fn close(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.pump.take() {
            let _ = task.await;
        }
        let _ = self.writer.shutdown().await;
    }
}

pub(crate) async fn connect_origin(
    addr: &str,
    client_addr: SocketAddr,
    proxy_protocol: bool,
    idle_timeout: Option<Duration>,
) -> Result<TcpStream, ProxyError> {
    let (host, port) = parse_host_port(addr).map_err(|error| ProxyError::OriginUnavailable {
        addr: addr.to_string(),
        detail: error.to_string(),
    })?;
    let resolved = resolve_origin(addr, &host, port, client_addr).await?;

    let connect = TcpStream::connect(resolved);
    let connected = match idle_timeout {
        Some(duration) => tokio::time::timeout(duration, connect).await.map_err(|_| {
            ProxyError::OriginUnavailable {
                addr: addr.to_string(),
                detail: "connect timed out".to_string(),
            }
        })?,
        None => connect.await,
    };
    let mut stream = connected.map_err(|error| ProxyError::OriginUnavailable {
        addr: addr.to_string(),
        detail: error.to_string(),
    })?;

    if proxy_protocol {
        let header =
            proxy_header_v1(client_addr, resolved).map_err(|error| ProxyError::OriginUnavailable {
                addr: addr.to_string(),
                detail: error.to_string(),
            })?;
        stream.write_all(header.as_bytes()).await?;
        stream.flush().await?;
    }

    Ok(stream)
}

async fn resolve_origin(
    addr: &str,
    host: &str,
    port: u16,
    client_addr: SocketAddr,
) -> Result<SocketAddr, ProxyError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|error| ProxyError::OriginUnavailable {
            addr: addr.to_string(),
            detail: format!("address resolution failed: {error}"),
        })?
        .collect();

    resolved
        .iter()
        .find(|candidate| candidate.is_ipv4() == client_addr.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| ProxyError::OriginUnavailable {
            addr: addr.to_string(),
            detail: "address resolution returned no addresses".to_string(),
        })
}

// Byte-at-a-time so no lookahead is left buffered when the caller wraps the
// socket in TLS right after the reply.
pub(crate) async fn read_reply_line<S>(
    stream: &mut S,
    idle_timeout: Option<Duration>,
) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let read = read_with_idle_timeout(stream, &mut byte, idle_timeout).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "origin closed while sending a reply",
            ));
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(line);
        }
        if line.len() > CONTROL_BUFFER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "origin reply line too long",
            ));
        }
    }
}

pub(crate) async fn wrap_origin_tls(
    stream: OriginStream,
    addr: &str,
    config: Arc<ClientConfig>,
) -> Result<OriginStream, ProxyError> {
    let tcp = match stream {
        OriginStream::Plain { stream } => stream,
        OriginStream::Tls { .. } => {
            return Err(ProxyError::SwitchFailed {
                addr: addr.to_string(),
                detail: "origin connection is already TLS".to_string(),
            })
        }
    };
    let (host, _) = parse_host_port(addr)?;
    let server_name = origin_server_name(&host)?;
    let connector = TlsConnector::from(config);
    let tls = connector.connect(server_name, tcp).await?;
    Ok(OriginStream::Tls { stream: tls })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::read_reply_line;

    #[tokio::test]
    async fn reads_exactly_one_reply_line() {
        let (mut remote, mut local) = tokio::io::duplex(1024);
        remote
            .write_all(b"220 Welcome\r\n331 next\r\n")
            .await
            .expect("write");

        let line = read_reply_line(&mut local, None).await.expect("line");
        assert_eq!(&line[..], b"220 Welcome\r\n");

        let next = read_reply_line(&mut local, None).await.expect("line");
        assert_eq!(&next[..], b"331 next\r\n");
    }

    #[tokio::test]
    async fn eof_before_newline_is_an_error() {
        let (mut remote, mut local) = tokio::io::duplex(1024);
        remote.write_all(b"220 partial").await.expect("write");
        drop(remote);

        let error = read_reply_line(&mut local, None)
            .await
            .expect_err("unterminated reply");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
