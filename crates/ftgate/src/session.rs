use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::ServerConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use ftgate_core::{
    reply_severity, CommandLine, LineBuffer, SecureCommandSet, TlsVersion, CONTROL_BUFFER_SIZE,
};
use ftgate_observe::{Event, EventSink, EventType, SessionScope};
use ftgate_tls::origin_client_config;

use crate::errors::ProxyError;
use crate::flow::{FlowControl, ResponseSlot};
use crate::handler::{CommandHandlers, RouteContext};
use crate::metrics::ProxyMetricsStore;
use crate::origin::{connect_origin, wrap_origin_tls, OriginLink, PumpShutdown};
use crate::pump::{relay_passthrough, PumpExit};
use crate::stream::{
    split_client, ClientReader, ClientStream, OriginReader, OriginStream, SharedClientWriter,
};
use crate::switch::{switch_origin, SwitchFailure, SwitchRequest};

pub(crate) struct SessionRuntime {
    pub(crate) default_origin: String,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) proxy_protocol: bool,
    pub(crate) secure_commands: SecureCommandSet,
    pub(crate) tls: Option<TlsRuntime>,
    pub(crate) handlers: CommandHandlers,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) metrics: Arc<ProxyMetricsStore>,
}

pub(crate) struct TlsRuntime {
    pub(crate) server_config: Arc<ServerConfig>,
    pub(crate) min_version: TlsVersion,
    pub(crate) max_version: TlsVersion,
}

struct SessionLegs {
    client_reader: ClientReader,
    client_writer: SharedClientWriter,
    origin: OriginLink,
}

#[derive(Default)]
struct TlsState {
    upgraded: bool,
    version: Option<TlsVersion>,
    previous_commands: Vec<Bytes>,
}

enum InterceptEnd {
    LoginComplete(SessionLegs),
    ClientClosed,
    OriginClosed,
    Rejected(String),
}

pub(crate) async fn run_session(
    runtime: Arc<SessionRuntime>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()> {
    let mut scope = SessionScope {
        session_id: Uuid::new_v4(),
        client_addr: client_addr.to_string(),
        origin_addr: runtime.default_origin.clone(),
    };
    runtime
        .sink
        .emit(Event::new(EventType::SessionOpened, scope.clone()));

    let origin_tcp = match connect_origin(
        &runtime.default_origin,
        client_addr,
        runtime.proxy_protocol,
        runtime.idle_timeout,
    )
    .await
    {
        Ok(tcp) => tcp,
        Err(error) => {
            runtime.metrics.record_origin_dial_failure();
            let mut stream = stream;
            let _ = stream
                .write_all(b"421 Origin server is unavailable\r\n")
                .await;
            let _ = stream.shutdown().await;
            emit_session_closed(&runtime, &scope, "origin_unavailable", Some(error.to_string()));
            return Ok(());
        }
    };
    runtime
        .sink
        .emit(Event::new(EventType::OriginConnected, scope.clone()));

    let control = FlowControl::new();
    let (client_reader, client_writer) = split_client(ClientStream::Plain { stream });
    let origin = OriginLink::establish(
        runtime.default_origin.clone(),
        OriginStream::Plain { stream: origin_tcp },
        Arc::clone(&client_writer),
        Arc::clone(&control),
        runtime.idle_timeout,
    );
    let legs = SessionLegs {
        client_reader,
        client_writer,
        origin,
    };
    let mut tls_state = TlsState::default();

    match intercept_until_login(&runtime, &mut scope, client_addr, &control, legs, &mut tls_state)
        .await
    {
        Ok(InterceptEnd::LoginComplete(legs)) => run_relay(&runtime, &scope, legs).await,
        Ok(InterceptEnd::ClientClosed) => {
            emit_session_closed(&runtime, &scope, "client_closed", None);
            Ok(())
        }
        Ok(InterceptEnd::OriginClosed) => {
            emit_session_closed(&runtime, &scope, "origin_closed", None);
            Ok(())
        }
        Ok(InterceptEnd::Rejected(detail)) => {
            emit_session_closed(&runtime, &scope, "rejected", Some(detail));
            Ok(())
        }
        Err(error) => {
            emit_session_closed(&runtime, &scope, "error", Some(error.to_string()));
            Err(io::Error::other(error))
        }
    }
}

enum Step {
    PumpFinished(Result<io::Result<PumpExit<OriginReader>>, tokio::task::JoinError>),
    Line(io::Result<Option<Vec<u8>>>),
}

async fn intercept_until_login(
    runtime: &SessionRuntime,
    scope: &mut SessionScope,
    client_addr: SocketAddr,
    control: &Arc<FlowControl>,
    mut legs: SessionLegs,
    tls_state: &mut TlsState,
) -> Result<InterceptEnd, ProxyError> {
    loop {
        let step = {
            let pump = legs.origin.pump_task_mut();
            tokio::select! {
                finished = pump => Step::PumpFinished(finished),
                line = read_client_line(&mut legs.client_reader, runtime.idle_timeout) => Step::Line(line),
            }
        };
        let raw = match step {
            Step::PumpFinished(finished) => {
                legs.origin.mark_pump_joined();
                close_client(&legs.client_writer).await;
                return match finished {
                    Ok(Ok(PumpExit::Eof)) | Ok(Ok(PumpExit::Stopped(_))) => {
                        Ok(InterceptEnd::OriginClosed)
                    }
                    Ok(Err(error)) => Err(ProxyError::Io(error)),
                    Err(join_error) => Err(ProxyError::Io(io::Error::other(join_error.to_string()))),
                };
            }
            Step::Line(line) => match line? {
                Some(raw) => raw,
                None => {
                    legs.origin.close().await;
                    return Ok(InterceptEnd::ClientClosed);
                }
            },
        };

        let command = CommandLine::parse(raw);

        if command.name() == "AUTH" && auth_parameter_requests_tls(&command) && !tls_state.upgraded
        {
            if let Some(tls) = &runtime.tls {
                let (upgraded_legs, outcome) =
                    upgrade_session_tls(runtime, scope, tls, control, legs, tls_state, &command)
                        .await?;
                legs = upgraded_legs;
                match outcome {
                    UpgradeOutcome::Upgraded | UpgradeOutcome::RefusedByOrigin => continue,
                    UpgradeOutcome::OriginClosed => {
                        close_client(&legs.client_writer).await;
                        legs.origin.close().await;
                        return Ok(InterceptEnd::OriginClosed);
                    }
                }
            }
        }

        if let Some(handler) = runtime.handlers.get(command.name()) {
            let mut context = RouteContext::new(
                client_addr,
                legs.origin.addr.clone(),
                command.parameter().unwrap_or("").to_string(),
            );
            if let Err(error) = handler.handle(&mut context).await {
                runtime.metrics.record_handler_rejection();
                let detail = error.message().to_string();
                let reply = format!("530 {}", sanitize_reply_text(&detail));
                let _ = send_client_reply(&legs.client_writer, &reply).await;
                close_client(&legs.client_writer).await;
                legs.origin.close().await;
                return Ok(InterceptEnd::Rejected(detail));
            }

            if context.origin_addr != legs.origin.addr {
                let request = SwitchRequest {
                    client_addr,
                    new_addr: context.origin_addr.clone(),
                    tls_version: tls_state.version,
                    previous_tls_commands: &tls_state.previous_commands,
                    proxy_protocol: runtime.proxy_protocol,
                    idle_timeout: runtime.idle_timeout,
                };
                let SessionLegs {
                    client_reader,
                    client_writer,
                    origin,
                } = legs;
                match switch_origin(origin, control, &client_writer, request).await {
                    Ok(new_origin) => {
                        scope.origin_addr = new_origin.addr.clone();
                        runtime.metrics.record_origin_switch();
                        runtime
                            .sink
                            .emit(Event::new(EventType::OriginSwitched, scope.clone()));
                        legs = SessionLegs {
                            client_reader,
                            client_writer,
                            origin: new_origin,
                        };
                    }
                    Err(SwitchFailure { kept, error }) => {
                        runtime.metrics.record_origin_switch_failure();
                        runtime.sink.emit(
                            Event::new(EventType::OriginSwitchFailed, scope.clone())
                                .with_attribute("detail", error.to_string()),
                        );
                        let _ =
                            send_client_reply(&client_writer, "530 Origin switch failed").await;
                        close_client(&client_writer).await;
                        if let Some(kept) = kept {
                            kept.close().await;
                        }
                        return Ok(InterceptEnd::Rejected(error.to_string()));
                    }
                }
            }
        }

        let reply = forward_command_gated(runtime, scope, control, &mut legs, &command).await?;
        if reply.origin_closed {
            close_client(&legs.client_writer).await;
            legs.origin.close().await;
            return Ok(InterceptEnd::OriginClosed);
        }

        if tls_state.upgraded && matches!(command.name(), "PBSZ" | "PROT") {
            tls_state.previous_commands.push(command.raw_bytes());
        }

        if command.name() == "PASS" && reply.severity == Some(2) {
            runtime
                .sink
                .emit(Event::new(EventType::LoginSucceeded, scope.clone()));
            return Ok(InterceptEnd::LoginComplete(legs));
        }
    }
}

async fn run_relay(
    runtime: &SessionRuntime,
    scope: &SessionScope,
    legs: SessionLegs,
) -> io::Result<()> {
    let SessionLegs {
        mut client_reader,
        client_writer,
        mut origin,
    } = legs;

    let mut origin_reader = match origin.stop_pump().await {
        PumpShutdown::Recovered(reader) => reader,
        PumpShutdown::OriginClosed => {
            close_client(&client_writer).await;
            emit_session_closed(runtime, scope, "origin_closed", None);
            return Ok(());
        }
        PumpShutdown::Failed(error) => {
            close_client(&client_writer).await;
            emit_session_closed(runtime, scope, "error", Some(error.to_string()));
            return Err(error);
        }
    };

    let mut client_writer = match Arc::try_unwrap(client_writer) {
        Ok(mutex) => mutex.into_inner(),
        Err(_) => {
            let error = io::Error::other("client writer still shared after pump shutdown");
            emit_session_closed(runtime, scope, "error", Some(error.to_string()));
            return Err(error);
        }
    };
    let (_origin_addr, mut origin_writer) = origin.into_parts();

    let relayed = relay_passthrough(
        &mut client_reader,
        &mut client_writer,
        &mut origin_reader,
        &mut origin_writer,
        runtime.idle_timeout,
    )
    .await;
    let _ = client_writer.shutdown().await;
    let _ = origin_writer.shutdown().await;

    match relayed {
        Ok((from_client, from_origin)) => {
            let event = Event::new(EventType::SessionClosed, scope.clone())
                .with_attribute("reason", "relay_complete")
                .with_attribute("bytes_from_client", from_client.to_string())
                .with_attribute("bytes_from_origin", from_origin.to_string());
            runtime.sink.emit(event);
            Ok(())
        }
        Err(error) => {
            emit_session_closed(runtime, scope, "error", Some(error.to_string()));
            Err(error)
        }
    }
}

enum UpgradeOutcome {
    Upgraded,
    RefusedByOrigin,
    OriginClosed,
}

async fn upgrade_session_tls(
    runtime: &SessionRuntime,
    scope: &SessionScope,
    tls: &TlsRuntime,
    control: &Arc<FlowControl>,
    legs: SessionLegs,
    tls_state: &mut TlsState,
    auth: &CommandLine,
) -> Result<(SessionLegs, UpgradeOutcome), ProxyError> {
    let SessionLegs {
        client_reader,
        client_writer,
        mut origin,
    } = legs;

    let mut slot = control.reserve_response(runtime.idle_timeout).await?;
    runtime.sink.emit(
        Event::new(EventType::CommandForwarded, scope.clone())
            .with_attribute("direction", "send to origin")
            .with_attribute("line", auth.display_redacted(&runtime.secure_commands)),
    );
    origin.writer.write_all(auth.raw()).await?;
    origin.writer.flush().await?;

    let (severity, payload, origin_closed) = collect_reply(&mut slot, runtime.idle_timeout).await?;

    if origin_closed {
        deliver_to_client(&client_writer, &payload).await?;
        drop(slot);
        return Ok((
            SessionLegs {
                client_reader,
                client_writer,
                origin,
            },
            UpgradeOutcome::OriginClosed,
        ));
    }

    if severity == Some(5) {
        deliver_to_client(&client_writer, &payload).await?;
        drop(slot);
        runtime
            .sink
            .emit(Event::new(EventType::TlsRefusedByOrigin, scope.clone()));
        return Ok((
            SessionLegs {
                client_reader,
                client_writer,
                origin,
            },
            UpgradeOutcome::RefusedByOrigin,
        ));
    }

    // the gate stays held while both legs are rebuilt
    let suspended = slot.into_suspension();

    let origin_reader = match origin.stop_pump().await {
        PumpShutdown::Recovered(reader) => reader,
        PumpShutdown::OriginClosed => {
            drop(suspended);
            deliver_to_client(&client_writer, &payload).await?;
            return Ok((
                SessionLegs {
                    client_reader,
                    client_writer,
                    origin,
                },
                UpgradeOutcome::OriginClosed,
            ));
        }
        PumpShutdown::Failed(error) => return Err(ProxyError::Io(error)),
    };

    // the acceptance reply reaches the client in plaintext, before handshake
    deliver_to_client(&client_writer, &payload).await?;

    let client_write_half = match Arc::try_unwrap(client_writer) {
        Ok(mutex) => mutex.into_inner(),
        Err(_) => {
            return Err(ProxyError::Io(io::Error::other(
                "client writer still shared after pump shutdown",
            )))
        }
    };
    let client_plain = client_reader.into_inner().unsplit(client_write_half);
    let client_tcp = match client_plain {
        ClientStream::Plain { stream } => stream,
        ClientStream::Tls { .. } => {
            return Err(ProxyError::Io(io::Error::other(
                "client connection is already TLS",
            )))
        }
    };
    let acceptor = TlsAcceptor::from(Arc::clone(&tls.server_config));
    let client_tls = acceptor.accept(client_tcp).await?;
    let client_stream = ClientStream::Tls { stream: client_tls };
    let negotiated = client_stream.negotiated_tls_version();
    let (new_client_reader, new_client_writer) = split_client(client_stream);

    let (origin_addr, origin_writer) = origin.into_parts();
    let origin_plain = origin_reader.into_inner().unsplit(origin_writer);
    let origin_tls = wrap_origin_tls(
        origin_plain,
        &origin_addr,
        origin_client_config(tls.min_version, tls.max_version),
    )
    .await?;
    let new_origin = OriginLink::establish(
        origin_addr,
        origin_tls,
        Arc::clone(&new_client_writer),
        Arc::clone(control),
        runtime.idle_timeout,
    );

    tls_state.upgraded = true;
    tls_state.version = negotiated;
    tls_state.previous_commands.push(auth.raw_bytes());
    runtime.metrics.record_tls_upgrade();
    runtime.sink.emit(
        Event::new(EventType::TlsUpgraded, scope.clone()).with_attribute(
            "version",
            negotiated.map(TlsVersion::as_str).unwrap_or("unknown"),
        ),
    );

    drop(suspended);
    Ok((
        SessionLegs {
            client_reader: new_client_reader,
            client_writer: new_client_writer,
            origin: new_origin,
        },
        UpgradeOutcome::Upgraded,
    ))
}

struct GatedReply {
    severity: Option<u8>,
    origin_closed: bool,
}

async fn forward_command_gated(
    runtime: &SessionRuntime,
    scope: &SessionScope,
    control: &Arc<FlowControl>,
    legs: &mut SessionLegs,
    command: &CommandLine,
) -> Result<GatedReply, ProxyError> {
    let mut slot = control.reserve_response(runtime.idle_timeout).await?;
    runtime.sink.emit(
        Event::new(EventType::CommandForwarded, scope.clone())
            .with_attribute("direction", "send to origin")
            .with_attribute("line", command.display_redacted(&runtime.secure_commands)),
    );
    legs.origin.writer.write_all(command.raw()).await?;
    legs.origin.writer.flush().await?;

    let (severity, payload, origin_closed) = collect_reply(&mut slot, runtime.idle_timeout).await?;
    deliver_to_client(&legs.client_writer, &payload).await?;
    drop(slot);

    Ok(GatedReply {
        severity,
        origin_closed,
    })
}

async fn collect_reply(
    slot: &mut ResponseSlot,
    wait: Option<Duration>,
) -> Result<(Option<u8>, Bytes, bool), ProxyError> {
    let mut lines = LineBuffer::new(CONTROL_BUFFER_SIZE);
    loop {
        let chunk = slot.next_chunk(wait).await?;
        if chunk.is_empty() {
            return Ok((None, lines.take_all(), true));
        }
        lines.push(&chunk).map_err(|error| {
            ProxyError::Io(io::Error::new(io::ErrorKind::InvalidData, error.to_string()))
        })?;
        if let Some(first) = lines.first_line() {
            let severity = reply_severity(first);
            return Ok((severity, lines.take_all(), false));
        }
    }
}

async fn read_client_line(
    reader: &mut ClientReader,
    idle_timeout: Option<Duration>,
) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let mut limited = AsyncReadExt::take(&mut *reader, (CONTROL_BUFFER_SIZE + 1) as u64);
    let read = match idle_timeout {
        Some(duration) => tokio::time::timeout(duration, limited.read_until(b'\n', &mut line))
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "client read idle timeout expired")
            })??,
        None => limited.read_until(b'\n', &mut line).await?,
    };
    if read == 0 {
        return Ok(None);
    }
    if line.len() > CONTROL_BUFFER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client command line too long",
        ));
    }
    Ok(Some(line))
}

fn auth_parameter_requests_tls(command: &CommandLine) -> bool {
    command
        .parameter()
        .map(|parameter| {
            let upper = parameter.trim().to_ascii_uppercase();
            upper == "TLS" || upper == "SSL"
        })
        .unwrap_or(false)
}

async fn deliver_to_client(writer: &SharedClientWriter, payload: &[u8]) -> io::Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    let mut writer = writer.lock().await;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn send_client_reply(writer: &SharedClientWriter, line: &str) -> io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

async fn close_client(writer: &SharedClientWriter) {
    let mut writer = writer.lock().await;
    let _ = writer.shutdown().await;
}

fn sanitize_reply_text(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

fn emit_session_closed(
    runtime: &SessionRuntime,
    scope: &SessionScope,
    reason: &str,
    detail: Option<String>,
) {
    let mut event =
        Event::new(EventType::SessionClosed, scope.clone()).with_attribute("reason", reason);
    if let Some(detail) = detail {
        event = event.with_attribute("detail", detail);
    }
    runtime.sink.emit(event);
}

#[cfg(test)]
mod tests {
    use ftgate_core::CommandLine;

    use super::{auth_parameter_requests_tls, sanitize_reply_text};

    #[test]
    fn auth_tls_and_ssl_parameters_trigger_the_upgrade_path() {
        assert!(auth_parameter_requests_tls(&CommandLine::parse(
            &b"AUTH TLS\r\n"[..]
        )));
        assert!(auth_parameter_requests_tls(&CommandLine::parse(
            &b"AUTH ssl\r\n"[..]
        )));
        assert!(!auth_parameter_requests_tls(&CommandLine::parse(
            &b"AUTH GSSAPI\r\n"[..]
        )));
        assert!(!auth_parameter_requests_tls(&CommandLine::parse(
            &b"AUTH\r\n"[..]
        )));
    }

    #[test]
    fn reply_text_never_carries_line_breaks() {
        assert_eq!(
            sanitize_reply_text("directory lookup failed\r\nQUIT"),
            "directory lookup failed  QUIT"
        );
    }
}
