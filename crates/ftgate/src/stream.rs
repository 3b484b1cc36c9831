use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::{client, server};

use ftgate_core::{TlsVersion, CONTROL_BUFFER_SIZE};
use ftgate_tls::tls_version_from_protocol;

pin_project! {
    #[project = ClientStreamProj]
    pub(crate) enum ClientStream {
        Plain {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: server::TlsStream<TcpStream>,
        },
    }
}

impl ClientStream {
    pub(crate) fn negotiated_tls_version(&self) -> Option<TlsVersion> {
        match self {
            Self::Plain { .. } => None,
            Self::Tls { stream } => stream
                .get_ref()
                .1
                .protocol_version()
                .and_then(tls_version_from_protocol),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

pin_project! {
    #[project = OriginStreamProj]
    pub(crate) enum OriginStream {
        Plain {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: client::TlsStream<TcpStream>,
        },
    }
}

impl AsyncRead for OriginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            OriginStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            OriginStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            OriginStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            OriginStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            OriginStreamProj::Plain { stream } => stream.poll_flush(cx),
            OriginStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            OriginStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            OriginStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

pub(crate) type ClientReader = BufReader<ReadHalf<ClientStream>>;
pub(crate) type SharedClientWriter = Arc<Mutex<WriteHalf<ClientStream>>>;
pub(crate) type OriginReader = BufReader<ReadHalf<OriginStream>>;
pub(crate) type OriginWriter = WriteHalf<OriginStream>;

pub(crate) fn split_client(stream: ClientStream) -> (ClientReader, SharedClientWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        BufReader::with_capacity(CONTROL_BUFFER_SIZE, read_half),
        Arc::new(Mutex::new(write_half)),
    )
}

pub(crate) fn split_origin(stream: OriginStream) -> (OriginReader, OriginWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        BufReader::with_capacity(CONTROL_BUFFER_SIZE, read_half),
        write_half,
    )
}
