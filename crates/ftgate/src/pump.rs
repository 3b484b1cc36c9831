use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use ftgate_core::CONTROL_BUFFER_SIZE;

use crate::flow::FlowControl;

pub(crate) enum PumpExit<R> {
    Stopped(R),
    Eof,
}

// Forwards origin bytes toward the client until EOF or an external stop.
// A stop hands the reader back untouched so the caller can rebuild the leg;
// EOF is reported separately so the caller can propagate a clean FIN.
pub(crate) fn spawn_response_pump<R, W>(
    mut reader: R,
    writer: Arc<Mutex<W>>,
    control: Arc<FlowControl>,
    idle_timeout: Option<Duration>,
) -> (watch::Sender<bool>, JoinHandle<io::Result<PumpExit<R>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (stop_sender, mut stop_receiver) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut buffer = vec![0u8; CONTROL_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                _ = stop_receiver.changed() => return Ok(PumpExit::Stopped(reader)),
                read = read_with_idle_timeout(&mut reader, &mut buffer, idle_timeout) => read?,
            };
            if read == 0 {
                if let Some(diversion) = control.diverted_sender() {
                    let _ = diversion.send(Bytes::new()).await;
                }
                return Ok(PumpExit::Eof);
            }
            let chunk = Bytes::copy_from_slice(&buffer[..read]);
            deliver_chunk(&control, &writer, chunk).await?;
        }
    });
    (stop_sender, task)
}

async fn deliver_chunk<W>(
    control: &FlowControl,
    writer: &Mutex<W>,
    chunk: Bytes,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(diversion) = control.diverted_sender() {
        if diversion.send(chunk.clone()).await.is_ok() {
            return Ok(());
        }
    }
    if control.pass_through() {
        let mut writer = writer.lock().await;
        writer.write_all(&chunk).await?;
        writer.flush().await?;
    }
    Ok(())
}

pub(crate) async fn read_with_idle_timeout<R>(
    reader: &mut R,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(duration) => tokio::time::timeout(duration, reader.read(buffer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read idle timeout expired"))?,
        None => reader.read(buffer).await,
    }
}

// Post-login byte engine: both directions forwarded verbatim, EOF on one leg
// half-closes the other, and the session ends when both legs are drained.
pub(crate) async fn relay_passthrough<CR, CW, OR, OW>(
    client_reader: &mut BufReader<CR>,
    client_writer: &mut CW,
    origin_reader: &mut BufReader<OR>,
    origin_writer: &mut OW,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    OR: AsyncRead + Unpin,
    OW: AsyncWrite + Unpin,
{
    let mut from_client = flush_lookahead(client_reader, origin_writer).await?;
    let mut from_origin = flush_lookahead(origin_reader, client_writer).await?;

    let mut client_buffer = vec![0u8; CONTROL_BUFFER_SIZE];
    let mut origin_buffer = vec![0u8; CONTROL_BUFFER_SIZE];
    let mut client_closed = false;
    let mut origin_closed = false;

    loop {
        if client_closed && origin_closed {
            return Ok((from_client, from_origin));
        }

        tokio::select! {
            read = read_with_idle_timeout(client_reader, &mut client_buffer, idle_timeout), if !client_closed => {
                let read = read?;
                if read == 0 {
                    client_closed = true;
                    let _ = origin_writer.shutdown().await;
                } else {
                    origin_writer.write_all(&client_buffer[..read]).await?;
                    origin_writer.flush().await?;
                    from_client += read as u64;
                }
            }
            read = read_with_idle_timeout(origin_reader, &mut origin_buffer, idle_timeout), if !origin_closed => {
                let read = read?;
                if read == 0 {
                    origin_closed = true;
                    let _ = client_writer.shutdown().await;
                } else {
                    client_writer.write_all(&origin_buffer[..read]).await?;
                    client_writer.flush().await?;
                    from_origin += read as u64;
                }
            }
        }
    }
}

async fn flush_lookahead<R, W>(reader: &mut BufReader<R>, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let buffered = reader.buffer().to_vec();
    if buffered.is_empty() {
        return Ok(0);
    }
    writer.write_all(&buffered).await?;
    writer.flush().await?;
    reader.consume(buffered.len());
    Ok(buffered.len() as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    use crate::flow::FlowControl;

    use super::{relay_passthrough, spawn_response_pump, PumpExit};

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn forwards_origin_bytes_in_order_while_pass_through() {
        let (mut origin_side, pump_reader) = tokio::io::duplex(1024);
        let (pump_writer, mut client_side) = tokio::io::duplex(1024);
        let control = FlowControl::new();
        let (_stop, task) = spawn_response_pump(
            pump_reader,
            Arc::new(Mutex::new(pump_writer)),
            Arc::clone(&control),
            None,
        );

        origin_side.write_all(b"220 Welcome\r\n").await.expect("write");
        origin_side.write_all(b"331 Password required\r\n").await.expect("write");

        let mut received = vec![0u8; 36];
        timeout(WAIT, client_side.read_exact(&mut received))
            .await
            .expect("client receives bytes")
            .expect("read");
        assert_eq!(&received[..], b"220 Welcome\r\n331 Password required\r\n");

        drop(origin_side);
        let exit = timeout(WAIT, task).await.expect("pump ends").expect("join");
        assert!(matches!(exit, Ok(PumpExit::Eof)));
    }

    #[tokio::test]
    async fn held_slot_diverts_bytes_away_from_the_client() {
        let (mut origin_side, pump_reader) = tokio::io::duplex(1024);
        let (pump_writer, mut client_side) = tokio::io::duplex(1024);
        let control = FlowControl::new();
        let (_stop, _task) = spawn_response_pump(
            pump_reader,
            Arc::new(Mutex::new(pump_writer)),
            Arc::clone(&control),
            None,
        );

        let mut slot = control
            .reserve_response(Some(WAIT))
            .await
            .expect("reserve");
        origin_side.write_all(b"234 Proceed\r\n").await.expect("write");

        let diverted = slot.next_chunk(Some(WAIT)).await.expect("diverted chunk");
        assert_eq!(&diverted[..], b"234 Proceed\r\n");

        let mut probe = [0u8; 1];
        let leak = timeout(Duration::from_millis(50), client_side.read(&mut probe)).await;
        assert!(leak.is_err(), "no bytes may reach the client while held");

        drop(slot);
        origin_side.write_all(b"200 Ok\r\n").await.expect("write");
        let mut resumed = vec![0u8; 8];
        timeout(WAIT, client_side.read_exact(&mut resumed))
            .await
            .expect("pass-through resumes")
            .expect("read");
        assert_eq!(&resumed[..], b"200 Ok\r\n");
    }

    #[tokio::test]
    async fn suspension_drops_origin_bytes() {
        let (mut origin_side, pump_reader) = tokio::io::duplex(1024);
        let (pump_writer, mut client_side) = tokio::io::duplex(1024);
        let control = FlowControl::new();
        let (_stop, _task) = spawn_response_pump(
            pump_reader,
            Arc::new(Mutex::new(pump_writer)),
            Arc::clone(&control),
            None,
        );

        let guard = control.suspend(Some(WAIT)).await.expect("suspend");
        origin_side.write_all(b"stale greeting\r\n").await.expect("write");
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        origin_side.write_all(b"200 Ok\r\n").await.expect("write");
        let mut received = vec![0u8; 8];
        timeout(WAIT, client_side.read_exact(&mut received))
            .await
            .expect("post-suspension bytes arrive")
            .expect("read");
        assert_eq!(&received[..], b"200 Ok\r\n");
    }

    #[tokio::test]
    async fn stop_returns_the_reader_with_the_stream_intact() {
        let (mut origin_side, pump_reader) = tokio::io::duplex(1024);
        let (pump_writer, _client_side) = tokio::io::duplex(1024);
        let control = FlowControl::new();
        let (stop, task) = spawn_response_pump(
            pump_reader,
            Arc::new(Mutex::new(pump_writer)),
            Arc::clone(&control),
            None,
        );

        stop.send(true).expect("stop signal");
        let exit = timeout(WAIT, task).await.expect("pump stops").expect("join");
        let mut reader = match exit.expect("pump result") {
            PumpExit::Stopped(reader) => reader,
            PumpExit::Eof => panic!("expected a stopped pump"),
        };

        origin_side.write_all(b"220 still here\r\n").await.expect("write");
        let mut received = vec![0u8; 16];
        timeout(WAIT, reader.read_exact(&mut received))
            .await
            .expect("recovered reader still reads")
            .expect("read");
        assert_eq!(&received[..], b"220 still here\r\n");
    }

    #[tokio::test]
    async fn eof_signals_a_held_slot_with_an_empty_chunk() {
        let (origin_side, pump_reader) = tokio::io::duplex(1024);
        let (pump_writer, _client_side) = tokio::io::duplex(1024);
        let control = FlowControl::new();
        let (_stop, task) = spawn_response_pump(
            pump_reader,
            Arc::new(Mutex::new(pump_writer)),
            Arc::clone(&control),
            None,
        );

        let mut slot = control
            .reserve_response(Some(WAIT))
            .await
            .expect("reserve");
        drop(origin_side);

        let chunk = slot.next_chunk(Some(WAIT)).await.expect("eof marker");
        assert!(chunk.is_empty());
        let exit = timeout(WAIT, task).await.expect("pump ends").expect("join");
        assert!(matches!(exit, Ok(PumpExit::Eof)));
    }

    #[tokio::test]
    async fn relay_forwards_both_directions_and_propagates_eof() {
        let (mut client_remote, client_local) = tokio::io::duplex(1024);
        let (mut origin_remote, origin_local) = tokio::io::duplex(1024);

        let (client_read, mut client_write) = tokio::io::split(client_local);
        let (origin_read, mut origin_write) = tokio::io::split(origin_local);
        let mut client_reader = BufReader::new(client_read);
        let mut origin_reader = BufReader::new(origin_read);

        let relay = tokio::spawn(async move {
            relay_passthrough(
                &mut client_reader,
                &mut client_write,
                &mut origin_reader,
                &mut origin_write,
                None,
            )
            .await
        });

        client_remote.write_all(b"NOOP\r\n").await.expect("client write");
        let mut at_origin = vec![0u8; 6];
        timeout(WAIT, origin_remote.read_exact(&mut at_origin))
            .await
            .expect("origin receives")
            .expect("read");
        assert_eq!(&at_origin[..], b"NOOP\r\n");

        origin_remote.write_all(b"200 Ok\r\n").await.expect("origin write");
        let mut at_client = vec![0u8; 8];
        timeout(WAIT, client_remote.read_exact(&mut at_client))
            .await
            .expect("client receives")
            .expect("read");
        assert_eq!(&at_client[..], b"200 Ok\r\n");

        drop(origin_remote);
        drop(client_remote);
        let (from_client, from_origin) = timeout(WAIT, relay)
            .await
            .expect("relay ends")
            .expect("join")
            .expect("relay result");
        assert_eq!(from_client, 6);
        assert_eq!(from_origin, 8);
    }
}
