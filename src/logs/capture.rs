use crate::logs::sink::{LogSink, StreamId};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Longest line forwarded as one entry; longer output is split into chunks
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A sink shared between one app's stdout and stderr pumps
pub type SharedSink = Arc<Mutex<LogSink>>;

/// Copy `reader` into `sink` line by line until EOF.
///
/// Lines are forwarded as raw bytes, so non-UTF-8 output is preserved. A line
/// longer than `MAX_LINE_BYTES` is written as several entries.
pub fn spawn_pump<R>(reader: R, stream: StreamId, sink: SharedSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            let mut chunk = (&mut reader).take(MAX_LINE_BYTES as u64);
            match chunk.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => sink.lock().await.write(stream, &line).await,
                Err(e) => {
                    tracing::debug!("{:?} pump stopped: {}", stream, e);
                    break;
                }
            }
        }
    })
}
