use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::warn;

use crate::event::PanelEvent;
use crate::hub::EventHub;

/// Longest line emitted as one unit; longer output is split
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into text lines.
///
/// Line endings (`\n` or `\r\n`) are stripped, invalid UTF-8 is replaced, and a
/// final unterminated line is still emitted at end of stream.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes already scanned for a newline in the current buffer
    scanned: usize,
}

impl LineCodec {
    /// Consume `len` bytes of text, plus the `\n` after them when `terminated`
    fn take_line(&mut self, src: &mut BytesMut, len: usize, terminated: bool) -> String {
        let mut line = &src[..len];
        if terminated && line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let text = String::from_utf8_lossy(line).into_owned();
        src.advance(if terminated { len + 1 } else { len });
        self.scanned = 0;
        text
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Room for a full-length line plus its `\r\n`
        let window = src.len().min(MAX_LINE_BYTES + 2);
        let from = self.scanned.min(window);
        if let Some(offset) = src[from..window].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let text_len = if end > 0 && src[end - 1] == b'\r' { end - 1 } else { end };
            if text_len <= MAX_LINE_BYTES {
                return Ok(Some(self.take_line(src, end, true)));
            }
            return Ok(Some(self.take_line(src, MAX_LINE_BYTES, false)));
        }

        if src.len() >= MAX_LINE_BYTES + 2 {
            return Ok(Some(self.take_line(src, MAX_LINE_BYTES, false)));
        }

        self.scanned = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len().min(MAX_LINE_BYTES);
                Ok(Some(self.take_line(src, len, false)))
            }
        }
    }
}

/// Append-only log file shared by the capture tasks of one process
#[derive(Clone)]
pub struct LogSink(Arc<Mutex<File>>);

impl LogSink {
    /// Open `path` for appending, creating it and its directory as needed
    pub fn open(path: &Path) -> std::io::Result<LogSink> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(LogSink::new(File::from_std(file)))
    }

    pub fn new(file: File) -> LogSink {
        LogSink(Arc::new(Mutex::new(file)))
    }

    /// Append one line followed by a newline
    pub async fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');

        let mut file = self.0.lock().await;
        file.write_all(&record).await?;
        file.flush().await
    }
}

/// Drain one output stream of process `id` into its log and the event hub.
///
/// Runs until the pipe closes. Log write failures are reported once and
/// otherwise ignored so that a full disk never stops supervision.
pub async fn capture_output<R: AsyncRead + Unpin>(
    id: &str,
    reader: R,
    sink: LogSink,
    hub: EventHub<PanelEvent>,
) {
    let mut frames = FramedRead::with_capacity(reader, LineCodec::default(), 8 * 1024);
    let mut write_failed = false;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                if let Err(e) = sink.append_line(&line).await {
                    if !write_failed {
                        warn!(id = %id, error = %e, "Failed to append to process log");
                        write_failed = true;
                    }
                }
                hub.publish(PanelEvent::log(id, line));
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Output capture stopped");
                break;
            }
        }
    }
}
