//! Line framing over the duplex stream.
//!
//! Inbound: bytes are split on `\n`, trimmed, and blank lines are skipped.
//! A line longer than the configured limit is never buffered whole; only
//! its head is kept so the router can still recover an id from it.
//! Outbound: every message is one JSON document followed by a single `\n`,
//! flushed immediately. All producers share one FIFO queue drained by a
//! single writer task, so lines never interleave mid-document.

use std::io;

use bytes::BytesMut;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

/// Boxed inbound half of the duplex stream
pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed outbound half of the duplex stream
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
/// Framed inbound half
pub(crate) type LineReader = FramedRead<BoxedRead, InboundCodec>;
/// Framed outbound half
pub(crate) type LineSink = FramedWrite<BoxedWrite, LinesCodec>;
/// Producer side of the outbound queue
pub(crate) type Outbound = mpsc::UnboundedSender<String>;

/// Bytes of an oversized line kept for id recovery.
const OVERSIZED_HEAD_LEN: usize = 4096;

/// One non-blank inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundLine {
    /// Trimmed text, within the size limit
    Text(String),
    /// Line within the size limit that is not valid UTF-8, decoded lossily
    Undecodable(String),
    /// Head of a line longer than the size limit
    Oversized(String),
}

/// Splits inbound bytes into [`InboundLine`]s with bounded buffering.
///
/// Reading through [`FramedRead`] keeps partial lines in the frame buffer,
/// so awaiting the next line is cancel safe.
#[derive(Debug)]
pub(crate) struct InboundCodec {
    max_line_len: usize,
    /// Offset in the buffer already searched for a newline
    next_index: usize,
    /// Head of an oversized line whose remainder is being skipped
    skipping: Option<BytesMut>,
}

impl InboundCodec {
    pub(crate) fn new(max_line_len: usize) -> Self {
        Self {
            max_line_len,
            next_index: 0,
            skipping: None,
        }
    }
}

impl Decoder for InboundCodec {
    type Item = InboundLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<InboundLine>> {
        loop {
            let newline = buf[self.next_index..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);

                    if let Some(head) = self.skipping.take() {
                        return Ok(Some(oversized(&head)));
                    }
                    if end > self.max_line_len {
                        return Ok(Some(oversized(&line[..end])));
                    }
                    if let Some(line) = classify_bytes(&line[..end]) {
                        return Ok(Some(line));
                    }
                }
                None if self.skipping.is_some() => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                None if buf.len() > self.max_line_len => {
                    let head = buf.split_to(OVERSIZED_HEAD_LEN.min(buf.len()));
                    trace!(buffered = buf.len() + head.len(), "Skipping oversized line");
                    self.skipping = Some(head);
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<InboundLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if let Some(head) = self.skipping.take() {
            buf.clear();
            return Ok(Some(oversized(&head)));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(classify_bytes(&rest))
    }
}

/// `None` for a blank line.
fn classify_bytes(bytes: &[u8]) -> Option<InboundLine> {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| InboundLine::Text(trimmed.to_string()))
        }
        Err(_) => {
            let text = String::from_utf8_lossy(bytes);
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| InboundLine::Undecodable(trimmed.to_string()))
        }
    }
}

fn oversized(bytes: &[u8]) -> InboundLine {
    let head = &bytes[..OVERSIZED_HEAD_LEN.min(bytes.len())];
    InboundLine::Oversized(String::from_utf8_lossy(head).trim().to_string())
}

pub(crate) fn line_reader(reader: BoxedRead, max_line_len: usize) -> LineReader {
    FramedRead::new(reader, InboundCodec::new(max_line_len))
}

pub(crate) fn line_sink(writer: BoxedWrite) -> LineSink {
    FramedWrite::new(writer, LinesCodec::new())
}

/// Drain the outbound queue onto `sink` until every producer is gone, then
/// hand the sink back so the stream can be reused.
///
/// Cancelling `abandon` gives up on a peer that stopped reading: queued
/// lines are dropped and the partially written line is discarded, but the
/// sink is still returned.
pub(crate) async fn pump_outbound(
    mut sink: LineSink,
    mut queue: mpsc::UnboundedReceiver<String>,
    abandon: CancellationToken,
) -> LineSink {
    tokio::select! {
        biased;
        () = abandon.cancelled() => {
            warn!(dropped = queue.len(), "Abandoned outbound lines the peer did not read");
            sink.write_buffer_mut().clear();
        }
        () = async {
            while let Some(line) = queue.recv().await {
                // `send` flushes after every line
                if let Err(e) = sink.send(line).await {
                    error!(error = %e, "Failed to write outbound line");
                }
            }
            if let Err(e) = SinkExt::<String>::flush(&mut sink).await {
                error!(error = %e, "Failed to flush outbound stream");
            }
        } => {}
    }
    sink
}
