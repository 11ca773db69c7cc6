//! Heartbeat ingestion over a line-delimited TCP stream.
//!
//! Each connection is one producer. Every line is decoded independently:
//! JSON heartbeat records, process-died notices, or the key/value lines of
//! the connection's implicit record. When a connection that announced an
//! implicit record closes, a departure heartbeat for it is emitted.
//!
//! Lines are framed by [`RecordCodec`], which never holds more than one
//! record's worth of bytes and hands back raw bytes, so an oversized or
//! non-UTF-8 line costs that line only.

use anyhow::Result;
use broker_core::{decode_line, ClientId, IngestItem, KeyValueProducer};
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info, warn};

/// Lines longer than this are discarded (64 KiB).
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// One newline-terminated record as read off the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum RecordFrame {
    /// Line contents without the trailing newline
    Line(BytesMut),
    /// A line over the size limit was skipped; carries its length
    Oversized(usize),
}

/// Newline framing with a length cap.
///
/// Unlike `LinesCodec`, nothing here is an error: an overlong line is
/// skipped without buffering it and reported as [`RecordFrame::Oversized`],
/// and bytes are not checked for UTF-8. The stream keeps going either way.
#[derive(Debug)]
pub struct RecordCodec {
    max_length: usize,
    /// Where to resume the newline search
    next_index: usize,
    /// Bytes dropped so far from the line being skipped
    discarding: Option<usize>,
}

impl RecordCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: None,
        }
    }
}

impl Decoder for RecordCodec {
    type Item = RecordFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RecordFrame>, io::Error> {
        if let Some(dropped) = self.discarding {
            return match buf.iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    buf.advance(offset + 1);
                    self.discarding = None;
                    Ok(Some(RecordFrame::Oversized(dropped + offset)))
                }
                None => {
                    self.discarding = Some(dropped + buf.len());
                    buf.clear();
                    Ok(None)
                }
            };
        }

        let scan_to = buf.len().min(self.max_length + 1);
        match buf[self.next_index..scan_to].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;
                let mut line = buf.split_to(end + 1);
                line.truncate(end);
                Ok(Some(RecordFrame::Line(line)))
            }
            None if buf.len() > self.max_length => {
                self.next_index = 0;
                self.discarding = Some(0);
                self.decode(buf)
            }
            None => {
                self.next_index = scan_to;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RecordFrame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if let Some(dropped) = self.discarding.take() {
            return Ok(Some(RecordFrame::Oversized(dropped)));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // Unterminated last line
        self.next_index = 0;
        Ok(Some(RecordFrame::Line(buf.split())))
    }
}

/// Bind the ingestion listener. Port 0 lets the OS pick one.
pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Heartbeat ingestion listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept producers until `sink` is closed.
pub async fn serve(listener: TcpListener, sink: mpsc::UnboundedSender<IngestItem>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        read_producer(stream, addr, sink).await;
                    });
                }
                Err(e) => error!("Failed to accept producer: {}", e),
            },
            _ = sink.closed() => {
                debug!("Ingestion sink closed, stopping listener");
                break;
            }
        }
    }
}

async fn read_producer<R>(stream: R, addr: SocketAddr, sink: mpsc::UnboundedSender<IngestItem>)
where
    R: AsyncRead + Unpin,
{
    let mut producer = KeyValueProducer::new(ClientId::generate());
    debug!("Producer connected from {} (implicit id {})", addr, producer.id());

    let mut frames = FramedRead::new(stream, RecordCodec::new(MAX_RECORD_SIZE));
    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(RecordFrame::Line(bytes)) => bytes,
            Ok(RecordFrame::Oversized(len)) => {
                warn!(
                    "Record from {} exceeds max size ({} > {}), dropping",
                    addr, len, MAX_RECORD_SIZE
                );
                continue;
            }
            Err(e) => {
                warn!("Read error from producer {}: {}", addr, e);
                break;
            }
        };

        let line = match std::str::from_utf8(&bytes) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!("Discarding non-UTF-8 record from {}: {}", addr, e);
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        match decode_line(&mut producer, line) {
            Ok(item) => {
                if sink.send(item).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Discarding malformed record from {}: {}", addr, e),
        }
    }

    if let Some(farewell) = producer.farewell() {
        debug!("Producer {} gone, departing {}", addr, producer.id());
        let _ = sink.send(farewell);
    } else {
        debug!("Producer {} disconnected", addr);
    }
}
