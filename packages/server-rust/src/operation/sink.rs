//! Bridge from a blocking workload to the operation's response stream.
//!
//! The workload pushes lines into a bounded channel through [`StreamSink`];
//! the response body drains that channel and is the only writer of the
//! transport. A full channel blocks the workload for up to
//! `send_timeout`, after which the stream is treated as broken. Lines longer
//! than `max_line_length` are split over consecutive frames so that no frame
//! exceeds the codec limit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use pkgsvc_core::{CodecError, EventCodec, EventSink, OperationEvent, RpcStatus};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::network::StreamConfig;

/// Room for at least one UTF-8 character per chunk.
const MIN_LINE_LENGTH: usize = 4;

/// Worker-side end of an operation's event channel.
#[derive(Debug)]
pub struct StreamSink {
    tx: mpsc::Sender<OperationEvent>,
    send_timeout: Duration,
    max_line_length: usize,
    runtime: Handle,
    disconnected: AtomicBool,
}

/// Creates the event channel for one operation.
///
/// Must be called from within a tokio runtime; the sink uses that runtime's
/// timer for bounded blocking sends.
#[must_use]
pub fn event_channel(config: &StreamConfig) -> (Arc<StreamSink>, mpsc::Receiver<OperationEvent>) {
    let (tx, rx) = mpsc::channel(config.event_channel_capacity.max(1));
    let sink = StreamSink {
        tx,
        send_timeout: config.send_timeout,
        max_line_length: config.max_line_length.max(MIN_LINE_LENGTH),
        runtime: Handle::current(),
        disconnected: AtomicBool::new(false),
    };
    (Arc::new(sink), rx)
}

impl StreamSink {
    /// `false` once the receiver is gone or a send timed out. Nothing more
    /// is delivered after that.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Acquire)
    }

    /// Enqueues the terminal status after every queued line. An oversized
    /// status message is truncated.
    pub async fn finish(&self, mut status: RpcStatus) {
        if !self.is_connected() {
            debug!(%status, "stream gone, dropping terminal status");
            return;
        }
        if let Some(message) = status.message.as_mut() {
            let end = floor_char_boundary(message, self.max_line_length);
            message.truncate(end);
        }
        let event = OperationEvent::status(status);
        match tokio::time::timeout(self.send_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => self.disconnect("terminal status not delivered"),
        }
    }

    fn deliver(&self, event: OperationEvent) -> bool {
        if !self.is_connected() {
            return false;
        }
        let sent = self
            .runtime
            .block_on(async { tokio::time::timeout(self.send_timeout, self.tx.send(event)).await });
        match sent {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                self.disconnect("receiver dropped");
                false
            }
            Err(_) => {
                self.disconnect("send timed out");
                false
            }
        }
    }

    fn disconnect(&self, reason: &'static str) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            debug!(reason, "operation stream disconnected");
        }
    }
}

impl EventSink for StreamSink {
    /// Blocks the calling worker thread while the channel is full. Must not
    /// be called from async code.
    fn send(&self, message: String) {
        for chunk in split_line(message, self.max_line_length) {
            if !self.deliver(OperationEvent::log(chunk)) {
                return;
            }
        }
    }
}

/// Largest index `<= max` that falls on a character boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut at = max;
    while !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Splits `line` into pieces of at most `max` bytes without breaking a
/// character. `max` must be at least 4.
fn split_line(line: String, max: usize) -> Vec<String> {
    if line.len() <= max {
        return vec![line];
    }
    let mut chunks = Vec::with_capacity(line.len() / max + 1);
    let mut rest = line.as_str();
    while !rest.is_empty() {
        let (head, tail) = rest.split_at(floor_char_boundary(rest, max));
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}

/// Encodes the channel's events as length-delimited frames, ending after
/// the terminal status or when every sender is gone.
pub fn event_stream(
    rx: mpsc::Receiver<OperationEvent>,
) -> impl Stream<Item = Result<Bytes, CodecError>> + Send + 'static {
    stream::unfold(
        (rx, EventCodec::new(), false),
        |(mut rx, mut codec, finished)| async move {
            if finished {
                return None;
            }
            let event = rx.recv().await?;
            let finished = matches!(event, OperationEvent::Status { .. });
            let frame = codec.encode_to_bytes(event);
            Some((frame, (rx, codec, finished)))
        },
    )
}

/// A stream carrying only a terminal status.
pub fn status_stream(
    status: RpcStatus,
) -> impl Stream<Item = Result<Bytes, CodecError>> + Send + 'static {
    stream::once(async move { EventCodec::new().encode_to_bytes(OperationEvent::status(status)) })
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use futures_util::StreamExt;
    use tokio_util::codec::Decoder;

    use super::*;

    async fn collect_events<S>(stream: S) -> Vec<OperationEvent>
    where
        S: Stream<Item = Result<Bytes, CodecError>>,
    {
        let frames: Vec<_> = stream.collect().await;
        let mut buf = BytesMut::new();
        for frame in frames {
            buf.extend_from_slice(&frame.unwrap());
        }
        let mut codec = EventCodec::new();
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lines_arrive_in_order_before_status() {
        let (sink, rx) = event_channel(&StreamConfig::default());
        let worker_sink = Arc::clone(&sink);
        tokio::task::spawn_blocking(move || {
            for i in 0..10 {
                worker_sink.send(format!("line {i}"));
            }
        })
        .await
        .unwrap();
        sink.finish(RpcStatus::ok()).await;
        drop(sink);

        let events = collect_events(event_stream(rx)).await;
        assert_eq!(events.len(), 11);
        for (i, event) in events.iter().take(10).enumerate() {
            assert_eq!(*event, OperationEvent::log(format!("line {i}")));
        }
        assert_eq!(events[10], OperationEvent::status(RpcStatus::ok()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_reader_applies_backpressure_without_loss() {
        let config = StreamConfig {
            event_channel_capacity: 2,
            ..StreamConfig::default()
        };
        let (sink, rx) = event_channel(&config);
        let worker_sink = Arc::clone(&sink);
        let worker = tokio::task::spawn_blocking(move || {
            for i in 0..50 {
                worker_sink.send(format!("line {i}"));
            }
        });

        let reader = tokio::spawn(async move {
            let mut events = Vec::new();
            let mut stream = Box::pin(event_stream(rx));
            let mut buf = BytesMut::new();
            let mut codec = EventCodec::new();
            while let Some(frame) = stream.next().await {
                tokio::time::sleep(Duration::from_millis(1)).await;
                buf.extend_from_slice(&frame.unwrap());
                while let Some(event) = codec.decode(&mut buf).unwrap() {
                    events.push(event);
                }
            }
            events
        });

        worker.await.unwrap();
        sink.finish(RpcStatus::ok()).await;
        drop(sink);

        let events = reader.await.unwrap();
        assert_eq!(events.len(), 51);
        assert_eq!(events[49], OperationEvent::log("line 49"));
        assert!(matches!(events[50], OperationEvent::Status { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_receiver_disconnects_silently() {
        let (sink, rx) = event_channel(&StreamConfig::default());
        drop(rx);

        let worker_sink = Arc::clone(&sink);
        tokio::task::spawn_blocking(move || {
            worker_sink.send("first".to_string());
            worker_sink.send("second".to_string());
        })
        .await
        .unwrap();

        assert!(!sink.is_connected());
        sink.finish(RpcStatus::ok()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_reader_times_out() {
        let config = StreamConfig {
            event_channel_capacity: 1,
            send_timeout: Duration::from_millis(20),
            ..StreamConfig::default()
        };
        let (sink, _rx) = event_channel(&config);

        let worker_sink = Arc::clone(&sink);
        tokio::task::spawn_blocking(move || {
            for i in 0..5 {
                worker_sink.send(format!("line {i}"));
            }
        })
        .await
        .unwrap();

        assert!(!sink.is_connected());
    }

    #[test]
    fn split_line_keeps_characters_whole() {
        assert_eq!(split_line("short".to_string(), 8), vec!["short"]);
        assert_eq!(split_line("abcdefgh".to_string(), 4), vec!["abcd", "efgh"]);
        // `é` is two bytes and must not be cut in half.
        assert_eq!(split_line("aaaé".to_string(), 4), vec!["aaa", "é"]);
        let long = "x".repeat(10);
        assert_eq!(split_line(long.clone(), 4).concat(), long);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_line_is_split_and_stream_completes() {
        let (sink, rx) = event_channel(&StreamConfig::default());
        let huge = "y".repeat(2 * 1024 * 1024);
        let worker_sink = Arc::clone(&sink);
        let line = huge.clone();
        let reader = tokio::spawn(collect_events(event_stream(rx)));
        tokio::task::spawn_blocking(move || {
            worker_sink.send(line);
            worker_sink.send("after".to_string());
        })
        .await
        .unwrap();
        sink.finish(RpcStatus::unknown("z".repeat(2 * 1024 * 1024))).await;
        drop(sink);

        let events = reader.await.unwrap();
        let (status, logs) = events.split_last().unwrap();
        let logs: Vec<&str> = logs
            .iter()
            .map(|event| match event {
                OperationEvent::Log { log } => log.as_str(),
                OperationEvent::Status { .. } => panic!("status before the last frame"),
            })
            .collect();
        assert!(logs.len() > 2);
        assert_eq!(logs.last(), Some(&"after"));
        assert_eq!(logs[..logs.len() - 1].concat(), huge);
        match status {
            OperationEvent::Status { status } => {
                assert_eq!(status.code, pkgsvc_core::StatusCode::Unknown);
                assert_eq!(
                    status.message.as_ref().map(String::len),
                    Some(StreamConfig::default().max_line_length)
                );
            }
            OperationEvent::Log { .. } => panic!("missing terminal status"),
        }
    }

    #[tokio::test]
    async fn status_stream_has_one_frame() {
        let events = collect_events(status_stream(RpcStatus::unavailable("busy"))).await;
        assert_eq!(events, vec![OperationEvent::status(RpcStatus::unavailable("busy"))]);
    }

    #[tokio::test]
    async fn event_stream_stops_after_status() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(OperationEvent::status(RpcStatus::ok())).await.unwrap();
        tx.send(OperationEvent::log("late")).await.unwrap();

        let events = collect_events(event_stream(rx)).await;
        assert_eq!(events, vec![OperationEvent::status(RpcStatus::ok())]);
        drop(tx);
    }
}
