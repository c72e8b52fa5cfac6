// ABOUTME: drains a script's stdout and stderr concurrently into bounded accumulators line by line.
// ABOUTME: forwards accepted lines to an optional sink on a blocking task so slow sinks never stall the pipes.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use scriptbox_common::{OutputLine, StreamKind, TRUNCATION_MARKER};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

const MAX_LINE_BYTES: usize = 64 * 1024;

/// Receives every accepted line, tagged with its stream. Called off the async workers.
pub type OutputSink = Arc<dyn Fn(&OutputLine) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Accepted,
    /// This line crossed the bound; the marker has been appended.
    Truncated,
    Discarded,
}

#[derive(Debug)]
pub struct StreamBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl StreamBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, line: &str) -> Push {
        if self.truncated {
            return Push::Discarded;
        }
        if self.text.len() + line.len() > self.limit {
            self.text.push_str(TRUNCATION_MARKER);
            self.truncated = true;
            return Push::Truncated;
        }
        self.text.push_str(line);
        Push::Accepted
    }

    fn take(&mut self) -> (String, bool) {
        (std::mem::take(&mut self.text), self.truncated)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub output: String,
    pub output_truncated: bool,
    pub error: String,
    pub error_truncated: bool,
}

/// Lazy line sequence over one stream, ending at end-of-stream.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    /// Start of a multibyte character cut off by the chunk bound.
    carry: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            carry: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        self.buf.append(&mut self.carry);
        let room = MAX_LINE_BYTES - self.buf.len();
        (&mut self.reader)
            .take(room as u64)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if self.buf.is_empty() {
            return Ok(None);
        }
        if !self.buf.ends_with(b"\n") {
            let tail = incomplete_utf8_tail(&self.buf);
            if tail > 0 && tail < self.buf.len() {
                self.carry = self.buf.split_off(self.buf.len() - tail);
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Length of a trailing multibyte sequence that is missing continuation bytes, or 0.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

pub struct OutputPump {
    readers: Vec<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    stdout: Arc<Mutex<StreamBuffer>>,
    stderr: Arc<Mutex<StreamBuffer>>,
}

impl OutputPump {
    pub fn start<O, E>(stdout: O, stderr: E, limit: usize, sink: Option<OutputSink>) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        // the queue only holds accepted lines and one marker per stream, so it is bounded by the output limits
        let (tx, delivery) = match sink {
            Some(sink) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(spawn_delivery(rx, sink)))
            }
            None => (None, None),
        };

        let stdout_buf = Arc::new(Mutex::new(StreamBuffer::new(limit)));
        let stderr_buf = Arc::new(Mutex::new(StreamBuffer::new(limit)));

        let readers = vec![
            tokio::spawn(read_stream(StreamKind::Stdout, stdout, stdout_buf.clone(), tx.clone())),
            tokio::spawn(read_stream(StreamKind::Stderr, stderr, stderr_buf.clone(), tx)),
        ];

        Self {
            readers,
            delivery,
            stdout: stdout_buf,
            stderr: stderr_buf,
        }
    }

    /// Joins both read loops and the sink delivery, abandoning any still running after `capture_timeout`.
    pub async fn finish(self, capture_timeout: Duration) -> CapturedOutput {
        let deadline = tokio::time::Instant::now() + capture_timeout;
        for reader in self.readers {
            let abort = reader.abort_handle();
            match tokio::time::timeout_at(deadline, reader).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "output reader task failed"),
                Err(_) => {
                    warn!("output stream still open after exit; abandoning reader");
                    abort.abort();
                }
            }
        }

        if let Some(delivery) = self.delivery {
            match tokio::time::timeout(capture_timeout, delivery).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "output sink panicked"),
                Err(_) => warn!("output sink still busy; detaching delivery"),
            }
        }

        let (output, output_truncated) = lock(&self.stdout).take();
        let (error, error_truncated) = lock(&self.stderr).take();
        CapturedOutput {
            output,
            output_truncated,
            error,
            error_truncated,
        }
    }
}

fn lock(buffer: &Mutex<StreamBuffer>) -> MutexGuard<'_, StreamBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_delivery(mut rx: mpsc::UnboundedReceiver<OutputLine>, sink: OutputSink) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(line) = rx.blocking_recv() {
            sink(&line);
        }
    })
}

async fn read_stream<R>(
    kind: StreamKind,
    stream: R,
    buffer: Arc<Mutex<StreamBuffer>>,
    tx: Option<mpsc::UnboundedSender<OutputLine>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LineReader::new(stream);
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(stream = ?kind, error = %err, "output stream read failed");
                break;
            }
        };

        // keep draining after truncation so the script never blocks on a full pipe
        let pushed = lock(&buffer).push(&line);
        match pushed {
            Push::Accepted => {
                if let Some(tx) = &tx {
                    let _ = tx.send(OutputLine { stream: kind, text: line });
                }
            }
            Push::Truncated => {
                warn!(stream = ?kind, "output exceeded limit, truncating");
                if let Some(tx) = &tx {
                    let _ = tx.send(OutputLine {
                        stream: kind,
                        text: TRUNCATION_MARKER.to_string(),
                    });
                }
            }
            Push::Discarded => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<OutputLine>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_sink = seen.clone();
        let sink: OutputSink = Arc::new(move |line: &OutputLine| {
            seen_in_sink.lock().unwrap().push(line.clone());
        });
        (sink, seen)
    }

    fn joined(lines: &[OutputLine], stream: StreamKind) -> String {
        lines
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.text.as_str())
            .collect()
    }

    #[tokio::test]
    async fn sink_sees_exactly_the_accumulated_lines_in_order() {
        let (sink, seen) = collecting_sink();
        let pump = OutputPump::start(
            Cursor::new(b"a\nb\nc".to_vec()),
            Cursor::new(b"oops\n".to_vec()),
            1024,
            Some(sink),
        );
        let captured = pump.finish(Duration::from_secs(5)).await;

        assert_eq!(captured.output, "a\nb\nc");
        assert_eq!(captured.error, "oops\n");
        assert!(!captured.output_truncated);

        let seen = seen.lock().unwrap();
        assert_eq!(joined(&seen, StreamKind::Stdout), captured.output);
        assert_eq!(joined(&seen, StreamKind::Stderr), captured.error);
        let stdout_lines: Vec<&str> = seen
            .iter()
            .filter(|l| l.stream == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout_lines, vec!["a\n", "b\n", "c"]);
    }

    #[tokio::test]
    async fn truncation_marker_reaches_sink_then_forwarding_stops() {
        let (sink, seen) = collecting_sink();
        let pump = OutputPump::start(
            Cursor::new(b"12345\n67890\nabcde\n".to_vec()),
            Cursor::new(Vec::new()),
            10,
            Some(sink),
        );
        let captured = pump.finish(Duration::from_secs(5)).await;

        assert!(captured.output_truncated);
        assert_eq!(captured.output, format!("12345\n{TRUNCATION_MARKER}"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].text, TRUNCATION_MARKER);
        assert_eq!(joined(&seen, StreamKind::Stdout), captured.output);
    }

    #[tokio::test]
    async fn long_lines_arrive_in_chunks() {
        let mut data = vec![b'x'; MAX_LINE_BYTES + 10];
        data.push(b'\n');
        let mut lines = LineReader::new(Cursor::new(data));

        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_BYTES);
        assert_eq!(second.len(), 11);
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_bound_never_splits_a_character() {
        let mut data = vec![b'x'; MAX_LINE_BYTES - 1];
        data.extend_from_slice("é\n".as_bytes());
        let mut lines = LineReader::new(Cursor::new(data));

        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE_BYTES - 1);
        assert!(first.bytes().all(|b| b == b'x'));
        assert_eq!(second, "é\n");
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cut_character_at_end_of_stream_is_replaced() {
        let mut lines = LineReader::new(Cursor::new(vec![b'o', b'k', 0xC3]));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ok");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "\u{fffd}");
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[test]
    fn incomplete_tail_lengths() {
        assert_eq!(incomplete_utf8_tail(b"abc"), 0);
        assert_eq!(incomplete_utf8_tail("aé".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(&[b'a', 0xE2, 0x82]), 2);
        assert_eq!(incomplete_utf8_tail(&[b'a', 0xF0]), 1);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let mut lines = LineReader::new(Cursor::new(vec![0xff, b'o', b'k', b'\n']));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "\u{fffd}ok\n");
    }

    #[tokio::test]
    async fn stalled_sink_does_not_stall_readers() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let sink: OutputSink = Arc::new(move |_line: &OutputLine| {
            let _ = release_rx.lock().unwrap().recv();
        });

        let body: Vec<u8> = (0..500).flat_map(|i| format!("line {i}\n").into_bytes()).collect();
        let expected = String::from_utf8(body.clone()).unwrap();
        let pump = OutputPump::start(Cursor::new(body), Cursor::new(Vec::new()), 1 << 20, Some(sink));

        for _ in 0..100u32 {
            if lock(&pump.stdout).text.len() == expected.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lock(&pump.stdout).text, expected);

        drop(release_tx);
        let captured = pump.finish(Duration::from_secs(5)).await;
        assert_eq!(captured.output, expected);
    }

    #[test]
    fn buffer_reports_transition_once() {
        let mut buffer = StreamBuffer::new(4);
        assert_eq!(buffer.push("ab\n"), Push::Accepted);
        assert_eq!(buffer.push("cd\n"), Push::Truncated);
        assert_eq!(buffer.push("e\n"), Push::Discarded);
    }
}
