//! The stdio forwarding pipeline.
//!
//! The plugin's stderr is scanned line by line with a bounded buffer. Lines
//! that parse as structured JSON log records are re-emitted through the
//! host's logger at the level they carry; everything else is copied raw to
//! the caller's stderr sink and logged at debug. Lines longer than the
//! buffer are split into multiple chunks whose concatenation reproduces the
//! source bytes exactly.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

use crate::config::BufferConfig;

/// One key/value pair from a structured log record, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecordKv {
    pub key: String,
    pub value: Value,
}

/// A structured log record parsed from a plugin stderr line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    pub timestamp: Option<String>,
    /// Remaining fields, ordered by their byte position in the source line
    /// so the order survives non-deterministic map iteration.
    pub kv: Vec<LogRecordKv>,
}

/// Try to interpret a stderr chunk as a structured log record. Returns
/// `None` for anything that is not a JSON object carrying at least
/// `@level` and `@message`.
pub fn parse_log_record(input: &[u8]) -> Option<LogRecord> {
    let value: Value = serde_json::from_slice(input).ok()?;
    let mut object = match value {
        Value::Object(map) => map,
        _ => return None,
    };

    let level = match object.remove("@level") {
        Some(Value::String(s)) => s,
        _ => return None,
    };
    let message = match object.remove("@message") {
        Some(Value::String(s)) => s,
        _ => return None,
    };
    let timestamp = match object.remove("@timestamp") {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };

    // Order remaining keys by where they appear in the raw bytes.
    let mut keyed: Vec<(usize, String, Value)> = object
        .into_iter()
        .map(|(key, value)| {
            let needle = format!("\"{key}\":");
            let position = find_subslice(input, needle.as_bytes()).unwrap_or(usize::MAX);
            (position, key, value)
        })
        .collect();
    keyed.sort_by_key(|(position, _, _)| *position);

    Some(LogRecord {
        level,
        message,
        timestamp,
        kv: keyed
            .into_iter()
            .map(|(_, key, value)| LogRecordKv { key, value })
            .collect(),
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Emit a parsed record through the host logger at its own level.
pub(crate) fn emit_log_record(plugin: &str, record: &LogRecord) {
    let mut text = record.message.clone();
    for kv in &record.kv {
        text.push_str(&format!(" {}={}", kv.key, kv.value));
    }
    match record.level.as_str() {
        "trace" => trace!(target: "skiff::plugin", plugin, "{text}"),
        "debug" => debug!(target: "skiff::plugin", plugin, "{text}"),
        "info" => info!(target: "skiff::plugin", plugin, "{text}"),
        "warn" | "warning" => warn!(target: "skiff::plugin", plugin, "{text}"),
        "error" => error!(target: "skiff::plugin", plugin, "{text}"),
        _ => debug!(target: "skiff::plugin", plugin, "{text}"),
    }
}

/// Line scanner with a bounded buffer.
///
/// Yields chunks terminated by a newline (newline included), or exactly
/// `max` bytes when a line exceeds the buffer. The concatenation of all
/// chunks is byte-identical to the input.
pub struct LineScanner<R> {
    reader: R,
    buf: Vec<u8>,
    max: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineScanner<R> {
    pub fn new(reader: R, max: usize) -> Self {
        LineScanner {
            reader,
            buf: Vec::new(),
            max: max.max(BufferConfig::STDERR_SCAN_MIN),
            eof: false,
        }
    }

    /// The next chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(i) = self.buf.iter().position(|&b| b == b'\n') {
                if i < self.max {
                    return Ok(Some(self.buf.drain(..=i).collect()));
                }
            }
            if self.buf.len() >= self.max {
                return Ok(Some(self.buf.drain(..self.max).collect()));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Drive the stderr pipeline until the stream ends: parse JSON records,
/// forward everything else to `sink`.
pub(crate) async fn forward_stderr<R>(
    plugin: String,
    reader: R,
    max_line: usize,
    mut sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) where
    R: AsyncRead + Unpin,
{
    let mut scanner = LineScanner::new(reader, max_line);
    loop {
        match scanner.next_chunk().await {
            Ok(Some(chunk)) => {
                if let Some(record) = parse_log_record(trim_line(&chunk)) {
                    emit_log_record(&plugin, &record);
                    continue;
                }
                if let Some(ref mut sink) = sink {
                    if let Err(e) = sink.write_all(&chunk).await {
                        error!(plugin, error = %e, "failed to write plugin stderr to sink");
                    }
                }
                debug!(
                    target: "skiff::plugin",
                    plugin,
                    "stderr: {}",
                    String::from_utf8_lossy(trim_line(&chunk))
                );
            }
            Ok(None) => break,
            Err(e) => {
                error!(plugin, error = %e, "error scanning plugin stderr");
                break;
            }
        }
    }
    if let Some(ref mut sink) = sink {
        let _ = sink.flush().await;
    }
}

fn trim_line(chunk: &[u8]) -> &[u8] {
    let mut end = chunk.len();
    while end > 0 && (chunk[end - 1] == b'\n' || chunk[end - 1] == b'\r') {
        end -= 1;
    }
    &chunk[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_record_basic() {
        let input = br#"{"@level":"info","@message":"hello","@timestamp":"2024-01-01T00:00:00.000000Z"}"#;
        let record = parse_log_record(input).unwrap();
        assert_eq!(record.level, "info");
        assert_eq!(record.message, "hello");
        assert_eq!(record.timestamp.as_deref(), Some("2024-01-01T00:00:00.000000Z"));
        assert!(record.kv.is_empty());
    }

    #[test]
    fn test_parse_log_record_preserves_key_order() {
        let input = br#"{"@level":"debug","@message":"m","zebra":1,"apple":2,"mango":3}"#;
        let record = parse_log_record(input).unwrap();
        let keys: Vec<&str> = record.kv.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["zebra", "apple", "mango"]);
        assert_eq!(record.kv[0].value, Value::from(1));
    }

    #[test]
    fn test_parse_log_record_rejects_plain_text() {
        assert!(parse_log_record(b"plain stderr line").is_none());
        assert!(parse_log_record(b"{\"no_level\":true}").is_none());
        assert!(parse_log_record(b"[1,2,3]").is_none());
    }

    #[tokio::test]
    async fn test_scanner_yields_lines_with_newline() {
        let data: &[u8] = b"one\ntwo\nthree";
        let mut scanner = LineScanner::new(data, 64);
        assert_eq!(scanner.next_chunk().await.unwrap().unwrap(), b"one\n");
        assert_eq!(scanner.next_chunk().await.unwrap().unwrap(), b"two\n");
        assert_eq!(scanner.next_chunk().await.unwrap().unwrap(), b"three");
        assert!(scanner.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scanner_splits_oversized_lines_losslessly() {
        let line = vec![b'x'; 200];
        let mut input = line.clone();
        input.push(b'\n');
        let mut scanner = LineScanner::new(&input[..], 64);

        let mut collected = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = scanner.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 64);
            collected.extend_from_slice(&chunk);
            chunks += 1;
        }
        assert_eq!(collected, input);
        assert!(chunks >= 2);
    }

    #[tokio::test]
    async fn test_scanner_enforces_minimum_buffer() {
        let data: &[u8] = b"0123456789012345678901234567890123456789\n";
        // Asking for a 1-byte buffer gets the 32-byte floor.
        let mut scanner = LineScanner::new(data, 1);
        let first = scanner.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 32);
    }

    #[tokio::test]
    async fn test_scanner_line_exactly_at_max() {
        let mut input = vec![b'a'; 63];
        input.push(b'\n');
        let mut scanner = LineScanner::new(&input[..], 64);
        let chunk = scanner.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.len(), 64);
        assert!(scanner.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forward_stderr_copies_raw_lines() {
        let (sink_tx, mut sink_rx) = tokio::io::duplex(4096);
        let data: &[u8] = b"not json at all\n";
        forward_stderr(
            "test".to_string(),
            data,
            64,
            Some(Box::new(sink_tx)),
        )
        .await;

        let mut out = vec![0u8; data.len()];
        tokio::io::AsyncReadExt::read_exact(&mut sink_rx, &mut out)
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_forward_stderr_does_not_copy_json_records() {
        let (sink_tx, mut sink_rx) = tokio::io::duplex(4096);
        let data: &[u8] = b"{\"@level\":\"info\",\"@message\":\"structured\"}\nraw\n";
        forward_stderr("test".to_string(), data, 64, Some(Box::new(sink_tx))).await;

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut sink_rx, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"raw\n");
    }
}
