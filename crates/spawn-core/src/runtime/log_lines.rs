use std::sync::LazyLock;

use futures::{Stream, StreamExt, stream};
use regex::Regex;

use crate::runtime::{LogStream, RuntimeResult};

static TIMESTAMP_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z\s").expect("timestamp regex is valid")
});

/// Strips the engine's RFC 3339 timestamp prefix. Blank lines yield `None`.
pub fn clean_log_line(raw: &str) -> Option<String> {
    let line = raw.trim_end_matches('\r');
    let line = TIMESTAMP_PREFIX.replace(line, "");
    if line.trim().is_empty() {
        None
    } else {
        Some(line.into_owned())
    }
}

/// Reassembles lines from output chunks that may split a line anywhere,
/// including inside a multi-byte character. Only complete lines are decoded.
#[derive(Debug, Default)]
pub struct LogLineBuffer {
    pending: Vec<u8>,
}

impl LogLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|byte| *byte == b'\n')
            .filter_map(|line| clean_log_line(&String::from_utf8_lossy(line)))
            .collect()
    }

    /// Flushes a trailing line that never received its newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        clean_log_line(&String::from_utf8_lossy(&rest))
    }
}

/// Turns a stream of raw output chunks into a stream of cleaned lines.
///
/// An error item is forwarded in place; the caller decides whether to keep
/// pulling.
pub fn into_log_lines<S>(chunks: S) -> LogStream
where
    S: Stream<Item = RuntimeResult<Vec<u8>>> + Send + 'static,
{
    let lines = chunks
        .map(Some)
        .chain(stream::once(async { None }))
        .scan(LogLineBuffer::default(), |buffer, item| {
            let batch: Vec<RuntimeResult<String>> = match item {
                Some(Ok(chunk)) => buffer.push(&chunk).into_iter().map(Ok).collect(),
                Some(Err(error)) => vec![Err(error)],
                None => buffer.finish().into_iter().map(Ok).collect(),
            };
            futures::future::ready(Some(stream::iter(batch)))
        })
        .flatten();

    Box::pin(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SpawnError, SpawnErrorKind};

    #[test]
    fn timestamps_are_stripped() {
        assert_eq!(
            clean_log_line("2024-05-01T12:30:45.123456789Z cloning repository").as_deref(),
            Some("cloning repository")
        );
        assert_eq!(clean_log_line("no timestamp here").as_deref(), Some("no timestamp here"));
    }

    #[test]
    fn blank_lines_are_dropped() {
        assert_eq!(clean_log_line("   "), None);
        assert_eq!(clean_log_line("2024-05-01T12:30:45.1Z   "), None);
    }

    #[test]
    fn buffer_joins_lines_split_across_chunks() {
        let mut buffer = LogLineBuffer::default();
        assert!(buffer.push(b"2024-05-01T12:30:45.1Z hel").is_empty());
        assert_eq!(buffer.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(buffer.push(b"ld\n\n"), vec!["world".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn buffer_keeps_characters_split_across_chunks() {
        let bytes = "héllo\nwörld".as_bytes();
        let mut buffer = LogLineBuffer::default();
        assert!(buffer.push(&bytes[..2]).is_empty());
        assert_eq!(buffer.push(&bytes[2..9]), vec!["héllo".to_string()]);
        assert_eq!(buffer.push(&bytes[9..]), Vec::<String>::new());
        assert_eq!(buffer.finish().as_deref(), Some("wörld"));
    }

    #[test]
    fn buffer_flushes_unterminated_tail() {
        let mut buffer = LogLineBuffer::default();
        assert!(buffer.push(b"done").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn stream_forwards_lines_and_errors() {
        let chunks = stream::iter(vec![
            Ok(b"one\ntw".to_vec()),
            Err(SpawnError::new(SpawnErrorKind::Stream, "connection reset")),
            Ok(b"o".to_vec()),
        ]);

        let items: Vec<_> = into_log_lines(chunks).collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_deref().unwrap(), "one");
        assert_eq!(items[1].as_ref().unwrap_err().kind, SpawnErrorKind::Stream);
        assert_eq!(items[2].as_deref().unwrap(), "two");
    }
}
