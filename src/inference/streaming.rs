//! SSE splitter for streaming model responses.
//!
//! Reads an HTTP body as a byte stream, splits on SSE boundaries (blank
//! line), and yields one `SseEvent` per event block. Provider-specific
//! decoding of the `data:` payload happens in the adapters.

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::SseEvent;

// ─── SSE splitter ────────────────────────────────────────────────────────────

/// Split a byte stream into SSE events.
///
/// Bytes are buffered until a full event (terminated by a blank line) is
/// available, so event and UTF-8 boundaries may fall anywhere in the chunks.
/// Comment-only blocks (keep-alives) are skipped. A trailing block without
/// the final blank line is still emitted when the stream ends.
pub fn sse_events<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(end) = find_boundary(&buffer) {
                    let block: Vec<u8> = buffer.drain(..end + 2).collect();
                    match parse_event(&String::from_utf8_lossy(&block[..end])) {
                        Some(event) => return Some((Ok(event), (byte_stream, buffer, false))),
                        None => continue,
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, true),
                        ));
                    }
                    None => {
                        let rest = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        return parse_event(&rest)
                            .map(|event| (Ok(event), (byte_stream, buffer, true)));
                    }
                }
            }
        },
    )
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one SSE event block. Returns `None` for comment-only or empty blocks.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.unwrap_or_default(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
