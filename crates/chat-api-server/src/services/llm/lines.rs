use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};

use super::types::{ProviderError, TextStream};

/// Split a streamed HTTP body into text lines.
///
/// Network chunks do not respect line boundaries, so partial lines are
/// buffered until their newline arrives. A trailing line without a newline is
/// still emitted. `\r\n` endings are normalized.
pub fn body_lines<S>(body: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer = BytesMut::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(e) => {
                    yield Err(ProviderError::Transport(e));
                    return;
                }
            }

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                yield Ok(decode_line(&line[..pos]));
            }
        }

        if !buffer.is_empty() {
            yield Ok(decode_line(&buffer));
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}

/// Payload of an SSE `data:` line
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_lines(chunks: Vec<&'static str>) -> Vec<String> {
        let body = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<Bytes, reqwest::Error>(Bytes::from_static(c.as_bytes()))),
        );
        body_lines(body)
            .map(|line| line.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_lines_spanning_chunks_are_reassembled() {
        let lines = collect_lines(vec!["data: {\"a\"", ":1}\r\n\r\nda", "ta: [DONE]\n"]).await;
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline_is_kept() {
        let lines = collect_lines(vec!["{\"response\":\"hi\"}\n{\"done\":true}"]).await;
        assert_eq!(lines, vec!["{\"response\":\"hi\"}", "{\"done\":true}"]);
    }

    #[test]
    fn test_sse_data_prefix() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: ping"), None);
    }
}
