//! Server-sent events decoding.
//!
//! Providers stream completions as `data: <json>\n\n` frames terminated by
//! `data: [DONE]`. The decoder is push-based: feed it raw body bytes, take
//! complete frames out, keep the partial tail buffered.

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A `data:` payload.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            // Comments, event names, and blank separators carry no payload.
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                frames.push(SseFrame::Done);
            } else if !payload.is_empty() {
                frames.push(SseFrame::Data(payload.to_owned()));
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_data_frames_and_terminator() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n");
        assert_eq!(
            frames,
            vec![
                SseFrame::Data("{\"a\":1}".into()),
                SseFrame::Data("{\"b\":2}".into()),
                SseFrame::Done,
            ]
        );
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"par").is_empty());
        let frames = decoder.push(b"tial\":true}\n\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"partial\":true}".into())]);
    }

    #[test]
    fn ignores_comments_events_and_blank_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keep-alive\n\nevent: message\ndata: {\"x\":1}\n\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"x\":1}".into())]);
    }

    #[test]
    fn handles_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"y\":2}\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"y\":2}".into()), SseFrame::Done]);
    }

    #[test]
    fn tolerates_missing_space_after_colon() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data:{\"z\":3}\n\n");
        assert_eq!(frames, vec![SseFrame::Data("{\"z\":3}".into())]);
    }
}
