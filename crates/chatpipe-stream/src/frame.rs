//! Frame decoder: splits a growing SSE byte stream into frames
//!
//! Blocks are delimited by a blank line. A block carrying an `event:` field is
//! one typed frame whose `data:` lines are joined with `\n`. A block without
//! one is the legacy untyped variant, where every `data:` marker opens a new
//! frame and unprefixed lines continue the previous payload.
//!
//! Frames depend only on the bytes fed so far, never on how they were split
//! into chunks. An incomplete tail is held until more data arrives or
//! [`FrameDecoder::finish`] is called.

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Event name from an `event:` line, `None` for the legacy variant
    pub event: Option<String>,
    /// Payload (concatenated `data:` lines)
    pub data: String,
    /// Last `id:` field seen in the block
    pub id: Option<String>,
}

impl Frame {
    /// Build a legacy untyped frame
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Build a typed frame
    pub fn typed(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Whether this frame is the `[DONE]` sentinel
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE frame decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Decoded text not yet terminated by a blank line
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence
    pending: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(chunk);
        let text = self.take_decodable();
        self.push_str(&text)
    }

    /// Feed already-decoded text, returning every frame completed by it
    pub fn push_str(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.normalize_line_endings();
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            frames.extend(parse_block(&block[..pos]));
        }
        frames
    }

    /// Flush the carry-over as a best-effort final block
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&rest);
        }
        let block = std::mem::take(&mut self.buffer).replace("\r\n", "\n");
        if block.trim().is_empty() {
            return Vec::new();
        }
        block
            .split("\n\n")
            .flat_map(parse_block)
            .collect()
    }

    /// Carry-over text awaiting a delimiter
    pub fn remainder(&self) -> &str {
        &self.buffer
    }

    /// Decode the pending bytes.
    ///
    /// Invalid sequences are replaced where they occur; only an incomplete
    /// sequence at the very end is kept for the next chunk.
    fn take_decodable(&mut self) -> String {
        let mut text = String::new();
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..start);
        text
    }

    /// Rewrite CRLF to LF, keeping a trailing `\r` for the next chunk
    fn normalize_line_endings(&mut self) {
        let hold_cr = self.buffer.ends_with('\r');
        if hold_cr {
            self.buffer.pop();
        }
        self.buffer = self.buffer.replace("\r\n", "\n");
        if hold_cr {
            self.buffer.push('\r');
        }
    }
}

/// Interpret one blank-line delimited block
fn parse_block(block: &str) -> Vec<Frame> {
    let mut event: Option<String> = None;
    let mut id: Option<String> = None;
    let mut data_lines: Vec<String> = Vec::new();
    let mut legacy: Vec<String> = Vec::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = field(line, "data") {
            data_lines.push(value.to_string());
            legacy.push(value.to_string());
        } else if let Some(value) = field(line, "event") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = field(line, "id") {
            id = Some(value.to_string());
        } else if field(line, "retry").is_some() {
            // Reconnection hints are handled by the session layer
        } else if let Some(last) = legacy.last_mut() {
            // Continuation of a wrapped legacy payload
            if !line.trim().is_empty() {
                last.push_str(line);
            }
        }
    }

    match event {
        Some(name) => vec![Frame {
            event: Some(name),
            data: data_lines.join("\n"),
            id,
        }],
        None => legacy
            .into_iter()
            .filter(|payload| !payload.trim().is_empty())
            .map(|payload| Frame {
                event: None,
                data: payload,
                id: id.clone(),
            })
            .collect(),
    }
}

/// Strip a `name:` prefix and the single optional space after it
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPED: &str = "event: connected\ndata: {\"message\":\"hi\"}\n\n\
event: chat_stream\ndata: {\"answer\":\"Hel\",\ndata: \"reasoning\":\"r\"}\n\n\
: keep-alive comment\n\n\
event: chat_stream\ndata: {\"answer\":\"Hello 世界\"}\n\n\
data: [DONE]\n\n";

    const LEGACY: &str = "data: {\"answer\":\"a\"}\n\ndata: {\"answer\":\"ab\",\n\"reasoning\":\"x\"}\n\ndata: [DONE]\n\n";

    fn decode_in_chunks(input: &[u8], size: usize) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in input.chunks(size) {
            frames.extend(decoder.push_bytes(chunk));
        }
        frames.extend(decoder.finish());
        frames
    }

    #[test]
    fn test_typed_frames() {
        let frames = decode_in_chunks(TYPED.as_bytes(), TYPED.len());
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], Frame::typed("connected", "{\"message\":\"hi\"}"));
        assert_eq!(
            frames[1],
            Frame::typed("chat_stream", "{\"answer\":\"Hel\",\n\"reasoning\":\"r\"}")
        );
        assert_eq!(frames[2].data, "{\"answer\":\"Hello 世界\"}");
        assert!(frames[3].is_done());
        assert_eq!(frames[3].event, None);
    }

    #[test]
    fn test_chunk_boundary_invariance_typed() {
        let whole = decode_in_chunks(TYPED.as_bytes(), TYPED.len());
        for size in 1..TYPED.len() {
            assert_eq!(decode_in_chunks(TYPED.as_bytes(), size), whole, "chunk size {size}");
        }
    }

    #[test]
    fn test_chunk_boundary_invariance_crlf() {
        let crlf = TYPED.replace('\n', "\r\n");
        let expected = decode_in_chunks(TYPED.as_bytes(), TYPED.len());
        for size in 1..crlf.len() {
            assert_eq!(decode_in_chunks(crlf.as_bytes(), size), expected, "chunk size {size}");
        }
    }

    #[test]
    fn test_legacy_continuation_lines() {
        let frames = decode_in_chunks(LEGACY.as_bytes(), 3);
        assert_eq!(
            frames,
            vec![
                Frame::data("{\"answer\":\"a\"}"),
                Frame::data("{\"answer\":\"ab\",\"reasoning\":\"x\"}"),
                Frame::data("[DONE]"),
            ]
        );
    }

    #[test]
    fn test_legacy_multiple_markers_in_one_block() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push_str("data: {\"answer\":\"1\"}\ndata: {\"answer\":\"2\"}\n\n");
        assert_eq!(
            frames,
            vec![Frame::data("{\"answer\":\"1\"}"), Frame::data("{\"answer\":\"2\"}")]
        );
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_str("data: {\"answer\":").is_empty());
        assert_eq!(decoder.remainder(), "data: {\"answer\":");
        let frames = decoder.push_str("\"hi\"}\n\n");
        assert_eq!(frames, vec![Frame::data("{\"answer\":\"hi\"}")]);
        assert_eq!(decoder.remainder(), "");
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_str("data: {\"answer\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), vec![Frame::data("{\"answer\":\"tail\"}")]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_split_multibyte_character() {
        let text = "data: {\"answer\":\"é\"}\n\n";
        let bytes = text.as_bytes();
        let split = text.find('é').map(|i| i + 1).unwrap_or_default();

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_bytes(&bytes[..split]).is_empty());
        let frames = decoder.push_bytes(&bytes[split..]);
        assert_eq!(frames, vec![Frame::data("{\"answer\":\"é\"}")]);
    }

    #[test]
    fn test_invalid_byte_before_split_character() {
        let bytes = b"data: a\xFFb\xE4\xBD\xA0\n\n";
        for size in 1..=bytes.len() {
            assert_eq!(
                decode_in_chunks(bytes, size),
                vec![Frame::data("a\u{FFFD}b\u{4F60}")],
                "chunk size {size}"
            );
        }
    }

    #[test]
    fn test_id_and_retry_fields() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push_str("id: 7\nretry: 1000\nevent: heartbeat\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        assert_eq!(frames[0].event.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn test_blank_blocks_produce_nothing() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_str("\n\n\n\n: ping\n\n").is_empty());
    }
}
