//! Incremental decoder for blank-line-delimited server-sent frames.
//!
//! The upstream body arrives in arbitrary chunks. [`FrameDecoder`] keeps a
//! byte carry-over buffer and yields every complete frame exactly once.
//! Splitting happens on bytes, so a multi-byte UTF-8 sequence cut across two
//! reads is reassembled before it is decoded.

/// Errors raised while decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown workflow event: {0}")]
    UnknownEvent(String),

    #[error("Frame payload has no event field")]
    MissingEvent,
}

/// Frame delimiters: two consecutive line terminators.
const DELIMITERS: [&[u8]; 4] = [b"\r\n\r\n", b"\r\n\n", b"\n\r\n", b"\n\n"];

/// Longest delimiter minus one; a delimiter may straddle the scanned prefix.
const MAX_OVERLAP: usize = 3;

/// Byte-level frame splitter with a carry-over buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already known to hold no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the frames it completed, in order.
    ///
    /// Frames are returned without their delimiter. Empty frames (extra
    /// blank lines) are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned.saturating_sub(MAX_OVERLAP);

        while let Some((at, len)) = find_delimiter(&self.buffer, cursor) {
            let frame = &self.buffer[start..at];
            if !frame.iter().all(u8::is_ascii_whitespace) {
                frames.push(String::from_utf8(frame.to_vec())?);
            }
            start = at + len;
            cursor = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        Ok(frames)
    }

    /// Bytes of the incomplete trailing frame still held.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Position and length of the first delimiter at or after `from`.
fn find_delimiter(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buffer.len()).find_map(|i| {
        DELIMITERS
            .iter()
            .find(|d| buffer[i..].starts_with(d))
            .map(|d| (i, d.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n")
            .unwrap();
        assert_eq!(frames, vec!["data: {\"a\":1}", "data: {\"b\":2}"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn frame_split_across_reads_is_emitted_once() {
        let mut decoder = FrameDecoder::new();
        let whole = b"data: {\"event\":\"text_chunk\"}\n\n";
        let mut frames = Vec::new();
        for byte in whole.iter() {
            frames.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames, vec!["data: {\"event\":\"text_chunk\"}"]);
    }

    #[test]
    fn delimiter_split_across_reads() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: x\r\n").unwrap().is_empty());
        assert!(decoder.push(b"\r").unwrap().is_empty());
        assert_eq!(decoder.push(b"\ndata: y").unwrap(), vec!["data: x"]);
        assert_eq!(decoder.push(b"\n\n").unwrap(), vec!["data: y"]);
    }

    #[test]
    fn multibyte_character_split_across_reads() {
        let text = "data: 气候变化\n\n".as_bytes();
        // Cut inside the three-byte encoding of the first CJK character.
        let (head, tail) = text.split_at(7);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head).unwrap().is_empty());
        assert_eq!(decoder.push(tail).unwrap(), vec!["data: 气候变化"]);
    }

    #[test]
    fn crlf_delimited_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"event: ping\r\n\r\ndata: 1\r\n\r\n").unwrap();
        assert_eq!(frames, vec!["event: ping", "data: 1"]);
    }

    #[test]
    fn trailing_fragment_is_carried_over() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: 1\n\ndata: par").unwrap();
        assert_eq!(frames, vec!["data: 1"]);
        assert_eq!(decoder.pending(), "data: par".len());
    }

    #[test]
    fn blank_frames_are_dropped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"\n\n\n\ndata: 1\n\n").unwrap();
        assert_eq!(frames, vec!["data: 1"]);
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: \xff\xfe\n\n").is_err());
    }
}
