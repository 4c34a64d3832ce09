//! Marker-delimited text framing for the rterm byte stream.
//!
//! Wire format of a response: `<body>\n\n<<END_OF_RESPONSE>>\n`.
//! Streamed shell output is written as `[HH:MM:SS] <text>` with no marker.

use serde::{Deserialize, Serialize};

/// Sentinel line that terminates every framed server response.
pub const END_OF_RESPONSE_MARKER: &str = "<<END_OF_RESPONSE>>";

/// Older sentinel spoken by early clients.
pub const LEGACY_END_MARKER: &str = "<<EOF>>";

/// Which sentinel a peer frames responses with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marker {
    #[default]
    Standard,
    Legacy,
}

impl Marker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Marker::Standard => END_OF_RESPONSE_MARKER,
            Marker::Legacy => LEGACY_END_MARKER,
        }
    }
}

impl std::str::FromStr for Marker {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" | END_OF_RESPONSE_MARKER => Ok(Marker::Standard),
            "legacy" | LEGACY_END_MARKER => Ok(Marker::Legacy),
            other => Err(format!("unknown marker '{other}' (expected standard or legacy)")),
        }
    }
}

/// Strip trailing `\r` / `\n` characters.
pub fn trim_line_breaks(text: &str) -> &str {
    text.trim_end_matches(['\r', '\n'])
}

/// Frame a response body: trailing line breaks are dropped, then a blank
/// line and the sentinel line are appended.
pub fn frame_response(body: &str, marker: Marker) -> String {
    let body = trim_line_breaks(body);
    let marker = marker.as_str();
    let mut frame = String::with_capacity(body.len() + marker.len() + 3);
    frame.push_str(body);
    frame.push_str("\n\n");
    frame.push_str(marker);
    frame.push('\n');
    frame
}

/// Local wall-clock prefix used for greetings and streamed output.
pub fn timestamp_prefix() -> String {
    chrono::Local::now().format("[%H:%M:%S] ").to_string()
}

/// Streaming response decoder: accumulates bytes and yields complete messages.
///
/// The **first** occurrence of the marker ends a message, so a marker that
/// appears inside legitimate output splits that output early.
#[derive(Debug)]
pub struct ResponseDecoder {
    buffer: Vec<u8>,
    marker: &'static [u8],
    /// The previous marker's line break has not arrived yet.
    skip_line_break: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(Marker::Standard)
    }
}

impl ResponseDecoder {
    pub fn new(marker: Marker) -> Self {
        Self {
            buffer: Vec::new(),
            marker: marker.as_str().as_bytes(),
            skip_line_break: false,
        }
    }

    /// Feed bytes into the decoder and return every completed message.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        self.consume_pending_line_break();

        let mut messages = Vec::new();
        while let Some(pos) = find(&self.buffer, self.marker) {
            let message = String::from_utf8_lossy(&self.buffer[..pos]);
            messages.push(trim_line_breaks(&message).to_string());

            self.buffer.drain(..pos + self.marker.len());
            self.skip_line_break = true;
            self.consume_pending_line_break();
        }

        messages
    }

    /// Take buffered text that can no longer turn into a marker.
    ///
    /// Used to surface streamed (unframed) output without waiting for the
    /// next sentinel. A tail that could be the start of the marker, or of a
    /// split UTF-8 character, stays buffered.
    pub fn take_pending(&mut self) -> Option<String> {
        let mut cut = self.buffer.len() - marker_prefix_len(&self.buffer, self.marker);
        if let Err(e) = std::str::from_utf8(&self.buffer[..cut]) {
            if e.error_len().is_none() {
                cut = e.valid_up_to();
            }
        }
        if cut == 0 {
            return None;
        }
        let text = String::from_utf8_lossy(&self.buffer[..cut]).into_owned();
        self.buffer.drain(..cut);
        Some(text)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skip_line_break = false;
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn consume_pending_line_break(&mut self) {
        if !self.skip_line_break || self.buffer.is_empty() {
            return;
        }
        if self.buffer.starts_with(b"\r\n") {
            self.buffer.drain(..2);
        } else if self.buffer.starts_with(b"\n") {
            self.buffer.drain(..1);
        } else if self.buffer == b"\r" {
            // wait for the `\n` that should follow
            return;
        }
        self.skip_line_break = false;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest buffer suffix that is a proper prefix of `marker`.
fn marker_prefix_len(buffer: &[u8], marker: &[u8]) -> usize {
    let max = (marker.len() - 1).min(buffer.len());
    (1..=max)
        .rev()
        .find(|&n| buffer[buffer.len() - n..] == marker[..n])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_trims_trailing_line_breaks() {
        let frame = frame_response("hello\r\n\n", Marker::Standard);
        assert_eq!(frame, "hello\n\n<<END_OF_RESPONSE>>\n");
    }

    #[test]
    fn legacy_marker_frame() {
        let frame = frame_response("Goodbye!", Marker::Legacy);
        assert_eq!(frame, "Goodbye!\n\n<<EOF>>\n");
    }

    #[test]
    fn decode_single_frame() {
        let mut decoder = ResponseDecoder::new(Marker::Standard);
        let messages = decoder.feed(frame_response("line one\nline two", Marker::Standard).as_bytes());
        assert_eq!(messages, vec!["line one\nline two".to_string()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut data = frame_response("first", Marker::Standard);
        data.push_str(&frame_response("second", Marker::Standard));

        let mut decoder = ResponseDecoder::default();
        assert_eq!(decoder.feed(data.as_bytes()), vec!["first", "second"]);
    }

    #[test]
    fn incremental_feed() {
        let frame = frame_response("C:\\Users\\alice", Marker::Standard);
        let bytes = frame.as_bytes();
        let mut decoder = ResponseDecoder::default();

        for i in 0..bytes.len() - 1 {
            assert!(decoder.feed(&bytes[i..i + 1]).is_empty());
        }
        let messages = decoder.feed(&bytes[bytes.len() - 1..]);
        assert_eq!(messages, vec!["C:\\Users\\alice"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn marker_line_break_split_across_reads() {
        let mut decoder = ResponseDecoder::default();
        assert_eq!(decoder.feed(b"one\n\n<<END_OF_RESPONSE>>"), vec!["one"]);
        assert!(decoder.feed(b"\n").is_empty());
        assert_eq!(decoder.feed(b"two\n\n<<END_OF_RESPONSE>>\n"), vec!["two"]);
    }

    #[test]
    fn embedded_marker_splits_at_first_occurrence() {
        // Output that itself prints the sentinel is cut short: the first
        // marker wins and the remainder becomes the next message.
        let body = "before\n<<END_OF_RESPONSE>>\nafter";
        let mut decoder = ResponseDecoder::default();
        let messages = decoder.feed(frame_response(body, Marker::Standard).as_bytes());
        assert_eq!(messages, vec!["before", "after"]);
    }

    #[test]
    fn legacy_decoder_ignores_standard_marker() {
        let mut decoder = ResponseDecoder::new(Marker::Legacy);
        assert!(decoder.feed(frame_response("x", Marker::Standard).as_bytes()).is_empty());
        assert_eq!(decoder.feed(b"\n<<EOF>>\n"), vec!["x\n\n<<END_OF_RESPONSE>>"]);
    }

    #[test]
    fn take_pending_holds_back_marker_prefix() {
        let mut decoder = ResponseDecoder::default();
        assert!(decoder.feed(b"[12:00:00] streamed\n<<END_").is_empty());
        assert_eq!(decoder.take_pending().as_deref(), Some("[12:00:00] streamed\n"));
        assert_eq!(decoder.pending(), "<<END_".len());

        assert_eq!(decoder.feed(b"OF_RESPONSE>>\n"), vec![""]);
        assert!(decoder.take_pending().is_none());
    }

    #[test]
    fn take_pending_keeps_split_utf8_char() {
        let mut decoder = ResponseDecoder::default();
        let bytes = "héllo".as_bytes();
        // cut inside the two-byte 'é'
        decoder.feed(&bytes[..2]);
        assert_eq!(decoder.take_pending().as_deref(), Some("h"));
        decoder.feed(&bytes[2..]);
        assert_eq!(decoder.take_pending().as_deref(), Some("éllo"));
    }

    #[test]
    fn reset_clears_buffer() {
        let mut decoder = ResponseDecoder::default();
        decoder.feed(b"partial");
        assert_eq!(decoder.pending(), 7);
        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn marker_from_str() {
        assert_eq!("legacy".parse::<Marker>(), Ok(Marker::Legacy));
        assert_eq!("<<END_OF_RESPONSE>>".parse::<Marker>(), Ok(Marker::Standard));
        assert!("bogus".parse::<Marker>().is_err());
    }

    #[test]
    fn timestamp_prefix_shape() {
        let prefix = timestamp_prefix();
        assert_eq!(prefix.len(), "[00:00:00] ".len());
        assert!(prefix.starts_with('[') && prefix.ends_with("] "));
    }
}
