//! Newline framing for byte streams.
//!
//! Subprocess pipes, SPP sockets and BLE notifications all deliver text in
//! arbitrarily sized pieces. [`LineFramer`] accumulates those pieces and
//! yields complete `\n`-terminated lines, keeping any unterminated tail
//! buffered until more data arrives.
//!
//! The buffer holds raw bytes and each line is decoded on its own, so a
//! multi-byte UTF-8 sequence split across two chunks reassembles correctly.
//! Invalid sequences decode to `U+FFFD` instead of stalling the stream.

/// Incremental line splitter.
#[derive(Debug, Default, Clone)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completes, in order.
    ///
    /// Lines are trimmed of surrounding whitespace (including a `\r` before
    /// the delimiter). Whitespace-only lines come back as empty strings;
    /// callers decide whether to skip them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(decode_line(&line[..pos]));
        }
        lines
    }

    /// Bytes received after the last delimiter.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the unterminated remainder, if it holds anything but whitespace.
    ///
    /// Used when the underlying stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = decode_line(&self.buffer);
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// Drop any buffered partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
