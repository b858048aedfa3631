//! Incremental line decoder for the engine's output streams.
//!
//! The engine writes human-readable status lines to stdout, but the OS
//! delivers them as arbitrary byte chunks. The decoder reassembles complete
//! lines across chunk boundaries so the classifier always sees whole lines,
//! regardless of how the pipe was buffered.

/// Default upper bound on a single line, in bytes.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Error type for line decoding.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// A line exceeded the configured maximum length and was dropped.
    #[error("Line exceeded {limit} bytes and was dropped")]
    LineTooLong {
        /// The configured limit that was exceeded.
        limit: usize,
    },
}

/// Splits a raw byte stream into discrete text lines.
///
/// Trailing partial lines are buffered across [`feed`](Self::feed) calls.
/// Call [`flush`](Self::flush) at stream end to recover a final line that
/// lacked a trailing newline.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    max_line_len: usize,
    /// Set while discarding the remainder of an overlong line.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LEN)
    }
}

impl LineDecoder {
    /// Create a decoder with the given maximum line length in bytes.
    #[must_use]
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_len,
            discarding: false,
        }
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    ///
    /// Lines are decoded lossily as UTF-8 with any trailing `\r` stripped.
    /// An overlong line yields a single `DecodeError::LineTooLong` entry and
    /// the rest of that line is discarded; decoding then resumes at the next
    /// newline.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<String, DecodeError>> {
        let mut out = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    out.push(Ok(Self::to_line(&self.buf)));
                }
                self.buf.clear();
                continue;
            }

            if self.discarding {
                continue;
            }

            if self.buf.len() >= self.max_line_len {
                out.push(Err(DecodeError::LineTooLong {
                    limit: self.max_line_len,
                }));
                self.buf.clear();
                self.discarding = true;
                continue;
            }

            self.buf.push(byte);
        }

        out
    }

    /// Emit the final buffered line at stream end, if any.
    pub fn flush(&mut self) -> Option<String> {
        self.discarding = false;
        if self.buf.is_empty() {
            return None;
        }
        let line = Self::to_line(&self.buf);
        self.buf.clear();
        Some(line)
    }

    /// Reset all buffered state for a new process session.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    fn to_line(bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        text.strip_suffix('\r').unwrap_or(&text).to_string()
    }
}
