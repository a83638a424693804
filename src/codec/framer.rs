//! Incremental segmentation of a JSON byte stream.
//!
//! JSON carries no length prefix, so message boundaries are recovered by
//! tracking brace/bracket depth outside string literals. Each byte is
//! examined exactly once, whatever the split of the incoming feeds.

use std::collections::VecDeque;

/// Segments arbitrary byte chunks into complete top-level JSON values.
///
/// Bytes before the `{` or `[` opening a value are discarded. Inside a
/// string literal, brackets are ignored and a quote only terminates the
/// string when preceded by an even number of backslashes.
#[derive(Default)]
pub(crate) struct JsonFramer {
    ready: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    in_value: bool,
    opener: u8,
    closer: u8,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonFramer {
    /// Take the next complete value, in arrival order.
    pub fn next(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    /// Feed one chunk. Values completed by it become available immediately;
    /// a trailing partial value is retained for the next feed.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if !self.in_value {
                match byte {
                    b'{' => self.begin(b'{', b'}'),
                    b'[' => self.begin(b'[', b']'),
                    _ => continue,
                }
                self.current.push(byte);
                continue;
            }

            self.current.push(byte);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            if byte == b'"' {
                self.in_string = true;
            } else if byte == self.opener {
                self.depth += 1;
            } else if byte == self.closer {
                self.depth -= 1;
                if self.depth == 0 {
                    self.ready.push_back(std::mem::take(&mut self.current));
                    self.in_value = false;
                }
            }
        }
    }

    fn begin(&mut self, opener: u8, closer: u8) {
        self.in_value = true;
        self.opener = opener;
        self.closer = closer;
        self.depth = 1;
        self.in_string = false;
        self.escaped = false;
    }
}
