/// Lazy byte accumulator for callbacks that parse framed protocols.
///
/// A `data` callback rarely receives whole frames. `begin` presents any
/// retained remainder followed by the new bytes as one contiguous slice;
/// after parsing, `end` records how much of that view was consumed and
/// retains the rest for the next call. Nothing is copied while every call
/// consumes its input completely.
///
/// The helper owns a single backing buffer that grows to the high-water
/// mark of unconsumed data and is reused across calls.
///
/// ```
/// use gyre::InputStream;
///
/// let mut stream = InputStream::new();
/// let data = b"HELLO";
/// assert_eq!(stream.begin(data), b"HELLO");
/// stream.end(data, 3); // "LO" retained
/// let more = b"WLY";
/// assert_eq!(stream.begin(more), b"LOWLY");
/// stream.end(more, 5);
/// assert_eq!(stream.begin(b"PLAYER"), b"PLAYER");
/// ```
#[derive(Debug, Default)]
pub struct InputStream {
    buf: Vec<u8>,
}

impl InputStream {
    pub fn new() -> Self {
        InputStream::default()
    }

    /// Returns the retained remainder followed by `data` as one contiguous
    /// slice. When nothing is retained this borrows `data` directly with
    /// no copy.
    pub fn begin<'a>(&'a mut self, data: &'a [u8]) -> &'a [u8] {
        if self.buf.is_empty() {
            data
        } else {
            self.buf.extend_from_slice(data);
            &self.buf
        }
    }

    /// Records that the leading `consumed` bytes of the view returned by
    /// the last `begin` were consumed, retaining the remainder. `data`
    /// must be the same slice that was passed to that `begin` call.
    /// Consuming the whole view drops the retained buffer.
    pub fn end(&mut self, data: &[u8], consumed: usize) {
        if self.buf.is_empty() {
            // begin returned `data` directly; retain its unconsumed tail.
            self.buf.extend_from_slice(&data[consumed.min(data.len())..]);
        } else {
            let n = consumed.min(self.buf.len());
            let remaining = self.buf.len() - n;
            self.buf.copy_within(n.., 0);
            self.buf.truncate(remaining);
        }
    }

    /// Number of retained bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
