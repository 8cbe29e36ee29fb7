use flate2::{Decompress, FlushDecompress, Status};

use crate::error::GatewayError;

/// Trailer of every complete zlib-stream message (`Z_SYNC_FLUSH`).
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const MIN_OUTPUT: usize = 4 * 1024;

/// Receive-side decoder for `compress=zlib-stream`.
///
/// The zlib context spans the whole connection, so one `Inflater` must see
/// every binary frame of a socket in order. Frames are buffered until one
/// ends with [`ZLIB_SUFFIX`]; the buffer is then inflated as one message.
pub struct Inflater {
    decompress: Decompress,
    buffer: Vec<u8>,
    output: Vec<u8>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            buffer: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Feed one binary frame. Returns the decoded message once a sync flush
    /// completes it, `None` while more frames are needed.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<String>, GatewayError> {
        self.buffer.extend_from_slice(frame);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        self.output.clear();
        let mut offset = 0;
        loop {
            if self.output.capacity() - self.output.len() < MIN_OUTPUT {
                self.output
                    .reserve(((self.buffer.len() - offset) * 4).max(MIN_OUTPUT));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.output.len();
            let status = self.decompress.decompress_vec(
                &self.buffer[offset..],
                &mut self.output,
                FlushDecompress::Sync,
            );
            let status = match status {
                Ok(status) => status,
                Err(err) => {
                    self.buffer.clear();
                    return Err(err.into());
                }
            };
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.output.len() - before_out;
            offset += consumed;

            if status == Status::StreamEnd {
                break;
            }
            let output_full = self.output.len() == self.output.capacity();
            if offset >= self.buffer.len() && !output_full {
                break;
            }
            // No progress either way: whatever remains cannot be inflated yet.
            if consumed == 0 && produced == 0 {
                break;
            }
        }
        self.buffer.clear();

        let message = String::from_utf8(std::mem::take(&mut self.output))?;
        Ok(Some(message))
    }

    /// Bytes of an incomplete message still waiting for its suffix.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    fn deflate(compress: &mut Compress, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 64);
        compress
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .unwrap();
        assert!(out.ends_with(&ZLIB_SUFFIX));
        out
    }

    #[test]
    fn context_persists_across_messages() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut inflater = Inflater::new();

        let first = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let second = r#"{"op":11}"#;
        assert_eq!(
            inflater.push(&deflate(&mut compress, first)).unwrap().as_deref(),
            Some(first)
        );
        // The second message back-references the first one's dictionary.
        assert_eq!(
            inflater.push(&deflate(&mut compress, second)).unwrap().as_deref(),
            Some(second)
        );
    }

    #[test]
    fn buffers_until_suffix() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut inflater = Inflater::new();
        let text = r#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{"content":"hello"}}"#;
        let data = deflate(&mut compress, text);
        let (head, tail) = data.split_at(data.len() / 2);

        assert_eq!(inflater.push(head).unwrap(), None);
        assert_eq!(inflater.pending(), head.len());
        assert_eq!(inflater.push(tail).unwrap().as_deref(), Some(text));
        assert_eq!(inflater.pending(), 0);
    }

    #[test]
    fn large_message_grows_output() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut inflater = Inflater::new();
        let text = format!(r#"{{"op":0,"d":"{}"}}"#, "a".repeat(200_000));
        let mut data = Vec::with_capacity(text.len() + 1024);
        compress
            .compress_vec(text.as_bytes(), &mut data, FlushCompress::Sync)
            .unwrap();
        assert_eq!(inflater.push(&data).unwrap().map(|s| s.len()), Some(text.len()));
    }

    #[test]
    fn garbage_is_an_inflate_error() {
        let mut inflater = Inflater::new();
        let err = inflater
            .push(&[0x13, 0x37, 0x00, 0x00, 0x00, 0xFF, 0xFF])
            .unwrap_err();
        assert!(matches!(err, GatewayError::Inflate(_)));
        assert_eq!(inflater.pending(), 0);
    }

    #[test]
    fn corruption_breaks_the_rest_of_the_stream() {
        let mut compress = Compress::new(Compression::default(), true);
        let mut inflater = Inflater::new();
        let hello = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        assert!(inflater.push(&deflate(&mut compress, hello)).unwrap().is_some());

        let err = inflater
            .push(&[0xFF, 0xFF, 0x13, 0x00, 0x00, 0xFF, 0xFF])
            .unwrap_err();
        assert!(matches!(err, GatewayError::Inflate(_)));
        // Later frames from the same server stream cannot be decoded either.
        let ack = deflate(&mut compress, r#"{"op":11}"#);
        assert!(matches!(inflater.push(&ack), Err(GatewayError::Inflate(_))));
    }
}
