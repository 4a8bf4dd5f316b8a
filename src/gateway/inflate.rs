//! Shared inflater for `compress=zlib-stream` gateway transport.
//!
//! The server keeps one zlib context for the whole connection: the first
//! binary frame starts with the two-byte zlib header (`0x78 ..`), every
//! message ends with a sync-flush suffix (`00 00 FF FF`), and frames in
//! between share the dictionary. One [`StreamInflater`] therefore lives as
//! long as the socket and is replaced on reconnect.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::{ProxyError, Result};

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

pub struct StreamInflater {
    decompress: Decompress,
    header_stripped: bool,
    pending: Vec<u8>,
}

impl Default for StreamInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamInflater {
    pub fn new() -> Self {
        Self {
            // Raw deflate; the zlib header is dropped from the first frame.
            decompress: Decompress::new(false),
            header_stripped: false,
            pending: Vec::new(),
        }
    }

    /// Feed one binary frame. Returns the decompressed text once the
    /// accumulated input ends on a message boundary, `None` while partial.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<String>> {
        self.pending.extend_from_slice(frame);
        if self.pending.len() < 4 || self.pending[self.pending.len() - 4..] != ZLIB_SUFFIX {
            return Ok(None);
        }

        let buffered = std::mem::take(&mut self.pending);
        let input: &[u8] = if self.header_stripped {
            &buffered
        } else {
            self.header_stripped = true;
            buffered.get(2..).unwrap_or(&[])
        };

        let inflated = self.inflate(input)?;
        let text = String::from_utf8(inflated)
            .map_err(|e| ProxyError::Gateway(format!("inflated frame is not utf-8: {e}")))?;
        Ok(Some(text))
    }

    fn inflate(&mut self, mut input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len().saturating_mul(4).max(1024));
        let mut stalls = 0u8;
        while !input.is_empty() {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            if out.capacity() == out.len() {
                out.reserve(8192);
            }
            let status = self
                .decompress
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| ProxyError::Gateway(format!("inflate: {e}")))?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];

            if consumed == 0 && produced == 0 {
                match status {
                    Status::StreamEnd => break,
                    _ => {
                        stalls += 1;
                        if stalls > 2 {
                            return Err(ProxyError::Gateway(
                                "inflater made no progress".to_string(),
                            ));
                        }
                        out.reserve(8192);
                    }
                }
            } else {
                stalls = 0;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Compress one message on a shared zlib context with a sync flush, the
    /// way the gateway does.
    fn deflate_message(compress: &mut Compress, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 256);
        compress
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .expect("compress");
        out
    }

    #[test]
    fn single_message_round_trip() {
        let mut compress = Compress::new(Compression::default(), true);
        let frame = deflate_message(&mut compress, r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);

        let mut inflater = StreamInflater::new();
        let text = inflater.push(&frame).unwrap().expect("complete message");
        assert_eq!(text, r#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
    }

    #[test]
    fn shared_context_across_messages() {
        let mut compress = Compress::new(Compression::default(), true);
        let first = deflate_message(&mut compress, r#"{"op":10}"#);
        let second = deflate_message(&mut compress, r#"{"op":11}"#);

        let mut inflater = StreamInflater::new();
        assert_eq!(inflater.push(&first).unwrap().as_deref(), Some(r#"{"op":10}"#));
        assert_eq!(inflater.push(&second).unwrap().as_deref(), Some(r#"{"op":11}"#));
    }

    #[test]
    fn partial_frames_accumulate() {
        let mut compress = Compress::new(Compression::default(), true);
        let frame = deflate_message(&mut compress, r#"{"op":0,"t":"READY","s":1}"#);
        let split = frame.len() / 2;

        let mut inflater = StreamInflater::new();
        assert!(inflater.push(&frame[..split]).unwrap().is_none());
        assert_eq!(
            inflater.push(&frame[split..]).unwrap().as_deref(),
            Some(r#"{"op":0,"t":"READY","s":1}"#)
        );
    }

    #[test]
    fn garbage_input_is_an_error() {
        let mut inflater = StreamInflater::new();
        // Valid suffix but nonsense body.
        let mut junk = vec![0x78, 0x9c, 0xde, 0xad, 0xbe, 0xef];
        junk.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);
        assert!(inflater.push(&junk).is_err());
    }
}
