use flate2::{Decompress, FlushDecompress, Status};

use crate::common::{ClientError, Result};

/// Every complete zlib-stream message ends with a sync-flush marker.
const ZLIB_SUFFIX: &[u8] = &[0x00, 0x00, 0xff, 0xff];

const INFLATE_CHUNK: usize = 16 * 1024;

/// Incremental inflater for `compress=zlib-stream` gateway transport.
///
/// The server runs one deflate context for the whole connection, so a single
/// `Decompress` must live as long as the socket. Binary frames are buffered
/// until the suffix marker arrives, then inflated in one go.
pub struct Inflater {
    stream: Decompress,
    compressed: Vec<u8>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            stream: Decompress::new(true),
            compressed: Vec::new(),
        }
    }

    /// Feeds one binary websocket frame. Returns the inflated message once a
    /// full zlib-stream message has been buffered, `None` while incomplete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>> {
        self.compressed.extend_from_slice(chunk);
        if !self.compressed.ends_with(ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.compressed.len() * 4);
        let mut offset = 0usize;
        let mut buf = [0u8; INFLATE_CHUNK];

        while offset < self.compressed.len() {
            let in_before = self.stream.total_in();
            let out_before = self.stream.total_out();

            let status = self
                .stream
                .decompress(&self.compressed[offset..], &mut buf, FlushDecompress::Sync)
                .map_err(|e| ClientError::Protocol(format!("zlib inflate failed: {e}")))?;

            let consumed = (self.stream.total_in() - in_before) as usize;
            let produced = (self.stream.total_out() - out_before) as usize;
            offset += consumed;
            out.extend_from_slice(&buf[..produced]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        return Err(ClientError::Protocol("zlib stream stalled".into()));
                    }
                }
            }
        }

        self.compressed.clear();
        Ok(Some(out))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Mimics the server side: one deflate context across messages, each
    /// message sync-flushed.
    struct Deflater(Compress);

    impl Deflater {
        fn new() -> Self {
            Self(Compress::new(Compression::default(), true))
        }

        fn push(&mut self, msg: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(msg.len() + 64);
            self.0
                .compress_vec(msg, &mut out, FlushCompress::Sync)
                .unwrap();
            out
        }
    }

    #[test]
    fn reassembles_a_message_split_across_frames() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let payload = br#"{"op":0,"t":"MESSAGE_CREATE","s":42,"d":{"content":"hello"}}"#;
        let compressed = deflater.push(payload);
        let (head, tail) = compressed.split_at(compressed.len() / 2);

        assert!(inflater.push(head).unwrap().is_none());
        let inflated = inflater.push(tail).unwrap().expect("complete message");
        assert_eq!(inflated, payload);
    }

    #[test]
    fn handles_consecutive_messages_on_one_context() {
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        for i in 0..5 {
            let payload = format!(r#"{{"op":0,"s":{i},"d":{{"n":{i}}}}}"#);
            let inflated = inflater
                .push(&deflater.push(payload.as_bytes()))
                .unwrap()
                .expect("complete message");
            assert_eq!(inflated, payload.as_bytes());
        }
    }

    #[test]
    fn garbage_input_is_a_protocol_error() {
        let mut inflater = Inflater::new();
        let mut bogus = vec![0xAAu8; 32];
        bogus.extend_from_slice(ZLIB_SUFFIX);
        assert!(matches!(
            inflater.push(&bogus),
            Err(ClientError::Protocol(_))
        ));
    }
}
