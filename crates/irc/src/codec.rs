use tokio_util::{
    bytes::BytesMut,
    codec::{Decoder, Encoder, LinesCodec, LinesCodecError},
};

/// Longest line accepted from the server, tags included.
pub const MAX_LINE_LENGTH: usize = 8191;

/// Line codec: decodes `\n`/`\r\n` terminated lines, encodes with `\r\n`.
#[derive(Debug, Clone)]
pub struct IrcCodec {
    lines: LinesCodec,
}

impl Default for IrcCodec {
    fn default() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

impl Decoder for IrcCodec {
    type Error = LinesCodecError;
    type Item = String;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        self.lines.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        self.lines.decode_eof(src)
    }
}

impl<T: AsRef<str>> Encoder<T> for IrcCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), LinesCodecError> {
        let line = line.as_ref();
        dst.reserve(line.len() + 2);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_crlf_and_lf_lines() {
        let mut codec = IrcCodec::default();
        let mut buf = BytesMut::from("PING :a\r\nPING :b\nPART");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :a"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :b"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"PART");
    }

    #[test]
    fn encodes_with_crlf() {
        let mut codec = IrcCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("NICK warden", &mut buf).unwrap();
        assert_eq!(&buf[..], b"NICK warden\r\n");
    }
}
