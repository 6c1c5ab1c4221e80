use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Passes bytes through as they arrive: one frame per read burst, no
/// framing imposed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkDecoder;

impl Decoder for ChunkDecoder {
    type Item = Bytes;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }
}

/// Newline-delimited frames, terminator stripped (including a trailing
/// `\r`). On EOF the unterminated remainder becomes the final frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineDecoder;

impl Decoder for LineDecoder {
    type Item = Bytes;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(line.freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(src.split().freeze())),
        }
    }
}

/// Writes frames out unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

impl Encoder<Bytes> for PassthroughEncoder {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
