//! Frame Codec
//!
//! Length-prefixed framing between a byte stream and discrete messages.
//! Pure Sans-IO: no sockets here, so every rule is testable on buffers.
//!
//! ```text
//! +-----------+-----------------+----------------+-------------------+
//! | kind (1B) | length (4B, BE) | crc32 (4B, BE) | payload (length B) |
//! +-----------+-----------------+----------------+-------------------+
//! ```

use crate::error::FramingError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Kind byte carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Opaque replication-engine message
    Data = 0x01,
    /// Graceful close notice; payload is a UTF-8 reason
    Close = 0x02,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Result<Self, FramingError> {
        match byte {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Close),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Build a data frame.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    /// Build a close frame carrying a human-readable reason.
    pub fn close(reason: &str) -> Self {
        Self {
            kind: FrameKind::Close,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Reason text of a close frame.
    pub fn close_reason(&self) -> Option<String> {
        match self.kind {
            FrameKind::Close => Some(String::from_utf8_lossy(&self.payload).into_owned()),
            FrameKind::Data => None,
        }
    }
}

/// Append the encoding of `frame` to `dst`.
pub fn encode_frame_into(
    frame: &Frame,
    max_frame_size: usize,
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    let len = frame.payload.len();
    if len > max_frame_size || len > u32::MAX as usize {
        return Err(FramingError::FrameTooLarge {
            len,
            max: max_frame_size,
        });
    }

    dst.reserve(FRAME_HEADER_SIZE + len);
    dst.put_u8(frame.kind as u8);
    dst.put_u32(len as u32);
    dst.put_u32(crc32fast::hash(&frame.payload));
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Encode a single frame into a self-delimiting byte sequence.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Bytes, FramingError> {
    let mut dst = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
    encode_frame_into(frame, max_frame_size, &mut dst)?;
    Ok(dst.freeze())
}

/// Incremental frame decoder.
///
/// Buffers partial reads until a whole frame is available. The first
/// framing error poisons the decoder: every later call returns it again.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
    error: Option<FramingError>,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self::with_capacity(max_frame_size, 8 * 1024)
    }

    pub fn with_capacity(max_frame_size: usize, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            max_frame_size,
            error: None,
        }
    }

    /// Append raw bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read into directly (e.g. with `AsyncReadExt::read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.error.is_some()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let kind = match FrameKind::from_byte(self.buf[0]) {
            Ok(kind) => kind,
            Err(e) => return self.fail(e),
        };
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        let expected = u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]);

        if len > self.max_frame_size {
            return self.fail(FramingError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_SIZE);
        let payload = self.buf.split_to(len).freeze();

        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return self.fail(FramingError::ChecksumMismatch { expected, actual });
        }

        Ok(Some(Frame { kind, payload }))
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>, FramingError> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn fail<T>(&mut self, err: FramingError) -> Result<T, FramingError> {
        self.buf.clear();
        self.error = Some(err.clone());
        Err(err)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::data(Bytes::from_static(b"hello")),
            Frame::data(Bytes::new()),
            Frame::data(vec![0xABu8; 300]),
            Frame::close("bye"),
            Frame::data((0..=255u8).collect::<Vec<_>>()),
        ]
    }

    fn encode_all(frames: &[Frame]) -> BytesMut {
        let mut wire = BytesMut::new();
        for frame in frames {
            encode_frame_into(frame, MAX, &mut wire).unwrap();
        }
        wire
    }

    #[test]
    fn test_encode_header_layout() {
        let encoded = encode_frame(&Frame::data(Bytes::from_static(b"abc")), MAX).unwrap();

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(encoded[0], FrameKind::Data as u8);
        assert_eq!(&encoded[1..5], &3u32.to_be_bytes());
        assert_eq!(&encoded[5..9], &crc32fast::hash(b"abc").to_be_bytes());
        assert_eq!(&encoded[9..], b"abc");
    }

    #[test]
    fn test_roundtrip_concatenated() {
        let frames = sample_frames();
        let wire = encode_all(&frames);

        let mut decoder = FrameDecoder::new(MAX);
        let decoded = decoder.decode(&wire).unwrap();

        assert_eq!(decoded, frames);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_roundtrip_every_fixed_chunk_size() {
        let frames = sample_frames();
        let wire = encode_all(&frames);

        for chunk_size in 1..=wire.len() {
            let mut decoder = FrameDecoder::new(MAX);
            let mut decoded = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoded.extend(decoder.decode(chunk).unwrap());
            }
            assert_eq!(decoded, frames, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_roundtrip_irregular_chunks() {
        let frames = sample_frames();
        let wire = encode_all(&frames);

        // Small LCG so chunk boundaries vary per seed without extra deps
        for seed in 1u64..50 {
            let mut state = seed;
            let mut decoder = FrameDecoder::new(MAX);
            let mut decoded = Vec::new();
            let mut pos = 0;
            while pos < wire.len() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let step = 1 + (state >> 33) as usize % 17;
                let end = (pos + step).min(wire.len());
                decoded.extend(decoder.decode(&wire[pos..end]).unwrap());
                pos = end;
            }
            assert_eq!(decoded, frames, "seed {}", seed);
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let encoded = encode_frame(&Frame::data(Bytes::from_static(b"partial")), MAX).unwrap();
        let mut decoder = FrameDecoder::new(MAX);

        assert!(decoder.decode(&encoded[..4]).unwrap().is_empty());
        assert!(decoder.decode(&encoded[4..12]).unwrap().is_empty());
        let frames = decoder.decode(&encoded[12..]).unwrap();
        assert_eq!(frames, vec![Frame::data(Bytes::from_static(b"partial"))]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let result = encode_frame(&Frame::data(vec![0u8; MAX + 1]), MAX);
        assert_eq!(
            result,
            Err(FramingError::FrameTooLarge { len: MAX + 1, max: MAX })
        );
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut wire = BytesMut::new();
        wire.put_u8(FrameKind::Data as u8);
        wire.put_u32((MAX + 1) as u32);
        wire.put_u32(0);

        let mut decoder = FrameDecoder::new(MAX);
        let err = decoder.decode(&wire).unwrap_err();
        assert_eq!(err, FramingError::FrameTooLarge { len: MAX + 1, max: MAX });
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut wire = encode_frame(&Frame::data(Bytes::from_static(b"x")), MAX)
            .unwrap()
            .to_vec();
        wire[0] = 0x7f;

        let mut decoder = FrameDecoder::new(MAX);
        assert_eq!(decoder.decode(&wire), Err(FramingError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_decode_rejects_corrupt_payload() {
        let mut wire = encode_frame(&Frame::data(Bytes::from_static(b"payload")), MAX)
            .unwrap()
            .to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut decoder = FrameDecoder::new(MAX);
        assert!(matches!(
            decoder.decode(&wire),
            Err(FramingError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_error_poisons_decoder() {
        let mut decoder = FrameDecoder::new(MAX);
        assert!(decoder.decode(&[0x00; FRAME_HEADER_SIZE]).is_err());
        assert!(decoder.is_poisoned());

        // Valid bytes after the error are not decoded
        let good = encode_frame(&Frame::data(Bytes::from_static(b"ok")), MAX).unwrap();
        assert_eq!(decoder.decode(&good), Err(FramingError::UnknownKind(0x00)));
    }

    #[test]
    fn test_frames_before_error_are_returned_by_next_frame() {
        let mut wire = encode_all(&[Frame::data(Bytes::from_static(b"first"))]);
        wire.put_slice(&[0xEE; FRAME_HEADER_SIZE]);

        let mut decoder = FrameDecoder::new(MAX);
        decoder.extend(&wire);
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::data(Bytes::from_static(b"first")))
        );
        assert_eq!(decoder.next_frame(), Err(FramingError::UnknownKind(0xEE)));
    }

    #[test]
    fn test_close_frame_reason() {
        let frame = Frame::close("shutting down");
        assert_eq!(frame.kind, FrameKind::Close);
        assert_eq!(frame.close_reason().as_deref(), Some("shutting down"));
        assert_eq!(Frame::data(Bytes::new()).close_reason(), None);
    }
}
