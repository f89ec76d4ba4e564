//! Newline framing for the ingest stream.
//!
//! TCP gives no message boundaries: a chunk may hold half a frame, several frames, or both.
//! [`FrameDecoder`] keeps the unterminated tail of one connection and hands out complete
//! frames lazily through [`FrameDecoder::feed`].

use bytes::{Bytes, BytesMut};
use proctree_shared::protocol::FRAME_DELIMITER;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    /// The producer sent more bytes than allowed without a delimiter.
    #[error("frame exceeds {limit} bytes without a delimiter ({buffered} bytes buffered)")]
    FrameTooLong { buffered: usize, limit: usize },
}

pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
    /// Bytes at the front of `buffer` already known to contain no delimiter.
    scanned: usize,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_len,
            scanned: 0,
            poisoned: false,
        }
    }

    /// Append `chunk` and iterate over every frame it completes.
    ///
    /// Frames not consumed from the returned iterator stay buffered and are yielded by the
    /// next call. Once a [`FramingError`] has been yielded the decoder is poisoned: it drops
    /// further input and yields nothing.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        if !self.poisoned {
            self.buffer.extend_from_slice(chunk);
        }
        Frames { decoder: self }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Take the unterminated remainder at end of stream, if there is one.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.poisoned || self.buffer.is_empty() {
            None
        } else {
            self.scanned = 0;
            Some(self.buffer.split().freeze())
        }
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        if self.poisoned {
            return Ok(None);
        }

        let delimiter = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == FRAME_DELIMITER)
            .map(|offset| self.scanned + offset);

        match delimiter {
            Some(end) if end <= self.max_frame_len => {
                let mut frame = self.buffer.split_to(end + 1);
                frame.truncate(end);
                self.scanned = 0;
                Ok(Some(frame.freeze()))
            }
            Some(end) => self.poison(end),
            None if self.buffer.len() > self.max_frame_len => self.poison(self.buffer.len()),
            None => {
                self.scanned = self.buffer.len();
                Ok(None)
            }
        }
    }

    fn poison(&mut self, buffered: usize) -> Result<Option<Bytes>, FramingError> {
        self.poisoned = true;
        self.buffer = BytesMut::new();
        self.scanned = 0;
        Err(FramingError::FrameTooLong {
            buffered,
            limit: self.max_frame_len,
        })
    }
}

/// Lazy iterator over the complete frames currently buffered in a [`FrameDecoder`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const STREAM: &[u8] = b"{\"pid\":1}\n{\"pid\":2,\"comm\":\"sh\"}\n\n{\"pid\":3}\n";

    fn expected_frames() -> Vec<Bytes> {
        vec![
            Bytes::from_static(b"{\"pid\":1}"),
            Bytes::from_static(b"{\"pid\":2,\"comm\":\"sh\"}"),
            Bytes::from_static(b""),
            Bytes::from_static(b"{\"pid\":3}"),
        ]
    }

    fn decode_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<Bytes> {
        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for chunk in chunks {
            for frame in decoder.feed(chunk) {
                frames.push(frame.unwrap());
            }
        }
        assert_eq!(decoder.buffered_len(), 0);
        frames
    }

    #[test]
    fn test_every_two_way_split_yields_same_frames() {
        for split in 0..=STREAM.len() {
            let (head, tail) = STREAM.split_at(split);
            assert_eq!(
                decode_chunks([head, tail]),
                expected_frames(),
                "split at byte {split}"
            );
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        assert_eq!(decode_chunks(STREAM.chunks(1)), expected_frames());
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    #[case(16)]
    fn test_fixed_size_chunks(#[case] size: usize) {
        assert_eq!(decode_chunks(STREAM.chunks(size)), expected_frames());
    }

    #[test]
    fn test_chunk_without_delimiter_is_buffered() {
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(decoder.feed(b"{\"pid\":").count(), 0);
        assert_eq!(decoder.buffered_len(), 7);

        let frames: Vec<_> = decoder.feed(b"1}\n{\"pid\"").collect();
        assert_eq!(frames, vec![Ok(Bytes::from_static(b"{\"pid\":1}"))]);
        assert_eq!(decoder.finish(), Some(Bytes::from_static(b"{\"pid\"")));
    }

    #[test]
    fn test_unconsumed_frames_stay_buffered() {
        let mut decoder = FrameDecoder::new(1024);
        let first = decoder.feed(b"a\nb\n").next();
        assert_eq!(first, Some(Ok(Bytes::from_static(b"a"))));

        let rest: Vec<_> = decoder.feed(b"c\n").collect();
        assert_eq!(
            rest,
            vec![Ok(Bytes::from_static(b"b")), Ok(Bytes::from_static(b"c"))]
        );
    }

    #[test]
    fn test_oversized_buffer_poisons_decoder() {
        let mut decoder = FrameDecoder::new(8);
        let frames: Vec<_> = decoder.feed(b"ok\n0123456789").collect();
        assert_eq!(
            frames,
            vec![
                Ok(Bytes::from_static(b"ok")),
                Err(FramingError::FrameTooLong {
                    buffered: 10,
                    limit: 8
                }),
            ]
        );

        assert!(decoder.is_poisoned());
        assert_eq!(decoder.feed(b"\nok\n").count(), 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_oversized_frame_rejected_regardless_of_split() {
        let line = b"0123456789\n";

        let mut whole = FrameDecoder::new(8);
        assert!(matches!(
            whole.feed(line).next(),
            Some(Err(FramingError::FrameTooLong { .. }))
        ));

        let mut split = FrameDecoder::new(8);
        assert_eq!(split.feed(&line[..5]).count(), 0);
        assert!(matches!(
            split.feed(&line[5..]).next(),
            Some(Err(FramingError::FrameTooLong { .. }))
        ));
    }

    #[test]
    fn test_frame_at_limit_is_accepted() {
        let mut decoder = FrameDecoder::new(4);
        let frames: Vec<_> = decoder.feed(b"abcd\n").collect();
        assert_eq!(frames, vec![Ok(Bytes::from_static(b"abcd"))]);
    }
}
