use crate::safe_converter::{PrecheckedCast, SafeCast};
use bytes::{Buf, BufMut, BytesMut};

/// Length prefix of every packet on a connection's byte stream. The prefix is always big
///  endian since it is read before the peer's byte order is known.
pub const FRAME_PREFIX_LEN: usize = 4;

pub fn put_frame(buf: &mut impl BufMut, packet: &[u8]) {
    buf.put_u32(packet.len().prechecked_cast());
    buf.put_slice(packet);
}

/// Splits the bytes read from a connection into packets
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::with_capacity(max_frame_len + FRAME_PREFIX_LEN),
            max_frame_len,
        }
    }

    /// the buffer to read into
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Returns the next complete packet, `Ok(None)` if more bytes are needed. A frame
    ///  exceeding the maximum length means the stream is out of sync, which the caller treats as
    ///  a broken connection.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<BytesMut>> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }
        let frame_len: usize = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]).safe_cast();
        if frame_len > self.max_frame_len {
            anyhow::bail!("frame length {} exceeds the maximum of {}", frame_len, self.max_frame_len);
        }
        if self.buf.len() < FRAME_PREFIX_LEN + frame_len {
            self.buf.reserve(FRAME_PREFIX_LEN + frame_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_PREFIX_LEN);
        Ok(Some(self.buf.split_to(frame_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_put_frame() {
        let mut buf = Vec::new();
        put_frame(&mut buf, &[7, 8, 9]);
        assert_eq!(buf, vec![0, 0, 0, 3, 7, 8, 9]);
    }

    #[rstest]
    #[case::single(vec![vec![0, 0, 0, 2, 1, 2]], vec![vec![1, 2]])]
    #[case::two_in_one_read(vec![vec![0, 0, 0, 1, 5, 0, 0, 0, 2, 6, 7]], vec![vec![5], vec![6, 7]])]
    #[case::split_prefix(vec![vec![0, 0], vec![0, 1, 9]], vec![vec![9]])]
    #[case::split_body(vec![vec![0, 0, 0, 3, 1], vec![2], vec![3, 0, 0]], vec![vec![1, 2, 3]])]
    #[case::empty_frame(vec![vec![0, 0, 0, 0]], vec![vec![]])]
    fn test_decode(#[case] reads: Vec<Vec<u8>>, #[case] expected: Vec<Vec<u8>>) {
        let mut decoder = FrameDecoder::new(100);
        let mut actual = Vec::new();
        for read in reads {
            decoder.read_buf().extend_from_slice(&read);
            while let Some(frame) = decoder.next_frame().unwrap() {
                actual.push(frame.to_vec());
            }
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_oversized_frame() {
        let mut decoder = FrameDecoder::new(10);
        decoder.read_buf().extend_from_slice(&[0, 0, 0, 11]);
        assert!(decoder.next_frame().is_err());
    }
}
