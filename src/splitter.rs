use bytes::{Buf, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

const TRAILING_KEEP_ON_NO_SOI: usize = 1024;
const MIN_FRAME_LEN: usize = 100;

/// Stateful MJPEG frame splitter. Feed raw decoder output in, pull whole JPEG
/// frames out. Pure over its internal buffer: `next_frame` drains until `None`.
pub struct MjpegSplitter {
    buf: BytesMut,
    max_buffer_bytes: usize,
}

impl MjpegSplitter {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_buffer_bytes,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next whole frame, if one is fully buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let soi = match find(&self.buf, &SOI) {
            Some(soi) => soi,
            None => {
                trim_to_tail_if_no_soi(&mut self.buf);
                return None;
            }
        };
        if soi > 0 {
            self.buf.advance(soi);
        }

        match find(&self.buf[2..], &EOI) {
            Some(rel) => {
                let end = 2 + rel + 2;
                let frame = self.buf[..end].to_vec();
                self.buf.advance(end);
                if frame.len() < MIN_FRAME_LEN {
                    return self.next_frame();
                }
                Some(frame)
            }
            None => {
                if self.buf.len() > self.max_buffer_bytes {
                    // No EOI within the ceiling; this SOI is junk. Drop it and
                    // let the next call hunt for a fresh SOI in what remains.
                    self.buf.advance(2);
                }
                None
            }
        }
    }
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    if haystack.len() < 2 {
        return None;
    }
    haystack.windows(2).position(|w| w == needle)
}

fn trim_to_tail_if_no_soi(buf: &mut BytesMut) {
    if buf.len() > TRAILING_KEEP_ON_NO_SOI {
        let drop = buf.len() - TRAILING_KEEP_ON_NO_SOI;
        buf.advance(drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(payload);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    #[test]
    fn emits_single_whole_frame() {
        let mut s = MjpegSplitter::default();
        let frame = jpeg(&[0u8; 200]);
        s.feed(&frame);
        let out = s.next_frame().expect("frame");
        assert_eq!(out, frame);
        assert!(s.next_frame().is_none());
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut s = MjpegSplitter::default();
        let f1 = jpeg(&[1u8; 150]);
        let f2 = jpeg(&[2u8; 150]);
        let mut combined = f1.clone();
        combined.extend_from_slice(&f2);
        s.feed(&combined);
        assert_eq!(s.next_frame().unwrap(), f1);
        assert_eq!(s.next_frame().unwrap(), f2);
        assert!(s.next_frame().is_none());
    }

    #[test]
    fn drops_frames_shorter_than_minimum() {
        let mut s = MjpegSplitter::default();
        let tiny = jpeg(&[0u8; 2]);
        let real = jpeg(&[3u8; 150]);
        let mut combined = tiny;
        combined.extend_from_slice(&real);
        s.feed(&combined);
        assert_eq!(s.next_frame().unwrap(), real);
    }

    #[test]
    fn garbage_before_soi_is_skipped() {
        let mut s = MjpegSplitter::default();
        let frame = jpeg(&[9u8; 120]);
        let mut combined = vec![0x00, 0x11, 0x22];
        combined.extend_from_slice(&frame);
        s.feed(&combined);
        assert_eq!(s.next_frame().unwrap(), frame);
    }

    #[test]
    fn round_trip_with_interleaved_garbage() {
        let mut s = MjpegSplitter::default();
        let frames: Vec<Vec<u8>> = (0..5).map(|i| jpeg(&vec![i as u8; 130])).collect();
        let mut stream = Vec::new();
        for f in &frames {
            stream.extend_from_slice(&[0xAB, 0xCD, 0xEF]);
            stream.extend_from_slice(f);
        }
        s.feed(&stream);
        for expected in &frames {
            assert_eq!(&s.next_frame().unwrap(), expected);
        }
        assert!(s.next_frame().is_none());
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let mut s = MjpegSplitter::default();
        let frame = jpeg(&[7u8; 140]);
        s.feed(&frame[..frame.len() - 5]);
        assert!(s.next_frame().is_none());
        s.feed(&frame[frame.len() - 5..]);
        assert_eq!(s.next_frame().unwrap(), frame);
    }
}
