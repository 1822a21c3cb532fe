//! Frame encoding and the resynchronizing stream decoder.

use tracing::{trace, warn};

use crate::{Packet, MAX_DATA, MIN_FRAME, STX};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit in a frame (max {MAX_DATA})")]
    Oversize(usize),
}

fn xor_of(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Build a complete wire frame for `cmd` carrying `seq` and `data`.
pub fn encode(cmd: u8, seq: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.len() > MAX_DATA {
        return Err(FrameError::Oversize(data.len()));
    }
    let mut frame = Vec::with_capacity(MIN_FRAME + data.len());
    frame.extend_from_slice(&STX);
    frame.push(cmd);
    frame.push((data.len() + 1) as u8);
    frame.push(seq);
    frame.extend_from_slice(data);
    frame.push(xor_of(&frame));
    Ok(frame)
}

/// Incremental decoder over an arbitrarily fragmented byte stream.
///
/// Feed raw reads in with [`Decoder::extend_from_slice`] and drain complete
/// frames with [`Decoder::next_packet`]. Corruption is recovered from by
/// dropping a single byte and rescanning for STX, so noise that happens to
/// contain a frame start never swallows the real frame behind it.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next well-formed frame, if the buffer holds one.
    pub fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match find_stx(&self.buf) {
                Some(0) => {}
                Some(at) => {
                    trace!(discarded = at, "skipping noise ahead of STX");
                    self.buf.drain(..at);
                }
                None => {
                    // keep a trailing 0xFA in case its partner is in flight
                    let keep = usize::from(self.buf.last() == Some(&STX[0]));
                    self.buf.drain(..self.buf.len() - keep);
                    return None;
                }
            }
            if self.buf.len() < MIN_FRAME {
                return None;
            }
            let len = self.buf[3] as usize;
            if len == 0 {
                // len counts the sequence byte, so 0 cannot occur in a real frame
                warn!("frame with zero length field, resyncing");
                self.buf.drain(..1);
                continue;
            }
            let frame_end = 4 + len + 1;
            if self.buf.len() < frame_end {
                return None;
            }
            let expected = xor_of(&self.buf[..frame_end - 1]);
            if expected != self.buf[frame_end - 1] {
                warn!(
                    got = self.buf[frame_end - 1],
                    expected, "frame checksum mismatch, resyncing"
                );
                self.buf.drain(..1);
                continue;
            }
            let packet = Packet {
                cmd: self.buf[2],
                seq: self.buf[4],
                data: self.buf[5..frame_end - 1].to_vec(),
            };
            self.buf.drain(..frame_end);
            return Some(packet);
        }
    }
}

fn find_stx(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == STX)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::Command;

    fn decode_all(decoder: &mut Decoder) -> Vec<Packet> {
        std::iter::from_fn(|| decoder.next_packet()).collect()
    }

    #[test]
    fn encoded_frame_checksums() {
        for (cmd, seq, data) in [
            (0x41u8, 1u8, vec![]),
            (0x05, 0x11, vec![0x00, 0x07]),
            (0x06, 0xFF, vec![0x01, 0x01, 0x00, 0x07]),
        ] {
            let frame = encode(cmd, seq, &data).unwrap();
            let (body, xor) = frame.split_at(frame.len() - 1);
            assert_eq!(xor_of(body), xor[0]);
            assert_eq!(frame.len(), MIN_FRAME + data.len());
        }
    }

    #[test]
    fn round_trip() {
        let mut decoder = Decoder::new();
        for cmd in [0x01u8, 0x41, 0x42, 0xFE] {
            for seq in [1u8, 0x80, 255] {
                for data in [vec![], vec![0xAB], vec![0u8; 250]] {
                    decoder.extend_from_slice(&encode(cmd, seq, &data).unwrap());
                    let packet = decoder.next_packet().unwrap();
                    assert_eq!(packet, Packet { cmd, seq, data });
                    assert!(decoder.next_packet().is_none());
                }
            }
        }
    }

    #[test]
    fn oversize_payload_rejected() {
        assert_eq!(
            encode(0x01, 1, &[0u8; 255]),
            Err(FrameError::Oversize(255))
        );
    }

    #[test]
    fn fragmented_delivery() {
        let frame = encode(Command::SelectCancel.into(), 0x11, &[0x00, 0x07]).unwrap();
        let mut decoder = Decoder::new();
        for byte in &frame[..frame.len() - 1] {
            decoder.extend_from_slice(&[*byte]);
            assert!(decoder.next_packet().is_none());
        }
        decoder.extend_from_slice(&frame[frame.len() - 1..]);
        let packet = decoder.next_packet().unwrap();
        assert_eq!(packet.cmd, u8::from(Command::SelectCancel));
        assert_eq!(packet.seq, 0x11);
        assert_eq!(packet.data, vec![0x00, 0x07]);
    }

    #[test]
    fn leading_noise_is_skipped() {
        let mut decoder = Decoder::new();
        decoder.extend_from_slice(&[0x00, 0x13, 0x37]);
        decoder.extend_from_slice(&encode(0x41, 9, &[]).unwrap());
        let packet = decoder.next_packet().unwrap();
        assert_eq!((packet.cmd, packet.seq), (0x41, 9));
    }

    #[test]
    fn corrupt_frame_does_not_stall_the_next_one() {
        let mut bad = encode(0x04, 2, &[0x02, 0x00, 0x07]).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = encode(0x41, 3, &[]).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend_from_slice(&bad);
        decoder.extend_from_slice(&good);
        let packets = decode_all(&mut decoder);
        assert_eq!(packets.len(), 1);
        assert_eq!((packets[0].cmd, packets[0].seq), (0x41, 3));
    }

    #[test]
    fn noise_containing_stx_does_not_eat_a_real_frame() {
        // a runt STX right before a genuine frame: single-byte resync must
        // land on the real frame start rather than discarding past it
        let good = encode(0x41, 7, &[]).unwrap();
        let mut stream = vec![STX[0], STX[1], 0x41, 0x05];
        stream.extend_from_slice(&good);

        let mut decoder = Decoder::new();
        decoder.extend_from_slice(&stream);
        let packets = decode_all(&mut decoder);
        assert_eq!(packets.len(), 1);
        assert_eq!((packets[0].cmd, packets[0].seq), (0x41, 7));
    }

    #[test]
    fn trailing_half_stx_is_retained() {
        let mut decoder = Decoder::new();
        decoder.extend_from_slice(&[0x00, 0x00, STX[0]]);
        assert!(decoder.next_packet().is_none());
        let mut rest = vec![STX[1]];
        rest.extend_from_slice(&encode(0x42, 1, &[]).unwrap()[2..]);
        decoder.extend_from_slice(&rest);
        let packet = decoder.next_packet().unwrap();
        assert_eq!(packet.cmd, 0x42);
    }

    #[test]
    fn back_to_back_frames() {
        let mut decoder = Decoder::new();
        let mut stream = Vec::new();
        for seq in 1..=5u8 {
            stream.extend_from_slice(&encode(0x41, seq, &[]).unwrap());
        }
        decoder.extend_from_slice(&stream);
        let packets = decode_all(&mut decoder);
        assert_eq!(packets.len(), 5);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.seq as usize, i + 1);
        }
    }
}
