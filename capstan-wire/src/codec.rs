//! Length-framed wire codec.
//!
//! Every frame starts with a fixed header: one flag byte and a
//! big-endian u32 carrying the total packet length, header included.
//! Messages longer than one packet are split into a chain of frames
//! with the MORE flag set on all but the last; a logical message ends
//! at the first frame with MORE clear.

use bytes::{BufMut, Bytes, BytesMut};

use capstan_core::{CapstanError, Result};

/// Maximum on-wire packet size, header included.
pub const MAX_PACKET: usize = 128 * 1024;

/// Fixed header: u8 flags + u32 big-endian packet length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload one frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = MAX_PACKET - FRAME_HEADER_LEN;

/// More frames follow for the current message.
pub const FLAG_MORE: u8 = 0x01;

/// Reserved for control frames; never set by this implementation but
/// tolerated on receive.
pub const FLAG_CONTROL: u8 = 0x04;

const KNOWN_FLAGS: u8 = FLAG_MORE | FLAG_CONTROL;

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: u8,
    pub packet_len: u32,
}

impl FrameHeader {
    /// Parse and validate the fixed header.
    pub fn parse(header: &[u8]) -> Result<Self> {
        if header.len() != FRAME_HEADER_LEN {
            return Err(CapstanError::protocol(format!(
                "frame header must be {FRAME_HEADER_LEN} bytes, got {}",
                header.len()
            )));
        }
        let flags = header[0];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(CapstanError::protocol(format!(
                "reserved flag bits set: {flags:#04x}"
            )));
        }
        let packet_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = packet_len as usize;
        if !(FRAME_HEADER_LEN..=MAX_PACKET).contains(&len) {
            return Err(CapstanError::protocol(format!(
                "packet length {len} outside [{FRAME_HEADER_LEN}, {MAX_PACKET}]"
            )));
        }
        Ok(Self { flags, packet_len })
    }

    #[inline]
    #[must_use]
    pub const fn more(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }

    /// Payload bytes following the header.
    #[inline]
    #[must_use]
    pub const fn body_len(&self) -> usize {
        self.packet_len as usize - FRAME_HEADER_LEN
    }
}

/// Split `payload` into on-wire frames, each header plus at most
/// [`MAX_FRAME_PAYLOAD`] bytes of body. An empty payload still yields
/// one empty frame, so the receiver always sees a message boundary.
pub fn encode_frames(payload: Bytes) -> FrameIter {
    FrameIter {
        payload,
        done: false,
    }
}

pub struct FrameIter {
    payload: Bytes,
    done: bool,
}

impl Iterator for FrameIter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        let take = self.payload.len().min(MAX_FRAME_PAYLOAD);
        let body = self.payload.split_to(take);
        let more = !self.payload.is_empty();
        if !more {
            self.done = true;
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.put_u8(if more { FLAG_MORE } else { 0 });
        frame.put_u32((FRAME_HEADER_LEN + body.len()) as u32);
        frame.extend_from_slice(&body);
        Some(frame.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode a contiguous frame stream back into messages.
    fn decode_all(mut wire: &[u8]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut current = Vec::new();
        while !wire.is_empty() {
            let header = FrameHeader::parse(&wire[..FRAME_HEADER_LEN]).unwrap();
            let body = &wire[FRAME_HEADER_LEN..header.packet_len as usize];
            current.extend_from_slice(body);
            wire = &wire[header.packet_len as usize..];
            if !header.more() {
                messages.push(std::mem::take(&mut current));
            }
        }
        assert!(current.is_empty(), "wire ended mid-message");
        messages
    }

    fn round_trip(payload: &[u8]) {
        let wire: Vec<u8> = encode_frames(Bytes::copy_from_slice(payload))
            .flat_map(|frame| frame.to_vec())
            .collect();
        let messages = decode_all(&wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], payload);
    }

    #[test]
    fn single_frame_round_trip() {
        round_trip(b"hello");
    }

    #[test]
    fn empty_message_is_one_empty_frame() {
        let frames: Vec<Bytes> = encode_frames(Bytes::new()).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_HEADER_LEN);
        round_trip(b"");
    }

    #[test]
    fn large_message_spans_frames() {
        let payload = vec![0xabu8; 1024 * 1024];
        let frames: Vec<Bytes> = encode_frames(Bytes::from(payload.clone())).collect();
        assert_eq!(frames.len(), payload.len().div_ceil(MAX_FRAME_PAYLOAD));
        for frame in &frames[..frames.len() - 1] {
            assert_eq!(frame.len(), MAX_PACKET);
            assert_eq!(frame[0] & FLAG_MORE, FLAG_MORE);
        }
        assert_eq!(frames.last().unwrap()[0] & FLAG_MORE, 0);
        round_trip(&payload);
    }

    #[test]
    fn exact_boundary_does_not_emit_trailing_frame() {
        let payload = vec![7u8; MAX_FRAME_PAYLOAD];
        let frames: Vec<Bytes> = encode_frames(Bytes::from(payload.clone())).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0] & FLAG_MORE, 0);
        round_trip(&payload);
    }

    #[test]
    fn random_payload_sizes_round_trip() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let len = rng.gen_range(0..3 * MAX_FRAME_PAYLOAD);
            let payload: Vec<u8> = (&mut rng)
                .sample_iter(rand::distributions::Standard)
                .take(len)
                .collect();
            round_trip(&payload);
        }
    }

    #[test]
    fn consecutive_messages_do_not_leak_state() {
        let wire: Vec<u8> = encode_frames(Bytes::from_static(b"first"))
            .chain(encode_frames(Bytes::from_static(b"second")))
            .flat_map(|frame| frame.to_vec())
            .collect();
        let messages = decode_all(&wire);
        assert_eq!(messages, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn reserved_flag_bits_are_rejected() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = 0x10;
        header[4] = FRAME_HEADER_LEN as u8;
        assert!(matches!(
            FrameHeader::parse(&header),
            Err(CapstanError::Protocol(_))
        ));
    }

    #[test]
    fn out_of_range_lengths_are_rejected() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[4] = (FRAME_HEADER_LEN - 1) as u8;
        assert!(FrameHeader::parse(&header).is_err());

        let oversized = ((MAX_PACKET + 1) as u32).to_be_bytes();
        let header = [0, oversized[0], oversized[1], oversized[2], oversized[3]];
        assert!(FrameHeader::parse(&header).is_err());
    }
}
