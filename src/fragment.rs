//! MTU fragmentation and reassembly.
//!
//! A logical packet may exceed the link's negotiated maximum payload. The
//! fragmenter splits it into link-sized fragments with a one-byte flag header;
//! the first fragment additionally carries the total packet length as u16 LE.
//! Each channel (command, notify, raw data) owns an independent
//! [`Reassembler`]. The raw-data channel uses an extended header with an
//! explicit sequence number and an ACK flag.
//!
//! ```text
//! first:        [flags|FIRST] [len lo] [len hi] [payload ...]
//! continuation: [flags]                         [payload ...]
//! raw data:     [seq] [flags] ...same as above...
//! ```

use crate::error::Error;

/// Flag: this fragment starts a new packet.
pub const FLAG_FIRST: u8 = 0x01;
/// Flag: more fragments follow.
pub const FLAG_MORE: u8 = 0x02;
/// Flag (raw-data channel only): this fragment acknowledges `seq`.
pub const FLAG_ACK: u8 = 0x04;

/// Conservative default until the handshake negotiates a larger payload.
pub const DEFAULT_MAX_FRAGMENT: usize = 20;

const FIRST_HEADER: usize = 3;
const CONT_HEADER: usize = 1;

/// Splits logical packets into fragments of at most `max_fragment_size`.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_fragment_size: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_size: usize) -> Self {
        // Room for the first-fragment header plus at least one payload byte.
        Self {
            max_fragment_size: max_fragment_size.max(FIRST_HEADER + 1),
        }
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    /// Split `payload` into wire fragments, in transmission order. Fails when
    /// the payload is larger than the u16 length header can announce.
    pub fn fragment(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::FragmentOverflow);
        }
        let mut fragments = Vec::new();
        let first_capacity = self.max_fragment_size - FIRST_HEADER;
        let cont_capacity = self.max_fragment_size - CONT_HEADER;

        let first_take = payload.len().min(first_capacity);
        let mut remaining = &payload[first_take..];

        let mut first = Vec::with_capacity(FIRST_HEADER + first_take);
        let more = !remaining.is_empty();
        first.push(FLAG_FIRST | if more { FLAG_MORE } else { 0 });
        first.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        first.extend_from_slice(&payload[..first_take]);
        fragments.push(first);

        while !remaining.is_empty() {
            let take = remaining.len().min(cont_capacity);
            let more = remaining.len() > take;
            let mut fragment = Vec::with_capacity(CONT_HEADER + take);
            fragment.push(if more { FLAG_MORE } else { 0 });
            fragment.extend_from_slice(&remaining[..take]);
            fragments.push(fragment);
            remaining = &remaining[take..];
        }
        Ok(fragments)
    }
}

/// Rebuilds logical packets from a fragment sequence, one channel each.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_len: usize,
    active: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = 0;
        self.active = false;
    }

    /// Feed one fragment. Returns the complete packet once the final
    /// fragment arrives. Sequence violations reset the buffer.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if fragment.is_empty() {
            return Err(Error::FragmentSequence);
        }
        let flags = fragment[0];
        let payload = if flags & FLAG_FIRST != 0 {
            if fragment.len() < FIRST_HEADER {
                self.reset();
                return Err(Error::FragmentSequence);
            }
            let announced = u16::from_le_bytes([fragment[1], fragment[2]]) as usize;
            self.reset();
            self.active = true;
            self.expected_len = announced;
            &fragment[FIRST_HEADER..]
        } else {
            if !self.active {
                return Err(Error::FragmentSequence);
            }
            &fragment[CONT_HEADER..]
        };

        if self.buffer.len() + payload.len() > self.expected_len {
            self.reset();
            return Err(Error::FragmentOverflow);
        }
        self.buffer.extend_from_slice(payload);

        let last = flags & FLAG_MORE == 0;
        if last {
            if self.buffer.len() != self.expected_len {
                self.reset();
                return Err(Error::FragmentSequence);
            }
            self.active = false;
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            Ok(None)
        }
    }
}

/// One decoded raw-data fragment: explicit sequence number, ack bit, and the
/// inner fragment bytes (same framing as the other channels).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFragment {
    pub seq: u8,
    pub ack: bool,
    pub inner: Vec<u8>,
}

impl RawFragment {
    /// Encode for the wire: `[seq] [raw flags] [inner ...]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.inner.len());
        out.push(self.seq);
        out.push(if self.ack { FLAG_ACK } else { 0 });
        out.extend_from_slice(&self.inner);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::FragmentSequence);
        }
        Ok(Self {
            seq: bytes[0],
            ack: bytes[1] & FLAG_ACK != 0,
            inner: bytes[2..].to_vec(),
        })
    }

    /// The ack echoing this fragment's sequence number.
    pub fn ack_for(seq: u8) -> Self {
        Self {
            seq,
            ack: true,
            inner: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_a_single_fragment() {
        let fragmenter = Fragmenter::new(DEFAULT_MAX_FRAGMENT);
        let fragments = fragmenter.fragment(b"hello").unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0][0], FLAG_FIRST);
        assert_eq!(&fragments[0][1..3], &5u16.to_le_bytes());
    }

    #[test]
    fn roundtrip_large_payload() {
        let fragmenter = Fragmenter::new(DEFAULT_MAX_FRAGMENT);
        let payload: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        let fragments = fragmenter.fragment(&payload).unwrap();
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.len() <= DEFAULT_MAX_FRAGMENT);
        }

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (i, fragment) in fragments.iter().enumerate() {
            let out = reassembler.push(fragment).unwrap();
            if i + 1 < fragments.len() {
                assert!(out.is_none());
            } else {
                result = out;
            }
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let fragmenter = Fragmenter::new(DEFAULT_MAX_FRAGMENT);
        let fragments = fragmenter.fragment(&[]).unwrap();
        assert_eq!(fragments.len(), 1);
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(&fragments[0]).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn roundtrip_exact_boundary() {
        let fragmenter = Fragmenter::new(8);
        // First fragment carries 5 payload bytes, continuations 7 each.
        let payload: Vec<u8> = (0..12u8).collect();
        let fragments = fragmenter.fragment(&payload).unwrap();
        assert_eq!(fragments.len(), 2);
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&fragments[0]).unwrap().is_none());
        assert_eq!(reassembler.push(&fragments[1]).unwrap(), Some(payload));
    }

    #[test]
    fn continuation_without_first_is_rejected() {
        let mut reassembler = Reassembler::new();
        assert_eq!(
            reassembler.push(&[FLAG_MORE, 1, 2, 3]),
            Err(Error::FragmentSequence)
        );
    }

    #[test]
    fn payload_beyond_announced_length_overflows() {
        let mut reassembler = Reassembler::new();
        // Announces 4 bytes but streams more.
        let mut first = vec![FLAG_FIRST | FLAG_MORE];
        first.extend_from_slice(&4u16.to_le_bytes());
        first.extend_from_slice(&[1, 2, 3]);
        assert!(reassembler.push(&first).unwrap().is_none());
        assert_eq!(
            reassembler.push(&[FLAG_MORE, 4, 5]),
            Err(Error::FragmentOverflow)
        );
        // The buffer was reset; a fresh packet works.
        let mut ok = vec![FLAG_FIRST];
        ok.extend_from_slice(&1u16.to_le_bytes());
        ok.push(9);
        assert_eq!(reassembler.push(&ok), Ok(Some(vec![9])));
    }

    #[test]
    fn truncated_final_fragment_is_a_sequence_error() {
        let mut reassembler = Reassembler::new();
        let mut first = vec![FLAG_FIRST];
        first.extend_from_slice(&4u16.to_le_bytes());
        first.push(1);
        assert_eq!(reassembler.push(&first), Err(Error::FragmentSequence));
    }

    #[test]
    fn new_first_fragment_resets_partial_packet() {
        let fragmenter = Fragmenter::new(8);
        let payload: Vec<u8> = (0..20u8).collect();
        let fragments = fragmenter.fragment(&payload).unwrap();
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&fragments[0]).unwrap().is_none());

        // Abandon the partial packet; a fresh packet reassembles cleanly.
        let short = fragmenter.fragment(b"ok").unwrap();
        assert_eq!(reassembler.push(&short[0]).unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn payload_too_large_to_announce_is_rejected() {
        let fragmenter = Fragmenter::new(DEFAULT_MAX_FRAGMENT);
        assert_eq!(
            fragmenter.fragment(&vec![0u8; u16::MAX as usize + 1]),
            Err(Error::FragmentOverflow)
        );
        // The largest announceable payload still fragments.
        assert!(fragmenter.fragment(&vec![0u8; u16::MAX as usize]).is_ok());
    }

    #[test]
    fn raw_fragment_roundtrip_and_ack() {
        let raw = RawFragment {
            seq: 7,
            ack: false,
            inner: vec![FLAG_FIRST, 1, 0, 42],
        };
        let decoded = RawFragment::decode(&raw.encode()).unwrap();
        assert_eq!(decoded, raw);

        let ack = RawFragment::ack_for(7);
        assert!(ack.ack);
        assert_eq!(ack.seq, 7);
        let decoded_ack = RawFragment::decode(&ack.encode()).unwrap();
        assert!(decoded_ack.ack);
        assert!(decoded_ack.inner.is_empty());
    }
}
