//! KISS framing for the TNC byte stream.
//!
//! A KISS frame is `FEND || cmd_byte || payload || FEND` with two escape
//! sequences inside the payload (`0xC0 -> 0xDB 0xDC`, `0xDB -> 0xDB 0xDD`).
//! The command byte packs `(port << 4) | command_nibble`; only the data
//! command (0x00) carries AX.25 frames, the remaining nibbles tune the TNC.
//!
//! [`KissDecoder`] is stateful: TCP gives us arbitrary chunk boundaries, so
//! bytes accumulate in a persistent buffer and complete frames are emitted as
//! their terminating `FEND` arrives.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Frame delimiter.
pub const FEND: u8 = 0xC0;
/// Escape introducer.
pub const FESC: u8 = 0xDB;
/// Escaped `FEND`.
pub const TFEND: u8 = 0xDC;
/// Escaped `FESC`.
pub const TFESC: u8 = 0xDD;

/// KISS command nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KissCommand {
    /// Data frame carrying an AX.25 frame.
    DataFrame = 0x00,
    /// Transmitter keyup delay, 10 ms units.
    TxDelay = 0x01,
    /// CSMA persistence parameter.
    Persistence = 0x02,
    /// CSMA slot time, 10 ms units.
    SlotTime = 0x03,
    /// TX tail time, 10 ms units.
    TxTail = 0x04,
    /// Full-duplex flag.
    FullDuplex = 0x05,
    /// Hardware-specific command.
    SetHardware = 0x06,
    /// Exit KISS mode.
    Return = 0x0F,
}

impl KissCommand {
    /// Decode a command nibble.
    fn from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            0x00 => Ok(Self::DataFrame),
            0x01 => Ok(Self::TxDelay),
            0x02 => Ok(Self::Persistence),
            0x03 => Ok(Self::SlotTime),
            0x04 => Ok(Self::TxTail),
            0x05 => Ok(Self::FullDuplex),
            0x06 => Ok(Self::SetHardware),
            0x0F => Ok(Self::Return),
            other => Err(ProtocolError::UnknownKissCommand(other)),
        }
    }
}

/// A decoded KISS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    /// TNC port (high nibble of the command byte).
    pub port: u8,
    /// Command nibble.
    pub command: KissCommand,
    /// Unescaped payload.
    pub data: Bytes,
}

impl KissFrame {
    /// Build a data frame for `port`.
    #[must_use]
    pub fn data(port: u8, data: impl Into<Bytes>) -> Self {
        Self { port, command: KissCommand::DataFrame, data: data.into() }
    }

    /// Encode to the on-wire byte form, delimiters included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let cmd_byte = (self.port << 4) | (self.command as u8);

        let mut out = Vec::with_capacity(self.data.len() + 4);
        out.put_u8(FEND);

        for &byte in std::iter::once(&cmd_byte).chain(self.data.iter()) {
            match byte {
                FEND => out.extend_from_slice(&[FESC, TFEND]),
                FESC => out.extend_from_slice(&[FESC, TFESC]),
                other => out.put_u8(other),
            }
        }

        out.put_u8(FEND);
        out
    }

    /// Decode the body of a frame (the bytes between two `FEND`s).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::EmptyKissFrame` for a zero-length body
    /// - `ProtocolError::InvalidKissEscape` for `FESC` followed by anything
    ///   but `TFEND`/`TFESC`, or a trailing lone `FESC`
    /// - `ProtocolError::UnknownKissCommand` for an unrecognized nibble
    fn decode_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(ProtocolError::EmptyKissFrame);
        }

        let mut unescaped = BytesMut::with_capacity(body.len());
        let mut iter = body.iter().copied();

        while let Some(byte) = iter.next() {
            if byte == FESC {
                match iter.next() {
                    Some(TFEND) => unescaped.put_u8(FEND),
                    Some(TFESC) => unescaped.put_u8(FESC),
                    _ => return Err(ProtocolError::InvalidKissEscape),
                }
            } else {
                unescaped.put_u8(byte);
            }
        }

        if unescaped.is_empty() {
            return Err(ProtocolError::EmptyKissFrame);
        }

        let cmd_byte = unescaped[0];
        let command = KissCommand::from_nibble(cmd_byte & 0x0F)?;

        Ok(Self {
            port: (cmd_byte >> 4) & 0x0F,
            command,
            data: unescaped.split_off(1).freeze(),
        })
    }
}

/// Stateful KISS stream decoder.
///
/// Feed raw TCP chunks through [`KissDecoder::extend`]; complete data frames
/// come back as they are delimited. Non-data frames and frames with invalid
/// escapes are dropped without disturbing the rest of the stream.
#[derive(Debug, Default)]
pub struct KissDecoder {
    buffer: BytesMut,
    dropped: u64,
}

impl KissDecoder {
    /// New decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and extract every complete data frame.
    ///
    /// Frames are delimited by `FEND` pairs; bytes before the first `FEND`
    /// and empty `FEND FEND` runs are discarded. A frame whose body fails to
    /// decode is dropped, and decoding resumes after its terminating `FEND`.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<KissFrame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();

        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == FEND) else {
                // No delimiter at all: everything so far is inter-frame noise.
                self.buffer.clear();
                break;
            };

            let Some(end) = self.buffer[start + 1..].iter().position(|&b| b == FEND) else {
                // Opening FEND but no terminator yet; keep from `start`.
                let _ = self.buffer.split_to(start);
                break;
            };
            let end = start + 1 + end;

            let body = self.buffer[start + 1..end].to_vec();
            // Advance past the terminating FEND regardless of how decoding
            // goes; a corrupt frame must not wedge the stream.
            let _ = self.buffer.split_to(end + 1);

            if body.is_empty() {
                continue;
            }

            match KissFrame::decode_body(&body) {
                Ok(frame) if frame.command == KissCommand::DataFrame => frames.push(frame),
                Ok(_) => {}
                Err(_) => self.dropped += 1,
            }
        }

        frames
    }

    /// Frames dropped due to invalid escapes since construction.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes currently buffered waiting for a terminating `FEND`.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a TX_DELAY command frame. `delay_ms` is rounded down to 10 ms
/// units and clamped to 2550 ms.
#[must_use]
pub fn tx_delay_command(port: u8, delay_ms: u32) -> Vec<u8> {
    one_byte_command(port, KissCommand::TxDelay, (delay_ms / 10).min(255) as u8)
}

/// Encode a PERSISTENCE command frame. `p` is clamped to `0.0..=1.0` and
/// scaled to 0-255.
#[must_use]
pub fn persistence_command(port: u8, p: f32) -> Vec<u8> {
    one_byte_command(port, KissCommand::Persistence, (p.clamp(0.0, 1.0) * 255.0) as u8)
}

/// Encode a SLOT_TIME command frame. `slot_ms` is rounded down to 10 ms
/// units and clamped to 2550 ms.
#[must_use]
pub fn slot_time_command(port: u8, slot_ms: u32) -> Vec<u8> {
    one_byte_command(port, KissCommand::SlotTime, (slot_ms / 10).min(255) as u8)
}

fn one_byte_command(port: u8, command: KissCommand, value: u8) -> Vec<u8> {
    KissFrame { port, command, data: Bytes::copy_from_slice(&[value]) }.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_special_bytes() {
        let frame = KissFrame::data(0, vec![0x01, FEND, 0x02, FESC, 0x03]);
        let wire = frame.encode();

        assert_eq!(
            wire,
            vec![FEND, 0x00, 0x01, FESC, TFEND, 0x02, FESC, TFESC, 0x03, FEND]
        );
    }

    #[test]
    fn decoder_round_trips_single_frame() {
        let frame = KissFrame::data(2, vec![0xAA, FEND, FESC, 0xBB]);

        let mut decoder = KissDecoder::new();
        let frames = decoder.extend(&frame.encode());

        assert_eq!(frames, vec![frame]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let frame = KissFrame::data(0, vec![1, 2, 3, 4]);
        let wire = frame.encode();

        let mut decoder = KissDecoder::new();
        assert!(decoder.extend(&wire[..3]).is_empty());
        let frames = decoder.extend(&wire[3..]);

        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn decoder_skips_empty_fend_runs() {
        let frame = KissFrame::data(0, vec![9]);
        let mut wire = vec![FEND, FEND, FEND];
        wire.extend_from_slice(&frame.encode());

        let mut decoder = KissDecoder::new();
        assert_eq!(decoder.extend(&wire), vec![frame]);
    }

    #[test]
    fn invalid_escape_drops_only_that_frame() {
        let good = KissFrame::data(0, vec![7, 7]);

        // FESC followed by a byte that is neither TFEND nor TFESC.
        let mut wire = vec![FEND, 0x00, FESC, 0x99, FEND];
        wire.extend_from_slice(&good.encode());

        let mut decoder = KissDecoder::new();
        let frames = decoder.extend(&wire);

        assert_eq!(frames, vec![good]);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn non_data_frames_are_consumed_silently() {
        let mut wire = tx_delay_command(0, 300);
        wire.extend_from_slice(&KissFrame::data(0, vec![1]).encode());

        let mut decoder = KissDecoder::new();
        let frames = decoder.extend(&wire);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_ref(), &[1]);
        assert_eq!(decoder.dropped(), 0);
    }

    #[test]
    fn tuning_commands_scale_to_units() {
        // 300 ms -> 30 units of 10 ms.
        assert_eq!(tx_delay_command(0, 300), vec![FEND, 0x01, 30, FEND]);
        // Clamped at 255 units.
        assert_eq!(tx_delay_command(0, 10_000), vec![FEND, 0x01, 255, FEND]);
        assert_eq!(slot_time_command(1, 100), vec![FEND, 0x13, 10, FEND]);
        // p = 0.25 -> 63.
        assert_eq!(persistence_command(0, 0.25), vec![FEND, 0x02, 63, FEND]);
    }

    #[test]
    fn port_encodes_into_high_nibble() {
        let frame = KissFrame::data(3, vec![0x42]);
        let wire = frame.encode();
        assert_eq!(wire[1], 0x30);

        let mut decoder = KissDecoder::new();
        let decoded = decoder.extend(&wire);
        assert_eq!(decoded[0].port, 3);
    }
}
