//! AX.25 UI frame codec.
//!
//! RFMP rides in connectionless UI frames: destination and source addresses
//! (plus an optional digipeater chain), a 0x03 control byte, the 0xF0 "no
//! layer 3" PID, and the RFMP text as the information field. Each address is
//! six left-shifted ASCII characters padded with shifted spaces, then an SSID
//! byte whose low bit terminates the address chain.

use std::fmt;

use bytes::Bytes;

use crate::errors::{ProtocolError, Result};

/// Control byte for UI frames.
pub const UI_CONTROL: u8 = 0x03;
/// PID for "no layer 3 protocol".
pub const PID_NO_LAYER3: u8 = 0xF0;
/// Default broadcast destination for RFMP traffic.
pub const RFMP_DESTINATION: &str = "RFMP";

/// Encoded size of one address block.
const ADDRESS_LEN: usize = 7;
/// Two addresses, control and PID.
const MIN_FRAME_LEN: usize = 2 * ADDRESS_LEN + 2;

/// An AX.25 address: callsign plus 4-bit SSID.
///
/// # Invariants
///
/// - Callsign is 1-6 uppercase ASCII alphanumeric characters
/// - SSID is 0-15
///
/// Both are enforced at construction; a decoded address that violates them
/// is rejected rather than produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ax25Address {
    callsign: String,
    ssid: u8,
}

impl Ax25Address {
    /// Create an address, uppercasing the callsign.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidCallsign` / `InvalidSsid` on violation of the
    /// invariants above.
    pub fn new(callsign: &str, ssid: u8) -> Result<Self> {
        let callsign = callsign.to_ascii_uppercase();

        if callsign.is_empty()
            || callsign.len() > 6
            || !callsign.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(ProtocolError::InvalidCallsign(callsign));
        }
        if ssid > 15 {
            return Err(ProtocolError::InvalidSsid(ssid));
        }

        Ok(Self { callsign, ssid })
    }

    /// Parse the string form `CALL` or `CALL-SSID`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid: u8 = ssid
                    .parse()
                    .map_err(|_| ProtocolError::InvalidCallsign(s.to_string()))?;
                Self::new(call, ssid)
            }
            None => Self::new(s, 0),
        }
    }

    /// Callsign without SSID.
    #[must_use]
    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Secondary station identifier.
    #[must_use]
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Encode as a 7-byte address block.
    ///
    /// `is_last` sets the address-extension bit that terminates the chain.
    #[must_use]
    pub fn encode(&self, is_last: bool) -> [u8; ADDRESS_LEN] {
        let mut out = [b' ' << 1; ADDRESS_LEN];
        for (slot, byte) in out.iter_mut().zip(self.callsign.bytes()) {
            *slot = byte << 1;
        }

        let mut ssid_byte = 0b0110_0000 | (self.ssid << 1);
        if is_last {
            ssid_byte |= 0x01;
        }
        out[6] = ssid_byte;

        out
    }

    /// Decode a 7-byte address block. The extension bit is ignored here; the
    /// frame decoder tracks it while walking the chain.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != ADDRESS_LEN {
            return Err(ProtocolError::Ax25TooShort(data.len()));
        }

        let callsign: String = data[..6]
            .iter()
            .map(|&b| char::from(b >> 1))
            .filter(|&c| c != ' ')
            .collect();
        let ssid = (data[6] >> 1) & 0x0F;

        Self::new(&callsign, ssid)
    }
}

impl fmt::Display for Ax25Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign)
        } else {
            write!(f, "{}-{}", self.callsign, self.ssid)
        }
    }
}

/// An AX.25 frame as carried inside KISS data frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Frame {
    /// Destination address (first on the wire).
    pub destination: Ax25Address,
    /// Source address.
    pub source: Ax25Address,
    /// Digipeater chain. RFMP itself transmits none, but frames heard on a
    /// shared channel may carry them.
    pub digipeaters: Vec<Ax25Address>,
    /// Control byte.
    pub control: u8,
    /// Protocol ID byte.
    pub pid: u8,
    /// Information field.
    pub info: Bytes,
}

impl Ax25Frame {
    /// Build a UI frame (`control=0x03`, `pid=0xF0`) with no digipeaters.
    #[must_use]
    pub fn ui(source: Ax25Address, destination: Ax25Address, info: impl Into<Bytes>) -> Self {
        Self {
            destination,
            source,
            digipeaters: Vec::new(),
            control: UI_CONTROL,
            pid: PID_NO_LAYER3,
            info: info.into(),
        }
    }

    /// Whether this is a UI frame RFMP will process.
    #[must_use]
    pub fn is_ui(&self) -> bool {
        self.control == UI_CONTROL && self.pid == PID_NO_LAYER3
    }

    /// Encode to raw AX.25 bytes (no KISS framing).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity((2 + self.digipeaters.len()) * ADDRESS_LEN + 2 + self.info.len());

        out.extend_from_slice(&self.destination.encode(false));
        out.extend_from_slice(&self.source.encode(self.digipeaters.is_empty()));

        for (i, digi) in self.digipeaters.iter().enumerate() {
            let is_last = i == self.digipeaters.len() - 1;
            out.extend_from_slice(&digi.encode(is_last));
        }

        out.push(self.control);
        out.push(self.pid);
        out.extend_from_slice(&self.info);

        out
    }

    /// Decode raw AX.25 bytes.
    ///
    /// Walks the address chain until the extension bit terminates it, then
    /// reads control, PID and the remaining info field.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Ax25TooShort` for truncated frames
    /// - `ProtocolError::Ax25Unterminated` if no address carries the
    ///   extension bit
    /// - address errors if a decoded callsign/SSID is malformed
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_LEN {
            return Err(ProtocolError::Ax25TooShort(data.len()));
        }

        let destination = Ax25Address::decode(&data[0..ADDRESS_LEN])?;
        let source = Ax25Address::decode(&data[ADDRESS_LEN..2 * ADDRESS_LEN])?;

        let mut digipeaters = Vec::new();
        let mut idx = 2 * ADDRESS_LEN;

        if data[2 * ADDRESS_LEN - 1] & 0x01 == 0 {
            // Source did not terminate the chain: digipeaters follow.
            loop {
                if idx + ADDRESS_LEN > data.len() {
                    return Err(ProtocolError::Ax25Unterminated);
                }
                digipeaters.push(Ax25Address::decode(&data[idx..idx + ADDRESS_LEN])?);
                idx += ADDRESS_LEN;

                if data[idx - 1] & 0x01 != 0 {
                    break;
                }
            }
        }

        if idx + 2 > data.len() {
            return Err(ProtocolError::Ax25TooShort(data.len()));
        }

        let control = data[idx];
        let pid = data[idx + 1];
        let info = Bytes::copy_from_slice(&data[idx + 2..]);

        Ok(Self { destination, source, digipeaters, control, pid, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let addr = Ax25Address::new("N0CALL", 3).unwrap();
        let encoded = addr.encode(true);

        assert_eq!(encoded.len(), 7);
        // End bit set.
        assert_eq!(encoded[6] & 0x01, 1);

        let decoded = Ax25Address::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn address_pads_short_callsigns() {
        let addr = Ax25Address::new("W1A", 0).unwrap();
        let encoded = addr.encode(false);

        // Padded with shifted spaces (0x40).
        assert_eq!(&encoded[3..6], &[0x40, 0x40, 0x40]);
        assert_eq!(Ax25Address::decode(&encoded).unwrap().callsign(), "W1A");
    }

    #[test]
    fn address_rejects_bad_input() {
        assert!(Ax25Address::new("", 0).is_err());
        assert!(Ax25Address::new("TOOLONG", 0).is_err());
        assert!(Ax25Address::new("N0 CL", 0).is_err());
        assert!(Ax25Address::new("N0CALL", 16).is_err());
    }

    #[test]
    fn parse_handles_ssid_suffix() {
        let addr = Ax25Address::parse("n0call-7").unwrap();
        assert_eq!(addr.callsign(), "N0CALL");
        assert_eq!(addr.ssid(), 7);
        assert_eq!(addr.to_string(), "N0CALL-7");

        assert_eq!(Ax25Address::parse("K1ABC").unwrap().to_string(), "K1ABC");
        assert!(Ax25Address::parse("N0CALL-16").is_err());
        assert!(Ax25Address::parse("N0CALL-x").is_err());
    }

    #[test]
    fn ui_frame_round_trip() {
        let frame = Ax25Frame::ui(
            Ax25Address::parse("N0CALL-1").unwrap(),
            Ax25Address::parse(RFMP_DESTINATION).unwrap(),
            &b"MSG|id=abcdef012345"[..],
        );

        let decoded = Ax25Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_ui());
    }

    #[test]
    fn digipeater_chain_round_trip() {
        let mut frame = Ax25Frame::ui(
            Ax25Address::parse("N0CALL").unwrap(),
            Ax25Address::parse("RFMP").unwrap(),
            &b"x"[..],
        );
        frame.digipeaters = vec![
            Ax25Address::parse("WIDE1-1").unwrap(),
            Ax25Address::parse("WIDE2-2").unwrap(),
        ];

        let wire = frame.encode();
        // Source must not carry the end bit when digipeaters follow.
        assert_eq!(wire[13] & 0x01, 0);

        let decoded = Ax25Frame::decode(&wire).unwrap();
        assert_eq!(decoded.digipeaters, frame.digipeaters);
        assert_eq!(decoded.info, frame.info);
    }

    #[test]
    fn decode_rejects_truncated() {
        let frame = Ax25Frame::ui(
            Ax25Address::parse("N0CALL").unwrap(),
            Ax25Address::parse("RFMP").unwrap(),
            &b""[..],
        );
        let wire = frame.encode();

        assert_eq!(
            Ax25Frame::decode(&wire[..10]),
            Err(ProtocolError::Ax25TooShort(10))
        );
    }

    #[test]
    fn non_ui_frames_are_flagged() {
        let mut frame = Ax25Frame::ui(
            Ax25Address::parse("N0CALL").unwrap(),
            Ax25Address::parse("RFMP").unwrap(),
            &b"payload"[..],
        );
        frame.control = 0x3F;

        let decoded = Ax25Frame::decode(&frame.encode()).unwrap();
        assert!(!decoded.is_ui());
    }
}
