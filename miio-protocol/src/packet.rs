//! miIO wire codec.
//!
//! Every frame starts with a fixed 32-byte header:
//!
//! ```text
//! 0      2      4          8          12      16                32
//! | 2131 | len  | reserved | deviceId | stamp |    checksum     |
//! ```
//!
//! Handshake frames are a bare header padded with `0xFF`; the reply carries
//! the device id, its current stamp and (on older firmware) the token in the
//! checksum slot. Data frames append the JSON payload encrypted with
//! AES-128-CBC, keyed off the token, and carry an MD5 over header, token and
//! ciphertext in the checksum slot.
//!
//! The codec keeps per-device stamp state: devices reject frames whose stamp
//! lags too far behind their clock, so outbound frames advance the last seen
//! stamp by the seconds elapsed since it was received.

use std::time::{Duration, Instant};

use aes::Aes128;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

use crate::error::{ProtocolError, Result};
use crate::token::{Token, TOKEN_LEN};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// First two bytes of every frame.
const MAGIC: [u8; 2] = [0x21, 0x31];

/// Fixed header size; also the total size of handshake frames.
pub const HEADER_LEN: usize = 32;

/// Devices reject stamps older than roughly this, so force a new handshake
/// once the last seen stamp gets stale.
const STAMP_MAX_AGE: Duration = Duration::from_secs(120);

/// Header fields of a frame, readable without any device state.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub device_id: u32,
    pub stamp: u32,
    pub has_payload: bool,
}

impl FrameHeader {
    /// Device id, unless the frame carries the handshake filler instead.
    pub fn known_device_id(&self) -> Option<u32> {
        match self.device_id {
            0 | u32::MAX => None,
            id => Some(id),
        }
    }
}

/// Parse and validate a frame header. Cheap; used by the dispatcher to route
/// raw datagrams before any per-device decoding happens.
pub fn peek(raw: &[u8]) -> Result<FrameHeader> {
    if raw.len() < HEADER_LEN {
        return Err(ProtocolError::InvalidPacket(format!(
            "frame too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0..2] != MAGIC {
        return Err(ProtocolError::InvalidPacket("bad magic".to_string()));
    }
    let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    if length != raw.len() {
        return Err(ProtocolError::InvalidPacket(format!(
            "length field says {} but frame is {} bytes",
            length,
            raw.len()
        )));
    }
    Ok(FrameHeader {
        device_id: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        stamp: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
        has_payload: raw.len() > HEADER_LEN,
    })
}

/// Per-device framing state: token, derived cipher material and stamp
/// bookkeeping.
pub struct Packet {
    token: Option<Token>,
    key: [u8; 16],
    iv: [u8; 16],
    device_id: u32,
    stamp: u32,
    stamp_at: Option<Instant>,
    last_checksum: [u8; TOKEN_LEN],
}

impl Packet {
    pub fn new() -> Self {
        Packet {
            token: None,
            key: [0; 16],
            iv: [0; 16],
            device_id: 0,
            stamp: 0,
            stamp_at: None,
            last_checksum: [0; TOKEN_LEN],
        }
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn set_token(&mut self, token: Token) {
        let key = md5(&[token.as_bytes()]);
        self.iv = md5(&[&key, token.as_bytes()]);
        self.key = key;
        self.token = Some(token);
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn set_device_id(&mut self, id: u32) {
        self.device_id = id;
    }

    /// Whether a handshake must run before the next data frame: no token
    /// yet, or the stamp is missing or stale.
    pub fn needs_handshake(&self) -> bool {
        if self.token.is_none() {
            return true;
        }
        match self.stamp_at {
            Some(at) => at.elapsed() > STAMP_MAX_AGE,
            None => true,
        }
    }

    /// Invalidate the stamp so the next data frame is preceded by a fresh
    /// handshake. Used when the device rejects a frame as stale.
    pub fn mark_handshake_required(&mut self) {
        self.stamp_at = None;
    }

    /// The hello frame: bare header, `0xFF` filler.
    pub fn handshake(&self) -> [u8; HEADER_LEN] {
        let mut frame = [0xFF; HEADER_LEN];
        frame[0..2].copy_from_slice(&MAGIC);
        frame[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
        frame
    }

    /// Frame a payload: encrypt, stamp and checksum.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let token = self.token.ok_or(ProtocolError::MissingToken)?;
        let stamp = self.outbound_stamp();

        let encrypted =
            Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(payload);

        let mut frame = Vec::with_capacity(HEADER_LEN + encrypted.len());
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&((HEADER_LEN + encrypted.len()) as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(&self.device_id.to_be_bytes());
        frame.extend_from_slice(&stamp.to_be_bytes());
        let checksum = md5(&[&frame[0..16], token.as_bytes(), &encrypted]);
        frame.extend_from_slice(&checksum);
        frame.extend_from_slice(&encrypted);
        Ok(frame)
    }

    fn outbound_stamp(&self) -> u32 {
        let elapsed = self
            .stamp_at
            .map(|at| at.elapsed().as_secs() as u32)
            .unwrap_or(0);
        self.stamp.wrapping_add(elapsed)
    }

    /// Apply an inbound frame to codec state and return its plaintext
    /// payload, or `None` for handshake replies.
    pub fn decode(&mut self, raw: &[u8]) -> Result<Option<Vec<u8>>> {
        let header = peek(raw)?;
        self.device_id = header.device_id;
        if header.stamp > 0 {
            self.stamp = header.stamp;
            self.stamp_at = Some(Instant::now());
        }
        self.last_checksum.copy_from_slice(&raw[16..32]);

        if !header.has_payload {
            return Ok(None);
        }

        let token = self.token.ok_or(ProtocolError::MissingToken)?;
        let encrypted = &raw[HEADER_LEN..];
        let expected = md5(&[&raw[0..16], token.as_bytes(), encrypted]);
        if expected != self.last_checksum {
            return Err(ProtocolError::InvalidPacket(
                "checksum mismatch, token is likely wrong".to_string(),
            ));
        }
        let plain = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(encrypted)
            .map_err(|_| ProtocolError::InvalidPacket("bad padding".to_string()))?;
        Ok(Some(plain))
    }

    /// Apply the last handshake reply: adopt the token from the checksum
    /// slot when the device sent one and none is set yet. Returns whether a
    /// token is now available.
    pub fn handle_handshake_reply(&mut self) -> bool {
        if self.token.is_none() {
            let filler = self.last_checksum.iter().all(|&b| b == 0xFF)
                || self.last_checksum.iter().all(|&b| b == 0);
            if !filler {
                self.set_token(Token::from(self.last_checksum));
            }
        }
        self.token.is_some()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        "00112233445566778899aabbccddeeff".parse().unwrap()
    }

    #[test]
    fn test_handshake_frame_layout() {
        let frame = Packet::new().handshake();
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(&frame[0..2], &MAGIC);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 32);
        assert!(frame[4..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_peek_rejects_bad_magic() {
        let mut frame = Packet::new().handshake();
        frame[0] = 0x00;
        assert!(peek(&frame).is_err());
    }

    #[test]
    fn test_peek_rejects_length_mismatch() {
        let mut frame = Packet::new().handshake().to_vec();
        frame.push(0);
        assert!(peek(&frame).is_err());
    }

    #[test]
    fn test_handshake_frame_has_no_device_id() {
        let frame = Packet::new().handshake();
        let header = peek(&frame).unwrap();
        assert_eq!(header.known_device_id(), None);
        assert!(!header.has_payload);
    }

    #[test]
    fn test_data_frame_between_peers() {
        // Device side: has the token, a stamp and an id
        let mut device = Packet::new();
        device.set_token(token());
        device.set_device_id(0x1234);
        device.stamp = 1000;
        device.stamp_at = Some(Instant::now());

        let frame = device.build(br#"{"id":1,"method":"miIO.info","params":[]}"#).unwrap();
        let header = peek(&frame).unwrap();
        assert_eq!(header.known_device_id(), Some(0x1234));
        assert!(header.has_payload);

        // Peer side decodes with the same token
        let mut peer = Packet::new();
        peer.set_token(token());
        let plain = peer.decode(&frame).unwrap().expect("payload expected");
        assert_eq!(&plain, br#"{"id":1,"method":"miIO.info","params":[]}"#);
        assert_eq!(peer.device_id(), 0x1234);
        assert_eq!(peer.stamp, 1000);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let mut sender = Packet::new();
        sender.set_token(token());
        sender.stamp = 1;
        sender.stamp_at = Some(Instant::now());
        let mut frame = sender.build(b"{}").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let mut receiver = Packet::new();
        receiver.set_token(token());
        assert!(receiver.decode(&frame).is_err());
    }

    #[test]
    fn test_handshake_reply_yields_token() {
        let mut reply = [0u8; HEADER_LEN];
        reply[0..2].copy_from_slice(&MAGIC);
        reply[2..4].copy_from_slice(&32u16.to_be_bytes());
        reply[8..12].copy_from_slice(&0xAABBu32.to_be_bytes());
        reply[12..16].copy_from_slice(&42u32.to_be_bytes());
        reply[16..32].copy_from_slice(token().as_bytes());

        let mut packet = Packet::new();
        assert!(packet.needs_handshake());
        assert!(packet.decode(&reply).unwrap().is_none());
        assert!(packet.handle_handshake_reply());
        assert_eq!(packet.token(), Some(token()));
        assert_eq!(packet.device_id(), 0xAABB);
        assert!(!packet.needs_handshake());
    }

    #[test]
    fn test_handshake_reply_without_token() {
        let mut reply = [0xFFu8; HEADER_LEN];
        reply[0..2].copy_from_slice(&MAGIC);
        reply[2..4].copy_from_slice(&32u16.to_be_bytes());
        reply[8..12].copy_from_slice(&7u32.to_be_bytes());
        reply[12..16].copy_from_slice(&1u32.to_be_bytes());

        let mut packet = Packet::new();
        packet.decode(&reply).unwrap();
        assert!(!packet.handle_handshake_reply());
        assert_eq!(packet.token(), None);
    }

    #[test]
    fn test_handshake_reply_keeps_manual_token() {
        let manual = token();
        let other: Token = "ffeeddccbbaa99887766554433221100".parse().unwrap();

        let mut reply = [0u8; HEADER_LEN];
        reply[0..2].copy_from_slice(&MAGIC);
        reply[2..4].copy_from_slice(&32u16.to_be_bytes());
        reply[8..12].copy_from_slice(&7u32.to_be_bytes());
        reply[12..16].copy_from_slice(&1u32.to_be_bytes());
        reply[16..32].copy_from_slice(other.as_bytes());

        let mut packet = Packet::new();
        packet.set_token(manual);
        packet.decode(&reply).unwrap();
        assert!(packet.handle_handshake_reply());
        assert_eq!(packet.token(), Some(manual));
    }

    #[test]
    fn test_mark_handshake_required() {
        let mut packet = Packet::new();
        packet.set_token(token());
        packet.stamp = 5;
        packet.stamp_at = Some(Instant::now());
        assert!(!packet.needs_handshake());

        packet.mark_handshake_required();
        assert!(packet.needs_handshake());
    }
}
