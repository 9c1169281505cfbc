//! LoRaWAN MAC frame codec for the join flow.
//!
//! Frame structures (all multi-byte fields little-endian):
//!   Join-Request (23 bytes):
//!     MHDR(1) | JoinEUI(8) | DevEUI(8) | DevNonce(2) | MIC(4)
//!   Join-Accept plaintext, before encryption (17 or 33 bytes):
//!     MHDR(1) | JoinNonce(3) | NetID(3) | DevAddr(4) | DLSettings(1) |
//!     RxDelay(1) | [CFList(16)] | MIC(4)
//!
//! The MHDR carries MType in the top three bits and Major in the low two.

pub mod crypto;

use std::fmt;

use crate::device::{DevAddr, DevNonce, Eui64, JoinNonce, NetId};
use crate::error::Error;

/// Join-Request frame length, MHDR and MIC included.
pub const JOIN_REQUEST_LEN: usize = 23;

/// MHDR of a Join-Accept (MType 001, Major LoRaWAN R1).
pub const JOIN_ACCEPT_MHDR: u8 = 0x20;

/// Largest JoinNonce that can still be minted.
pub const MAX_JOIN_NONCE: JoinNonce = 0x00ff_fffe;

/// MHDR message type, as far as the join flow distinguishes it. Data and
/// rejoin traffic never reaches a Join Server and stays unclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    Other(u8),
}

impl MType {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0b000 => MType::JoinRequest,
            bits => MType::Other(bits),
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "join-request"),
            MType::Other(bits) => write!(f, "MType 0b{:03b}", bits),
        }
    }
}

/// LoRaWAN Major version (low two MHDR bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    LoRaWANR1,
    Unknown(u8),
}

impl Major {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & 0x03 {
            0b00 => Major::LoRaWANR1,
            other => Major::Unknown(other),
        }
    }
}

/// DLSettings byte of a Join-Accept: OptNeg(1) | Rx1DROffset(3) | Rx2DR(4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlSettings {
    pub opt_neg: bool,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
}

impl DlSettings {
    pub fn to_byte(self) -> u8 {
        ((self.opt_neg as u8) << 7) | ((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_dr & 0x0f)
    }
}

/// Optional channel frequency list appended to a Join-Accept.
pub type CfList = [u8; 16];

/// Decoded Join-Request, MIC still unverified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestFrame {
    pub major: Major,
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: DevNonce,
    pub mic: [u8; 4],
}

/// Decoded MAC frame, as far as the Join Server cares to look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    JoinRequest(JoinRequestFrame),
    /// A Join-Accept cannot be decoded further without session context.
    JoinAccept { encrypted_payload: Vec<u8> },
}

impl fmt::Display for JoinRequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JoinRequest JoinEUI={:016X} DevEUI={:016X} DevNonce={}",
            self.join_eui, self.dev_eui, self.dev_nonce
        )
    }
}

/// Decodes a raw 23-byte Join-Request frame.
pub fn decode_join_request(data: &[u8]) -> Result<JoinRequestFrame, Error> {
    if data.len() != JOIN_REQUEST_LEN {
        return Err(Error::InvalidArgument(format!(
            "join-request must be {} bytes, got {}",
            JOIN_REQUEST_LEN,
            data.len()
        )));
    }

    let mhdr = data[0];
    if let other @ MType::Other(_) = MType::from_mhdr(mhdr) {
        return Err(Error::InvalidArgument(format!(
            "expected a join-request, got {}",
            other
        )));
    }
    let major = Major::from_mhdr(mhdr);
    if let Major::Unknown(m) = major {
        return Err(Error::InvalidArgument(format!(
            "unsupported LoRaWAN major: {}",
            m
        )));
    }

    let mut join_eui = [0u8; 8];
    join_eui.copy_from_slice(&data[1..9]);
    let mut dev_eui = [0u8; 8];
    dev_eui.copy_from_slice(&data[9..17]);
    let mut dev_nonce = [0u8; 2];
    dev_nonce.copy_from_slice(&data[17..19]);
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&data[19..23]);

    Ok(JoinRequestFrame {
        major,
        join_eui: u64::from_le_bytes(join_eui),
        dev_eui: u64::from_le_bytes(dev_eui),
        dev_nonce: u16::from_le_bytes(dev_nonce),
        mic,
    })
}

/// Re-encodes the MIC-covered portion of a Join-Request
/// (MHDR through DevNonce, 19 bytes).
pub fn encode_join_request(frame: &JoinRequestFrame) -> [u8; 19] {
    let mut buf = [0u8; 19];
    buf[0] = 0x00; // MType JoinRequest, Major LoRaWAN R1
    buf[1..9].copy_from_slice(&frame.join_eui.to_le_bytes());
    buf[9..17].copy_from_slice(&frame.dev_eui.to_le_bytes());
    buf[17..19].copy_from_slice(&frame.dev_nonce.to_le_bytes());
    buf
}

/// Join-Accept fields announced to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    pub join_nonce: JoinNonce,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<CfList>,
}

impl JoinAcceptPayload {
    /// Encodes the fields between MHDR and MIC (12 or 28 bytes).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + if self.cf_list.is_some() { 16 } else { 0 });
        buf.extend_from_slice(&self.join_nonce.to_le_bytes()[..3]);
        buf.extend_from_slice(&self.net_id.to_le_bytes()[..3]);
        buf.extend_from_slice(&self.dev_addr.to_le_bytes());
        buf.push(self.dl_settings.to_byte());
        buf.push(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            buf.extend_from_slice(cf_list);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_join_request() -> Vec<u8> {
        vec![
            0x00, // MHDR
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x42, // JoinEUI (LE)
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x42, 0x42, // DevEUI (LE)
            0x42, 0x24, // DevNonce (LE)
            0x6e, 0x54, 0x1b, 0x37, // MIC
        ]
    }

    #[test]
    fn test_decode_join_request() {
        let frame = decode_join_request(&fixture_join_request()).unwrap();
        assert_eq!(frame.join_eui, 0x42ff_ffff_ffff_ffff);
        assert_eq!(frame.dev_eui, 0x4242_ffff_ffff_ffff);
        assert_eq!(frame.dev_nonce, 0x2442);
        assert_eq!(frame.mic, [0x6e, 0x54, 0x1b, 0x37]);
        assert_eq!(frame.major, Major::LoRaWANR1);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let mut data = fixture_join_request();
        data.pop();
        assert!(matches!(
            decode_join_request(&data),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            decode_join_request(&[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mtype_classification() {
        assert_eq!(MType::from_mhdr(0x00), MType::JoinRequest);
        assert_eq!(MType::from_mhdr(JOIN_ACCEPT_MHDR), MType::Other(0b001));
        assert_eq!(MType::from_mhdr(0x40), MType::Other(0b010));
        assert_eq!(MType::from_mhdr(0xe0), MType::Other(0b111));
    }

    #[test]
    fn test_decode_rejects_wrong_mtype() {
        let mut data = fixture_join_request();
        data[0] = 0x40; // UnconfirmedDataUp
        assert!(matches!(
            decode_join_request(&data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_major() {
        let mut data = fixture_join_request();
        data[0] = 0x01;
        assert!(matches!(
            decode_join_request(&data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_encode_round_trips_mic_input() {
        let frame = decode_join_request(&fixture_join_request()).unwrap();
        assert_eq!(
            &encode_join_request(&frame)[..],
            &fixture_join_request()[..19]
        );
    }

    #[test]
    fn test_dl_settings_packing() {
        let dls = DlSettings {
            opt_neg: true,
            rx1_dr_offset: 0x7,
            rx2_dr: 0xf,
        };
        assert_eq!(dls.to_byte(), 0xff);
        assert_eq!(DlSettings::default().to_byte(), 0x00);
    }

    #[test]
    fn test_join_accept_encoding() {
        let accept = JoinAcceptPayload {
            join_nonce: 0x42fffe,
            net_id: 0x42ffff,
            dev_addr: 0x42ffffff,
            dl_settings: DlSettings {
                opt_neg: true,
                rx1_dr_offset: 0x7,
                rx2_dr: 0xf,
            },
            rx_delay: 0x42,
            cf_list: None,
        };
        assert_eq!(
            accept.encode(),
            vec![
                0xfe, 0xff, 0x42, // JoinNonce
                0xff, 0xff, 0x42, // NetID
                0xff, 0xff, 0xff, 0x42, // DevAddr
                0xff, // DLSettings
                0x42, // RxDelay
            ]
        );
    }

    #[test]
    fn test_join_accept_encoding_with_cf_list() {
        let accept = JoinAcceptPayload {
            join_nonce: 0,
            net_id: 0,
            dev_addr: 0,
            dl_settings: DlSettings::default(),
            rx_delay: 1,
            cf_list: Some([0xaa; 16]),
        };
        let encoded = accept.encode();
        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[12..], &[0xaa; 16]);
    }
}
