//! Control-plane datagram protocol between cluster peers and the Join
//! Server.
//!
//! Each datagram is a small binary header followed by a JSON body:
//!   VERSION(1) | token(2, big-endian) | TYPE(1) | JSON
//! The token is echoed in the answer so callers can match replies.
//! Binary fields inside the JSON are hex (keys, EUIs) or base64 (frames).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::device::{Eui64, KeyEnvelope, NetId, SessionKeys};
use crate::error::Error;
use crate::lorawan::{CfList, DlSettings};
use crate::server::{
    AppSKeyResponse, JoinRequest, JoinResponse, NwkSKeysResponse, SessionKeyRequest,
};

/// Protocol version (always 0x01)
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    JoinReq = 0x00,
    JoinAns = 0x01,
    NwkSKeysReq = 0x02,
    NwkSKeysAns = 0x03,
    AppSKeyReq = 0x04,
    AppSKeyAns = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::JoinReq),
            0x01 => Ok(PacketType::JoinAns),
            0x02 => Ok(PacketType::NwkSKeysReq),
            0x03 => Ok(PacketType::NwkSKeysAns),
            0x04 => Ok(PacketType::AppSKeyReq),
            0x05 => Ok(PacketType::AppSKeyAns),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// Parsed control datagram
#[derive(Debug)]
pub struct ControlPacket {
    pub token: u16,
    pub kind: PacketType,
    pub body: Vec<u8>,
}

impl ControlPacket {
    /// Parse a raw UDP datagram into a control packet
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Packet too short: {} bytes", data.len()));
        }

        let mut buf = data;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported protocol version: 0x{:02x}",
                version
            ));
        }

        let token = buf.get_u16();
        let kind = PacketType::try_from(buf.get_u8())?;

        Ok(ControlPacket {
            token,
            kind,
            body: buf.to_vec(),
        })
    }

    /// Build a datagram with the given body
    pub fn build(token: u16, kind: PacketType, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(token);
        buf.put_u8(kind as u8);
        buf.put_slice(body);
        buf.to_vec()
    }
}

/// Answer body: exactly one of `result` and `error` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct Answer<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDto>,
}

impl<T> Answer<T> {
    pub fn from_result(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Answer {
                result: Some(value),
                error: None,
            },
            Err(e) => Answer {
                result: None,
                error: Some(ErrorDto {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDto {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DlSettingsDto {
    pub opt_neg: bool,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
}

/// HandleJoin request body
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequestDto {
    pub auth_token: String,
    /// Base64-encoded 23-byte Join-Request frame
    pub raw_payload: String,
    pub selected_mac_version: String,
    /// 8 hex digits, MSB first
    pub dev_addr: Option<String>,
    /// 6 hex digits, MSB first
    pub net_id: String,
    pub dl_settings: DlSettingsDto,
    pub rx_delay: u8,
    /// 32 hex digits when present
    pub cf_list: Option<String>,
}

impl JoinRequestDto {
    pub fn to_request(&self) -> Result<JoinRequest, Error> {
        let raw_payload = base64_decode(&self.raw_payload)
            .map_err(|e| Error::InvalidArgument(format!("raw_payload: {}", e)))?;
        let selected_mac_version = self
            .selected_mac_version
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("selected_mac_version: {}", e)))?;
        let dev_addr = self
            .dev_addr
            .as_deref()
            .map(|s| parse_hex_u32(s, 4, "dev_addr"))
            .transpose()?;
        let net_id: NetId = parse_hex_u32(&self.net_id, 3, "net_id")?;
        let cf_list: Option<CfList> = self.cf_list.as_deref().map(parse_cf_list).transpose()?;

        Ok(JoinRequest {
            raw_payload,
            payload: None,
            selected_mac_version,
            dev_addr,
            net_id,
            dl_settings: DlSettings {
                opt_neg: self.dl_settings.opt_neg,
                rx1_dr_offset: self.dl_settings.rx1_dr_offset,
                rx2_dr: self.dl_settings.rx2_dr,
            },
            rx_delay: self.rx_delay,
            cf_list,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyEnvelopeDto {
    /// Hex: 32 digits plaintext, 48 digits wrapped
    pub key: String,
    pub kek_label: String,
}

impl From<&KeyEnvelope> for KeyEnvelopeDto {
    fn from(env: &KeyEnvelope) -> Self {
        KeyEnvelopeDto {
            key: hex::encode(&env.key),
            kek_label: env.kek_label.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionKeysDto {
    pub session_key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f_nwk_s_int_key: Option<KeyEnvelopeDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s_nwk_s_int_key: Option<KeyEnvelopeDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nwk_s_enc_key: Option<KeyEnvelopeDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_s_key: Option<KeyEnvelopeDto>,
}

impl From<&SessionKeys> for SessionKeysDto {
    fn from(keys: &SessionKeys) -> Self {
        SessionKeysDto {
            session_key_id: keys.session_key_id.clone(),
            f_nwk_s_int_key: keys.f_nwk_s_int_key.as_ref().map(Into::into),
            s_nwk_s_int_key: keys.s_nwk_s_int_key.as_ref().map(Into::into),
            nwk_s_enc_key: keys.nwk_s_enc_key.as_ref().map(Into::into),
            app_s_key: keys.app_s_key.as_ref().map(Into::into),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponseDto {
    /// Base64: MHDR followed by the encrypted Join-Accept
    pub raw_payload: String,
    pub session_keys: SessionKeysDto,
    pub lifetime: u32,
}

impl From<&JoinResponse> for JoinResponseDto {
    fn from(resp: &JoinResponse) -> Self {
        JoinResponseDto {
            raw_payload: base64_encode(&resp.raw_payload),
            session_keys: (&resp.session_keys).into(),
            lifetime: resp.lifetime,
        }
    }
}

/// GetNwkSKeys / GetAppSKey request body
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionKeyRequestDto {
    pub auth_token: String,
    /// 16 hex digits, MSB first
    pub dev_eui: String,
    pub session_key_id: String,
}

impl SessionKeyRequestDto {
    pub fn to_request(&self) -> Result<SessionKeyRequest, Error> {
        let dev_eui: Eui64 = crate::device::parse_eui(&self.dev_eui)
            .map_err(|e| Error::InvalidArgument(format!("dev_eui: {}", e)))?;
        Ok(SessionKeyRequest {
            dev_eui,
            session_key_id: self.session_key_id.clone(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NwkSKeysDto {
    pub f_nwk_s_int_key: KeyEnvelopeDto,
    pub s_nwk_s_int_key: KeyEnvelopeDto,
    pub nwk_s_enc_key: KeyEnvelopeDto,
}

impl From<&NwkSKeysResponse> for NwkSKeysDto {
    fn from(resp: &NwkSKeysResponse) -> Self {
        NwkSKeysDto {
            f_nwk_s_int_key: (&resp.f_nwk_s_int_key).into(),
            s_nwk_s_int_key: (&resp.s_nwk_s_int_key).into(),
            nwk_s_enc_key: (&resp.nwk_s_enc_key).into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppSKeyDto {
    pub app_s_key: KeyEnvelopeDto,
}

impl From<&AppSKeyResponse> for AppSKeyDto {
    fn from(resp: &AppSKeyResponse) -> Self {
        AppSKeyDto {
            app_s_key: (&resp.app_s_key).into(),
        }
    }
}

fn parse_hex_u32(s: &str, len: usize, field: &str) -> Result<u32, Error> {
    let bytes = hex::decode(s)
        .map_err(|e| Error::InvalidArgument(format!("{}: {}", field, e)))?;
    if bytes.len() != len {
        return Err(Error::InvalidArgument(format!(
            "{} must be {} bytes, got {}",
            field,
            len,
            bytes.len()
        )));
    }
    let mut value = 0u32;
    for b in bytes {
        value = (value << 8) | u32::from(b);
    }
    Ok(value)
}

fn parse_cf_list(s: &str) -> Result<CfList, Error> {
    let bytes =
        hex::decode(s).map_err(|e| Error::InvalidArgument(format!("cf_list: {}", e)))?;
    let cf_list: CfList = bytes
        .try_into()
        .map_err(|_| Error::InvalidArgument("cf_list must be 16 bytes".into()))?;
    Ok(cf_list)
}

pub fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn base64_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip() {
        let body = br#"{"x":1}"#;
        let packet = ControlPacket::build(0x4242, PacketType::JoinReq, body);
        let parsed = ControlPacket::parse(&packet).unwrap();
        assert_eq!(parsed.token, 0x4242);
        assert_eq!(parsed.kind, PacketType::JoinReq);
        assert_eq!(parsed.body, body);
    }

    #[test]
    fn test_parse_rejects_short_and_unknown() {
        assert!(ControlPacket::parse(&[0x01, 0x00]).is_err());
        assert!(ControlPacket::parse(&[0x02, 0x00, 0x00, 0x00]).is_err()); // bad version
        assert!(ControlPacket::parse(&[0x01, 0x00, 0x00, 0x77]).is_err()); // bad type
    }

    #[test]
    fn test_join_request_dto_conversion() {
        let dto = JoinRequestDto {
            auth_token: "secret".into(),
            raw_payload: base64_encode(&[0u8; 23]),
            selected_mac_version: "1.0.2".into(),
            dev_addr: Some("42ffffff".into()),
            net_id: "42ffff".into(),
            dl_settings: DlSettingsDto {
                opt_neg: true,
                rx1_dr_offset: 7,
                rx2_dr: 15,
            },
            rx_delay: 0x42,
            cf_list: None,
        };
        let req = dto.to_request().unwrap();
        assert_eq!(req.dev_addr, Some(0x42ff_ffff));
        assert_eq!(req.net_id, 0x42ffff);
        assert_eq!(req.dl_settings.to_byte(), 0xff);
        assert_eq!(req.raw_payload.len(), 23);
    }

    #[test]
    fn test_join_request_dto_rejects_bad_fields() {
        let mut dto = JoinRequestDto {
            auth_token: "".into(),
            raw_payload: "!!!".into(),
            selected_mac_version: "1.0.2".into(),
            dev_addr: None,
            net_id: "42ffff".into(),
            dl_settings: DlSettingsDto {
                opt_neg: false,
                rx1_dr_offset: 0,
                rx2_dr: 0,
            },
            rx_delay: 1,
            cf_list: None,
        };
        assert!(dto.to_request().is_err());

        dto.raw_payload = base64_encode(&[0u8; 23]);
        dto.net_id = "42".into();
        assert!(dto.to_request().is_err());

        dto.net_id = "42ffff".into();
        dto.cf_list = Some("aabb".into());
        assert!(dto.to_request().is_err());
    }

    #[test]
    fn test_answer_serialization() {
        let ok: Answer<u32> = Answer::from_result(Ok(7));
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(json, r#"{"result":7}"#);

        let err: Answer<u32> =
            Answer::from_result(Err(Error::NotFound("session keys x".into())));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""kind":"not_found""#));
    }
}
