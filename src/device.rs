//! End-device and session state owned by the registries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// EUI-64 identifier (JoinEUI, DevEUI). Numeric value; little-endian on the wire.
pub type Eui64 = u64;
/// 32-bit network-assigned device address.
pub type DevAddr = u32;
/// 24-bit identifier of the home Network Server.
pub type NetId = u32;
/// 16-bit nonce supplied by the device in every Join-Request.
pub type DevNonce = u16;
/// 24-bit nonce minted by the Join Server per Join-Accept.
pub type JoinNonce = u32;
/// AES-128 key (16 bytes).
pub type AesKey = [u8; 16];

/// LoRaWAN MAC version spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacVersion {
    V1_0,
    V1_0_1,
    V1_0_2,
    V1_0_3,
    V1_1,
}

impl MacVersion {
    pub fn is_1_1(self) -> bool {
        matches!(self, MacVersion::V1_1)
    }

    /// Whether two versions share key-derivation and MIC semantics
    /// (1.0.x on one side, 1.1 on the other).
    pub fn same_family(self, other: MacVersion) -> bool {
        self.is_1_1() == other.is_1_1()
    }
}

impl fmt::Display for MacVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacVersion::V1_0 => write!(f, "1.0"),
            MacVersion::V1_0_1 => write!(f, "1.0.1"),
            MacVersion::V1_0_2 => write!(f, "1.0.2"),
            MacVersion::V1_0_3 => write!(f, "1.0.3"),
            MacVersion::V1_1 => write!(f, "1.1"),
        }
    }
}

impl FromStr for MacVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" | "1.0.0" => Ok(MacVersion::V1_0),
            "1.0.1" => Ok(MacVersion::V1_0_1),
            "1.0.2" => Ok(MacVersion::V1_0_2),
            "1.0.3" => Ok(MacVersion::V1_0_3),
            "1.1" => Ok(MacVersion::V1_1),
            _ => Err(anyhow::anyhow!("unsupported LoRaWAN version: {}", s)),
        }
    }
}

/// Root key material provisioned on a device.
///
/// 1.0.x devices carry only `AppKey`; 1.1 devices additionally carry
/// `NwkKey`, the root of all network-side derivations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootKeys {
    pub app_key: AesKey,
    pub nwk_key: Option<AesKey>,
}

/// A session key as handed to peers: plaintext with an empty KEK label,
/// or wrapped (AES key wrap) under the named KEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEnvelope {
    pub key: Vec<u8>,
    pub kek_label: String,
}

impl KeyEnvelope {
    pub fn plaintext(key: AesKey) -> Self {
        KeyEnvelope {
            key: key.to_vec(),
            kek_label: String::new(),
        }
    }

    pub fn wrapped(key: Vec<u8>, kek_label: impl Into<String>) -> Self {
        KeyEnvelope {
            key,
            kek_label: kek_label.into(),
        }
    }

    pub fn is_wrapped(&self) -> bool {
        !self.kek_label.is_empty()
    }
}

/// Session key set derived by one successful join, indexed by
/// (DevEUI, session key id). 1.0.x sessions carry `FNwkSIntKey` and
/// `AppSKey` only; 1.1 sessions carry all four keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionKeys {
    pub session_key_id: String,
    pub f_nwk_s_int_key: Option<KeyEnvelope>,
    pub s_nwk_s_int_key: Option<KeyEnvelope>,
    pub nwk_s_enc_key: Option<KeyEnvelope>,
    pub app_s_key: Option<KeyEnvelope>,
}

/// The most recent committed session of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub dev_addr: DevAddr,
    pub keys: SessionKeys,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndDeviceIds {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_addr: Option<DevAddr>,
}

/// A provisioned end device, identified by (JoinEUI, DevEUI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndDevice {
    pub ids: EndDeviceIds,
    pub lorawan_version: MacVersion,
    pub root_keys: RootKeys,
    /// Smallest DevNonce the device is expected to use next (1.1 only).
    pub next_dev_nonce: u32,
    /// DevNonces already consumed by accepted joins.
    pub used_dev_nonces: Vec<DevNonce>,
    /// Next JoinNonce to mint. Monotonically increasing.
    pub next_join_nonce: JoinNonce,
    /// Address of the Network Server cluster authorized to activate this device.
    pub network_server_address: String,
    /// Address of the Application Server peer, when AppSKey wrapping applies.
    pub application_server_address: Option<String>,
    pub session: Option<Session>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An EUI-64 prefix: a JoinEUI is covered when its top `length` bits match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EuiPrefix {
    pub eui: Eui64,
    pub length: u8,
}

impl EuiPrefix {
    pub fn matches(&self, eui: Eui64) -> bool {
        if self.length == 0 {
            return true;
        }
        let length = u32::from(self.length.min(64));
        let mask = !0u64 << (64 - length);
        (eui ^ self.eui) & mask == 0
    }
}

impl fmt::Display for EuiPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}/{}", self.eui, self.length)
    }
}

impl FromStr for EuiPrefix {
    type Err = anyhow::Error;

    /// Parses `"<16 hex digits>/<bits>"`, e.g. `"42ffffffffffff00/56"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (eui, length) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("EUI prefix must be <eui>/<bits>: {:?}", s))?;
        let length: u8 = length
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid prefix length {:?}: {}", length, e))?;
        if length > 64 {
            anyhow::bail!("prefix length must be at most 64, got {}", length);
        }
        Ok(EuiPrefix {
            eui: parse_eui(eui)?,
            length,
        })
    }
}

/// Parses an EUI-64 from 16 hex digits (MSB first).
pub fn parse_eui(s: &str) -> anyhow::Result<Eui64> {
    let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("invalid EUI {:?}: {}", s, e))?;
    if bytes.len() != 8 {
        anyhow::bail!("EUI must be 8 bytes, got {}", bytes.len());
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(buf))
}

/// Parses an AES-128 key from 32 hex digits.
pub fn parse_aes_key(s: &str) -> anyhow::Result<AesKey> {
    let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("invalid key: {}", e))?;
    if bytes.len() != 16 {
        anyhow::bail!("AES-128 key must be 16 bytes, got {}", bytes.len());
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    Ok(key)
}
