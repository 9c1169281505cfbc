//! The Join Server proper: Join-Request handling and peer key read-back.
//!
//! `handle_join` drives a single activation:
//! parse → device lookup → MIC verification → nonce checks → key
//! derivation → Join-Accept construction → commit. The session-key record
//! is persisted before the device record; a dangling key record without a
//! device pointer is tolerable and lazily collectable, a device pointing at
//! a missing record is not. Every mutation that depends on current device
//! state runs inside the registry's transform closure, which re-validates
//! the nonce policy against the state actually being committed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::device::{
    AesKey, DevAddr, DevNonce, EndDevice, Eui64, EuiPrefix, JoinNonce, KeyEnvelope, MacVersion,
    NetId, Session, SessionKeys,
};
use crate::error::Error;
use crate::lorawan::{
    self, crypto, CfList, DlSettings, Frame, JoinAcceptPayload, JoinRequestFrame,
    JOIN_ACCEPT_MHDR, MAX_JOIN_NONCE,
};
use crate::registry::{DeviceRegistry, KeyRegistry};

/// Static configuration of the join core. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct JoinServerConfig {
    /// JoinEUIs served by this Join Server.
    pub join_eui_prefixes: Vec<EuiPrefix>,
    /// KEK table: label to key-encryption key.
    pub keks: HashMap<String, AesKey>,
    /// KEK label used when wrapping session keys for a peer address.
    pub kek_labels: HashMap<String, String>,
}

/// Identity of the peer invoking a server method, as established by the
/// transport layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub authenticated: bool,
    /// Peer address, when known. Addressed callers must match the device's
    /// authorized Network Server; cluster-internal callers carry no address.
    pub address: Option<String>,
}

impl Caller {
    pub fn cluster() -> Self {
        Caller {
            authenticated: true,
            address: None,
        }
    }

    pub fn addressed(address: impl Into<String>) -> Self {
        Caller {
            authenticated: true,
            address: Some(address.into()),
        }
    }

    pub fn anonymous() -> Self {
        Caller {
            authenticated: false,
            address: None,
        }
    }
}

/// Activation request as bundled by the Network Server.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Raw 23-byte MAC frame. When non-empty it wins over `payload`.
    pub raw_payload: Vec<u8>,
    /// Pre-decoded frame, accepted in lieu of `raw_payload`.
    pub payload: Option<Frame>,
    pub selected_mac_version: MacVersion,
    pub dev_addr: Option<DevAddr>,
    pub net_id: NetId,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<CfList>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResponse {
    /// MHDR followed by the encrypted Join-Accept.
    pub raw_payload: Vec<u8>,
    pub session_keys: SessionKeys,
    /// Session TTL in seconds; 0 means "do not rotate".
    pub lifetime: u32,
}

#[derive(Debug, Clone)]
pub struct SessionKeyRequest {
    pub dev_eui: Eui64,
    pub session_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NwkSKeysResponse {
    pub f_nwk_s_int_key: KeyEnvelope,
    pub s_nwk_s_int_key: KeyEnvelope,
    pub nwk_s_enc_key: KeyEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSKeyResponse {
    pub app_s_key: KeyEnvelope,
}

pub struct JoinServer {
    config: JoinServerConfig,
    devices: Arc<dyn DeviceRegistry>,
    keys: Arc<dyn KeyRegistry>,
}

impl JoinServer {
    pub fn new(
        config: JoinServerConfig,
        devices: Arc<dyn DeviceRegistry>,
        keys: Arc<dyn KeyRegistry>,
    ) -> Self {
        JoinServer {
            config,
            devices,
            keys,
        }
    }

    /// Handles a Join-Request and returns the encrypted Join-Accept along
    /// with the freshly derived session keys.
    pub async fn handle_join(
        &self,
        caller: &Caller,
        req: JoinRequest,
    ) -> Result<JoinResponse, Error> {
        if !caller.authenticated {
            return Err(Error::Unauthenticated);
        }

        let dev_addr = req
            .dev_addr
            .ok_or_else(|| Error::InvalidArgument("request carries no DevAddr".into()))?;

        let frame = request_frame(&req)?;
        debug!("handling {}", frame);

        if !self
            .config
            .join_eui_prefixes
            .iter()
            .any(|p| p.matches(frame.join_eui))
        {
            return Err(Error::InvalidArgument(format!(
                "JoinEUI {:016X} is not covered by any configured prefix",
                frame.join_eui
            )));
        }
        if frame.dev_eui == 0 {
            return Err(Error::InvalidArgument("DevEUI is zero".into()));
        }

        let device = self
            .devices
            .get_by_eui(frame.join_eui, frame.dev_eui)
            .await?;

        if !device.lorawan_version.same_family(req.selected_mac_version) {
            return Err(Error::InvalidArgument(format!(
                "device speaks LoRaWAN {}, request selected {}",
                device.lorawan_version, req.selected_mac_version
            )));
        }

        if let Some(address) = &caller.address {
            if *address != device.network_server_address {
                return Err(Error::PermissionDenied(format!(
                    "caller {} is not the authorized Network Server",
                    address
                )));
            }
        }

        let app_key = device.root_keys.app_key;
        let nwk_root = if device.lorawan_version.is_1_1() {
            device.root_keys.nwk_key.ok_or_else(|| {
                Error::FailedPrecondition("1.1 device is provisioned without NwkKey".into())
            })?
        } else {
            app_key
        };

        // The request MIC is keyed by NwkKey for 1.1 and AppKey for 1.0.x.
        let mic_input = lorawan::encode_join_request(&frame);
        if crypto::mic(&nwk_root, &mic_input) != frame.mic {
            return Err(Error::PermissionDenied("join-request MIC mismatch".into()));
        }

        // Fast-fail on the snapshot; the commit transform re-validates.
        check_dev_nonce(&device, frame.dev_nonce)?;

        let join_nonce = device.next_join_nonce;
        if join_nonce > MAX_JOIN_NONCE {
            return Err(Error::ResourceExhausted(format!(
                "JoinNonce space of DevEUI {:016X} is exhausted",
                frame.dev_eui
            )));
        }

        let accept = JoinAcceptPayload {
            join_nonce,
            net_id: req.net_id,
            dev_addr,
            dl_settings: req.dl_settings,
            rx_delay: req.rx_delay,
            cf_list: req.cf_list,
        };
        let raw_accept = self.build_join_accept(&device, &frame, &nwk_root, &accept);

        let session_keys = self.derive_session_keys(&device, &frame, join_nonce, req.net_id)?;

        // Commit order: keys first. An orphaned key record is harmless;
        // a device session pointing at nothing is not.
        let stored_keys = session_keys.clone();
        let key_id = session_keys.session_key_id.clone();
        self.keys
            .set_by_id(
                frame.dev_eui,
                &session_keys.session_key_id,
                Box::new(move |existing| match existing {
                    Some(_) => Err(Error::AlreadyExists(format!("session keys {}", key_id))),
                    None => Ok(stored_keys),
                }),
            )
            .await?;

        let committed_keys = session_keys.clone();
        let dev_nonce = frame.dev_nonce;
        let now = Utc::now();
        self.devices
            .set_by_eui(
                frame.join_eui,
                frame.dev_eui,
                Box::new(move |current| {
                    let mut dev = current
                        .ok_or_else(|| Error::Aborted("device vanished during join".into()))?;
                    // A concurrent join may have advanced the state since
                    // the snapshot; this one then loses.
                    check_dev_nonce(&dev, dev_nonce)?;
                    if dev.next_join_nonce != join_nonce {
                        return Err(Error::Aborted(
                            "concurrent join advanced the join nonce".into(),
                        ));
                    }
                    if dev.lorawan_version.is_1_1() {
                        dev.next_dev_nonce = u32::from(dev_nonce) + 1;
                    }
                    dev.used_dev_nonces.push(dev_nonce);
                    dev.next_join_nonce = join_nonce + 1;
                    dev.session = Some(Session {
                        dev_addr,
                        keys: committed_keys,
                        started_at: now,
                    });
                    dev.updated_at = now;
                    Ok(dev)
                }),
            )
            .await?;

        info!(
            "accepted join DevEUI={:016X} JoinEUI={:016X} DevNonce={} JoinNonce={}",
            frame.dev_eui, frame.join_eui, frame.dev_nonce, join_nonce
        );

        Ok(JoinResponse {
            raw_payload: raw_accept,
            session_keys,
            lifetime: 0,
        })
    }

    /// Returns the network-side session keys for (DevEUI, session key id).
    pub async fn get_nwk_s_keys(
        &self,
        caller: &Caller,
        req: SessionKeyRequest,
    ) -> Result<NwkSKeysResponse, Error> {
        if !caller.authenticated {
            return Err(Error::Unauthenticated);
        }

        let keys = self.read_keys(req.dev_eui, &req.session_key_id).await?;
        Ok(NwkSKeysResponse {
            f_nwk_s_int_key: keys
                .f_nwk_s_int_key
                .ok_or_else(|| Error::FailedPrecondition("no FNwkSIntKey stored".into()))?,
            s_nwk_s_int_key: keys
                .s_nwk_s_int_key
                .ok_or_else(|| Error::FailedPrecondition("no SNwkSIntKey stored".into()))?,
            nwk_s_enc_key: keys
                .nwk_s_enc_key
                .ok_or_else(|| Error::FailedPrecondition("no NwkSEncKey stored".into()))?,
        })
    }

    /// Returns the application session key for (DevEUI, session key id).
    pub async fn get_app_s_key(
        &self,
        caller: &Caller,
        req: SessionKeyRequest,
    ) -> Result<AppSKeyResponse, Error> {
        if !caller.authenticated {
            return Err(Error::Unauthenticated);
        }

        let keys = self.read_keys(req.dev_eui, &req.session_key_id).await?;
        Ok(AppSKeyResponse {
            app_s_key: keys
                .app_s_key
                .ok_or_else(|| Error::FailedPrecondition("no AppSKey stored".into()))?,
        })
    }

    async fn read_keys(&self, dev_eui: Eui64, session_key_id: &str) -> Result<SessionKeys, Error> {
        self.keys
            .get_by_id(dev_eui, session_key_id)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => e,
                other => Error::registry(anyhow::anyhow!(other)),
            })
    }

    fn build_join_accept(
        &self,
        device: &EndDevice,
        frame: &JoinRequestFrame,
        nwk_root: &AesKey,
        accept: &JoinAcceptPayload,
    ) -> Vec<u8> {
        let body = accept.encode();
        let opt_neg = accept.dl_settings.opt_neg && device.lorawan_version.is_1_1();

        let (mic, enc_key) = if opt_neg {
            let js_int_key = crypto::derive_js_int_key(nwk_root, frame.dev_eui);
            (
                crypto::join_accept_mic_1_1(
                    &js_int_key,
                    frame.join_eui,
                    frame.dev_nonce,
                    JOIN_ACCEPT_MHDR,
                    &body,
                ),
                *nwk_root,
            )
        } else {
            (
                crypto::join_accept_mic_legacy(&device.root_keys.app_key, JOIN_ACCEPT_MHDR, &body),
                device.root_keys.app_key,
            )
        };

        let mut plaintext = body;
        plaintext.extend_from_slice(&mic);

        let mut raw = Vec::with_capacity(1 + plaintext.len());
        raw.push(JOIN_ACCEPT_MHDR);
        raw.extend_from_slice(&crypto::encrypt_join_accept(&enc_key, &plaintext));
        raw
    }

    fn derive_session_keys(
        &self,
        device: &EndDevice,
        frame: &JoinRequestFrame,
        join_nonce: JoinNonce,
        net_id: NetId,
    ) -> Result<SessionKeys, Error> {
        let ns_kek = self.kek_for(Some(device.network_server_address.as_str()))?;
        let as_kek = self.kek_for(device.application_server_address.as_deref())?;

        let app_key = &device.root_keys.app_key;
        let mut keys = SessionKeys {
            session_key_id: mint_session_key_id(),
            ..Default::default()
        };

        if device.lorawan_version.is_1_1() {
            let nwk_key = device.root_keys.nwk_key.as_ref().ok_or_else(|| {
                Error::FailedPrecondition("1.1 device is provisioned without NwkKey".into())
            })?;
            keys.f_nwk_s_int_key = Some(envelope(
                crypto::derive_f_nwk_s_int_key(nwk_key, join_nonce, frame.join_eui, frame.dev_nonce),
                &ns_kek,
            ));
            keys.s_nwk_s_int_key = Some(envelope(
                crypto::derive_s_nwk_s_int_key(nwk_key, join_nonce, frame.join_eui, frame.dev_nonce),
                &ns_kek,
            ));
            keys.nwk_s_enc_key = Some(envelope(
                crypto::derive_nwk_s_enc_key(nwk_key, join_nonce, frame.join_eui, frame.dev_nonce),
                &ns_kek,
            ));
            keys.app_s_key = Some(envelope(
                crypto::derive_app_s_key(app_key, join_nonce, frame.join_eui, frame.dev_nonce),
                &as_kek,
            ));
        } else {
            keys.f_nwk_s_int_key = Some(envelope(
                crypto::derive_legacy_nwk_s_key(app_key, join_nonce, net_id, frame.dev_nonce),
                &ns_kek,
            ));
            keys.app_s_key = Some(envelope(
                crypto::derive_legacy_app_s_key(app_key, join_nonce, net_id, frame.dev_nonce),
                &as_kek,
            ));
        }

        Ok(keys)
    }

    /// Resolves the KEK wrapping session keys for `peer`, if one is
    /// configured. A label that does not resolve in the KEK table is a
    /// deployment error, not a reason to fall back to plaintext.
    fn kek_for(&self, peer: Option<&str>) -> Result<Option<(String, AesKey)>, Error> {
        let Some(peer) = peer else {
            return Ok(None);
        };
        let Some(label) = self.config.kek_labels.get(peer) else {
            return Ok(None);
        };
        let kek = self.config.keks.get(label).ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("KEK label {:?} has no key configured", label))
        })?;
        Ok(Some((label.clone(), *kek)))
    }
}

fn envelope(key: AesKey, kek: &Option<(String, AesKey)>) -> KeyEnvelope {
    match kek {
        Some((label, kek_key)) => KeyEnvelope::wrapped(crypto::wrap_key(kek_key, &key), label),
        None => KeyEnvelope::plaintext(key),
    }
}

/// Resolves the frame the request actually carries. A non-empty raw
/// payload wins; a pre-decoded payload that disagrees with it is rejected.
fn request_frame(req: &JoinRequest) -> Result<JoinRequestFrame, Error> {
    if !req.raw_payload.is_empty() {
        let frame = lorawan::decode_join_request(&req.raw_payload)?;
        if let Some(Frame::JoinRequest(supplied)) = &req.payload {
            if supplied.join_eui != frame.join_eui
                || supplied.dev_eui != frame.dev_eui
                || supplied.dev_nonce != frame.dev_nonce
            {
                return Err(Error::InvalidArgument(
                    "decoded payload disagrees with raw payload".into(),
                ));
            }
        }
        return Ok(frame);
    }

    match &req.payload {
        None => Err(Error::DataLoss("request carries no payload".into())),
        Some(Frame::JoinRequest(frame)) => {
            if let lorawan::Major::Unknown(m) = frame.major {
                return Err(Error::InvalidArgument(format!(
                    "unsupported LoRaWAN major: {}",
                    m
                )));
            }
            if frame.join_eui == 0 {
                return Err(Error::DataLoss("JoinEUI is zero".into()));
            }
            if frame.dev_eui == 0 {
                return Err(Error::DataLoss("DevEUI is zero".into()));
            }
            Ok(frame.clone())
        }
        Some(_) => Err(Error::DataLoss("payload is not a join-request".into())),
    }
}

/// Replay protection. 1.1 enforces strict DevNonce monotonicity; 1.0.x
/// forbids reuse of any previously accepted DevNonce.
fn check_dev_nonce(device: &EndDevice, dev_nonce: DevNonce) -> Result<(), Error> {
    if device.lorawan_version.is_1_1() {
        if u32::from(dev_nonce) < device.next_dev_nonce {
            return Err(Error::InvalidArgument(format!(
                "dev_nonce {} too small, expected at least {}",
                dev_nonce, device.next_dev_nonce
            )));
        }
    } else if device.used_dev_nonces.contains(&dev_nonce) {
        return Err(Error::InvalidArgument(format!(
            "dev_nonce {} reused",
            dev_nonce
        )));
    }
    Ok(())
}

/// Mints an opaque session-key identifier: 16 bytes from the OS RNG,
/// unique per DevEUI for all practical purposes.
fn mint_session_key_id() -> String {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    hex::encode(id)
}
