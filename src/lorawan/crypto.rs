//! AES primitives of the join flow.
//!
//! All session keys are single-block AES-128 encryptions of a tagged,
//! zero-padded input under a root key. MICs are truncated AES-CMAC.
//! Join-Accept "encryption" applies the block cipher in decrypt direction
//! so that the device can invert it with plain AES encrypt.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::device::{AesKey, DevNonce, Eui64, JoinNonce, NetId};

/// Block size of AES-128.
pub const BLOCK_SIZE: usize = 16;

/// MIC size in bytes.
pub const MIC_SIZE: usize = 4;

/// Frame type of a Join-Request in the 1.1 Join-Accept MIC input.
const JOIN_REQUEST_TYPE: u8 = 0xff;

/// AES-CMAC over `data`, truncated to the 4-byte MIC.
pub fn mic(key: &AesKey, data: &[u8]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; MIC_SIZE];
    out.copy_from_slice(&tag[..MIC_SIZE]);
    out
}

/// Join-Accept MIC for 1.0.x (and 1.1 without OptNeg):
/// CMAC(key, MHDR | JoinNonce | NetID | DevAddr | DLSettings | RxDelay | [CFList]).
pub fn join_accept_mic_legacy(key: &AesKey, mhdr: u8, body: &[u8]) -> [u8; MIC_SIZE] {
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(mhdr);
    buf.extend_from_slice(body);
    mic(key, &buf)
}

/// Join-Accept MIC for 1.1 with OptNeg set:
/// CMAC(JSIntKey, JoinReqType | JoinEUI | DevNonce | MHDR | body).
pub fn join_accept_mic_1_1(
    js_int_key: &AesKey,
    join_eui: Eui64,
    dev_nonce: DevNonce,
    mhdr: u8,
    body: &[u8],
) -> [u8; MIC_SIZE] {
    let mut buf = Vec::with_capacity(12 + body.len());
    buf.push(JOIN_REQUEST_TYPE);
    buf.extend_from_slice(&join_eui.to_le_bytes());
    buf.extend_from_slice(&dev_nonce.to_le_bytes());
    buf.push(mhdr);
    buf.extend_from_slice(body);
    mic(js_int_key, &buf)
}

/// Encrypts the Join-Accept bytes after MHDR. Applied block-wise; the
/// input length must be a multiple of 16 (MIC included).
pub fn encrypt_join_accept(key: &AesKey, payload: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let mut out = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.decrypt_block((&mut block).into());
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

/// Inverts [`encrypt_join_accept`]; what the device runs on reception.
pub fn decrypt_join_accept(key: &AesKey, payload: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let mut out = Vec::with_capacity(payload.len());
    for chunk in payload.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.encrypt_block((&mut block).into());
        out.extend_from_slice(&block[..chunk.len()]);
    }
    out
}

fn derive(root: &AesKey, block: [u8; BLOCK_SIZE]) -> AesKey {
    let cipher = Aes128::new(root.into());
    let mut block = block;
    cipher.encrypt_block((&mut block).into());
    block
}

fn root_key_block(tag: u8, dev_eui: Eui64) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[1..9].copy_from_slice(&dev_eui.to_le_bytes());
    block
}

/// JSIntKey: MIC key of the 1.1 Join-Accept answering a Join-Request.
pub fn derive_js_int_key(nwk_key: &AesKey, dev_eui: Eui64) -> AesKey {
    derive(nwk_key, root_key_block(0x06, dev_eui))
}

/// JSEncKey: encryption key of 1.1 Rejoin-Request answers.
pub fn derive_js_enc_key(nwk_key: &AesKey, dev_eui: Eui64) -> AesKey {
    derive(nwk_key, root_key_block(0x05, dev_eui))
}

fn session_key_block_1_1(
    tag: u8,
    join_nonce: JoinNonce,
    join_eui: Eui64,
    dev_nonce: DevNonce,
) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    block[4..12].copy_from_slice(&join_eui.to_le_bytes());
    block[12..14].copy_from_slice(&dev_nonce.to_le_bytes());
    block
}

pub fn derive_f_nwk_s_int_key(
    nwk_key: &AesKey,
    join_nonce: JoinNonce,
    join_eui: Eui64,
    dev_nonce: DevNonce,
) -> AesKey {
    derive(nwk_key, session_key_block_1_1(0x01, join_nonce, join_eui, dev_nonce))
}

pub fn derive_app_s_key(
    app_key: &AesKey,
    join_nonce: JoinNonce,
    join_eui: Eui64,
    dev_nonce: DevNonce,
) -> AesKey {
    derive(app_key, session_key_block_1_1(0x02, join_nonce, join_eui, dev_nonce))
}

pub fn derive_s_nwk_s_int_key(
    nwk_key: &AesKey,
    join_nonce: JoinNonce,
    join_eui: Eui64,
    dev_nonce: DevNonce,
) -> AesKey {
    derive(nwk_key, session_key_block_1_1(0x03, join_nonce, join_eui, dev_nonce))
}

pub fn derive_nwk_s_enc_key(
    nwk_key: &AesKey,
    join_nonce: JoinNonce,
    join_eui: Eui64,
    dev_nonce: DevNonce,
) -> AesKey {
    derive(nwk_key, session_key_block_1_1(0x04, join_nonce, join_eui, dev_nonce))
}

fn session_key_block_legacy(
    tag: u8,
    join_nonce: JoinNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[1..4].copy_from_slice(&join_nonce.to_le_bytes()[..3]);
    block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    block
}

/// 1.0.x NwkSKey, stored as FNwkSIntKey.
pub fn derive_legacy_nwk_s_key(
    app_key: &AesKey,
    join_nonce: JoinNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> AesKey {
    derive(app_key, session_key_block_legacy(0x01, join_nonce, net_id, dev_nonce))
}

/// 1.0.x AppSKey.
pub fn derive_legacy_app_s_key(
    app_key: &AesKey,
    join_nonce: JoinNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> AesKey {
    derive(app_key, session_key_block_legacy(0x02, join_nonce, net_id, dev_nonce))
}

/// AES key wrap (RFC 3394) of a 16-byte session key under a 16-byte KEK.
/// Output is 24 bytes.
pub fn wrap_key(kek: &AesKey, key: &AesKey) -> Vec<u8> {
    let cipher = Aes128::new(kek.into());

    let mut a = [0xa6u8; 8];
    let mut r = [[0u8; 8]; 2];
    r[0].copy_from_slice(&key[..8]);
    r[1].copy_from_slice(&key[8..]);

    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut block = [0u8; BLOCK_SIZE];
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(ri);
            cipher.encrypt_block((&mut block).into());

            a.copy_from_slice(&block[..8]);
            let t = (2 * j + i as u64 + 1).to_be_bytes();
            for (ab, tb) in a.iter_mut().zip(t) {
                *ab ^= tb;
            }
            ri.copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&a);
    out.extend_from_slice(&r[0]);
    out.extend_from_slice(&r[1]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_KEY: AesKey = [
        0x42, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff,
    ];
    const NWK_KEY: AesKey = [
        0x42, 0x42, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff,
    ];
    const JOIN_EUI: Eui64 = 0x42ff_ffff_ffff_ffff;
    const DEV_EUI: Eui64 = 0x4242_ffff_ffff_ffff;

    fn join_request_bytes(dev_nonce: u16) -> [u8; 19] {
        let mut buf = [0u8; 19];
        buf[0] = 0x00;
        buf[1..9].copy_from_slice(&JOIN_EUI.to_le_bytes());
        buf[9..17].copy_from_slice(&DEV_EUI.to_le_bytes());
        buf[17..19].copy_from_slice(&dev_nonce.to_le_bytes());
        buf
    }

    #[test]
    fn test_join_request_mic_nwk_key() {
        assert_eq!(mic(&NWK_KEY, &join_request_bytes(0)), [0x55, 0x17, 0x54, 0x8e]);
        assert_eq!(
            mic(&NWK_KEY, &join_request_bytes(0x2442)),
            [0x6e, 0x54, 0x1b, 0x37]
        );
    }

    #[test]
    fn test_join_request_mic_app_key() {
        assert_eq!(mic(&APP_KEY, &join_request_bytes(0)), [0xcc, 0x15, 0x6f, 0x0a]);
        assert_eq!(
            mic(&APP_KEY, &join_request_bytes(0x2442)),
            [0xed, 0x8b, 0xd2, 0x24]
        );
    }

    // JoinNonce 0, NetID 0x42ffff, DevAddr 0x42ffffff, DLSettings 0xff, RxDelay 0x42.
    const ACCEPT_BODY: [u8; 12] = [
        0x00, 0x00, 0x00, 0xff, 0xff, 0x42, 0xff, 0xff, 0xff, 0x42, 0xff, 0x42,
    ];

    #[test]
    fn test_join_accept_mic_legacy() {
        assert_eq!(
            join_accept_mic_legacy(&APP_KEY, 0x20, &ACCEPT_BODY),
            [0xad, 0x48, 0xaf, 0x94]
        );
    }

    #[test]
    fn test_join_accept_mic_1_1() {
        let js_int_key = derive_js_int_key(&NWK_KEY, DEV_EUI);
        assert_eq!(
            join_accept_mic_1_1(&js_int_key, JOIN_EUI, 0, 0x20, &ACCEPT_BODY),
            [0x16, 0x41, 0x9f, 0x29]
        );
    }

    #[test]
    fn test_join_accept_encryption_round_trip() {
        let mut payload = ACCEPT_BODY.to_vec();
        payload.extend_from_slice(&[0xad, 0x48, 0xaf, 0x94]);
        let encrypted = encrypt_join_accept(&APP_KEY, &payload);
        assert_eq!(encrypted.len(), payload.len());
        assert_ne!(encrypted, payload);
        assert_eq!(decrypt_join_accept(&APP_KEY, &encrypted), payload);
    }

    #[test]
    fn test_join_accept_encryption_two_blocks() {
        let mut payload = ACCEPT_BODY.to_vec();
        payload.extend_from_slice(&[0x11; 16]); // CFList
        payload.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let encrypted = encrypt_join_accept(&NWK_KEY, &payload);
        assert_eq!(encrypted.len(), 32);
        assert_eq!(decrypt_join_accept(&NWK_KEY, &encrypted), payload);
    }

    #[test]
    fn test_derivations_are_deterministic() {
        let a = derive_f_nwk_s_int_key(&NWK_KEY, 0x42fffe, JOIN_EUI, 0x2442);
        let b = derive_f_nwk_s_int_key(&NWK_KEY, 0x42fffe, JOIN_EUI, 0x2442);
        assert_eq!(a, b);

        let legacy_a = derive_legacy_app_s_key(&APP_KEY, 1, 0x42ffff, 2);
        let legacy_b = derive_legacy_app_s_key(&APP_KEY, 1, 0x42ffff, 2);
        assert_eq!(legacy_a, legacy_b);
    }

    #[test]
    fn test_derivations_are_distinct() {
        let keys = [
            derive_f_nwk_s_int_key(&NWK_KEY, 1, JOIN_EUI, 2),
            derive_s_nwk_s_int_key(&NWK_KEY, 1, JOIN_EUI, 2),
            derive_nwk_s_enc_key(&NWK_KEY, 1, JOIN_EUI, 2),
            derive_app_s_key(&APP_KEY, 1, JOIN_EUI, 2),
            derive_js_int_key(&NWK_KEY, DEV_EUI),
            derive_js_enc_key(&NWK_KEY, DEV_EUI),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_key_wrap_rfc3394_vector() {
        // RFC 3394 section 4.1: 128-bit key data under a 128-bit KEK.
        let kek: AesKey = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        let data: AesKey = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        assert_eq!(
            wrap_key(&kek, &data),
            vec![
                0x1f, 0xa6, 0x8b, 0x0a, 0x81, 0x12, 0xb4, 0x47, 0xae, 0xf3, 0x4b, 0xd8, 0xfb,
                0x5a, 0x7b, 0x82, 0x9d, 0x3e, 0x86, 0x23, 0x71, 0xd2, 0xcf, 0xe5,
            ]
        );
    }
}
