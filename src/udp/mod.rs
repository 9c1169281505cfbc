//! UDP control endpoint.
//!
//! Serves `HandleJoin`, `GetNwkSKeys` and `GetAppSKey` over the datagram
//! protocol of [`protocol`]. The source address of an authenticated
//! datagram is the caller identity checked against the device's authorized
//! Network Server.

pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::server::{Caller, JoinServer};
use protocol::{
    Answer, AppSKeyDto, ControlPacket, JoinRequestDto, JoinResponseDto, NwkSKeysDto, PacketType,
    SessionKeyRequestDto,
};

/// Runs the control endpoint until the socket fails.
pub async fn run_server(config: &Config, server: Arc<JoinServer>) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(&config.server.bind).await?;
    info!("control endpoint listening on {}", config.server.bind);

    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        debug!("Received {} bytes from {}", len, src);

        match ControlPacket::parse(&buf[..len]) {
            Ok(packet) => {
                if let Some(reply) =
                    handle_packet(&config.server.cluster_auth_token, &server, src, packet).await
                {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        warn!("Failed to send answer to {}: {}", src, e);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to parse control packet from {}: {}", src, e);
            }
        }
    }
}

async fn handle_packet(
    cluster_auth_token: &str,
    server: &JoinServer,
    src: SocketAddr,
    packet: ControlPacket,
) -> Option<Vec<u8>> {
    match packet.kind {
        PacketType::JoinReq => {
            let dto: JoinRequestDto = match serde_json::from_slice(&packet.body) {
                Ok(dto) => dto,
                Err(e) => {
                    warn!("Failed to parse join request JSON from {}: {}", src, e);
                    return None;
                }
            };
            let caller = caller_for(cluster_auth_token, &dto.auth_token, src);
            let result = match dto.to_request() {
                Ok(req) => server.handle_join(&caller, req).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("join from {} failed: {}", src, e);
            }
            let answer: Answer<JoinResponseDto> =
                Answer::from_result(result.map(|r| JoinResponseDto::from(&r)));
            Some(answer_packet(packet.token, PacketType::JoinAns, &answer))
        }
        PacketType::NwkSKeysReq => {
            let dto: SessionKeyRequestDto = match serde_json::from_slice(&packet.body) {
                Ok(dto) => dto,
                Err(e) => {
                    warn!("Failed to parse key request JSON from {}: {}", src, e);
                    return None;
                }
            };
            let caller = caller_for(cluster_auth_token, &dto.auth_token, src);
            let result = match dto.to_request() {
                Ok(req) => server.get_nwk_s_keys(&caller, req).await,
                Err(e) => Err(e),
            };
            let answer: Answer<NwkSKeysDto> =
                Answer::from_result(result.map(|r| NwkSKeysDto::from(&r)));
            Some(answer_packet(packet.token, PacketType::NwkSKeysAns, &answer))
        }
        PacketType::AppSKeyReq => {
            let dto: SessionKeyRequestDto = match serde_json::from_slice(&packet.body) {
                Ok(dto) => dto,
                Err(e) => {
                    warn!("Failed to parse key request JSON from {}: {}", src, e);
                    return None;
                }
            };
            let caller = caller_for(cluster_auth_token, &dto.auth_token, src);
            let result = match dto.to_request() {
                Ok(req) => server.get_app_s_key(&caller, req).await,
                Err(e) => Err(e),
            };
            let answer: Answer<AppSKeyDto> =
                Answer::from_result(result.map(|r| AppSKeyDto::from(&r)));
            Some(answer_packet(packet.token, PacketType::AppSKeyAns, &answer))
        }
        PacketType::JoinAns | PacketType::NwkSKeysAns | PacketType::AppSKeyAns => {
            warn!("Unexpected answer packet from {}: {:?}", src, packet.kind);
            None
        }
    }
}

/// An authenticated caller is identified by its source IP; a bad or
/// missing token yields an anonymous caller the server will reject.
fn caller_for(cluster_auth_token: &str, presented: &str, src: SocketAddr) -> Caller {
    if !cluster_auth_token.is_empty() && presented == cluster_auth_token {
        Caller::addressed(src.ip().to_string())
    } else {
        Caller::anonymous()
    }
}

fn answer_packet<T: serde::Serialize>(token: u16, kind: PacketType, answer: &Answer<T>) -> Vec<u8> {
    let body = serde_json::to_vec(answer).unwrap_or_else(|e| {
        warn!("Failed to serialize answer: {}", e);
        br#"{"error":{"kind":"internal","message":"answer serialization failed"}}"#.to_vec()
    });
    ControlPacket::build(token, kind, &body)
}
