use crate::config::{add_ice_url_scheme, LinkConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::link::LinkEvent;
use crate::peer::state::LinkSignal;
use crate::peer::types::{IceCandidate, Role};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// создаём RTCPeerConnection по конфигурации линка
pub async fn new_peer(config: &LinkConfig) -> Result<Arc<RTCPeerConnection>> {
    config.validate()?;

    let mut setting_engine = SettingEngine::default();
    if config.include_loopback {
        setting_engine.set_include_loopback_candidate(true);
    }
    let api = APIBuilder::new()
        .with_setting_engine(setting_engine)
        .build();

    let pc = api
        .new_peer_connection(rtc_config(&config.ice_servers))
        .await
        .map_err(|e| Error::TransportFailed(format!("failed to create peer connection: {e}")))?;
    Ok(Arc::new(pc))
}

/// Подключает колбэки соединения к очереди событий линка
pub fn hook_peer(pc: &Arc<RTCPeerConnection>, role: Role, events: UnboundedSender<LinkEvent>) {
    let cand_events = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate(&format!("LOCAL {role}"), &candidate);
                    let _ = cand_events.send(LinkEvent::LocalCandidate(candidate));
                }
                Err(e) => warn!("Failed to serialize local candidate: {e}"),
            },
            // cand == None означает конец сбора, но на него не полагаемся
            None => debug!("ICE candidate gathering completed ({role})"),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    // слабая ссылка, иначе соединение держит само себя через колбэк
    let pc_stats: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection ({role}) state changed to: {:?}", st);

        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = pc_stats.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }

        let _ = events.send(LinkEvent::Signal(LinkSignal::Transport(st)));
        Box::pin(async {})
    }));
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_server(config: &ServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: vec![add_ice_url_scheme(config)],
        username: config.username.clone().unwrap_or_default(),
        credential: config.credential.clone().unwrap_or_default(),
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers.iter().map(ice_server).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtc_config_maps_servers() {
        let servers = vec![
            ServerConfig::stun("s", "stun.example.org:3478"),
            ServerConfig {
                id: "t".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("classroom".into()),
                credential: Some("secret".into()),
            },
        ];
        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert_eq!(config.ice_servers[1].username, "classroom");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[tokio::test]
    async fn test_new_peer_rejects_bad_config() {
        let mut config = LinkConfig::local();
        config.ice_servers.push(ServerConfig::stun("empty", ""));
        assert!(matches!(new_peer(&config).await, Err(Error::InvalidConfig(_))));
    }
}
