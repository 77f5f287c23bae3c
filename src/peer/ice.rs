use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::peer::connection::ice_server;
use crate::peer::types::IceCandidate;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_gatherer_state::RTCIceGathererState,
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Сколько ждём подходящего кандидата при проверке ICE сервера
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Что делать с пришедшим удалённым кандидатом
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Remote description уже есть, применяем сразу
    Apply,
    /// Remote description ещё нет, кандидат ждёт в очереди
    Queued,
    /// Такой кандидат уже был
    Duplicate,
}

/// Кандидаты, полученные до установки remote description.
/// FIFO, сбрасывается целиком при установке описания.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    remote_set: bool,
    queue: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, candidate: &IceCandidate) -> Admission {
        if !self.seen.insert(candidate.clone()) {
            return Admission::Duplicate;
        }
        if self.remote_set {
            Admission::Apply
        } else {
            self.queue.push_back(candidate.clone());
            Admission::Queued
        }
    }

    /// Отмечает, что remote description установлен, и отдаёт очередь по порядку
    pub fn mark_remote_set(&mut self) -> Vec<IceCandidate> {
        self.remote_set = true;
        self.queue.drain(..).collect()
    }

    pub fn is_remote_set(&self) -> bool {
        self.remote_set
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.seen.clear();
    }
}

/// Применяет ICE кандидат от удаленной стороны
pub async fn apply_candidate(pc: &RTCPeerConnection, candidate: IceCandidate) -> Result<()> {
    debug!("Applying remote candidate: {}", candidate.candidate);
    pc.add_ice_candidate(candidate.into())
        .await
        .map_err(|e| Error::TransportFailed(format!("failed to add ICE candidate: {e}")))
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, candidates: Vec<IceCandidate>) {
    if !candidates.is_empty() {
        info!("Flushing {} queued remote candidates", candidates.len());
    }
    for candidate in candidates {
        if let Err(e) = apply_candidate(pc, candidate).await {
            warn!("Failed to apply pending candidate: {e}");
        }
    }
}

/// Счётчики кандидатов по типам
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        match candidate.kind() {
            Some("host") => summary.host += 1,
            Some("srflx") | Some("prflx") => summary.srflx += 1,
            Some("relay") => summary.relay += 1,
            _ => {}
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 && summary.srflx == 0 {
        warn!("No srflx or relay candidates found! Connection through NAT may fail.");
    }
    summary
}

/// Проверяет, что ICE сервер отвечает: для STUN ждём srflx, для TURN relay кандидата
pub async fn check_ice_server_availability(config: &ServerConfig) -> bool {
    let rtc_config = RTCConfiguration {
        ice_servers: vec![ice_server(config)],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => {
            let pc = Arc::new(pc);
            let result = check_via_ice_gathering(&pc, &config.r#type).await;
            let _ = pc.close().await;
            result
        }
        Err(e) => {
            warn!("Failed to create probe peer connection: {e}");
            false
        }
    }
}

async fn check_via_ice_gathering(pc: &Arc<RTCPeerConnection>, server_type: &str) -> bool {
    let expected = if server_type == "turn" { "relay" } else { "srflx" };

    let (gather_tx, mut gather_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = gather_tx.send(state);
        Box::pin(async {})
    }));

    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(init) = c.to_json() {
                let _ = cand_tx.send(IceCandidate::from(init));
            }
        }
        Box::pin(async {})
    }));

    // Data channel нужен, чтобы offer вообще запустил сбор кандидатов
    if let Err(e) = pc.create_data_channel("probe", None).await {
        warn!("Failed to create probe data channel: {e}");
        return false;
    }
    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            warn!("Failed to create probe offer: {e}");
            return false;
        }
    };
    if let Err(e) = pc.set_local_description(offer).await {
        warn!("Failed to set probe local description: {e}");
        return false;
    }

    let wait = async {
        loop {
            tokio::select! {
                Some(c) = cand_rx.recv() => {
                    if c.kind() == Some(expected) {
                        debug!("Probe found {expected} candidate: {}", c.candidate);
                        return true;
                    }
                }
                Some(state) = gather_rx.recv() => {
                    if state == RTCIceGathererState::Complete {
                        // добираем то, что уже пришло
                        while let Ok(c) = cand_rx.try_recv() {
                            if c.kind() == Some(expected) {
                                return true;
                            }
                        }
                        return false;
                    }
                }
                else => return false,
            }
        }
    };

    match timeout(PROBE_TIMEOUT, wait).await {
        Ok(found) => found,
        Err(_) => {
            debug!("Probe timed out waiting for {expected} candidate");
            false
        }
    }
}
