use crate::peer::types::IceCandidate;
use tracing::{debug, info};
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};
use webrtc::peer_connection::RTCPeerConnection;

#[cfg(debug_assertions)]
const DEFAULT_FILTER: &str = "classroom_link_lib=debug,webrtc=warn";

#[cfg(not(debug_assertions))]
const DEFAULT_FILTER: &str = "warn";

/// Логирование с временными метками. Повторный вызов ничего не делает.
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
