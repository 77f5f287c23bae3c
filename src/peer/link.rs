//! PeerLink: одно WebRTC соединение и не больше одного data channel

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::events::{ListenerHandle, Listeners};
use crate::peer::connection::{hook_peer, new_peer};
use crate::peer::data_channel::attach_dc;
use crate::peer::ice::{analyze_candidates, apply_candidate, apply_pending_candidates, Admission, PendingCandidates};
use crate::peer::state::{LinkSignal, LinkState};
use crate::peer::types::{ConnectionState, IceCandidate, Role};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// События соединения; обрабатываются строго по одному
pub(crate) enum LinkEvent {
    Signal(LinkSignal),
    LocalCandidate(IceCandidate),
    Channel(Arc<RTCDataChannel>),
    Message(String),
    /// Состояние уже применено, осталось оповестить слушателей
    Notify(ConnectionState),
}

/// Этап handshake; offer всегда раньше answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fresh,
    OfferCreated,
    OfferApplied,
    AnswerCreated,
    AnswerApplied,
}

struct LinkInner {
    role: Role,
    config: LinkConfig,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<LinkState>,
    state_tx: watch::Sender<ConnectionState>,
    stage: tokio::sync::Mutex<Stage>,
    remote: tokio::sync::Mutex<PendingCandidates>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    local_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    state_listeners: Listeners<ConnectionState>,
    candidate_listeners: Listeners<IceCandidate>,
    message_listeners: Listeners<String>,
}

/// Одна сторона прямого соединения. Принадлежит ровно одному контроллеру.
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    /// Хост: сам открывает data channel для транскрипта
    pub async fn create_as_host(config: &LinkConfig) -> Result<PeerLink> {
        let link = Self::create(Role::Host, config).await?;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = link
            .inner
            .pc
            .create_data_channel(&config.channel_label, Some(init))
            .await
            .map_err(Error::transport)?;
        attach_dc(&dc, link.inner.events.clone());
        Ok(link)
    }

    /// Ученик: принимает первый data channel, предложенный хостом
    pub async fn create_as_joiner(config: &LinkConfig) -> Result<PeerLink> {
        let link = Self::create(Role::Joiner, config).await?;

        let events = link.inner.events.clone();
        let accepted = Arc::new(AtomicBool::new(false));
        link.inner.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            if accepted.swap(true, Ordering::SeqCst) {
                warn!("Ignoring extra data channel '{}'", dc.label());
            } else {
                attach_dc(&dc, events.clone());
            }
            Box::pin(async {})
        }));
        Ok(link)
    }

    async fn create(role: Role, config: &LinkConfig) -> Result<PeerLink> {
        let pc = new_peer(config).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        hook_peer(&pc, role, events_tx.clone());

        let inner = Arc::new(LinkInner {
            role,
            config: config.clone(),
            pc,
            events: events_tx,
            state: Mutex::new(LinkState::new()),
            state_tx,
            stage: tokio::sync::Mutex::new(Stage::Fresh),
            remote: tokio::sync::Mutex::new(PendingCandidates::new()),
            channel: Mutex::new(None),
            local_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            state_listeners: Listeners::new(),
            candidate_listeners: Listeners::new(),
            message_listeners: Listeners::new(),
        });

        tokio::spawn(drive(Arc::downgrade(&inner), events_rx));
        info!("PeerLink created as {role}");
        Ok(PeerLink { inner })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().current()
    }

    /// Реактивное состояние для UI
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.inner.channel.lock().clone()
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.inner.pc
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.inner.local_candidates.lock().clone()
    }

    pub async fn has_remote_description(&self) -> bool {
        self.inner.remote.lock().await.is_remote_set()
    }

    pub fn on_state_change(
        &self,
        cb: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.state_listeners.subscribe(cb)
    }

    /// Колбэк на каждый собранный локальный кандидат; уже собранные
    /// кандидаты передаются сразу при подписке
    pub fn on_local_candidate(
        &self,
        cb: impl Fn(&IceCandidate) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let gathered = self.inner.local_candidates.lock();
        for c in gathered.iter() {
            cb(c);
        }
        self.inner.candidate_listeners.subscribe(cb)
    }

    pub fn on_message(&self, cb: impl Fn(&String) + Send + Sync + 'static) -> ListenerHandle {
        self.inner.message_listeners.subscribe(cb)
    }

    /// Хост: создаёт offer и ставит его локальным описанием
    pub async fn create_offer(&self) -> Result<String> {
        let mut stage = self.inner.stage.lock().await;
        if self.inner.role != Role::Host || *stage != Stage::Fresh {
            return Err(self.out_of_order("create_offer", *stage));
        }

        let offer = self.inner.pc.create_offer(None).await.map_err(Error::description)?;
        self.inner
            .pc
            .set_local_description(offer.clone())
            .await
            .map_err(Error::description)?;
        *stage = Stage::OfferCreated;
        self.handshake_started();

        Ok(self.local_sdp().await.unwrap_or(offer.sdp))
    }

    /// Ученик: применяет offer хоста
    pub async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let mut stage = self.inner.stage.lock().await;
        if self.inner.role != Role::Joiner || *stage != Stage::Fresh {
            return Err(self.out_of_order("set_remote_offer", *stage));
        }

        let desc = RTCSessionDescription::offer(sdp.to_string()).map_err(Error::description)?;
        self.apply_remote(desc).await?;
        *stage = Stage::OfferApplied;
        self.handshake_started();
        Ok(())
    }

    /// Ученик: создаёт answer после применения offer
    pub async fn create_answer(&self) -> Result<String> {
        let mut stage = self.inner.stage.lock().await;
        if self.inner.role != Role::Joiner || *stage != Stage::OfferApplied {
            return Err(self.out_of_order("create_answer", *stage));
        }

        let answer = self.inner.pc.create_answer(None).await.map_err(Error::description)?;
        self.inner
            .pc
            .set_local_description(answer.clone())
            .await
            .map_err(Error::description)?;
        *stage = Stage::AnswerCreated;

        Ok(self.local_sdp().await.unwrap_or(answer.sdp))
    }

    /// Хост: применяет answer ученика
    pub async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let mut stage = self.inner.stage.lock().await;
        if self.inner.role != Role::Host || *stage != Stage::OfferCreated {
            return Err(self.out_of_order("set_remote_answer", *stage));
        }

        let desc = RTCSessionDescription::answer(sdp.to_string()).map_err(Error::description)?;
        self.apply_remote(desc).await?;
        *stage = Stage::AnswerApplied;
        Ok(())
    }

    /// Применяет удалённый кандидат или ставит его в очередь, если
    /// remote description ещё нет. Повторы молча пропускаются.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            debug!("Link closed, dropping remote candidate");
            return Ok(());
        }

        let mut remote = self.inner.remote.lock().await;
        match remote.admit(&candidate) {
            Admission::Apply => apply_candidate(&self.inner.pc, candidate).await,
            Admission::Queued => {
                debug!(
                    "Remote description not set yet, queuing candidate ({} pending)",
                    remote.pending()
                );
                Ok(())
            }
            Admission::Duplicate => {
                debug!("Duplicate remote candidate ignored: {}", candidate.candidate);
                Ok(())
            }
        }
    }

    /// Текст по каналу; канал должен быть открыт
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let dc = self.data_channel().ok_or(Error::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }
        dc.send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(Error::transport)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Идемпотентно закрывает канал и соединение; `closed` приходит один раз
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing PeerLink ({})", self.inner.role);

        self.signal_now(LinkSignal::Closed);
        self.inner.remote.lock().await.clear();

        let dc = self.inner.channel.lock().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                warn!("Failed to close data channel: {e}");
            }
        }
        self.inner.pc.close().await.map_err(Error::transport)
    }

    async fn apply_remote(&self, desc: RTCSessionDescription) -> Result<()> {
        // блокировка держится до конца сброса очереди, чтобы новые
        // кандидаты не обогнали отложенные
        let mut remote = self.inner.remote.lock().await;
        self.inner
            .pc
            .set_remote_description(desc)
            .await
            .map_err(Error::description)?;
        let queued = remote.mark_remote_set();
        apply_pending_candidates(&self.inner.pc, queued).await;
        Ok(())
    }

    async fn local_sdp(&self) -> Option<String> {
        self.inner.pc.local_description().await.map(|d| d.sdp)
    }

    /// Применяет сигнал сразу, а слушателей оповещает через очередь
    fn signal_now(&self, signal: LinkSignal) {
        let changed = self.inner.state.lock().apply(signal);
        if let Some(state) = changed {
            let _ = self.inner.events.send(LinkEvent::Notify(state));
        }
    }

    fn handshake_started(&self) {
        self.signal_now(LinkSignal::HandshakeStarted);

        if let Some(limit) = self.inner.config.connect_timeout() {
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let _ = events.send(LinkEvent::Signal(LinkSignal::TimedOut));
            });
        }
    }

    fn out_of_order(&self, op: &str, stage: Stage) -> Error {
        let err = Error::InvalidDescription(format!(
            "{op} called by {} at stage {stage:?}",
            self.inner.role
        ));
        error!("{err}");
        err
    }
}

/// Единственная задача, которая меняет состояние и зовёт слушателей линка
async fn drive(weak: Weak<LinkInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        match event {
            LinkEvent::Signal(signal) => {
                if signal == LinkSignal::TimedOut {
                    warn!("PeerLink ({}) did not connect in time", inner.role);
                }
                let changed = inner.state.lock().apply(signal);
                if let Some(state) = changed {
                    publish(&inner, state);
                }
            }
            LinkEvent::Notify(state) => publish(&inner, state),
            LinkEvent::LocalCandidate(candidate) => {
                let mut gathered = inner.local_candidates.lock();
                gathered.push(candidate.clone());
                inner.candidate_listeners.emit(&candidate);
            }
            LinkEvent::Channel(dc) => {
                if inner.closed.load(Ordering::SeqCst) {
                    let _ = dc.close().await;
                } else {
                    *inner.channel.lock() = Some(dc);
                }
            }
            LinkEvent::Message(text) => inner.message_listeners.emit(&text),
        }
    }
    debug!("PeerLink event loop finished");
}

fn publish(inner: &LinkInner, state: ConnectionState) {
    info!("PeerLink ({}) state -> {:?}", inner.role, state);
    inner.state_tx.send_replace(state);

    match state {
        ConnectionState::Connected => {
            analyze_candidates(&inner.local_candidates.lock());
        }
        ConnectionState::Failed | ConnectionState::Disconnected => {
            let err = Error::TransportFailed(format!("{} link is {:?}", inner.role, state));
            warn!("{err}");
            analyze_candidates(&inner.local_candidates.lock());
        }
        _ => {}
    }
    inner.state_listeners.emit(&state);
}
