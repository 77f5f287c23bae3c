//! SessionController: публичная точка входа для UI и трансляции транскрипта

use crate::codec::SessionCode;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::events::{ListenerHandle, Listeners};
use crate::peer::link::PeerLink;
use crate::peer::types::{CandidateRecord, ConnectionState, Role};
use crate::signaling::{ProtocolEvents, SignalingProtocol};
use crate::store::SignalingStore;
use crate::transcript::Transcript;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use webrtc::data_channel::RTCDataChannel;

/// Текущая сессия контроллера
struct Active {
    protocol: Arc<SignalingProtocol>,
    /// После leave/closed события старого линка больше не принимаются
    finished: Arc<AtomicBool>,
}

#[derive(Clone)]
struct Shared {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_listeners: Listeners<ConnectionState>,
    message_listeners: Listeners<String>,
    transcript: Arc<Mutex<Transcript>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.state_listeners.emit(&state);
        }
    }
}

/// Одна сессия учителя или ученика: create → use → leave().
/// Хост удаляет документ сессии только в `leave()`; если процесс
/// завершится без него, документ останется в хранилище.
pub struct SessionController {
    store: Arc<dyn SignalingStore>,
    config: LinkConfig,
    active: Mutex<Option<Active>>,
    /// Код сессии хоста, чьё удаление не удалось; следующий `leave()` повторит
    pending_delete: Mutex<Option<SessionCode>>,
    shared: Shared,
    events: ProtocolEvents,
}

impl SessionController {
    pub fn new(store: Arc<dyn SignalingStore>, config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            store,
            config,
            active: Mutex::new(None),
            pending_delete: Mutex::new(None),
            shared: Shared {
                state_tx: Arc::new(state_tx),
                state_listeners: Listeners::new(),
                message_listeners: Listeners::new(),
                transcript: Arc::new(Mutex::new(Transcript::new())),
            },
            events: ProtocolEvents::default(),
        })
    }

    /// Учитель: создаёт сессию и возвращает код для учеников
    pub async fn host_session(&self) -> Result<SessionCode> {
        self.leave_previous().await;

        let protocol = SignalingProtocol::host(self.store.clone(), &self.config, self.events.clone())
            .await?;
        let code = protocol.code().clone();
        self.activate(protocol);
        Ok(code)
    }

    /// Ученик: подключается по коду, который продиктовал учитель
    pub async fn join_session(&self, code: &str) -> Result<()> {
        self.leave_previous().await;

        let protocol =
            SignalingProtocol::join(self.store.clone(), &self.config, code, self.events.clone())
                .await
                .inspect_err(|e| warn!("join_session({code}) failed: {e}"))?;
        self.shared.transcript.lock().clear();
        self.activate(protocol);
        Ok(())
    }

    /// Закрывает соединение; хост также удаляет документ сессии и
    /// обе коллекции кандидатов. Ученик ничего не удаляет.
    /// Если удаление не удалось, повторный `leave()` попробует снова.
    pub async fn leave(&self) -> Result<()> {
        let active = self.active.lock().take();
        let mut closed = Ok(());
        if let Some(active) = active {
            let protocol = active.protocol;
            info!("Leaving session {} as {}", protocol.code(), protocol.role());

            protocol.stop();
            closed = protocol.link().close().await;
            active.finished.store(true, Ordering::SeqCst);
            self.shared.set_state(ConnectionState::Closed);

            if protocol.role() == Role::Host {
                *self.pending_delete.lock() = Some(protocol.code().clone());
            }
        }

        let pending = self.pending_delete.lock().clone();
        if let Some(code) = pending {
            if let Err(e) = self.store.delete_session(&code).await {
                warn!("Deleting session {code} failed, will retry on next leave: {e}");
                return Err(e);
            }
            self.pending_delete.lock().take();
            info!("Session {code} deleted");
        }
        closed
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn session_code(&self) -> Option<SessionCode> {
        self.with_link(|p| p.code().clone())
    }

    pub fn role(&self) -> Option<Role> {
        self.with_link(|p| p.role())
    }

    /// Появляется, как только PeerLink отдал канал (у хоста сразу, у ученика
    /// после прихода канала от хоста)
    pub fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.with_link(|p| p.link().data_channel()).flatten()
    }

    /// Текст транскрипта ученика
    pub fn transcript(&self) -> String {
        self.shared.transcript.lock().as_str().to_string()
    }

    /// Отправляет фрагмент транскрипта по открытому каналу
    pub async fn send_transcript(&self, text: &str) -> Result<()> {
        let link = self
            .with_link(|p| p.link().clone())
            .ok_or(Error::ChannelNotOpen)?;
        link.send_text(text).await
    }

    pub fn on_connection_state_change(
        &self,
        cb: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.state_listeners.subscribe(cb)
    }

    pub fn on_candidate_received(
        &self,
        cb: impl Fn(&CandidateRecord) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.candidate_received.subscribe(cb)
    }

    pub fn on_session_deleted(
        &self,
        cb: impl Fn(&SessionCode) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.session_deleted.subscribe(cb)
    }

    pub fn on_message(&self, cb: impl Fn(&String) + Send + Sync + 'static) -> ListenerHandle {
        self.shared.message_listeners.subscribe(cb)
    }

    pub fn on_error(&self, cb: impl Fn(&Arc<Error>) + Send + Sync + 'static) -> ListenerHandle {
        self.events.errors.subscribe(cb)
    }

    fn with_link<T>(&self, f: impl FnOnce(&SignalingProtocol) -> T) -> Option<T> {
        self.active.lock().as_ref().map(|a| f(&a.protocol))
    }

    async fn leave_previous(&self) {
        let busy = self.active.lock().is_some() || self.pending_delete.lock().is_some();
        if busy {
            info!("Starting a new session, leaving the current one first");
            if let Err(e) = self.leave().await {
                warn!("Leaving previous session failed: {e}");
            }
        }
    }

    fn activate(&self, protocol: SignalingProtocol) {
        let finished = Arc::new(AtomicBool::new(false));
        let role = protocol.role();
        let link: &PeerLink = protocol.link();

        {
            let shared = self.shared.clone();
            let finished = finished.clone();
            let errors = self.events.errors.clone();
            link.on_state_change(move |st| {
                if finished.load(Ordering::SeqCst) {
                    return;
                }
                match st {
                    ConnectionState::Closed => finished.store(true, Ordering::SeqCst),
                    ConnectionState::Failed => errors.emit(&Arc::new(Error::TransportFailed(
                        format!("{role} link failed"),
                    ))),
                    _ => {}
                }
                shared.set_state(*st);
            });
        }
        {
            let shared = self.shared.clone();
            let finished = finished.clone();
            link.on_message(move |text| {
                if finished.load(Ordering::SeqCst) {
                    return;
                }
                if role == Role::Joiner {
                    shared.transcript.lock().push(text);
                }
                shared.message_listeners.emit(text);
            });
        }

        // Connecting мог примениться до подписки
        let current = link.state();
        if current != ConnectionState::Disconnected {
            self.shared.set_state(current);
        }

        *self.active.lock() = Some(Active {
            protocol: Arc::new(protocol),
            finished,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn controller(store: &MemoryStore) -> SessionController {
        SessionController::new(Arc::new(store.clone()), LinkConfig::local()).unwrap()
    }

    #[tokio::test]
    async fn test_join_missing_session() {
        let store = MemoryStore::new();
        let joiner = controller(&store);

        let err = joiner.join_session("ZZZZZ").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(ref code) if code == "zzzzz"));
        assert_eq!(joiner.connection_state(), ConnectionState::Disconnected);
        assert_eq!(store.session_count(), 0);
        assert!(joiner.data_channel().is_none());
    }

    #[tokio::test]
    async fn test_leave_without_session_is_noop() {
        let store = MemoryStore::new();
        let c = controller(&store);
        c.leave().await.unwrap();
        assert_eq!(c.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_host_writes_offer_and_leave_deletes() {
        let store = MemoryStore::new();
        let host = controller(&store);

        let code = host.host_session().await.unwrap();
        assert!(code.is_well_formed());
        assert_eq!(host.role(), Some(Role::Host));
        assert_eq!(host.connection_state(), ConnectionState::Connecting);

        let doc = store.get(&code).await.unwrap().unwrap();
        assert!(doc.offer.is_some());
        assert!(doc.answer.is_none());
        assert!(doc.created_at.is_some());

        host.leave().await.unwrap();
        assert!(store.get(&code).await.unwrap().is_none());
        assert!(store.candidates(&code, Role::Host).is_empty());
        assert_eq!(host.connection_state(), ConnectionState::Closed);
        assert_eq!(store.subscriber_count(&code), 0);
    }

    #[tokio::test]
    async fn test_host_fails_cleanly_when_store_down() {
        let store = MemoryStore::new();
        store.set_available(false);
        let host = controller(&store);

        let err = host.host_session().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(host.session_code().is_none());
        assert_eq!(host.connection_state(), ConnectionState::Disconnected);

        store.set_available(true);
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_retries_failed_delete() {
        let store = MemoryStore::new();
        let host = controller(&store);
        let code = host.host_session().await.unwrap();

        store.set_available(false);
        assert!(matches!(host.leave().await, Err(Error::StoreUnavailable(_))));
        assert_eq!(host.connection_state(), ConnectionState::Closed);
        assert!(host.session_code().is_none());

        store.set_available(true);
        assert!(store.get(&code).await.unwrap().is_some());
        host.leave().await.unwrap();
        assert!(store.get(&code).await.unwrap().is_none());
        assert!(store.candidates(&code, Role::Host).is_empty());
        // удалять больше нечего
        host.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_link() {
        let store = MemoryStore::new();
        let config = LinkConfig {
            connect_timeout_ms: Some(200),
            ..LinkConfig::local()
        };
        let host = SessionController::new(Arc::new(store.clone()), config).unwrap();
        let (err_tx, mut err_rx) = tokio::sync::mpsc::unbounded_channel();
        let _errors = host.on_error(move |e| {
            let _ = err_tx.send(e.clone());
        });

        // ученик так и не приходит
        host.host_session().await.unwrap();
        let mut state = host.state_watch();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(host.connection_state(), ConnectionState::Failed);

        let err = tokio::time::timeout(std::time::Duration::from_secs(1), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(*err, Error::TransportFailed(_)));

        host.leave().await.unwrap();
        assert_eq!(host.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let store = MemoryStore::new();
        let c = controller(&store);
        assert!(matches!(
            c.send_transcript("hello").await,
            Err(Error::ChannelNotOpen)
        ));
    }
}
