//! Handshake через хранилище сигналинга: offer/answer и trickle ICE

use crate::codec::SessionCode;
use crate::config::{LinkConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::events::{ListenerHandle, Listeners};
use crate::peer::link::PeerLink;
use crate::peer::types::{CandidateRecord, ConnectionState, IceCandidate, Role};
use crate::store::{SessionPatch, SessionSnapshot, SignalingStore, Subscription};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Сколько раз хост перегенерирует код при коллизии
const CODE_ATTEMPTS: usize = 3;

/// События протокола, общие для всех попыток контроллера
#[derive(Clone, Default)]
pub struct ProtocolEvents {
    pub candidate_received: Listeners<CandidateRecord>,
    pub session_deleted: Listeners<SessionCode>,
    pub errors: Listeners<Arc<Error>>,
}

impl ProtocolEvents {
    fn report(&self, err: Error) {
        error!("Signaling error: {err}");
        self.errors.emit(&Arc::new(err));
    }
}

#[derive(Default)]
struct PumpTasks {
    stopped: bool,
    handles: Vec<JoinHandle<()>>,
}

/// Подписки и фоновые задачи одного handshake.
/// Останавливаются ровно один раз: по `stop()` или при закрытии линка.
/// Флаг и список задач меняются только под одной блокировкой.
#[derive(Default)]
struct Pumps {
    tasks: Mutex<PumpTasks>,
}

impl Pumps {
    fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock();
        if tasks.stopped {
            handle.abort();
        } else {
            tasks.handles.push(handle);
        }
    }

    fn is_stopped(&self) -> bool {
        self.tasks.lock().stopped
    }

    /// Снимает все подписки (drop внутри задач); true только при первом вызове
    fn stop(&self) -> bool {
        let handles = {
            let mut tasks = self.tasks.lock();
            if tasks.stopped {
                return false;
            }
            tasks.stopped = true;
            std::mem::take(&mut tasks.handles)
        };
        for task in handles {
            task.abort();
        }
        true
    }
}

/// Один handshake одной роли
pub struct SignalingProtocol {
    role: Role,
    code: SessionCode,
    link: Arc<PeerLink>,
    pumps: Arc<Pumps>,
    _link_closed: ListenerHandle,
}

impl SignalingProtocol {
    /// Хост: offer → документ сессии → ждём answer и кандидатов ученика
    pub async fn host(
        store: Arc<dyn SignalingStore>,
        config: &LinkConfig,
        events: ProtocolEvents,
    ) -> Result<SignalingProtocol> {
        let link = Arc::new(PeerLink::create_as_host(config).await?);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        link.on_local_candidate(move |c| {
            let _ = local_tx.send(c.clone());
        });

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(abort_attempt(&link, e).await),
        };

        let code = match publish_offer(store.as_ref(), &offer).await {
            Ok(code) => code,
            Err(e) => return Err(abort_attempt(&link, e).await),
        };
        info!("Hosting session {code}");

        let subs = async {
            let doc_sub = store.subscribe(&code).await?;
            let cand_sub = store.subscribe_candidates(&code, Role::Joiner).await?;
            Ok::<_, Error>((doc_sub, cand_sub))
        };
        let (doc_sub, cand_sub) = match subs.await {
            Ok(subs) => subs,
            Err(e) => {
                // документ уже записан, хост обязан его убрать
                if let Err(del) = store.delete_session(&code).await {
                    warn!("Failed to roll back session {code}: {del}");
                }
                return Err(abort_attempt(&link, e).await);
            }
        };

        let proto = Self::assemble(Role::Host, code, link);
        proto.spawn_local_pump(store.clone(), local_rx, events.clone());
        proto.spawn_host_doc_pump(store.clone(), doc_sub, config.retry.clone(), events.clone());
        proto.spawn_candidate_pump(store, cand_sub, config.retry.clone(), events);
        Ok(proto)
    }

    /// Ученик: читаем offer, пишем answer, обмениваемся кандидатами
    pub async fn join(
        store: Arc<dyn SignalingStore>,
        config: &LinkConfig,
        input: &str,
        events: ProtocolEvents,
    ) -> Result<SignalingProtocol> {
        let code = SessionCode::normalize(input);
        let doc = store
            .get(&code)
            .await?
            .ok_or_else(|| Error::SessionNotFound(code.to_string()))?;
        let offer = doc
            .offer
            .clone()
            .ok_or_else(|| Error::SessionNotFound(code.to_string()))?;
        if doc.answer.is_some() {
            return Err(Error::InvalidDescription(format!(
                "session {code} already has a joiner"
            )));
        }

        let link = Arc::new(PeerLink::create_as_joiner(config).await?);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        link.on_local_candidate(move |c| {
            let _ = local_tx.send(c.clone());
        });

        // answer пишется последним: если что-то упадёт раньше, документ
        // остаётся свободным для следующей попытки
        let answer = async {
            link.set_remote_offer(&offer).await?;
            let answer = link.create_answer().await?;
            let doc_sub = store.subscribe(&code).await?;
            let cand_sub = store.subscribe_candidates(&code, Role::Host).await?;
            store.put(&code, SessionPatch::answer(answer)).await?;
            Ok::<_, Error>((doc_sub, cand_sub))
        };
        let (doc_sub, cand_sub) = match answer.await {
            Ok(subs) => subs,
            Err(e) => return Err(abort_attempt(&link, e).await),
        };
        info!("Joined session {code}");

        let proto = Self::assemble(Role::Joiner, code, link);
        proto.spawn_local_pump(store.clone(), local_rx, events.clone());
        proto.spawn_joiner_doc_pump(store.clone(), doc_sub, config.retry.clone(), events.clone());
        proto.spawn_candidate_pump(store, cand_sub, config.retry.clone(), events);
        Ok(proto)
    }

    fn assemble(role: Role, code: SessionCode, link: Arc<PeerLink>) -> SignalingProtocol {
        let pumps = Arc::new(Pumps::default());
        let weak_pumps = Arc::downgrade(&pumps);
        let link_closed = link.on_state_change(move |st| {
            if *st == ConnectionState::Closed {
                if let Some(pumps) = weak_pumps.upgrade() {
                    if pumps.stop() {
                        debug!("Link closed, signaling subscriptions released");
                    }
                }
            }
        });

        SignalingProtocol {
            role,
            code,
            link,
            pumps,
            _link_closed: link_closed,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn link(&self) -> &Arc<PeerLink> {
        &self.link
    }

    /// Отписывается от хранилища. Повторный вызов ничего не делает.
    pub fn stop(&self) {
        if self.pumps.stop() {
            debug!("Signaling for {} stopped ({})", self.code, self.role);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.pumps.is_stopped()
    }

    /// Локальные кандидаты уходят в коллекцию своей роли по порядку
    fn spawn_local_pump(
        &self,
        store: Arc<dyn SignalingStore>,
        mut local_rx: mpsc::UnboundedReceiver<IceCandidate>,
        events: ProtocolEvents,
    ) {
        let code = self.code.clone();
        let role = self.role;
        self.pumps.spawn(async move {
            while let Some(candidate) = local_rx.recv().await {
                if let Err(e) = store.append_candidate(&code, role, candidate).await {
                    events.report(e);
                }
            }
        });
    }

    /// Хост ждёт answer. Свой же снимок с одним offer пропускается.
    fn spawn_host_doc_pump(
        &self,
        store: Arc<dyn SignalingStore>,
        mut sub: Subscription<SessionSnapshot>,
        retry: RetryPolicy,
        events: ProtocolEvents,
    ) {
        let code = self.code.clone();
        let link = Arc::downgrade(&self.link);
        let pumps = Arc::downgrade(&self.pumps);
        self.pumps.spawn(async move {
            loop {
                match sub.recv().await {
                    Some(Some(doc)) => {
                        let Some(answer) = doc.answer else { continue };
                        let Some(link) = link.upgrade() else { return };
                        apply_answer(&link, &answer, &events).await;
                    }
                    Some(None) => {
                        debug!("Session {code} deleted");
                        events.session_deleted.emit(&code);
                        return;
                    }
                    None => {
                        let resub = resubscribe(&retry, &pumps, &events, "session", || {
                            store.subscribe(&code)
                        })
                        .await;
                        let Some(next) = resub else { return };
                        sub = next;
                        // answer мог прийти, пока подписки не было
                        match store.get(&code).await {
                            Ok(Some(doc)) => {
                                if let (Some(answer), Some(link)) = (doc.answer, link.upgrade()) {
                                    apply_answer(&link, &answer, &events).await;
                                }
                            }
                            Ok(None) => {
                                events.session_deleted.emit(&code);
                                return;
                            }
                            Err(e) => events.report(e),
                        }
                    }
                }
            }
        });
    }

    /// Ученику документ нужен только чтобы заметить удаление сессии
    fn spawn_joiner_doc_pump(
        &self,
        store: Arc<dyn SignalingStore>,
        mut sub: Subscription<SessionSnapshot>,
        retry: RetryPolicy,
        events: ProtocolEvents,
    ) {
        let code = self.code.clone();
        let pumps = Arc::downgrade(&self.pumps);
        self.pumps.spawn(async move {
            loop {
                match sub.recv().await {
                    Some(Some(_)) => {}
                    Some(None) => {
                        info!("Host ended session {code}");
                        events.session_deleted.emit(&code);
                        return;
                    }
                    None => {
                        let resub = resubscribe(&retry, &pumps, &events, "session", || {
                            store.subscribe(&code)
                        })
                        .await;
                        match resub {
                            Some(next) => sub = next,
                            None => {
                                if let Ok(None) = store.get(&code).await {
                                    events.session_deleted.emit(&code);
                                }
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Кандидаты другой стороны → PeerLink. После переподписки коллекция
    /// приходит заново; уже виденные `seq` пропускаются.
    fn spawn_candidate_pump(
        &self,
        store: Arc<dyn SignalingStore>,
        mut sub: Subscription<CandidateRecord>,
        retry: RetryPolicy,
        events: ProtocolEvents,
    ) {
        let code = self.code.clone();
        let remote = self.role.remote();
        let link = Arc::downgrade(&self.link);
        let pumps = Arc::downgrade(&self.pumps);
        self.pumps.spawn(async move {
            let mut last_seq: Option<u64> = None;
            loop {
                match sub.recv().await {
                    Some(record) => {
                        if last_seq.is_some_and(|seen| record.seq <= seen) {
                            continue;
                        }
                        last_seq = Some(record.seq);
                        events.candidate_received.emit(&record);
                        let Some(link) = link.upgrade() else { return };
                        if let Err(e) = link.add_remote_candidate(record.candidate).await {
                            events.report(e);
                        }
                    }
                    None => {
                        let resub = resubscribe(&retry, &pumps, &events, "candidates", || {
                            store.subscribe_candidates(&code, remote)
                        })
                        .await;
                        let Some(next) = resub else { return };
                        sub = next;
                    }
                }
            }
        });
    }
}

impl Drop for SignalingProtocol {
    fn drop(&mut self) {
        // документ не удаляем: это делает только leave() хоста
        self.pumps.stop();
    }
}

/// Пишет offer под свежим кодом; при коллизии кода берёт новый
async fn publish_offer(store: &dyn SignalingStore, offer: &str) -> Result<SessionCode> {
    let mut last_err = None;
    for _ in 0..CODE_ATTEMPTS {
        let code = SessionCode::generate();
        match store.put(&code, SessionPatch::offer(offer)).await {
            Ok(()) => return Ok(code),
            Err(Error::InvalidDescription(reason)) => {
                warn!("Session code {code} already taken ({reason}), regenerating");
                last_err = Some(Error::InvalidDescription(reason));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::StoreUnavailable("no session code available".into())))
}

/// Применяет answer, если remote description ещё нет.
/// Ошибка описания для этого линка фатальна.
async fn apply_answer(link: &PeerLink, answer: &str, events: &ProtocolEvents) {
    if link.has_remote_description().await {
        return;
    }
    info!("Answer arrived, applying");
    if let Err(e) = link.set_remote_answer(answer).await {
        let fatal = matches!(e, Error::InvalidDescription(_));
        events.report(e);
        if fatal {
            if let Err(e) = link.close().await {
                debug!("Closing link after bad answer: {e}");
            }
        }
    }
}

/// Закрывает линк неудавшейся попытки и возвращает исходную ошибку
async fn abort_attempt(link: &PeerLink, err: Error) -> Error {
    warn!("Handshake attempt failed: {err}");
    if let Err(e) = link.close().await {
        debug!("Closing failed link: {e}");
    }
    err
}

/// Повторная подписка после обрыва потока, с ограниченным числом попыток
async fn resubscribe<T, F, Fut>(
    retry: &RetryPolicy,
    pumps: &Weak<Pumps>,
    events: &ProtocolEvents,
    what: &str,
    subscribe: F,
) -> Option<Subscription<T>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Subscription<T>>>,
{
    let mut attempt = 0;
    loop {
        let alive = pumps.upgrade().is_some_and(|p| !p.is_stopped());
        if !alive {
            return None;
        }
        if !retry.should_retry(attempt) {
            events.report(Error::StoreUnavailable(format!(
                "{what} subscription lost after {attempt} attempts"
            )));
            return None;
        }

        let delay = retry.backoff(attempt);
        warn!(
            "{what} subscription dropped, retrying in {:?} (attempt {})",
            delay,
            attempt + 1
        );
        tokio::time::sleep(delay).await;

        match subscribe().await {
            Ok(sub) => {
                info!("{what} subscription restored");
                return Some(sub);
            }
            Err(Error::SessionNotFound(code)) => {
                debug!("Session {code} is gone, not resubscribing");
                return None;
            }
            Err(e) => warn!("Resubscribe failed: {e}"),
        }
        attempt += 1;
    }
}
