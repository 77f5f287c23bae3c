//! Хранилище сигналинга в памяти процесса

use super::{SessionDoc, SessionPatch, SessionSnapshot, SignalingStore, Subscription};
use crate::codec::SessionCode;
use crate::error::{Error, Result};
use crate::peer::types::{CandidateRecord, IceCandidate, Role};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;

type Watchers<T> = Vec<(u64, UnboundedSender<T>)>;

#[derive(Default)]
struct Inner {
    unavailable: bool,
    next_watch_id: u64,
    docs: HashMap<SessionCode, SessionDoc>,
    candidates: HashMap<(SessionCode, Role), Vec<CandidateRecord>>,
    doc_watchers: HashMap<SessionCode, Watchers<SessionSnapshot>>,
    candidate_watchers: HashMap<(SessionCode, Role), Watchers<CandidateRecord>>,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::StoreUnavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn watch_id(&mut self) -> u64 {
        let id = self.next_watch_id;
        self.next_watch_id += 1;
        id
    }
}

fn broadcast<T: Clone>(watchers: &mut Watchers<T>, value: &T) {
    watchers.retain(|(_, tx)| tx.send(value.clone()).is_ok());
}

/// Хранилище в памяти. Клоны разделяют одно состояние, поэтому хост и ученик
/// в одном процессе видят одни и те же документы.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Имитация недоступности: все операции падают с `StoreUnavailable`
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    /// Имитация обрыва соединения: все потоки подписок закрываются
    pub fn drop_subscribers(&self) {
        let mut inner = self.inner.lock();
        inner.doc_watchers.clear();
        inner.candidate_watchers.clear();
    }

    /// Кандидаты роли в порядке поступления
    pub fn candidates(&self, code: &SessionCode, role: Role) -> Vec<CandidateRecord> {
        self.inner
            .lock()
            .candidates
            .get(&(code.clone(), role))
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().docs.len()
    }

    pub fn subscriber_count(&self, code: &SessionCode) -> usize {
        let inner = self.inner.lock();
        let docs = inner.doc_watchers.get(code).map_or(0, Vec::len);
        let cands: usize = [Role::Host, Role::Joiner]
            .iter()
            .map(|role| {
                inner
                    .candidate_watchers
                    .get(&(code.clone(), *role))
                    .map_or(0, Vec::len)
            })
            .sum();
        docs + cands
    }

    fn doc_cancel(&self, code: SessionCode, id: u64) -> impl FnOnce() + Send + Sync + 'static {
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(list) = inner.lock().doc_watchers.get_mut(&code) {
                    list.retain(|(wid, _)| *wid != id);
                }
            }
        }
    }

    fn candidate_cancel(
        &self,
        key: (SessionCode, Role),
        id: u64,
    ) -> impl FnOnce() + Send + Sync + 'static {
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(list) = inner.lock().candidate_watchers.get_mut(&key) {
                    list.retain(|(wid, _)| *wid != id);
                }
            }
        }
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn put(&self, code: &SessionCode, patch: SessionPatch) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        let mut doc = inner.docs.get(code).cloned().unwrap_or_default();
        doc.apply(patch)?;
        inner.docs.insert(code.clone(), doc.clone());
        debug!("store put {code}: offer={} answer={}", doc.offer.is_some(), doc.answer.is_some());

        if let Some(watchers) = inner.doc_watchers.get_mut(code) {
            broadcast(watchers, &Some(doc));
        }
        Ok(())
    }

    async fn get(&self, code: &SessionCode) -> Result<Option<SessionDoc>> {
        let inner = self.inner.lock();
        inner.check_available()?;
        Ok(inner.docs.get(code).cloned())
    }

    async fn subscribe(&self, code: &SessionCode) -> Result<Subscription<SessionSnapshot>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        if !inner.docs.contains_key(code) {
            return Err(Error::SessionNotFound(code.to_string()));
        }

        let id = inner.watch_id();
        let (tx, rx) = mpsc::unbounded_channel();
        inner.doc_watchers.entry(code.clone()).or_default().push((id, tx));
        drop(inner);

        Ok(Subscription::new(rx, self.doc_cancel(code.clone(), id)))
    }

    async fn append_candidate(
        &self,
        code: &SessionCode,
        role: Role,
        candidate: IceCandidate,
    ) -> Result<CandidateRecord> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        if !inner.docs.contains_key(code) {
            return Err(Error::SessionNotFound(code.to_string()));
        }

        let key = (code.clone(), role);
        let list = inner.candidates.entry(key.clone()).or_default();
        let record = CandidateRecord {
            seq: list.len() as u64,
            role,
            candidate,
        };
        list.push(record.clone());

        if let Some(watchers) = inner.candidate_watchers.get_mut(&key) {
            broadcast(watchers, &record);
        }
        Ok(record)
    }

    async fn subscribe_candidates(
        &self,
        code: &SessionCode,
        role: Role,
    ) -> Result<Subscription<CandidateRecord>> {
        let mut inner = self.inner.lock();
        inner.check_available()?;
        if !inner.docs.contains_key(code) {
            return Err(Error::SessionNotFound(code.to_string()));
        }

        let key = (code.clone(), role);
        let (tx, rx) = mpsc::unbounded_channel();
        // Уже имеющиеся записи отдаём под той же блокировкой, что и регистрацию
        for record in inner.candidates.get(&key).into_iter().flatten() {
            let _ = tx.send(record.clone());
        }
        let id = inner.watch_id();
        inner.candidate_watchers.entry(key.clone()).or_default().push((id, tx));
        drop(inner);

        Ok(Subscription::new(rx, self.candidate_cancel(key, id)))
    }

    async fn delete_session(&self, code: &SessionCode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        inner.docs.remove(code);
        for role in [Role::Host, Role::Joiner] {
            let key = (code.clone(), role);
            inner.candidates.remove(&key);
            inner.candidate_watchers.remove(&key);
        }
        if let Some(mut watchers) = inner.doc_watchers.remove(code) {
            broadcast(&mut watchers, &None);
        }
        debug!("store deleted session {code}");
        Ok(())
    }
}
