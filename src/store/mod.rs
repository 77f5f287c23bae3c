//! Хранилище сигналинга: документ сессии + две коллекции кандидатов

pub mod memory;

pub use memory::MemoryStore;

use crate::codec::SessionCode;
use crate::error::{Error, Result};
use crate::peer::types::{CandidateRecord, IceCandidate, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Документ сессии. `offer` пишет только хост, `answer` только ученик.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDoc {
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SessionDoc {
    /// Сливает патч в документ, соблюдая порядок offer → answer и однократную запись
    pub fn apply(&mut self, patch: SessionPatch) -> Result<()> {
        if patch.offer.is_some() && self.offer.is_some() {
            return Err(Error::InvalidDescription("offer already written".into()));
        }
        if patch.answer.is_some() {
            if self.offer.is_none() && patch.offer.is_none() {
                return Err(Error::InvalidDescription(
                    "answer cannot be written before offer".into(),
                ));
            }
            if self.answer.is_some() {
                return Err(Error::InvalidDescription("answer already written".into()));
            }
        }

        if let Some(offer) = patch.offer {
            self.offer = Some(offer);
        }
        if let Some(answer) = patch.answer {
            self.answer = Some(answer);
        }
        if self.created_at.is_none() {
            self.created_at = patch.created_at;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.offer.is_some() && self.answer.is_some()
    }
}

/// Частичное обновление документа сессии
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            offer: Some(sdp.into()),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            answer: Some(sdp.into()),
            ..Default::default()
        }
    }
}

/// Снимок документа; `None` значит, что сессия удалена
pub type SessionSnapshot = Option<SessionDoc>;

/// Поток уведомлений хранилища. Отписка при `unsubscribe` или drop.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub fn new(
        rx: mpsc::UnboundedReceiver<T>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Следующее уведомление; `None`, если хранилище закрыло поток
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

/// Общее хранилище сигналинга. Ничего не знает о WebRTC.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Сливает поля в документ, создавая его при отсутствии
    async fn put(&self, code: &SessionCode, patch: SessionPatch) -> Result<()>;

    async fn get(&self, code: &SessionCode) -> Result<Option<SessionDoc>>;

    /// Все последующие снимки документа до отписки
    async fn subscribe(&self, code: &SessionCode) -> Result<Subscription<SessionSnapshot>>;

    async fn append_candidate(
        &self,
        code: &SessionCode,
        role: Role,
        candidate: IceCandidate,
    ) -> Result<CandidateRecord>;

    /// Каждая запись ровно один раз, в порядке поступления,
    /// включая уже имеющиеся на момент подписки
    async fn subscribe_candidates(
        &self,
        code: &SessionCode,
        role: Role,
    ) -> Result<Subscription<CandidateRecord>>;

    /// Удаляет документ и обе коллекции одним пакетом
    async fn delete_session(&self, code: &SessionCode) -> Result<()>;
}
