//! Типизированные подписки на события: по одному `Listeners<T>` на категорию

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerMap<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// Список слушателей одной категории событий
pub struct Listeners<T> {
    inner: Arc<Mutex<ListenerMap<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerMap {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, cb: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let id = {
            let mut map = self.inner.lock();
            let id = map.next_id;
            map.next_id += 1;
            map.callbacks.push((id, Arc::new(cb)));
            id
        };

        let weak: Weak<Mutex<ListenerMap<T>>> = Arc::downgrade(&self.inner);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().callbacks.retain(|(cid, _)| *cid != id);
                }
            })),
        }
    }

    /// Вызывает всех слушателей; колбэки выполняются вне блокировки
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }
}

/// Ручка отписки. Если её просто уронить, слушатель остаётся.
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all() {
        let listeners: Listeners<u32> = Listeners::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = total.clone();
            listeners.subscribe(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }
        listeners.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe_removes_only_one() {
        let listeners: Listeners<&'static str> = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = {
            let hits = hits.clone();
            listeners.subscribe(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _h2 = {
            let hits = hits.clone();
            listeners.subscribe(move |_| {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };
        h1.unsubscribe();
        listeners.emit(&"x");
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let listeners: Listeners<()> = Listeners::new();
        let inner = listeners.clone();
        listeners.subscribe(move |_| {
            inner.subscribe(|_| {});
        });
        listeners.emit(&());
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_handle_outlives_listeners() {
        let listeners: Listeners<()> = Listeners::new();
        let handle = listeners.subscribe(|_| {});
        drop(listeners);
        handle.unsubscribe();
    }
}
