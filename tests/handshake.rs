//! Полный handshake двух контроллеров через общее хранилище на loopback

use classroom_link_lib::{
    logger, ConnectionState, Error, LinkConfig, MemoryStore, RetryPolicy, Role,
    SessionCode, SessionController, SessionDoc, SignalingStore,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

const CONNECT_LIMIT: Duration = Duration::from_secs(30);

fn controller(store: &MemoryStore) -> SessionController {
    SessionController::new(Arc::new(store.clone()), LinkConfig::local()).unwrap()
}

async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
    timeout(CONNECT_LIMIT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
        .unwrap();
}

async fn doc(store: &MemoryStore, code: &SessionCode) -> Option<SessionDoc> {
    store.get(code).await.unwrap()
}

/// Слушатели зовутся после обновления watch, поэтому ждём их отдельно
async fn wait_recorded(seen: &Mutex<Vec<ConnectionState>>, want: ConnectionState) {
    timeout(Duration::from_secs(5), async {
        while !seen.lock().contains(&want) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("listener never saw {want:?}"));
}

fn record_states(c: &SessionController) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    // handle не держим: без unsubscribe слушатель живёт вместе с контроллером
    let _ = c.on_connection_state_change(move |st| sink.lock().push(*st));
    seen
}

async fn connected_pair(store: &MemoryStore) -> (SessionController, SessionController, SessionCode) {
    let host = controller(store);
    let joiner = controller(store);

    let code = host.host_session().await.unwrap();
    // ученик вводит код как придётся
    joiner
        .join_session(&format!("  {}  ", code.as_str().to_uppercase()))
        .await
        .unwrap();

    wait_state(&mut host.state_watch(), ConnectionState::Connected).await;
    wait_state(&mut joiner.state_watch(), ConnectionState::Connected).await;
    (host, joiner, code)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_and_joiner_connect() {
    logger::init();
    let store = MemoryStore::new();
    let host = controller(&store);
    let joiner = controller(&store);
    let host_states = record_states(&host);
    let joiner_states = record_states(&joiner);

    let code = host.host_session().await.unwrap();
    assert_eq!(host.connection_state(), ConnectionState::Connecting);
    joiner.join_session(code.as_str()).await.unwrap();
    assert_eq!(joiner.session_code(), Some(code.clone()));
    assert_eq!(joiner.role(), Some(Role::Joiner));

    wait_state(&mut host.state_watch(), ConnectionState::Connected).await;
    wait_state(&mut joiner.state_watch(), ConnectionState::Connected).await;

    wait_recorded(&host_states, ConnectionState::Connected).await;
    wait_recorded(&joiner_states, ConnectionState::Connected).await;
    assert_eq!(
        host_states.lock()[..2],
        [ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(
        joiner_states.lock()[..2],
        [ConnectionState::Connecting, ConnectionState::Connected]
    );

    assert!(doc(&store, &code).await.unwrap().is_complete());
    assert!(!store.candidates(&code, Role::Host).is_empty());
    assert!(joiner.data_channel().is_some());

    joiner.leave().await.unwrap();
    host.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transcript_reaches_joiner_in_order() {
    logger::init();
    let store = MemoryStore::new();
    let (host, joiner, _code) = connected_pair(&store).await;

    let fragments = ["Today we talk ", "about cells. ", "Cells divide."];
    for f in fragments {
        host.send_transcript(f).await.unwrap();
    }

    let expected: String = fragments.concat();
    timeout(Duration::from_secs(10), async {
        while joiner.transcript() != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("transcript did not arrive");
    // у хоста свой транскрипт не копится
    assert!(host.transcript().is_empty());

    joiner.leave().await.unwrap();
    host.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_leave_deletes_session_for_everyone() {
    logger::init();
    let store = MemoryStore::new();
    let (host, joiner, code) = connected_pair(&store).await;

    let (deleted_tx, mut deleted_rx) = tokio::sync::mpsc::unbounded_channel();
    let _deleted = joiner.on_session_deleted(move |c| {
        let _ = deleted_tx.send(c.clone());
    });

    host.leave().await.unwrap();
    assert_eq!(host.connection_state(), ConnectionState::Closed);
    assert!(doc(&store, &code).await.is_none());
    assert!(store.candidates(&code, Role::Host).is_empty());
    assert!(store.candidates(&code, Role::Joiner).is_empty());

    let gone = timeout(Duration::from_secs(5), deleted_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone, code);

    // канал закрылся и у ученика
    let mut rx = joiner.state_watch();
    timeout(CONNECT_LIMIT, rx.wait_for(|s| *s != ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    joiner.leave().await.unwrap();
    assert_eq!(store.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joiner_leave_keeps_session() {
    logger::init();
    let store = MemoryStore::new();
    let (host, joiner, code) = connected_pair(&store).await;

    joiner.leave().await.unwrap();
    assert_eq!(joiner.connection_state(), ConnectionState::Closed);
    assert!(joiner.session_code().is_none());
    assert!(doc(&store, &code).await.is_some());
    assert!(!store.candidates(&code, Role::Host).is_empty());

    host.leave().await.unwrap();
    assert!(doc(&store, &code).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_survives_dropped_subscriptions() {
    logger::init();
    let store = MemoryStore::new();
    let host = controller(&store);
    let joiner = controller(&store);

    let code = host.host_session().await.unwrap();
    // обрыв до прихода answer: хост должен переподписаться и перечитать документ
    store.drop_subscribers();
    joiner.join_session(code.as_str()).await.unwrap();

    wait_state(&mut host.state_watch(), ConnectionState::Connected).await;
    wait_state(&mut joiner.state_watch(), ConnectionState::Connected).await;

    joiner.leave().await.unwrap();
    host.leave().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_resubscribe_is_reported() {
    logger::init();
    let store = MemoryStore::new();
    let config = LinkConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            multiplier: 2.0,
        },
        ..LinkConfig::local()
    };
    let host = SessionController::new(Arc::new(store.clone()), config).unwrap();

    let (err_tx, mut err_rx) = tokio::sync::mpsc::unbounded_channel();
    let _errors = host.on_error(move |e| {
        let _ = err_tx.send(e.clone());
    });

    let code = host.host_session().await.unwrap();
    store.set_available(false);
    store.drop_subscribers();

    let err = timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(*err, Error::StoreUnavailable(_)));

    store.set_available(true);
    host.leave().await.unwrap();
    assert!(doc(&store, &code).await.is_none());
}

#[tokio::test]
async fn second_joiner_is_refused() {
    let store = MemoryStore::new();
    let host = controller(&store);
    let first = controller(&store);
    let second = controller(&store);

    let code = host.host_session().await.unwrap();
    first.join_session(code.as_str()).await.unwrap();
    let err = second.join_session(code.as_str()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidDescription(_)));
    assert_eq!(second.connection_state(), ConnectionState::Disconnected);

    first.leave().await.unwrap();
    host.leave().await.unwrap();
}

#[tokio::test]
async fn unknown_code_is_not_found() {
    let store = MemoryStore::new();
    let joiner = controller(&store);
    let err = joiner.join_session("ZZZZZ").await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
    assert_eq!(store.session_count(), 0);
}
