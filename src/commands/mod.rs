//! Команды для десктопной оболочки (Tauri)

pub mod session_api;

use crate::config::LinkConfig;
use crate::session::SessionController;
use crate::store::SignalingStore;
use std::sync::Arc;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{Emitter, Manager, Runtime};
use tracing::warn;

pub const STATE_EVENT: &str = "classroom-state";
pub const MESSAGE_EVENT: &str = "classroom-message";
pub const SESSION_DELETED_EVENT: &str = "classroom-session-deleted";

/// Плагин с командами сессии; события контроллера уходят во фронтенд
pub fn plugin<R: Runtime>(store: Arc<dyn SignalingStore>, config: LinkConfig) -> TauriPlugin<R> {
    Builder::new("classroom")
        .invoke_handler(tauri::generate_handler![
            session_api::host_session,
            session_api::join_session,
            session_api::leave_session,
            session_api::send_transcript,
            session_api::connection_state,
            session_api::transcript,
        ])
        .setup(move |app, _api| {
            crate::logger::init();
            let controller = SessionController::new(store.clone(), config.clone())?;

            let handle = app.clone();
            controller.on_connection_state_change(move |st| {
                if let Err(e) = handle.emit(STATE_EVENT, st) {
                    warn!("Failed to emit {STATE_EVENT}: {e}");
                }
            });
            let handle = app.clone();
            controller.on_message(move |text| {
                let _ = handle.emit(MESSAGE_EVENT, text);
            });
            let handle = app.clone();
            controller.on_session_deleted(move |code| {
                let _ = handle.emit(SESSION_DELETED_EVENT, code);
            });

            app.manage(controller);
            Ok(())
        })
        .build()
}
