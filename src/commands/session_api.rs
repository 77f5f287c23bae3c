use crate::peer::types::ConnectionState;
use crate::session::SessionController;
use tauri::{command, State};

/// Учитель: новая сессия, возвращает код
#[command]
pub async fn host_session(controller: State<'_, SessionController>) -> Result<String, String> {
    controller
        .host_session()
        .await
        .map(|code| code.to_string())
        .map_err(|e| e.to_string())
}

/// Ученик: подключение по коду
#[command]
pub async fn join_session(
    controller: State<'_, SessionController>,
    code: String,
) -> Result<(), String> {
    controller.join_session(&code).await.map_err(|e| e.to_string())
}

#[command]
pub async fn leave_session(controller: State<'_, SessionController>) -> Result<(), String> {
    controller.leave().await.map_err(|e| e.to_string())
}

/// текст по каналу
#[command]
pub async fn send_transcript(
    controller: State<'_, SessionController>,
    text: String,
) -> Result<bool, String> {
    match controller.send_transcript(&text).await {
        Ok(()) => Ok(true),
        Err(crate::error::Error::ChannelNotOpen) => Ok(false),
        Err(e) => Err(e.to_string()),
    }
}

#[command]
pub fn connection_state(controller: State<'_, SessionController>) -> ConnectionState {
    controller.connection_state()
}

#[command]
pub fn transcript(controller: State<'_, SessionController>) -> String {
    controller.transcript()
}
