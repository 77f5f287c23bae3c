use crate::peer::types::ConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Сигналы, из которых складывается `ConnectionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    /// Начат handshake (создан offer или применён чужой offer)
    HandshakeStarted,
    Transport(RTCPeerConnectionState),
    ChannelOpen,
    ChannelClosed,
    /// Не дождались `connected` за отведённое время
    TimedOut,
    /// Явный `close()`
    Closed,
}

/// Автомат состояний PeerLink.
///
/// `connected` требует обоих подсигналов: транспорт connected и data channel
/// открыт. После failed/disconnected/closed этот PeerLink больше не оживает,
/// кроме финального перехода в `closed` при явном закрытии.
#[derive(Debug, Default)]
pub struct LinkState {
    current: ConnectionState,
    transport_connected: bool,
    channel_open: bool,
    ended: bool,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn channel_open(&self) -> bool {
        self.channel_open
    }

    /// Применяет сигнал; возвращает новое состояние, если оно изменилось
    pub fn apply(&mut self, signal: LinkSignal) -> Option<ConnectionState> {
        if signal == LinkSignal::Closed {
            self.ended = true;
            self.channel_open = false;
            self.transport_connected = false;
            return self.set(ConnectionState::Closed);
        }
        if self.ended {
            return None;
        }

        match signal {
            LinkSignal::HandshakeStarted => {
                if self.current == ConnectionState::Disconnected {
                    self.set(ConnectionState::Connecting)
                } else {
                    None
                }
            }
            LinkSignal::Transport(st) => match st {
                RTCPeerConnectionState::Connected => {
                    self.transport_connected = true;
                    self.promote()
                }
                RTCPeerConnectionState::Disconnected => {
                    self.transport_connected = false;
                    self.end(ConnectionState::Disconnected)
                }
                RTCPeerConnectionState::Failed => {
                    self.transport_connected = false;
                    self.end(ConnectionState::Failed)
                }
                RTCPeerConnectionState::Closed => {
                    self.transport_connected = false;
                    self.end(ConnectionState::Closed)
                }
                _ => None,
            },
            LinkSignal::ChannelOpen => {
                self.channel_open = true;
                self.promote()
            }
            LinkSignal::ChannelClosed => {
                self.channel_open = false;
                if self.current == ConnectionState::Connected {
                    self.end(ConnectionState::Disconnected)
                } else {
                    None
                }
            }
            LinkSignal::TimedOut => {
                if self.current == ConnectionState::Connected {
                    None
                } else {
                    self.end(ConnectionState::Failed)
                }
            }
            LinkSignal::Closed => None,
        }
    }

    fn promote(&mut self) -> Option<ConnectionState> {
        if self.transport_connected && self.channel_open {
            self.set(ConnectionState::Connected)
        } else {
            None
        }
    }

    fn end(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        self.ended = true;
        self.set(state)
    }

    fn set(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        if self.current == state {
            return None;
        }
        self.current = state;
        Some(state)
    }
}
