// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Метка data channel для трансляции транскрипта
pub const DEFAULT_CHANNEL_LABEL: &str = "transcript";

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: &str, url: &str) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

/// Ограниченная политика повторов с экспоненциальной задержкой
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Задержка перед попыткой `attempt` (с нуля), с джиттером до 25%
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = (self.initial_backoff_ms as f64) * self.multiplier.powi(attempt as i32);
        let base = base.min(self.max_backoff_ms as f64);
        let jitter = base * rand::rng().random_range(0.0..=0.25);
        Duration::from_millis((base + jitter).min(self.max_backoff_ms as f64) as u64)
    }
}

/// Настройки PeerLink и протокола
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LinkConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// Собирать loopback кандидаты (одна машина, тесты)
    pub include_loopback: bool,
    /// Без таймаута по умолчанию
    pub connect_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
    pub channel_label: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            include_loopback: false,
            connect_timeout_ms: None,
            retry: RetryPolicy::default(),
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
        }
    }
}

impl LinkConfig {
    /// Конфиг для соединений внутри одной машины
    pub fn local() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: true,
            ..Default::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "server {} has an empty url",
                    server.id
                )));
            }

            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        if self.channel_label.is_empty() {
            return Err(Error::InvalidConfig("channel label cannot be empty".into()));
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(username: Option<&str>) -> ServerConfig {
        ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: username.map(Into::into),
            credential: username.map(|_| "secret".into()),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.channel_label, "transcript");
        assert!(config.connect_timeout().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_turn_requires_credentials() {
        let mut config = LinkConfig::default();
        config.ice_servers.push(turn(None));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.ice_servers.pop();
        config.ice_servers.push(turn(Some("classroom")));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut config = LinkConfig::local();
        config.ice_servers.push(ServerConfig::stun("blank", ""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = LinkConfig::from_json(r#"{"include_loopback": true, "retry": {"max_attempts": 2}}"#)
            .unwrap();
        assert!(config.include_loopback);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 250);
        assert_eq!(config.ice_servers, default_ice_servers());
    }

    #[test]
    fn test_add_ice_url_scheme() {
        assert_eq!(add_ice_url_scheme(&turn(Some("u"))), "turn:relay.example.org:3478");
        let stun = ServerConfig::stun("s", "stun.example.org:19302");
        assert_eq!(add_ice_url_scheme(&stun), "stun:stun.example.org:19302");
        let explicit = ServerConfig::stun("s", "stun:stun.example.org");
        assert_eq!(add_ice_url_scheme(&explicit), "stun:stun.example.org");
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy::default();
        let first = policy.backoff(0);
        assert!(first >= Duration::from_millis(250));
        assert!(first <= Duration::from_millis(313));
        assert!(policy.backoff(30) <= Duration::from_millis(5000));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }
}
