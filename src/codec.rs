//! Короткие коды сессий, которые учитель диктует ученикам

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Длина кода сессии
pub const CODE_LEN: usize = 5;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Нормализованный код сессии (нижний регистр, без пробелов по краям).
/// Уникальность не гарантируется: авторитетна запись в хранилище.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..CODE_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        SessionCode(code)
    }

    /// Приводит пользовательский ввод к виду, в котором код хранится
    pub fn normalize(input: &str) -> Self {
        SessionCode(input.trim().to_lowercase())
    }

    /// Проверяет длину и алфавит, не обращаясь к хранилищу
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == CODE_LEN && self.0.bytes().all(|b| ALPHABET.contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionCode {
    fn from(input: &str) -> Self {
        SessionCode::normalize(input)
    }
}
