//! 密码散列驱动与随机令牌
//!
//! `HashManager` 根据 `[security.hash]` 选择具体的驱动。`plaintext` 驱动只用于开发环境，
//! 它把密码原样保存，`check` 退化为字符串比较。

use std::fmt;

use log::{error, warn};
use rand::{rngs::OsRng, RngCore};

use crate::config::HashConfig;

/// 散列失败
#[derive(Debug, Clone, PartialEq)]
pub struct HashError(String);

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password hashing failed: {}", self.0)
    }
}

impl std::error::Error for HashError {}

/// 散列值的元信息
#[derive(Debug, Clone, PartialEq)]
pub struct HashInfo {
    pub algo: String,
    pub cost: Option<u32>,
}

pub trait HashDriver: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, HashError>;
    fn check(&self, password: &str, hash: &str) -> bool;
    fn info(&self, hash: &str) -> HashInfo;
}

pub struct BcryptDriver {
    cost: u32,
}

impl BcryptDriver {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl HashDriver for BcryptDriver {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        bcrypt::hash(password, self.cost).map_err(|e| HashError(e.to_string()))
    }

    fn check(&self, password: &str, hash: &str) -> bool {
        // 非 bcrypt 格式的散列值视为不匹配
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    fn info(&self, hash: &str) -> HashInfo {
        // $2b$10$...
        let parts: Vec<&str> = hash.split('$').collect();
        if parts.len() >= 4 && parts[1].starts_with('2') {
            HashInfo {
                algo: "bcrypt".to_string(),
                cost: parts[2].parse().ok(),
            }
        } else {
            HashInfo {
                algo: "unknown".to_string(),
                cost: None,
            }
        }
    }
}

pub struct PlaintextDriver;

impl HashDriver for PlaintextDriver {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        Ok(password.to_string())
    }

    fn check(&self, password: &str, hash: &str) -> bool {
        constant_time_eq(password.as_bytes(), hash.as_bytes())
    }

    fn info(&self, _hash: &str) -> HashInfo {
        HashInfo {
            algo: "plaintext".to_string(),
            cost: None,
        }
    }
}

/// 当前配置所选的散列驱动
pub struct HashManager {
    name: String,
    driver: Box<dyn HashDriver>,
}

impl HashManager {
    pub fn from_config(config: &HashConfig) -> Self {
        match config.driver.as_str() {
            "plaintext" => {
                warn!("密码散列驱动为plaintext，密码将以明文保存，请勿在生产环境中使用");
                Self::plaintext()
            }
            "bcrypt" => Self::bcrypt(config.cost),
            other => {
                error!("未知的密码散列驱动{}，使用bcrypt", other);
                Self::bcrypt(config.cost)
            }
        }
    }

    pub fn bcrypt(cost: u32) -> Self {
        Self {
            name: "bcrypt".to_string(),
            driver: Box::new(BcryptDriver::new(cost)),
        }
    }

    pub fn plaintext() -> Self {
        Self {
            name: "plaintext".to_string(),
            driver: Box::new(PlaintextDriver),
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self, password: &str) -> Result<String, HashError> {
        self.driver.hash(password)
    }

    pub fn check(&self, password: &str, hash: &str) -> bool {
        self.driver.check(password, hash)
    }

    pub fn info(&self, hash: &str) -> HashInfo {
        self.driver.info(hash)
    }
}

/// 生成 128 位的随机令牌，以 32 个十六进制字符表示
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// 比较耗时只取决于长度，不取决于第一个不同的字节
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
