//! WSSE UsernameToken 认证
//!
//! 客户端发送：
//!
//! ```text
//! Authorization: WSSE profile="UsernameToken"
//! X-WSSE: UsernameToken Username="bob", PasswordDigest="...", Nonce="...", Created="2026-01-01T00:00:00Z"
//! ```
//!
//! 摘要为 `base64(sha1(base64_decode(nonce) + created + password))`。
//! 每个 nonce 在 300 秒内只能使用一次，已使用的 nonce 记录在 `nonces_path` 目录中。

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use log::{error, warn};
use regex::Regex;
use sha1::{Digest, Sha1};

use super::{AuthProvider, User, UserProvider};
use crate::crypto::constant_time_eq;
use crate::{exception::AuthenticateException, request::Request, session::Session};

/// 时间戳与 nonce 的有效窗口（秒）
pub const WSSE_LIFETIME: i64 = 300;

lazy_static! {
    static ref WSSE_HEADER: Regex = Regex::new(
        r#"UsernameToken Username="([^"]+)", PasswordDigest="([^"]+)", Nonce="([^"]+)", Created="([^"]+)""#
    )
    .unwrap();
}

struct WsseToken {
    username: String,
    digest: String,
    nonce: String,
    created: String,
}

/// 已使用 nonce 的文件存储，每个 nonce 一个文件，内容为首次出现的 unix 时间
pub struct NonceStore {
    dir: PathBuf,
}

impl NonceStore {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "Nonces directory \"{}\" not found. Please review application configuration or create it.",
                    dir.display()
                ),
            ));
        }
        Ok(Self { dir })
    }

    // 文件名取 nonce 的 SHA-1，长度固定
    fn path(&self, nonce: &str) -> PathBuf {
        self.dir.join(hex::encode(Sha1::digest(nonce.as_bytes())))
    }

    /// 记录 nonce；窗口内已出现过则返回 `false`。
    ///
    /// 以 create-new 方式创建文件，同一个 nonce 的并发请求只有一个能成功。
    pub fn record(&self, nonce: &str, now: i64) -> io::Result<bool> {
        let path = self.path(nonce);
        match create_new(&path, now) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let seen: i64 = fs::read_to_string(&path)?.trim().parse().unwrap_or(now);
        if seen + WSSE_LIFETIME > now {
            return Ok(false);
        }

        // 过期记录：删除后重新抢占
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match create_new(&path, now) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn create_new(path: &Path, now: i64) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(now.to_string().as_bytes())
}

pub struct WsseAuthProvider {
    users: Arc<dyn UserProvider>,
    nonces: NonceStore,
    realm: String,
}

impl WsseAuthProvider {
    pub fn new(users: Arc<dyn UserProvider>, nonces_path: &str, realm: &str) -> io::Result<Self> {
        Ok(Self {
            users,
            nonces: NonceStore::new(nonces_path)?,
            realm: realm.to_string(),
        })
    }

    /// 以指定的当前时间认证，便于测试过期逻辑
    pub fn authenticate_at(
        &self,
        request: &Request,
        now: DateTime<Utc>,
    ) -> Result<User, AuthenticateException> {
        self.validate_request(request)
            .and_then(|token| self.validate_token(&token, now))
            .map_err(|reason| {
                AuthenticateException::new(format!("The WSSE authentication failed : {}", reason))
                    .with_header(
                        "WWW-Authenticate",
                        format!("WSSE realm=\"{}\", profile=\"UsernameToken\"", self.realm),
                    )
            })
    }

    fn validate_request(&self, request: &Request) -> Result<WsseToken, String> {
        let authorization = request
            .header("authorization")
            .ok_or("\"Authorization\" header not found")?;
        if authorization != "WSSE profile=\"UsernameToken\"" {
            return Err("\"Authorization\" header must be 'WSSE profile=\"UsernameToken\"'".to_string());
        }
        let wsse = request
            .header("x-wsse")
            .ok_or("\"X-WSSE\" header not found")?;
        let captures = WSSE_HEADER
            .captures(wsse)
            .ok_or("\"X-WSSE\" syntax error")?;
        Ok(WsseToken {
            username: captures[1].to_string(),
            digest: captures[2].to_string(),
            nonce: captures[3].to_string(),
            created: captures[4].to_string(),
        })
    }

    fn validate_token(&self, token: &WsseToken, now: DateTime<Utc>) -> Result<User, String> {
        let user = self
            .users
            .get_by_username(&token.username)
            .ok_or("unknown user")?;

        let created = parse_created(&token.created).ok_or("invalid \"Created\" timestamp")?;
        if now.timestamp() - created.timestamp() > WSSE_LIFETIME {
            return Err(format!("timestamp too old (+{} s)", WSSE_LIFETIME));
        }

        match self.nonces.record(&token.nonce, now.timestamp()) {
            Ok(true) => {}
            Ok(false) => return Err("nonce already used".to_string()),
            Err(e) => {
                error!("无法记录WSSE nonce：{}", e);
                return Err("nonce storage failure".to_string());
            }
        }

        let expected = raw_digest(&token.nonce, &token.created, user.password());
        let given = Base64::decode_vec(&token.digest).unwrap_or_default();
        if !constant_time_eq(&expected, &given) {
            warn!("WSSE摘要不匹配：{}", token.username);
            return Err("invalid token".to_string());
        }
        Ok(user)
    }
}

impl AuthProvider for WsseAuthProvider {
    fn authenticate(&self, request: &Request, _session: &Session) -> Result<User, AuthenticateException> {
        self.authenticate_at(request, Utc::now())
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

fn parse_created(created: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(created) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(created, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(created, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|t| t.and_utc())
}

/// `base64(sha1(base64_decode(nonce) + created + password))`，非法的 nonce 按空串处理
pub fn password_digest(nonce: &str, created: &str, password: &str) -> String {
    Base64::encode_string(&raw_digest(nonce, created, password))
}

fn raw_digest(nonce: &str, created: &str, password: &str) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(Base64::decode_vec(nonce).unwrap_or_default());
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}
