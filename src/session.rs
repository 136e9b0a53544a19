//! 访客会话
//!
//! 每个访客通过 `WEBGATESESSID` Cookie 对应一个 `Session`。会话保存在进程内的
//! `SessionStore` 中，容量由 `app.session_capacity` 决定，超出时淘汰最久未访问的访客。
//! 请求开始时内核从存储中取出会话，请求结束后再放回。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use log::{debug, error};
use lru::LruCache;
use serde_json::Value;

use crate::crypto::{constant_time_eq, random_token};

/// 一次性提示消息
#[derive(Debug, Clone, PartialEq)]
pub struct Flash {
    pub message: String,
    pub data: Value,
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    started: bool,
    is_new: bool,
    data: HashMap<String, Value>,
    flashes: HashMap<String, Flash>,
    tokens: HashMap<String, String>,
}

impl Session {
    fn with_id(id: String, is_new: bool) -> Self {
        Self {
            id,
            started: false,
            is_new,
            data: HashMap::new(),
            flashes: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    /// 新访客的空会话
    pub fn new() -> Self {
        Self::with_id(random_token(), true)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 会话是否由本次请求创建（需要下发 Cookie）
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.start();
        self.data.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// 写入一条提示消息，下一次 `take_flash` 读取后即被清除
    pub fn flash(&mut self, key: &str, message: &str, data: Value, kind: &str) {
        self.start();
        self.flashes.insert(
            key.to_string(),
            Flash {
                message: message.to_string(),
                data,
                kind: kind.to_string(),
            },
        );
    }

    pub fn take_flash(&mut self, key: &str) -> Option<Flash> {
        self.flashes.remove(key)
    }

    /// 获取 `id` 对应的表单令牌，不存在时生成一个
    pub fn get_token(&mut self, id: &str) -> String {
        self.start();
        self.tokens
            .entry(id.to_string())
            .or_insert_with(random_token)
            .clone()
    }

    pub fn is_valid_token(&self, id: &str, value: &str) -> bool {
        match self.tokens.get(id) {
            Some(token) => !value.is_empty() && constant_time_eq(token.as_bytes(), value.as_bytes()),
            None => false,
        }
    }

    pub fn remove_token(&mut self, id: &str) {
        self.tokens.remove(id);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// 进程内的会话存储
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<LruCache<String, Session>>>,
}

impl SessionStore {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// 读取 Cookie 对应会话的副本；未知或缺失的 Cookie 得到一个新会话
    ///
    /// 会话留在存储中，同一 Cookie 的并发请求看到的是同一个会话。
    pub fn load(&self, cookie: Option<&str>) -> Session {
        let id = match cookie {
            Some(id) if !id.is_empty() => id,
            _ => return Session::new(),
        };
        let mut sessions = match self.sessions.lock() {
            Ok(s) => s,
            Err(e) => {
                error!("会话存储的锁已中毒：{}", e);
                return Session::new();
            }
        };
        match sessions.get(id).cloned() {
            Some(mut session) => {
                session.is_new = false;
                session
            }
            None => {
                debug!("未知的会话{}，创建新会话", id);
                Session::new()
            }
        }
    }

    /// 放回会话；从未开始的会话不保存
    pub fn save(&self, session: Session) {
        if !session.is_started() {
            return;
        }
        match self.sessions.lock() {
            Ok(mut sessions) => {
                sessions.put(session.id.clone(), session);
            }
            Err(e) => {
                error!("会话存储的锁已中毒：{}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
