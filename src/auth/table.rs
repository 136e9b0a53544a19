//! users 表
//!
//! 列：`id, name, email, password, token, can_login, created_at, updated_at,
//! verified_at, deleted_at`，其中 `email` 唯一。`MemoryUserTable` 把行保存在内存中，
//! 可选地在每次写入后持久化到一个 JSON 文件。

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{error, info};
use serde_derive::{Deserialize, Serialize};

use crate::util::is_valid_email;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: u64,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub can_login: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// `save` 的字段集合，`None` 表示不修改
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserFields {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub can_login: Option<bool>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl UserFields {
    fn is_empty(&self) -> bool {
        *self == UserFields::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableError {
    /// 没有提供任何字段
    NothingToDo,
    /// 字段值非法
    UnexpectedValue(Vec<String>),
    /// 邮箱已被其他行使用
    Conflict(String),
    /// 要更新的行不存在
    NotFound(u64),
    /// 持久化失败
    Storage(String),
}

impl TableError {
    /// 对应的 HTTP 状态码
    pub fn status(&self) -> u16 {
        match self {
            TableError::NothingToDo | TableError::UnexpectedValue(_) => 400,
            TableError::Conflict(_) => 409,
            TableError::NotFound(_) => 404,
            TableError::Storage(_) => 500,
        }
    }
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::NothingToDo => write!(f, "users : no data provided. Nothing to do."),
            TableError::UnexpectedValue(fields) => write!(
                f,
                "users : unexpected value(s) for field(s) \"{}\".",
                fields.join(", ")
            ),
            TableError::Conflict(email) => write!(f, "users : Email \"{}\" already added.", email),
            TableError::NotFound(id) => write!(f, "users : row {} not found.", id),
            TableError::Storage(e) => write!(f, "users : storage failure ({}).", e),
        }
    }
}

impl std::error::Error for TableError {}

pub trait UserTable: Send + Sync {
    /// 插入（`id` 为 `None`）或更新一行，返回行 id
    fn save(&self, fields: UserFields, id: Option<u64>) -> Result<u64, TableError>;
    /// 按列值查找第一行的 id
    fn find_id(&self, column: &str, value: &str) -> Option<u64>;
    /// 读取某一行某一列的值
    fn find_val(&self, column: &str, id: u64) -> Option<String>;
    /// 邮箱对应的账户是否已完成验证
    fn is_account_active(&self, email: &str) -> bool;
    /// 按列值查找整行
    fn find_by(&self, column: &str, value: &str) -> Option<UserRow>;
}

struct TableState {
    rows: BTreeMap<u64, UserRow>,
    next_id: u64,
}

pub struct MemoryUserTable {
    state: Mutex<TableState>,
    file: Option<PathBuf>,
}

impl Default for MemoryUserTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUserTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                rows: BTreeMap::new(),
                next_id: 1,
            }),
            file: None,
        }
    }

    /// 从 JSON 文件加载，文件不存在时创建空表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let rows: Vec<UserRow> = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                error!("无法解析users表文件{}：{}", path.display(), e);
                TableError::Storage(e.to_string())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(TableError::Storage(e.to_string())),
        };
        let next_id = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        info!("已加载users表{}，共{}行", path.display(), rows.len());
        Ok(Self {
            state: Mutex::new(TableState {
                rows: rows.into_iter().map(|r| (r.id, r)).collect(),
                next_id,
            }),
            file: Some(path),
        })
    }

    pub fn get(&self, id: u64) -> Option<UserRow> {
        self.state.lock().ok()?.rows.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, rows: &BTreeMap<u64, UserRow>) -> Result<(), TableError> {
        let path = match &self.file {
            Some(p) => p,
            None => return Ok(()),
        };
        let list: Vec<&UserRow> = rows.values().collect();
        let text =
            serde_json::to_string_pretty(&list).map_err(|e| TableError::Storage(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| {
                error!("写入users表文件{}失败：{}", path.display(), e);
                TableError::Storage(e.to_string())
            })
    }
}

fn column_value(row: &UserRow, column: &str) -> Option<String> {
    let date = |d: &Option<DateTime<Utc>>| d.map(|d| d.to_rfc3339());
    match column {
        "id" => Some(row.id.to_string()),
        "name" => Some(row.name.clone()),
        "email" => Some(row.email.clone()),
        "password" => row.password.clone(),
        "token" => Some(row.token.clone()),
        "can_login" => Some(if row.can_login { "1" } else { "0" }.to_string()),
        "created_at" => date(&row.created_at),
        "updated_at" => date(&row.updated_at),
        "verified_at" => date(&row.verified_at),
        "deleted_at" => date(&row.deleted_at),
        _ => None,
    }
}

impl UserTable for MemoryUserTable {
    fn save(&self, fields: UserFields, id: Option<u64>) -> Result<u64, TableError> {
        if fields.is_empty() {
            return Err(TableError::NothingToDo);
        }
        if let Some(email) = &fields.email {
            if !is_valid_email(email) {
                return Err(TableError::UnexpectedValue(vec!["email".to_string()]));
            }
        }

        let mut state = self
            .state
            .lock()
            .map_err(|e| TableError::Storage(e.to_string()))?;

        if let Some(email) = &fields.email {
            let taken = state
                .rows
                .values()
                .any(|r| r.email == *email && Some(r.id) != id);
            if taken {
                return Err(TableError::Conflict(email.clone()));
            }
        }

        let now = Utc::now();
        let mut next_id = state.next_id;
        let row = match id {
            Some(row_id) => {
                let mut row = state
                    .rows
                    .get(&row_id)
                    .cloned()
                    .ok_or(TableError::NotFound(row_id))?;
                apply(&mut row, fields);
                row.updated_at = Some(now);
                row
            }
            None => {
                let (name, email) = match (&fields.name, &fields.email) {
                    (Some(n), Some(e)) => (n.clone(), e.clone()),
                    _ => {
                        let mut missing = Vec::new();
                        if fields.name.is_none() {
                            missing.push("name".to_string());
                        }
                        if fields.email.is_none() {
                            missing.push("email".to_string());
                        }
                        return Err(TableError::UnexpectedValue(missing));
                    }
                };
                let row_id = next_id;
                next_id += 1;
                let mut row = UserRow {
                    id: row_id,
                    name,
                    email,
                    password: None,
                    token: String::new(),
                    can_login: false,
                    created_at: Some(now),
                    updated_at: Some(now),
                    verified_at: None,
                    deleted_at: None,
                };
                apply(&mut row, fields);
                row
            }
        };

        // 先落盘，成功后才更新内存中的行
        let row_id = row.id;
        let mut rows = state.rows.clone();
        rows.insert(row_id, row);
        self.persist(&rows)?;
        state.rows = rows;
        state.next_id = next_id;
        Ok(row_id)
    }

    fn find_id(&self, column: &str, value: &str) -> Option<u64> {
        self.find_by(column, value).map(|r| r.id)
    }

    fn find_val(&self, column: &str, id: u64) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.rows.get(&id).and_then(|r| column_value(r, column))
    }

    fn is_account_active(&self, email: &str) -> bool {
        match self.state.lock() {
            Ok(state) => state
                .rows
                .values()
                .any(|r| r.email == email && r.verified_at.is_some()),
            Err(_) => false,
        }
    }

    fn find_by(&self, column: &str, value: &str) -> Option<UserRow> {
        let state = self.state.lock().ok()?;
        state
            .rows
            .values()
            .find(|r| column_value(r, column).as_deref() == Some(value))
            .cloned()
    }
}

fn apply(row: &mut UserRow, fields: UserFields) {
    if let Some(name) = fields.name {
        row.name = name;
    }
    if let Some(email) = fields.email {
        row.email = email;
    }
    if let Some(password) = fields.password {
        row.password = Some(password);
    }
    if let Some(token) = fields.token {
        row.token = token;
    }
    if let Some(can_login) = fields.can_login {
        row.can_login = can_login;
    }
    if let Some(verified_at) = fields.verified_at {
        row.verified_at = Some(verified_at);
    }
}
