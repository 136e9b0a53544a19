use std::collections::HashMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use super::table::UserTable;
use crate::config::UserEntry;

/// 已认证（或待认证）的用户。
///
/// 提供者每次查询都会构造新的实例，`attributes` 保存 `name` 之类的扩展属性。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub key: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub can_login: bool,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl User {
    /// 公共用户，用于无需认证的控制器
    pub fn public() -> Self {
        Self {
            id: 0,
            key: "public".to_string(),
            username: "public".to_string(),
            password: None,
            can_login: true,
            attributes: HashMap::new(),
        }
    }

    pub fn can_login(&self) -> bool {
        self.can_login
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    /// 去掉密码，得到可以放进会话的快照
    pub fn without_password(mut self) -> Self {
        self.password = None;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: &str, value: Value) {
        self.attributes.insert(name.to_string(), value);
    }
}

/// 用户数据来源
pub trait UserProvider: Send + Sync {
    fn get_by_id(&self, id: u64) -> Option<User>;
    fn get_by_key(&self, key: &str) -> Option<User>;
    fn get_by_username(&self, username: &str) -> Option<User>;
    /// 是否支持注册、修改密码等写操作
    fn writeable(&self) -> bool;
}

/// 来自配置文件 `[[users.list]]` 的只读用户列表
pub struct UserArrayProvider {
    users: Vec<UserEntry>,
}

impl UserArrayProvider {
    pub fn new(users: Vec<UserEntry>) -> Self {
        Self { users }
    }

    fn build(entry: &UserEntry) -> User {
        User {
            id: entry.id,
            key: if entry.key.is_empty() {
                entry.id.to_string()
            } else {
                entry.key.clone()
            },
            username: entry.username.clone(),
            password: Some(entry.password.clone()),
            can_login: entry.can_login,
            attributes: entry.attributes.clone(),
        }
    }
}

impl UserProvider for UserArrayProvider {
    fn get_by_id(&self, id: u64) -> Option<User> {
        self.users.iter().find(|u| u.id == id).map(Self::build)
    }

    fn get_by_key(&self, key: &str) -> Option<User> {
        self.users
            .iter()
            .map(Self::build)
            .find(|u| u.key == key)
    }

    fn get_by_username(&self, username: &str) -> Option<User> {
        self.users
            .iter()
            .find(|u| u.username == username)
            .map(Self::build)
    }

    fn writeable(&self) -> bool {
        false
    }
}

/// 基于 users 表的用户来源，以邮箱作为用户名和 key
pub struct UserTableProvider {
    table: Arc<dyn UserTable>,
}

impl UserTableProvider {
    pub fn new(table: Arc<dyn UserTable>) -> Self {
        Self { table }
    }

    fn fetch(&self, column: &str, value: &str) -> Option<User> {
        let row = self.table.find_by(column, value)?;
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), Value::from(row.name.clone()));
        Some(User {
            id: row.id,
            key: row.email.clone(),
            username: row.email,
            password: row.password,
            can_login: row.can_login,
            attributes,
        })
    }
}

impl UserProvider for UserTableProvider {
    fn get_by_id(&self, id: u64) -> Option<User> {
        self.fetch("id", &id.to_string())
    }

    fn get_by_key(&self, key: &str) -> Option<User> {
        self.fetch("email", key)
    }

    fn get_by_username(&self, username: &str) -> Option<User> {
        self.fetch("email", username)
    }

    fn writeable(&self) -> bool {
        true
    }
}
