use num_cpus;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use serde_json::Value;

use log::{error, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;

use crate::exception::Exception;

/// 框架配置，对应 `config/development.toml`。
///
/// 每个分节都可以省略，缺省值见各 `default_*` 函数。
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    app: AppConfig,
    #[serde(default)]
    security: SecurityConfig,
    #[serde(default)]
    mailer: MailerConfig,
    #[serde(default)]
    users: UsersConfig,
}

/// `[server]`：监听与线程
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub local: bool,
    #[serde(default)]
    pub worker_threads: usize,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// `[app]`：应用级设置
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub production: bool,
    /// 应用挂载的路径前缀，路由前会被剥离
    #[serde(default)]
    pub base_uri: String,
    /// 邮件中链接使用的主机部分，如 `example.com`
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    #[serde(default = "default_templates_path")]
    pub templates_path: String,
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
    /// 应用控制器所在的根命名空间
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub guard: GuardSection,
    #[serde(default)]
    pub hash: HashConfig,
    #[serde(default)]
    pub wsse: WsseConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GuardSection {
    #[serde(default)]
    pub web: WebGuardConfig,
}

/// `[security.guard.web]`：认证页面地址与注册开关
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebGuardConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_logout_url")]
    pub logout_url: String,
    #[serde(default = "default_register_url")]
    pub register_url: String,
    #[serde(default = "default_verify_url")]
    pub verify_url: String,
    #[serde(default = "default_forgot_url")]
    pub forgot_url: String,
    #[serde(default = "default_renew_url")]
    pub renew_url: String,
    /// 登录成功后的默认跳转地址
    #[serde(default = "default_home_url")]
    pub home_url: String,
    #[serde(default = "default_true")]
    pub can_register: bool,
}

/// `[security.hash]`：`bcrypt` 或 `plaintext`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HashConfig {
    #[serde(default = "default_hash_driver")]
    pub driver: String,
    #[serde(default = "default_hash_cost")]
    pub cost: u32,
}

/// `[security.wsse]`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WsseConfig {
    #[serde(default = "default_nonces_path")]
    pub nonces_path: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

/// `[mailer]`：`log` 或 `spool`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MailerConfig {
    #[serde(default = "default_mailer_driver")]
    pub driver: String,
    #[serde(default = "default_mail_from")]
    pub from: String,
    #[serde(default = "default_mail_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub replyto: String,
    #[serde(default = "default_spool_path")]
    pub spool_path: String,
}

/// `[users]`：`array` 使用 `[[users.list]]`，`table` 使用 users 表
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UsersConfig {
    #[serde(default = "default_users_provider")]
    pub provider: String,
    /// users 表的持久化文件，留空时只保存在内存中
    #[serde(default)]
    pub table_file: String,
    #[serde(default)]
    pub list: Vec<UserEntry>,
}

/// `[[users.list]]` 中的一个用户
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    pub id: u64,
    #[serde(default)]
    pub key: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub can_login: bool,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    7878
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_base_url() -> String {
    "localhost:7878".to_string()
}

fn default_cache_path() -> String {
    "cache".to_string()
}

fn default_templates_path() -> String {
    "resources/templates".to_string()
}

fn default_session_capacity() -> usize {
    1024
}

fn default_namespace() -> String {
    "app".to_string()
}

fn default_login_url() -> String {
    "/auth/login".to_string()
}

fn default_logout_url() -> String {
    "/auth/logout".to_string()
}

fn default_register_url() -> String {
    "/auth/register".to_string()
}

fn default_verify_url() -> String {
    "/auth/verify".to_string()
}

fn default_forgot_url() -> String {
    "/auth/forgot".to_string()
}

fn default_renew_url() -> String {
    "/auth/renew".to_string()
}

fn default_home_url() -> String {
    "/".to_string()
}

fn default_hash_driver() -> String {
    "bcrypt".to_string()
}

fn default_hash_cost() -> u32 {
    10
}

fn default_nonces_path() -> String {
    "cache/nonces".to_string()
}

fn default_realm() -> String {
    "webgate".to_string()
}

fn default_mailer_driver() -> String {
    "log".to_string()
}

fn default_mail_from() -> String {
    "noreply@localhost".to_string()
}

fn default_mail_from_name() -> String {
    "webgate".to_string()
}

fn default_spool_path() -> String {
    "cache/mails".to_string()
}

fn default_users_provider() -> String {
    "table".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            local: true,
            worker_threads: 0,
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            production: false,
            base_uri: String::new(),
            base_url: default_base_url(),
            cache_path: default_cache_path(),
            templates_path: default_templates_path(),
            session_capacity: default_session_capacity(),
            namespace: default_namespace(),
        }
    }
}

impl Default for WebGuardConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            logout_url: default_logout_url(),
            register_url: default_register_url(),
            verify_url: default_verify_url(),
            forgot_url: default_forgot_url(),
            renew_url: default_renew_url(),
            home_url: default_home_url(),
            can_register: true,
        }
    }
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            driver: default_hash_driver(),
            cost: default_hash_cost(),
        }
    }
}

impl Default for WsseConfig {
    fn default() -> Self {
        Self {
            nonces_path: default_nonces_path(),
            realm: default_realm(),
        }
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            driver: default_mailer_driver(),
            from: default_mail_from(),
            from_name: default_mail_from_name(),
            replyto: String::new(),
            spool_path: default_spool_path(),
        }
    }
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            provider: default_users_provider(),
            table_file: String::new(),
            list: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件读取配置。文件无法读取时返回错误，内容非法时回退到默认配置。
    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => {
                error!("无法打开配置文件{}：{}", filename, e);
                return Err(Exception::InvalidConfig);
            }
        };
        let mut str_val = String::new();
        if let Err(e) = file.read_to_string(&mut str_val) {
            error!("读取配置文件{}失败：{}", filename, e);
            return Err(Exception::InvalidConfig);
        }
        Ok(Self::parse(&str_val))
    }

    /// 从 TOML 文本构建配置
    pub fn parse(text: &str) -> Self {
        let mut raw_config: Config = match toml::from_str(text) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象，使用默认配置：{}", e);
                Config::new()
            }
        };
        if raw_config.server.worker_threads == 0 {
            raw_config.server.worker_threads = num_cpus::get();
        }
        if raw_config.app.session_capacity == 0 {
            warn!("session_capacity被设置为0，但会话存储不能被禁用，因此该值将被改为1024。");
            raw_config.app.session_capacity = default_session_capacity();
        }
        raw_config.app.base_uri = raw_config.app.base_uri.trim_end_matches('/').to_string();
        raw_config
    }
}

impl Config {
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    pub fn guard(&self) -> &WebGuardConfig {
        &self.security.guard.web
    }

    pub fn hash(&self) -> &HashConfig {
        &self.security.hash
    }

    pub fn wsse(&self) -> &WsseConfig {
        &self.security.wsse
    }

    pub fn mailer(&self) -> &MailerConfig {
        &self.mailer
    }

    pub fn users(&self) -> &UsersConfig {
        &self.users
    }

    pub fn port(&self) -> u16 {
        self.server.port
    }

    pub fn worker_threads(&self) -> usize {
        self.server.worker_threads
    }

    pub fn local(&self) -> bool {
        self.server.local
    }

    pub fn base_uri(&self) -> &str {
        &self.app.base_uri
    }

    pub fn cache_path(&self) -> &str {
        &self.app.cache_path
    }
}
