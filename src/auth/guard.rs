//! 基于会话的 Web 认证守卫
//!
//! users 表中的状态：
//!
//! ```text
//! 未注册 --register--> 待验证(token, can_login=false) --verify--> 已激活(can_login=true, token="")
//! 已激活 --start_forgot_password--> 待重置(token) --renew_password--> 已激活(新密码, token="")
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Value};
use url::form_urlencoded;

use super::{
    table::{TableError, UserFields, UserTable},
    User, UserProvider,
};
use crate::{
    config::WebGuardConfig,
    crypto::{random_token, HashManager},
    exception::AuthenticateException,
    mailer::{MailError, MailService},
    session::Session,
    util::is_valid_email,
};

/// 会话中保存当前用户的键
pub const SESSION_USER_KEY: &str = "_user";

/// 注册时写入的占位名称
pub const PENDING_NAME: &str = "» new «";

#[derive(Debug, Clone, PartialEq)]
pub enum GuardError {
    /// 输入不合法（邮箱格式、空字段）
    Validation(String),
    /// 凭据错误
    Authenticate(AuthenticateException),
    /// 邮箱已对应一个激活的账户
    AlreadyRegistered,
    /// 令牌无效或已被使用
    InvalidToken(String),
    /// users 表不可写或写入失败
    Storage(String),
    /// 邮件发送失败
    Mail(String),
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Validation(m) => write!(f, "{}", m),
            GuardError::Authenticate(e) => write!(f, "{}", e),
            GuardError::AlreadyRegistered => write!(f, "This email address is already registered."),
            GuardError::InvalidToken(m) => write!(f, "{}", m),
            GuardError::Storage(m) => write!(f, "{}", m),
            GuardError::Mail(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for GuardError {}

impl From<TableError> for GuardError {
    fn from(e: TableError) -> Self {
        GuardError::Storage(e.to_string())
    }
}

impl From<MailError> for GuardError {
    fn from(e: MailError) -> Self {
        GuardError::Mail(e.to_string())
    }
}

pub struct WebGuard {
    users: Arc<dyn UserProvider>,
    table: Option<Arc<dyn UserTable>>,
    hasher: Arc<HashManager>,
    mail: MailService,
    config: WebGuardConfig,
    base_url: String,
}

impl WebGuard {
    /// `table` 为 `None` 时只支持登录与登出
    pub fn new(
        users: Arc<dyn UserProvider>,
        table: Option<Arc<dyn UserTable>>,
        hasher: Arc<HashManager>,
        mail: MailService,
        config: WebGuardConfig,
        base_url: &str,
    ) -> Self {
        Self {
            users,
            table,
            hasher,
            mail,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /* ==== 登录状态 ==== */

    /// 校验凭据，成功后把去掉密码的用户快照写入会话。失败时会话保持不变。
    pub fn login(&self, session: &mut Session, username: &str, password: &str) -> Result<User, GuardError> {
        let denied = || {
            GuardError::Authenticate(AuthenticateException::new(
                "Access denied, please check your credentials.",
            ))
        };
        let user = self.users.get_by_username(username).ok_or_else(denied)?;
        if !self.hasher.check(password, user.password()) || !user.can_login() {
            warn!("登录失败：{}", username);
            return Err(denied());
        }

        let user = user.without_password();
        let snapshot = serde_json::to_value(&user).map_err(|e| GuardError::Storage(e.to_string()))?;
        session.set(SESSION_USER_KEY, snapshot);
        info!("用户{}已登录", user.username);
        Ok(user)
    }

    pub fn logout(&self, session: &mut Session) -> bool {
        session.remove(SESSION_USER_KEY);
        true
    }

    pub fn is_logged_in(&self, session: &Session) -> bool {
        session.has(SESSION_USER_KEY)
    }

    pub fn current_user(&self, session: &Session) -> Option<User> {
        session
            .get(SESSION_USER_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /* ==== 注册 ==== */

    /// 为邮箱创建（或重置）待验证账户并发送确认邮件。
    ///
    /// 尚未验证的邮箱可以重复注册，每次都会生成新令牌。
    pub fn register(&self, email: &str) -> Result<(), GuardError> {
        if !is_valid_email(email) {
            return Err(GuardError::Validation(
                "You have to provide an email address to register.".to_string(),
            ));
        }
        let table = self.table()?;
        if table.is_account_active(email) {
            return Err(GuardError::AlreadyRegistered);
        }

        let token = random_token();
        table.save(
            UserFields {
                name: Some(PENDING_NAME.to_string()),
                email: Some(email.to_string()),
                token: Some(token.clone()),
                ..Default::default()
            },
            table.find_id("email", email),
        )?;

        let confirm_url = format!("//{}{}", self.base_url, self.verify_url(&token));
        self.mail
            .send_template(email, "auth/confirm-email", &json!({ "confirmurl": confirm_url }))?;
        info!("已为{}创建待验证账户", email);
        Ok(())
    }

    /// 令牌对应的用户 id，空令牌永远不匹配
    pub fn user_id_from_token(&self, token: &str) -> Option<u64> {
        if token.is_empty() {
            return None;
        }
        self.table.as_ref()?.find_id("token", token)
    }

    /// 完成注册：先解析令牌，任何校验失败都不会修改数据
    pub fn verify(&self, token: &str, name: &str, password: &str) -> Result<u64, GuardError> {
        let table = self.table()?;
        let id = self.user_id_from_token(token).ok_or_else(|| {
            GuardError::InvalidToken("Verification failed : please renew your registration.".to_string())
        })?;
        if name.trim().is_empty() {
            return Err(GuardError::Validation("User name can't be empty.".to_string()));
        }
        if password.trim().is_empty() {
            return Err(GuardError::Validation("User password can't be empty.".to_string()));
        }

        let hash = self.hasher.hash(password).map_err(|e| GuardError::Storage(e.to_string()))?;
        table.save(
            UserFields {
                name: Some(name.trim().to_string()),
                password: Some(hash),
                token: Some(String::new()),
                can_login: Some(true),
                verified_at: Some(Utc::now()),
                ..Default::default()
            },
            Some(id),
        )?;
        info!("用户{}已完成验证", id);
        Ok(id)
    }

    /* ==== 找回密码 ==== */

    /// 为激活的账户生成重置令牌并发信；未知邮箱静默成功
    pub fn start_forgot_password(&self, email: &str) -> Result<(), GuardError> {
        if !is_valid_email(email) {
            return Err(GuardError::Validation(
                "You have to provide an email address to renew your password.".to_string(),
            ));
        }
        let table = self.table()?;
        if !table.is_account_active(email) {
            return Ok(());
        }

        let token = random_token();
        table.save(
            UserFields {
                token: Some(token.clone()),
                ..Default::default()
            },
            table.find_id("email", email),
        )?;

        let renew_url = format!("//{}{}", self.base_url, self.renew_url(&token));
        self.mail
            .send_template(email, "auth/renew-password", &json!({ "renewurl": renew_url }))?;
        Ok(())
    }

    /// 用令牌重置密码，成功后令牌失效并发送确认邮件
    pub fn renew_password(&self, token: &str, password: &str) -> Result<u64, GuardError> {
        let table = self.table()?;
        let id = self.user_id_from_token(token).ok_or_else(|| {
            GuardError::InvalidToken("Password renewal failed : user not found.".to_string())
        })?;
        if password.trim().is_empty() {
            return Err(GuardError::Validation("User password can't be empty.".to_string()));
        }

        let hash = self.hasher.hash(password).map_err(|e| GuardError::Storage(e.to_string()))?;
        table.save(
            UserFields {
                password: Some(hash),
                token: Some(String::new()),
                can_login: Some(true),
                ..Default::default()
            },
            Some(id),
        )?;

        if let Some(email) = table.find_val("email", id) {
            let login_url = format!("//{}{}", self.base_url, self.login_url(""));
            self.mail
                .send_template(&email, "auth/password-updated", &json!({ "loginurl": login_url }))?;
        }
        info!("用户{}已重置密码", id);
        Ok(id)
    }

    /* ==== 能力 ==== */

    pub fn can_register(&self) -> bool {
        self.config.can_register && self.can_update_users()
    }

    pub fn can_update_users(&self) -> bool {
        self.users.writeable() && self.table.is_some()
    }

    fn table(&self) -> Result<&Arc<dyn UserTable>, GuardError> {
        match &self.table {
            Some(t) if self.users.writeable() => Ok(t),
            _ => Err(GuardError::Storage("Users are not writeable.".to_string())),
        }
    }

    /* ==== 地址 ==== */

    pub fn login_url(&self, redirect_to: &str) -> String {
        if redirect_to.is_empty() {
            self.config.login_url.clone()
        } else {
            format!("{}?{}", self.config.login_url, encode_pair("redirect_to", redirect_to))
        }
    }

    pub fn logout_url(&self) -> String {
        self.config.logout_url.clone()
    }

    pub fn register_url(&self) -> String {
        self.config.register_url.clone()
    }

    pub fn verify_url(&self, token: &str) -> String {
        with_key(&self.config.verify_url, token)
    }

    pub fn forgot_url(&self) -> String {
        self.config.forgot_url.clone()
    }

    pub fn renew_url(&self, token: &str) -> String {
        with_key(&self.config.renew_url, token)
    }

    pub fn home_url(&self) -> String {
        self.config.home_url.clone()
    }

    /// 模板中使用的地址集合
    pub fn urls(&self) -> Value {
        json!({
            "login_url": self.login_url(""),
            "logout_url": self.logout_url(),
            "register_url": self.register_url(),
            "forgot_url": self.forgot_url(),
        })
    }
}

fn encode_pair(key: &str, value: &str) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair(key, value)
        .finish()
}

fn with_key(url: &str, token: &str) -> String {
    if token.is_empty() {
        url.to_string()
    } else {
        format!("{}?{}", url, encode_pair("k", token))
    }
}
