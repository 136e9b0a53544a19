//! 认证：用户来源、认证提供者与 Web 守卫

pub mod basic;
pub mod guard;
pub mod table;
pub mod user;
pub mod wsse;

use log::error;
use url::form_urlencoded;

pub use basic::BasicAuthProvider;
pub use guard::{GuardError, WebGuard, SESSION_USER_KEY};
pub use table::{MemoryUserTable, TableError, UserFields, UserRow, UserTable};
pub use user::{User, UserArrayProvider, UserProvider, UserTableProvider};
pub use wsse::WsseAuthProvider;

use crate::{exception::AuthenticateException, request::Request, session::Session};

/// 认证提供者：从请求（和会话）中得到当前用户
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, request: &Request, session: &Session) -> Result<User, AuthenticateException>;
    fn realm(&self) -> &str;
}

/// 不做认证，总是返回公共用户
pub struct PublicAuthProvider;

impl AuthProvider for PublicAuthProvider {
    fn authenticate(&self, _request: &Request, _session: &Session) -> Result<User, AuthenticateException> {
        Ok(User::public())
    }

    fn realm(&self) -> &str {
        "public"
    }
}

/// 读取会话中的登录用户，未登录时重定向到登录页
pub struct SessionAuthProvider {
    login_url: String,
}

impl SessionAuthProvider {
    pub fn new(login_url: &str) -> Self {
        Self {
            login_url: login_url.to_string(),
        }
    }
}

impl AuthProvider for SessionAuthProvider {
    fn authenticate(&self, request: &Request, session: &Session) -> Result<User, AuthenticateException> {
        let user = session
            .get(SESSION_USER_KEY)
            .and_then(|v| serde_json::from_value::<User>(v.clone()).ok());
        match user {
            Some(user) => Ok(user),
            None => {
                let redirect_to = form_urlencoded::Serializer::new(String::new())
                    .append_pair("redirect_to", request.path())
                    .finish();
                Err(AuthenticateException::new("Authentication required.")
                    .with_status(302)
                    .with_header("Location", format!("{}?{}", self.login_url, redirect_to)))
            }
        }
    }

    fn realm(&self) -> &str {
        "session"
    }
}

/// 控制器声明使用的认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Public,
    Session,
    Basic,
    Wsse,
}

/// 启动时构造好的全部认证提供者
pub struct AuthProviders {
    public: PublicAuthProvider,
    session: SessionAuthProvider,
    basic: BasicAuthProvider,
    wsse: Option<WsseAuthProvider>,
}

impl AuthProviders {
    pub fn new(
        session: SessionAuthProvider,
        basic: BasicAuthProvider,
        wsse: Option<WsseAuthProvider>,
    ) -> Self {
        Self {
            public: PublicAuthProvider,
            session,
            basic,
            wsse,
        }
    }

    /// nonce 目录不可用时 WSSE 提供者为空，使用它的控制器一律返回 500
    pub fn authenticate(
        &self,
        kind: ProviderKind,
        request: &Request,
        session: &Session,
    ) -> Result<User, AuthenticateException> {
        match kind {
            ProviderKind::Public => self.public.authenticate(request, session),
            ProviderKind::Session => self.session.authenticate(request, session),
            ProviderKind::Basic => self.basic.authenticate(request, session),
            ProviderKind::Wsse => match &self.wsse {
                Some(wsse) => wsse.authenticate(request, session),
                None => {
                    error!("WSSE认证未启用：nonce目录不可用");
                    Err(AuthenticateException::new("WSSE authentication is not available.")
                        .with_status(500))
                }
            },
        }
    }
}
