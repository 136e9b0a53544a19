//! HTTP 内核：装配服务、持有路由表、分发请求并渲染错误

use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::{
    auth::{
        AuthProviders, BasicAuthProvider, MemoryUserTable, SessionAuthProvider, UserArrayProvider,
        UserProvider, UserTable, UserTableProvider, WebGuard, WsseAuthProvider,
    },
    config::Config,
    controller::{self, gate::AuthController, Context, ControllerFactory},
    crypto::HashManager,
    exception::{Exception, HttpException},
    mailer::MailService,
    param::{BUILTIN_NAMESPACE, SESSION_COOKIE},
    request::Request,
    response::Response,
    router::Router,
    session::{Session, SessionStore},
    template::TemplateEngine,
};

/// 控制器可以使用的全部服务，启动时构造一次
pub struct Services {
    pub config: Config,
    pub providers: AuthProviders,
    pub guard: WebGuard,
    pub templates: Arc<TemplateEngine>,
    pub hasher: Arc<HashManager>,
    pub users: Arc<dyn UserProvider>,
    pub table: Option<Arc<dyn UserTable>>,
}

impl Services {
    pub fn from_config(config: Config) -> Result<Self, Exception> {
        let hasher = Arc::new(HashManager::from_config(config.hash()));

        let table: Option<Arc<dyn UserTable>> = match config.users().provider.as_str() {
            "table" => {
                let file = &config.users().table_file;
                let table = if file.is_empty() {
                    MemoryUserTable::new()
                } else {
                    MemoryUserTable::open(file).map_err(|e| {
                        error!("无法打开users表：{}", e);
                        Exception::InvalidConfig
                    })?
                };
                Some(Arc::new(table) as Arc<dyn UserTable>)
            }
            "array" => None,
            other => {
                error!("未知的用户来源：{}", other);
                return Err(Exception::InvalidConfig);
            }
        };
        let users: Arc<dyn UserProvider> = match &table {
            Some(t) => Arc::new(UserTableProvider::new(t.clone())),
            None => Arc::new(UserArrayProvider::new(config.users().list.clone())),
        };

        let mut templates = TemplateEngine::new();
        let templates_path = &config.app().templates_path;
        if Path::new(templates_path).is_dir() {
            templates.add_src_path(templates_path)?;
        } else {
            debug!("模板目录{}不存在，仅使用内置模板", templates_path);
        }
        templates.share("appname", Value::from(config.mailer().from_name.clone()));
        let templates = Arc::new(templates);

        let mail = MailService::new(
            MailService::driver_from_config(config.mailer()),
            templates.clone(),
            config.mailer(),
        );
        let guard = WebGuard::new(
            users.clone(),
            table.clone(),
            hasher.clone(),
            mail,
            config.guard().clone(),
            &config.app().base_url,
        );

        let wsse = match WsseAuthProvider::new(
            users.clone(),
            &config.wsse().nonces_path,
            &config.wsse().realm,
        ) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("WSSE认证不可用：{}", e);
                None
            }
        };
        let providers = AuthProviders::new(
            SessionAuthProvider::new(&config.guard().login_url),
            BasicAuthProvider::new(users.clone(), hasher.clone(), &config.wsse().realm),
            wsse,
        );

        Ok(Self {
            config,
            providers,
            guard,
            templates,
            hasher,
            users,
            table,
        })
    }
}

pub struct Kernel {
    services: Services,
    router: Router,
    sessions: SessionStore,
}

impl Kernel {
    /// 装配服务并注册内置控制器
    pub fn new(config: Config) -> Result<Self, Exception> {
        let mut router = Router::new(&config.app().namespace, config.base_uri());
        router.register(
            &format!("{}::AuthController", BUILTIN_NAMESPACE),
            AuthController::boxed,
        );
        let sessions = SessionStore::with_capacity(config.app().session_capacity);
        let services = Services::from_config(config)?;
        Ok(Self {
            services,
            router,
            sessions,
        })
    }

    pub fn register(&mut self, id: &str, factory: ControllerFactory) -> &mut Self {
        self.router.register(id, factory);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// 处理一个已解析的请求，返回未压缩的响应
    pub fn handle(&self, request: &Request, id: u128) -> Response {
        let mut session = self.sessions.load(request.cookie(SESSION_COOKIE));

        let mut response = match self.dispatch(request, &mut session) {
            Ok(r) => r,
            Err(e) => {
                if e.status() >= 500 {
                    error!("[ID{}]{} {}：{}", id, request.method(), request.path(), e);
                } else {
                    debug!("[ID{}]{} {}：{}", id, request.method(), request.path(), e);
                }
                self.render_error(request, &e)
            }
        };

        if session.is_new() && session.is_started() {
            response.add_header(
                "Set-Cookie",
                format!(
                    "{}={}; Path=/; HttpOnly; SameSite=Lax",
                    SESSION_COOKIE,
                    session.id()
                ),
            );
        }
        self.sessions.save(session);

        info!(
            "[ID{}] {}, {}, {}, {}, {}, {}, ",
            id,
            request.version(),
            request.path(),
            request.method(),
            response.status_code(),
            response.information(),
            request.user_agent(),
        );
        response
    }

    fn dispatch(&self, request: &Request, session: &mut Session) -> Result<Response, HttpException> {
        let route = self.router.dispatch(request.path())?;
        let controller_id = route.controller.unwrap_or_default();
        let mut controller = self.router.instantiate(&controller_id).ok_or_else(|| {
            HttpException::new(
                404,
                format!("No suitable controller found for \"{}\".", route.requested_path),
            )
        })?;
        let mut ctx = Context::new(request, session, &self.services, route.args);
        controller::run(controller.as_mut(), &mut ctx)
    }

    /// 客户端需要 JSON 时输出 `{"error": {...}}`，否则输出 HTML 错误页
    pub fn render_error(&self, request: &Request, e: &HttpException) -> Response {
        let hide = self.services.config.app().production && e.status() >= 500;
        let detail = if hide || e.message().is_empty() {
            e.title().to_string()
        } else {
            e.message().to_string()
        };

        let mut response = if request.wants_json() || request.is_json() {
            Response::json(
                e.status(),
                &json!({
                    "error": {
                        "code": e.status(),
                        "title": e.title(),
                        "detail": detail,
                    }
                }),
            )
        } else {
            Response::from_status_code(e.status(), Some(&detail))
        };
        for (name, value) in e.headers() {
            response.set_header(name, value.clone());
        }
        response
    }
}
