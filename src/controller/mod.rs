//! 控制器与请求处理流水线
//!
//! 每个请求依次经过：认证 → 授权 → 生成唯一标识 → 防刷检查 → 缓存 → 执行。
//! 任何一步都可以用 `HttpException` 中止，由内核渲染成错误页。

pub mod gate;
pub mod rest;

use chrono::Utc;
use log::{debug, error, warn};
use serde_json::Value;

use crate::{
    auth::{ProviderKind, User},
    cache::HttpCache,
    exception::HttpException,
    kernel::Services,
    request::Request,
    response::Response,
    session::Session,
};

/// 由路由注册表保存的控制器构造函数
pub type ControllerFactory = fn() -> Box<dyn Controller>;

/// 控制器。除 `start` 外的方法都有默认实现。
pub trait Controller: Send {
    /// 使用的认证方式
    fn provider(&self) -> ProviderKind {
        ProviderKind::Public
    }

    /// 认证之后的授权检查
    fn allow(&self, _ctx: &Context) -> bool {
        true
    }

    /// 同一访客两次请求之间的最小间隔（毫秒），0 表示不限制
    fn limit(&self, _ctx: &Context) -> i64 {
        0
    }

    /// 响应缓存的有效期（秒），0 表示不缓存
    fn cache_ttl(&self) -> i64 {
        0
    }

    fn start(&mut self, ctx: &mut Context) -> Result<Response, HttpException>;
}

/// 一次请求的执行上下文
pub struct Context<'a> {
    request: &'a Request,
    session: &'a mut Session,
    services: &'a Services,
    user: Option<User>,
    args: Vec<String>,
    uid: String,
}

impl<'a> Context<'a> {
    pub fn new(
        request: &'a Request,
        session: &'a mut Session,
        services: &'a Services,
        args: Vec<String>,
    ) -> Self {
        let uid = unique_id(request.path_info(), services.config.base_uri());
        Self {
            request,
            session,
            services,
            user: None,
            args,
            uid,
        }
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn session(&mut self) -> &mut Session {
        self.session
    }

    pub fn services(&self) -> &'a Services {
        self.services
    }

    /// 认证得到的用户，认证之前为 `None`
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.request.param(key)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.request.has_param(key)
    }

    pub fn data(&self, key: &str) -> Option<&str> {
        self.request.data(key)
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.request.has_data(key)
    }

    pub fn is_get(&self) -> bool {
        self.request.is_get()
    }

    pub fn is_post(&self) -> bool {
        self.request.is_post()
    }

    pub fn is_head(&self) -> bool {
        self.request.is_head()
    }

    /// 当前请求地址对应的表单令牌，不存在时生成
    pub fn form_token(&mut self) -> String {
        let id = self.request.path().to_string();
        self.session.get_token(&id)
    }

    /// 校验提交的 `_token`，成功后令牌作废
    pub fn check_form_token(&mut self) -> Result<(), HttpException> {
        let id = self.request.path().to_string();
        let value = self.request.data("_token").unwrap_or("");
        if !self.session.is_valid_token(&id, value) {
            warn!("表单令牌无效：{}", id);
            return Err(HttpException::new(405, "Invalid form, please try again."));
        }
        self.session.remove_token(&id);
        Ok(())
    }

    /// 渲染模板为 HTML 响应
    pub fn render(&self, template: &str, vars: &Value) -> Result<Response, HttpException> {
        let html = self.services.templates.render(template, vars).map_err(|e| {
            error!("渲染模板{}失败：{}", template, e);
            halt_internal_error(format!("Unable to render template \"{}\".", template))
        })?;
        Ok(Response::html(200, html))
    }
}

/// 请求路径去掉前缀与查询串，首尾 `/` 去掉后把 `/` 换成 `-`；空路径为 `index`
pub fn unique_id(path: &str, base_uri: &str) -> String {
    let path = path.split('?').next().unwrap_or("");
    let path = path.strip_prefix(base_uri).unwrap_or(path);
    let uid = path.trim_matches('/').replace('/', "-");
    if uid.is_empty() {
        "index".to_string()
    } else {
        uid
    }
}

/// 按固定顺序执行流水线
pub fn run(controller: &mut dyn Controller, ctx: &mut Context) -> Result<Response, HttpException> {
    // 认证
    let user = ctx
        .services
        .providers
        .authenticate(controller.provider(), ctx.request, ctx.session)
        .map_err(HttpException::from)?;
    ctx.user = Some(user);

    // 授权
    let can_login = ctx.user.as_ref().map_or(false, User::can_login);
    if !can_login || !controller.allow(ctx) {
        return Err(halt_forbidden(format!("Access denied ({})", ctx.request.ip())));
    }

    // 防刷
    let limit = controller.limit(ctx).abs();
    if limit > 0 {
        flood_check(ctx, limit, Utc::now().timestamp_millis())?;
    }

    // 缓存
    let ttl = controller.cache_ttl();
    if ttl <= 0 {
        return controller.start(ctx);
    }
    let cache = HttpCache::new(
        ctx.services.config.cache_path(),
        &format!("{}.cache", ctx.uid),
        ttl,
    );
    match cache.read() {
        Ok(Some(response)) => {
            debug!("命中缓存：{}", ctx.uid);
            return Ok(response);
        }
        Ok(None) => {}
        Err(e) => error!("读取缓存{}失败：{}", ctx.uid, e),
    }
    let mut response = controller.start(ctx)?;
    if let Err(e) = cache.save(&mut response) {
        error!("写入缓存{}失败：{}", ctx.uid, e);
    }
    Ok(response)
}

/// 会话中记录上一次访问时间，间隔小于 `limit` 毫秒时返回 429
pub fn flood_check(ctx: &mut Context, limit: i64, now_ms: i64) -> Result<(), HttpException> {
    let key = format!("throttle.{}.{}", ctx.request.ip().replace('.', "-"), ctx.uid);
    let last = ctx.session.get(&key).and_then(Value::as_i64).unwrap_or(0);
    ctx.session.set(&key, Value::from(now_ms));

    if now_ms - last < limit {
        let retry_after = ((limit as f64 / 1000.0).round() as i64).max(1);
        return Err(halt_too_many_requests(format!(
            "You have to wait {} milliseconds between two requests.",
            limit
        ))
        .with_header("Retry-After", retry_after.to_string()));
    }
    Ok(())
}

/* ==== 中止与重定向 ==== */

pub fn halt(status: u16, message: impl Into<String>) -> HttpException {
    HttpException::new(status, message)
}

pub fn halt_bad_request(message: impl Into<String>) -> HttpException {
    halt(400, message)
}

pub fn halt_unauthorized(message: impl Into<String>) -> HttpException {
    halt(401, message)
}

pub fn halt_forbidden(message: impl Into<String>) -> HttpException {
    halt(403, message)
}

pub fn halt_not_found(message: impl Into<String>) -> HttpException {
    halt(404, message)
}

pub fn halt_not_acceptable(message: impl Into<String>) -> HttpException {
    halt(406, message)
}

pub fn halt_conflict(message: impl Into<String>) -> HttpException {
    halt(409, message)
}

pub fn halt_expectation_failed(message: impl Into<String>) -> HttpException {
    halt(417, message)
}

pub fn halt_too_many_requests(message: impl Into<String>) -> HttpException {
    halt(429, message)
}

pub fn halt_internal_error(message: impl Into<String>) -> HttpException {
    halt(500, message)
}

pub fn halt_not_implemented(message: impl Into<String>) -> HttpException {
    halt(501, message)
}

pub fn halt_unavailable(message: impl Into<String>) -> HttpException {
    halt(503, message)
}

pub fn redirect(url: &str) -> Response {
    Response::redirect(url, 302)
}

pub fn redirect_permanent(url: &str) -> Response {
    Response::redirect(url, 301)
}

/// 表单提交后跳转（303），浏览器会改用 GET
pub fn redirect_after_post(url: &str) -> Response {
    Response::redirect(url, 303)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::Services;
    use proptest::prelude::*;

    fn services() -> Services {
        Services::from_config(Config::parse("[users]\nprovider = \"array\"\n")).unwrap()
    }

    fn request(raw: &str) -> Request {
        Request::try_from(raw.as_bytes(), 0).unwrap()
    }

    struct Hello;

    impl Controller for Hello {
        fn start(&mut self, ctx: &mut Context) -> Result<Response, HttpException> {
            Ok(Response::html(200, format!("hello {}", ctx.arg(0).unwrap_or("nobody"))))
        }
    }

    struct Closed;

    impl Controller for Closed {
        fn allow(&self, _ctx: &Context) -> bool {
            false
        }

        fn start(&mut self, _ctx: &mut Context) -> Result<Response, HttpException> {
            Ok(Response::new())
        }
    }

    #[test]
    fn test_unique_id() {
        assert_eq!(unique_id("/", ""), "index");
        assert_eq!(unique_id("/foo/bar/", ""), "foo-bar");
        assert_eq!(unique_id("/app/foo?x=1", "/app"), "foo");
        assert_eq!(unique_id("/app", "/app"), "index");
    }

    #[test]
    fn test_run_public_controller() {
        let services = services();
        let req = request("GET /hello/world HTTP/1.1\r\n\r\n");
        let mut session = Session::new();
        let mut ctx = Context::new(&req, &mut session, &services, vec!["world".to_string()]);

        let response = run(&mut Hello, &mut ctx).unwrap();
        assert_eq!(response.body_str(), "hello world");
        assert_eq!(ctx.user().unwrap().username, "public");
        assert_eq!(ctx.uid(), "hello-world");
    }

    #[test]
    fn test_denied_controller() {
        let services = services();
        let req = request("GET /closed HTTP/1.1\r\n\r\n");
        let mut session = Session::new();
        let mut ctx = Context::new(&req, &mut session, &services, Vec::new());

        let err = run(&mut Closed, &mut ctx).unwrap_err();
        assert_eq!(err.status(), 403);
        assert_eq!(err.message(), "Access denied (127.0.0.1)");
    }

    #[test]
    fn test_flood_check() {
        let services = services();
        let req = request("POST /form HTTP/1.1\r\n\r\n");
        let mut session = Session::new();
        let mut ctx = Context::new(&req, &mut session, &services, Vec::new());

        assert!(flood_check(&mut ctx, 1500, 10_000).is_ok());
        let err = flood_check(&mut ctx, 1500, 10_100).unwrap_err();
        assert_eq!(err.status(), 429);
        assert_eq!(
            err.message(),
            "You have to wait 1500 milliseconds between two requests."
        );
        assert_eq!(err.headers()[0], ("Retry-After".to_string(), "2".to_string()));
        assert!(flood_check(&mut ctx, 1500, 12_000).is_ok());
        assert!(session.has("throttle.127-0-0-1.form"));
    }

    #[test]
    fn test_form_token_is_bound_to_uri() {
        let services = services();
        let get = request("GET /auth/login HTTP/1.1\r\n\r\n");
        let mut session = Session::new();
        let token = Context::new(&get, &mut session, &services, Vec::new()).form_token();

        let body = format!("_token={}", token);
        let post = request(&format!(
            "POST /auth/login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));
        let other = request(&format!(
            "POST /auth/register HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));

        let err = Context::new(&other, &mut session, &services, Vec::new())
            .check_form_token()
            .unwrap_err();
        assert_eq!(err.status(), 405);
        assert_eq!(err.message(), "Invalid form, please try again.");

        let mut ctx = Context::new(&post, &mut session, &services, Vec::new());
        assert!(ctx.check_form_token().is_ok());
        assert!(ctx.check_form_token().is_err());
    }

    #[test]
    fn test_redirects() {
        assert_eq!(redirect("/a").status_code(), 302);
        assert_eq!(redirect_permanent("/a").status_code(), 301);
        let r = redirect_after_post("/a");
        assert_eq!(r.status_code(), 303);
        assert_eq!(r.header("Location"), Some("/a"));
    }

    proptest! {
        #[test]
        fn test_second_hit_inside_window_is_throttled(limit in 1i64..100_000, gap in 0i64..100_000) {
            let services = services();
            let req = request("GET /p HTTP/1.1\r\n\r\n");
            let mut session = Session::new();
            let mut ctx = Context::new(&req, &mut session, &services, Vec::new());
            let start = 1_000_000_000i64;

            prop_assert!(flood_check(&mut ctx, limit, start).is_ok());
            let second = flood_check(&mut ctx, limit, start + gap);
            prop_assert_eq!(second.is_err(), gap < limit);
        }
    }
}
