//! 随框架附带的示例应用，注册在 `app` 命名空间下
//!
//! - `/`：欢迎页，缓存 10 秒
//! - `/account`：需要登录的个人页面
//! - `/api/status`：Basic 认证的状态接口
//! - `/api/users/<id>`：WSSE 认证的用户接口，支持 GET 与 POST

use serde_json::json;

use crate::{
    auth::{ProviderKind, UserFields},
    controller::{
        halt_not_found,
        rest::{Rest, RestController, RestError, RestResult},
        Context, Controller,
    },
    exception::HttpException,
    kernel::Kernel,
    response::Response,
    util::{escape_html, HtmlBuilder},
};

/// 把示例控制器注册到内核，`ns` 为应用命名空间
pub fn register(kernel: &mut Kernel, ns: &str) {
    kernel
        .register(&format!("{}::IndexController", ns), index)
        .register(&format!("{}::AccountController", ns), account)
        .register(&format!("{}::Api::StatusController", ns), status)
        .register(&format!("{}::Api::UsersController", ns), users);
}

fn index() -> Box<dyn Controller> {
    Box::new(IndexController)
}

fn account() -> Box<dyn Controller> {
    Box::new(AccountController)
}

fn status() -> Box<dyn Controller> {
    Box::new(Rest(StatusController))
}

fn users() -> Box<dyn Controller> {
    Box::new(Rest(UsersController))
}

pub struct IndexController;

impl Controller for IndexController {
    fn cache_ttl(&self) -> i64 {
        10
    }

    fn start(&mut self, ctx: &mut Context) -> Result<Response, HttpException> {
        if !ctx.args().is_empty() {
            return Err(halt_not_found(format!("Nothing at \"{}\".", ctx.args().join("/"))));
        }
        let guard = &ctx.services().guard;
        let body = format!(
            "<h1>Welcome</h1><p><a href=\"{}\">Log in</a> &bull; <a href=\"/account\">My account</a></p>",
            escape_html(&guard.login_url(""))
        );
        Ok(Response::html(200, HtmlBuilder::from_body("Welcome", body).build()))
    }
}

pub struct AccountController;

impl Controller for AccountController {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Session
    }

    fn start(&mut self, ctx: &mut Context) -> Result<Response, HttpException> {
        let guard = &ctx.services().guard;
        let (username, name) = match ctx.user() {
            Some(user) => (
                user.username.clone(),
                user.attribute("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            ),
            None => (String::new(), String::new()),
        };
        let body = format!(
            "<h1>Hello {}</h1><p>Signed in as {}.</p><p><a href=\"{}\">Log out</a></p>",
            escape_html(&name),
            escape_html(&username),
            escape_html(&guard.logout_url())
        );
        Ok(Response::html(200, HtmlBuilder::from_body("My account", body).build()))
    }
}

pub struct StatusController;

impl RestController for StatusController {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Basic
    }

    fn get(&mut self, ctx: &mut Context) -> RestResult {
        let services = ctx.services();
        Ok(Some(json!({
            "status": "ok",
            "user": ctx.user().map(|u| u.username.clone()),
            "hash": services.hasher.driver_name(),
            "can_register": services.guard.can_register(),
        })))
    }
}

pub struct UsersController;

impl RestController for UsersController {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Wsse
    }

    fn get(&mut self, ctx: &mut Context) -> RestResult {
        let id: u64 = ctx
            .arg(0)
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| RestError::UnexpectedValue {
                message: "A numeric user id is expected.".to_string(),
                fields: vec!["id".to_string()],
            })?;
        let user = ctx
            .services()
            .users
            .get_by_id(id)
            .ok_or_else(|| halt_not_found(format!("User {} not found.", id)))?;
        Ok(Some(json!(user.without_password())))
    }

    fn post(&mut self, ctx: &mut Context) -> RestResult {
        let services = ctx.services();
        let table = services
            .table
            .as_ref()
            .ok_or_else(|| RestError::Http(HttpException::new(501, "Users are not writeable.")))?;

        let password = match ctx.data("password") {
            Some(p) if !p.is_empty() => Some(
                services
                    .hasher
                    .hash(p)
                    .map_err(|e| RestError::Internal(e.to_string()))?,
            ),
            _ => None,
        };
        let fields = UserFields {
            name: ctx.data("name").map(str::to_string),
            email: ctx.data("email").map(str::to_string),
            can_login: Some(password.is_some()),
            password,
            ..Default::default()
        };
        let id = table.save(fields, None)?;
        Ok(Some(json!({ "id": id })))
    }
}
