//! 登录、注册、找回密码的页面控制器，挂载在 `/auth/<route>`

use log::{error, info};
use serde_json::{json, Value};

use super::{halt_not_found, redirect, redirect_after_post, redirect_permanent, Context, Controller};
use crate::{
    auth::GuardError,
    exception::HttpException,
    response::Response,
};

const FLASH_KEY: &str = "auth";

pub struct AuthController;

impl AuthController {
    pub fn boxed() -> Box<dyn Controller> {
        Box::new(AuthController)
    }
}

impl Controller for AuthController {
    fn limit(&self, ctx: &Context) -> i64 {
        if ctx.is_post() {
            200
        } else {
            0
        }
    }

    fn start(&mut self, ctx: &mut Context) -> Result<Response, HttpException> {
        let route = ctx.arg(0).unwrap_or("").to_string();
        match route.as_str() {
            "" => Ok(redirect_permanent(&ctx.services().guard.login_url(""))),
            "login" => login(ctx),
            "logout" => logout(ctx),
            "register" => register(ctx),
            "verify" => verify(ctx),
            "forgot" => forgot(ctx),
            "renew" => renew(ctx),
            other => Err(halt_not_found(format!(
                "Unknown authentication route \"{}\".",
                other
            ))),
        }
    }
}

fn login(ctx: &mut Context) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    let redirect_to = ctx
        .data("redirect_to")
        .or_else(|| ctx.param("redirect_to"))
        .unwrap_or("")
        .to_string();

    if !ctx.is_post() {
        if guard.is_logged_in(ctx.session()) {
            return Ok(redirect(&guard.home_url()));
        }
        return screen(ctx, "login", json!({ "redirect_to": redirect_to }));
    }

    ctx.check_form_token()?;
    let username = ctx.data("username").unwrap_or("").to_string();
    let password = ctx.data("password").unwrap_or("").to_string();
    match guard.login(ctx.session(), &username, &password) {
        Ok(_) => Ok(redirect_after_post(&safe_target(&redirect_to, &guard.home_url()))),
        Err(e) => {
            fail(ctx, &e, json!({ "username": username }));
            Ok(redirect_after_post(&guard.login_url(&redirect_to)))
        }
    }
}

fn logout(ctx: &mut Context) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    if let Some(user) = guard.current_user(ctx.session()) {
        info!("用户{}已登出", user.username);
    }
    guard.logout(ctx.session());
    Ok(redirect(&guard.login_url("")))
}

fn register(ctx: &mut Context) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    if !guard.can_register() {
        return Ok(redirect(&guard.login_url("")));
    }

    if !ctx.is_post() {
        let name = if ctx.has_param("waiting") {
            "register_waiting"
        } else {
            "register"
        };
        return screen(ctx, name, json!({}));
    }

    ctx.check_form_token()?;
    let email = ctx.data("email").unwrap_or("").trim().to_string();
    match guard.register(&email) {
        Ok(()) => Ok(redirect_after_post(&format!("{}?waiting", guard.register_url()))),
        Err(e) => {
            fail(ctx, &e, json!({ "email": email }));
            Ok(redirect_after_post(&guard.register_url()))
        }
    }
}

fn verify(ctx: &mut Context) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    if !guard.can_register() {
        return Ok(redirect(&guard.login_url("")));
    }
    let key = verification_key(ctx);

    if !ctx.is_post() {
        if guard.user_id_from_token(&key).is_none() {
            let e = GuardError::InvalidToken(
                "Verification failed : please renew your registration.".to_string(),
            );
            fail(ctx, &e, json!({}));
            return Ok(redirect(&guard.register_url()));
        }
        return screen(ctx, "verify", json!({ "vk": key }));
    }

    ctx.check_form_token()?;
    let name = ctx.data("name").unwrap_or("").to_string();
    let password = ctx.data("password").unwrap_or("").to_string();
    if ctx.data("password_check").unwrap_or("") != password {
        let e = GuardError::Validation("Passwords don't match.".to_string());
        fail(ctx, &e, json!({ "name": name }));
        return Ok(redirect_after_post(&guard.verify_url(&key)));
    }

    match guard.verify(&key, &name, &password) {
        Ok(_) => {
            ctx.session().flash(
                FLASH_KEY,
                "Your account is ready, you can now log in.",
                json!({}),
                "success",
            );
            Ok(redirect_after_post(&guard.login_url("")))
        }
        Err(e @ GuardError::InvalidToken(_)) => {
            fail(ctx, &e, json!({}));
            Ok(redirect_after_post(&guard.register_url()))
        }
        Err(e) => {
            fail(ctx, &e, json!({ "name": name }));
            Ok(redirect_after_post(&guard.verify_url(&key)))
        }
    }
}

fn forgot(ctx: &mut Context) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    if !guard.can_update_users() {
        return Ok(redirect(&guard.login_url("")));
    }

    if !ctx.is_post() {
        let name = if ctx.has_param("waiting") {
            "forgot_waiting"
        } else {
            "forgot"
        };
        return screen(ctx, name, json!({}));
    }

    ctx.check_form_token()?;
    let email = ctx.data("email").unwrap_or("").trim().to_string();
    match guard.start_forgot_password(&email) {
        Ok(()) => Ok(redirect_after_post(&format!("{}?waiting", guard.forgot_url()))),
        Err(e) => {
            fail(ctx, &e, json!({ "email": email }));
            Ok(redirect_after_post(&guard.forgot_url()))
        }
    }
}

fn renew(ctx: &mut Context) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    if !guard.can_update_users() {
        return Ok(redirect(&guard.login_url("")));
    }
    let key = verification_key(ctx);

    if !ctx.is_post() {
        if guard.user_id_from_token(&key).is_none() {
            let e = GuardError::InvalidToken("Password renewal failed : user not found.".to_string());
            fail(ctx, &e, json!({}));
            return Ok(redirect(&guard.forgot_url()));
        }
        return screen(ctx, "renew", json!({ "vk": key }));
    }

    ctx.check_form_token()?;
    let password = ctx.data("password").unwrap_or("").to_string();
    if ctx.data("password_check").unwrap_or("") != password {
        let e = GuardError::Validation("Passwords don't match.".to_string());
        fail(ctx, &e, json!({}));
        return Ok(redirect_after_post(&guard.renew_url(&key)));
    }

    match guard.renew_password(&key, &password) {
        Ok(_) => {
            ctx.session().flash(
                FLASH_KEY,
                "Your password has been updated, you can now log in.",
                json!({}),
                "success",
            );
            Ok(redirect_after_post(&guard.login_url("")))
        }
        Err(e @ GuardError::InvalidToken(_)) => {
            fail(ctx, &e, json!({}));
            Ok(redirect_after_post(&guard.forgot_url()))
        }
        Err(e) => {
            fail(ctx, &e, json!({}));
            Ok(redirect_after_post(&guard.renew_url(&key)))
        }
    }
}

/// 表单中的 `vkey` 优先，其次是链接中的 `k`
fn verification_key(ctx: &Context) -> String {
    ctx.data("vkey")
        .or_else(|| ctx.param("k"))
        .unwrap_or("")
        .to_string()
}

/// 只允许站内相对路径作为登录后的跳转目标
fn safe_target(target: &str, fallback: &str) -> String {
    if target.starts_with('/') && !target.starts_with("//") {
        target.to_string()
    } else {
        fallback.to_string()
    }
}

fn fail(ctx: &mut Context, e: &GuardError, data: Value) {
    match e {
        GuardError::Storage(m) | GuardError::Mail(m) => error!("认证流程失败：{}", m),
        _ => {}
    }
    ctx.session().flash(FLASH_KEY, &e.to_string(), data, "error");
}

/// 渲染 `auth` 模板的某个画面，附带上一次的提示消息与表单令牌
fn screen(ctx: &mut Context, name: &str, mut vars: Value) -> Result<Response, HttpException> {
    let guard = &ctx.services().guard;
    vars[format!("screen_{}", name)] = json!(true);

    if let Some(flash) = ctx.session().take_flash(FLASH_KEY) {
        let slot = if flash.kind == "success" { "success" } else { "error" };
        vars[slot] = json!(flash.message);
        if let Value::Object(data) = flash.data {
            for (k, v) in data {
                vars[k] = v;
            }
        }
    }

    vars["token"] = json!(ctx.form_token());
    vars["can_register"] = json!(guard.can_register());
    vars["can_update_users"] = json!(guard.can_update_users());
    vars["login_url"] = json!(guard.login_url(""));
    vars["register_url"] = json!(guard.register_url());
    vars["forgot_url"] = json!(guard.forgot_url());
    ctx.render("auth", &vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_target() {
        assert_eq!(safe_target("/account", "/"), "/account");
        assert_eq!(safe_target("//evil.example", "/"), "/");
        assert_eq!(safe_target("https://evil.example", "/"), "/");
        assert_eq!(safe_target("", "/home"), "/home");
    }
}
