//! JSON 接口控制器
//!
//! 实现 `RestController` 中需要的方法，再用 `Rest` 包装后注册。
//! 未实现的方法返回 501，错误统一为 `{"error": {"code", "title", "detail"[, "fields"]}}`。

use std::fmt;

use log::error;
use serde_json::{json, Value};

use super::{halt_not_implemented, Context, Controller};
use crate::{
    auth::{ProviderKind, TableError},
    exception::HttpException,
    param::{status_message, HttpRequestMethod},
    response::Response,
};

/// 成功时的响应体，`None` 对应 204
pub type RestResult = Result<Option<Value>, RestError>;

#[derive(Debug, Clone, PartialEq)]
pub enum RestError {
    /// 请求数据不合法，对应 422
    UnexpectedValue { message: String, fields: Vec<String> },
    Http(HttpException),
    /// 其他内部错误，对应 500
    Internal(String),
}

impl RestError {
    pub fn status(&self) -> u16 {
        match self {
            RestError::UnexpectedValue { .. } => 422,
            RestError::Http(e) => e.status(),
            RestError::Internal(_) => 500,
        }
    }

    /// 错误响应体
    pub fn to_json(&self) -> Value {
        let code = self.status();
        let mut body = json!({
            "code": code,
            "title": status_message(code),
            "detail": self.to_string(),
        });
        if let RestError::UnexpectedValue { fields, .. } = self {
            if !fields.is_empty() {
                body["fields"] = json!(fields);
            }
        }
        json!({ "error": body })
    }
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestError::UnexpectedValue { message, .. } => write!(f, "{}", message),
            RestError::Http(e) => write!(f, "{}", e.message()),
            RestError::Internal(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for RestError {}

impl From<HttpException> for RestError {
    fn from(e: HttpException) -> Self {
        RestError::Http(e)
    }
}

impl From<TableError> for RestError {
    fn from(e: TableError) -> Self {
        match &e {
            TableError::UnexpectedValue(fields) => RestError::UnexpectedValue {
                message: e.to_string(),
                fields: fields.clone(),
            },
            TableError::Storage(_) => RestError::Internal(e.to_string()),
            _ => RestError::Http(HttpException::new(e.status(), e.to_string())),
        }
    }
}

pub trait RestController: Send {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Public
    }

    fn allow(&self, _ctx: &Context) -> bool {
        true
    }

    fn limit(&self, _ctx: &Context) -> i64 {
        0
    }

    fn get(&mut self, _ctx: &mut Context) -> RestResult {
        Err(not_implemented("GET"))
    }

    fn post(&mut self, _ctx: &mut Context) -> RestResult {
        Err(not_implemented("POST"))
    }

    fn put(&mut self, _ctx: &mut Context) -> RestResult {
        Err(not_implemented("PUT"))
    }

    fn patch(&mut self, _ctx: &mut Context) -> RestResult {
        Err(not_implemented("PATCH"))
    }

    fn delete(&mut self, _ctx: &mut Context) -> RestResult {
        Err(not_implemented("DELETE"))
    }
}

fn not_implemented(method: &str) -> RestError {
    RestError::Http(halt_not_implemented(format!("Method {} is not implemented.", method)))
}

/// 把 `RestController` 适配为 `Controller`
pub struct Rest<T>(pub T);

impl<T: RestController> Controller for Rest<T> {
    fn provider(&self) -> ProviderKind {
        self.0.provider()
    }

    fn allow(&self, ctx: &Context) -> bool {
        self.0.allow(ctx)
    }

    fn limit(&self, ctx: &Context) -> i64 {
        self.0.limit(ctx)
    }

    fn start(&mut self, ctx: &mut Context) -> Result<Response, HttpException> {
        let method = ctx.request().method();
        let result = match method {
            HttpRequestMethod::Get | HttpRequestMethod::Head => self.0.get(ctx),
            HttpRequestMethod::Post => self.0.post(ctx),
            HttpRequestMethod::Put => self.0.put(ctx),
            HttpRequestMethod::Patch => self.0.patch(ctx),
            HttpRequestMethod::Delete => self.0.delete(ctx),
            HttpRequestMethod::Options => Err(not_implemented("OPTIONS")),
        };

        let response = match result {
            Ok(Some(body)) => {
                let code = if method == HttpRequestMethod::Post { 201 } else { 200 };
                Response::json(code, &body)
            }
            Ok(None) => {
                let mut response = Response::new();
                response
                    .set_code(204)
                    .set_header("Content-Type", "application/json");
                response
            }
            Err(e) => {
                if let RestError::Internal(m) = &e {
                    error!("接口{}内部错误：{}", ctx.uid(), m);
                }
                let mut response = Response::json(e.status(), &e.to_json());
                if let RestError::Http(http) = &e {
                    for (name, value) in http.headers() {
                        response.add_header(name, value.clone());
                    }
                }
                response
            }
        };
        Ok(response)
    }
}
