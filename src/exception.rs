// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了框架在请求处理生命周期中可能产生的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：`Exception` 覆盖协议解析、模板与配置错误；`HttpException`
//!   表示需要中断控制器并直接返回给客户端的 HTTP 失败；`AuthenticateException`
//!   表示认证提供者拒绝了请求。
//! - **语义映射**：`HttpException` 自带状态码与附加响应头，内核可以直接将其渲染为响应。
//! - **用户友好**：所有类型都实现了 `std::fmt::Display`，可以安全地记录到日志或返回给客户端。

use std::error::Error;
use std::fmt;

use crate::param::status_message;

/// 服务器处理请求过程中发生的底层异常类型。
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Exception {
    /// 客户端发送的请求字节流无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 客户端使用了框架不支持的 HTTP 方法。
    UnSupportedRequestMethod,
    /// 客户端使用了框架不支持的 HTTP 协议版本。
    UnsupportedHttpVersion,
    /// 请求行或请求头格式错误。
    MalformedRequest,
    /// 请求体超过了允许的最大长度。
    BodyTooLarge,
    /// 在任何模板目录中都找不到请求的模板文件。
    TemplateNotFound,
    /// 配置文件无法读取或内容非法。
    InvalidConfig,
}

use Exception::*;

impl fmt::Display for Exception {
    /// 根据错误类型写入人类可读的描述文本。
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            MalformedRequest => write!(f, "Malformed request (400)"),
            BodyTooLarge => write!(f, "Request body too large (413)"),
            TemplateNotFound => write!(f, "Template file not found"),
            InvalidConfig => write!(f, "Invalid configuration"),
        }
    }
}

impl Error for Exception {}

/// 附加在 HTTP 失败上的响应头列表
pub type Headers = Vec<(String, String)>;

/// 中断控制器执行的 HTTP 失败。
///
/// 控制器流水线中的任何阶段都可以返回它，内核捕获后根据客户端偏好渲染为
/// JSON 或 HTML 错误页，并附加 `headers` 中的响应头（如 `Retry-After`）。
#[derive(Debug, Clone, PartialEq)]
pub struct HttpException {
    status: u16,
    message: String,
    headers: Headers,
}

impl HttpException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_headers(status: u16, message: impl Into<String>, headers: Headers) -> Self {
        Self {
            status,
            message: message.into(),
            headers,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// 状态码对应的标准标题，如 `Not Found`
    pub fn title(&self) -> &'static str {
        status_message(self.status)
    }
}

impl fmt::Display for HttpException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, self.title(), self.message)
    }
}

impl Error for HttpException {}

/// 认证失败。
///
/// 默认状态码为 401，提供者可以通过 `headers` 附带 `WWW-Authenticate` 之类的质询头。
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticateException {
    status: u16,
    message: String,
    headers: Headers,
}

impl AuthenticateException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

impl fmt::Display for AuthenticateException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for AuthenticateException {}

impl From<AuthenticateException> for HttpException {
    fn from(e: AuthenticateException) -> Self {
        HttpException::with_headers(e.status, e.message, e.headers)
    }
}
