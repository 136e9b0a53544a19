// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 该模块负责将 TCP 流中读取的原始字节解析为强类型的 `Request` 结构体。它涵盖了：
//! 1. 请求行（Request-Line）的解析（方法、路径、版本）。
//! 2. 全部 HTTP 标头（Headers）的提取，字段名大小写不敏感。
//! 3. 查询字符串、表单请求体（`application/x-www-form-urlencoded`）与 Cookie 的解码。
//! 4. 内容协商（Content Negotiation）相关的编码解析。

use std::collections::HashMap;

use crate::{exception::Exception, param::*};
use log::error;
use url::form_urlencoded;

/// 表示一个完整的 HTTP 请求。
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP 请求方法（GET, POST 等）
    method: HttpRequestMethod,
    /// 请求的资源路径（包含查询字符串）
    path: String,
    /// HTTP 协议版本
    version: HttpVersion,
    /// 客户端标识字符串
    user_agent: String,
    /// 客户端支持的压缩编码列表（按解析顺序排列）
    accept_encoding: Vec<HttpEncoding>,
    /// 客户端接受的内容类型（MIME）
    accept: Option<String>,
    /// 全部请求头，字段名统一为小写
    headers: Vec<(String, String)>,
    /// 查询参数
    query: HashMap<String, String>,
    /// 表单参数
    form: HashMap<String, String>,
    /// Cookie
    cookies: HashMap<String, String>,
    /// 原始请求体
    body: String,
    /// 客户端地址，由连接处理器在解析后写入
    client_ip: String,
}

impl Request {
    /// 从原始字节缓冲区尝试构建 `Request` 实例。
    ///
    /// # 逻辑步骤
    /// 1. 以空行切分报文头与请求体，并验证报文头是合法的 UTF-8 字符串。
    /// 2. 解析请求行：提取方法、路径和协议版本。
    /// 3. 迭代解析标头，识别 `User-Agent`, `Accept`, `Accept-Encoding`, `Cookie` 等字段。
    /// 4. 解码查询字符串与表单请求体。
    ///
    /// # 参数
    /// * `buffer` - 从网络 Socket 读取的原始数据。
    /// * `id` - 连接 ID，用于在多线程环境下追踪日志。
    pub fn try_from(buffer: &[u8], id: u128) -> Result<Self, Exception> {
        let (head_bytes, body_bytes) = match find_header_end(buffer) {
            Some(pos) => (&buffer[..pos], &buffer[pos + 4..]),
            None => (buffer, &buffer[buffer.len()..]),
        };

        // 1. 将报文头转换为字符串，失败则判定为非法的 HTTP 请求
        let head = match std::str::from_utf8(head_bytes) {
            Ok(string) => string,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };
        let body = match std::str::from_utf8(body_bytes) {
            Ok(string) => string.trim_end_matches('\0').to_string(),
            Err(_) => {
                error!("[ID{}]HTTP请求体不是合法的UTF-8", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };
        if body.len() > MAX_BODY_SIZE {
            return Err(Exception::BodyTooLarge);
        }

        let request_lines: Vec<&str> = head.split(CRLF).collect();

        // 2. 解析请求行 (e.g., "GET /index.html HTTP/1.1")
        let first_line_parts: Vec<&str> = request_lines[0].split(' ').collect();

        if first_line_parts.len() < 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, request_lines[0]);
            return Err(Exception::UnSupportedRequestMethod);
        }

        let method_str = first_line_parts[0].to_uppercase();
        let method = match method_str.as_str() {
            "GET" => HttpRequestMethod::Get,
            "HEAD" => HttpRequestMethod::Head,
            "OPTIONS" => HttpRequestMethod::Options,
            "POST" => HttpRequestMethod::Post,
            "PUT" => HttpRequestMethod::Put,
            "PATCH" => HttpRequestMethod::Patch,
            "DELETE" => HttpRequestMethod::Delete,
            _ => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, &method_str);
                return Err(Exception::UnSupportedRequestMethod);
            }
        };

        let version_str = first_line_parts[first_line_parts.len() - 1].to_uppercase();
        let version = match version_str.as_str() {
            "HTTP/1.1" => HttpVersion::V1_1,
            "HTTP/1.0" => HttpVersion::V1_0,
            _ => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, &version_str);
                return Err(Exception::UnsupportedHttpVersion);
            }
        };

        // 路径中可能包含空格（虽然不规范），通过 join 尝试恢复
        let path = if first_line_parts.len() == 3 {
            first_line_parts[1].to_string()
        } else {
            first_line_parts[1..first_line_parts.len() - 1].join(" ")
        };

        // 3. 迭代各行解析 Headers
        let mut headers = Vec::new();
        for line in request_lines.iter().skip(1) {
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_lowercase(), value.trim().to_string()));
                }
                None => {
                    error!("[ID{}]无法解析的请求头：{}", id, line);
                    return Err(Exception::MalformedRequest);
                }
            }
        }

        let find = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };

        let user_agent = find("user-agent").unwrap_or_default();
        let accept = find("accept");

        // 这里的逻辑比较简单，只要包含关键词即视为支持
        let mut accept_encoding = vec![];
        if let Some(encoding) = find("accept-encoding") {
            if encoding.contains("gzip") {
                accept_encoding.push(HttpEncoding::Gzip);
            }
            if encoding.contains("deflate") {
                accept_encoding.push(HttpEncoding::Deflate);
            }
            if encoding.contains("br") {
                accept_encoding.push(HttpEncoding::Br);
            }
        }

        let mut cookies = HashMap::new();
        if let Some(cookie_line) = find("cookie") {
            for pair in cookie_line.split(';') {
                if let Some((k, v)) = pair.split_once('=') {
                    cookies.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }

        // 4. 查询字符串与表单
        let query = match path.split_once('?') {
            Some((_, qs)) => decode_pairs(qs),
            None => HashMap::new(),
        };
        let is_form = find("content-type")
            .map_or(true, |t| t.starts_with("application/x-www-form-urlencoded"));
        let form = if is_form && !body.is_empty() {
            decode_pairs(&body)
        } else {
            HashMap::new()
        };

        Ok(Self {
            method,
            path,
            version,
            user_agent,
            accept_encoding,
            accept,
            headers,
            query,
            form,
            cookies,
            body,
            client_ip: "127.0.0.1".to_string(),
        })
    }

    /// 根据已接收的字节判断完整报文的期望长度。
    ///
    /// 报文头尚未接收完整时返回 `None`；否则返回报文头长度加上 `Content-Length`。
    /// 长度溢出时返回 `usize::MAX`，由调用方按超长报文拒绝。
    pub fn expected_length(buffer: &[u8]) -> Option<usize> {
        let end = find_header_end(buffer)?;
        let head = String::from_utf8_lossy(&buffer[..end]);
        let content_length = head
            .split(CRLF)
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        Some(
            end.checked_add(4)
                .and_then(|n| n.checked_add(content_length))
                .unwrap_or(usize::MAX),
        )
    }

    /// 记录客户端地址
    pub fn set_client_ip(&mut self, ip: &str) {
        self.client_ip = ip.to_string();
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn decode_pairs(input: &str) -> HashMap<String, String> {
    form_urlencoded::parse(input.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

// --- Getter 访问器实现 ---

impl Request {
    /// 获取 HTTP 协议版本
    pub fn version(&self) -> &HttpVersion {
        &self.version
    }

    /// 获取请求路径（含查询参数）
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 获取不含查询参数的路径
    pub fn path_info(&self) -> &str {
        match self.path.split_once('?') {
            Some((p, _)) => p,
            None => &self.path,
        }
    }

    /// 获取原始查询字符串
    pub fn query_string(&self) -> &str {
        match self.path.split_once('?') {
            Some((_, q)) => q,
            None => "",
        }
    }

    /// 获取请求方法
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    /// 获取用户代理字符串
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// 获取客户端支持的压缩算法列表
    pub fn accept_encoding(&self) -> &Vec<HttpEncoding> {
        &self.accept_encoding
    }

    /// 获取客户端接受的文件 MIME 类型
    pub fn accept(&self) -> Option<&String> {
        self.accept.as_ref()
    }

    /// 按名称读取请求头（大小写不敏感）
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// 读取查询参数
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.query.contains_key(key)
    }

    /// 读取表单参数
    pub fn data(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.form.contains_key(key)
    }

    /// 读取 Cookie
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// 获取原始请求体
    pub fn body(&self) -> &str {
        &self.body
    }

    /// 客户端地址
    pub fn ip(&self) -> &str {
        &self.client_ip
    }

    /// 客户端是否期望 JSON 响应
    pub fn wants_json(&self) -> bool {
        self.accept
            .as_ref()
            .map_or(false, |a| a.contains("application/json"))
    }

    /// 请求体是否为 JSON
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .map_or(false, |t| t.contains("application/json"))
    }

    pub fn is_get(&self) -> bool {
        self.method == HttpRequestMethod::Get
    }

    pub fn is_post(&self) -> bool {
        self.method == HttpRequestMethod::Post
    }

    pub fn is_head(&self) -> bool {
        self.method == HttpRequestMethod::Head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 验证常规 GET 请求的解析，包括 Path 和 Headers
    #[test]
    fn test_parse_get_request() {
        let request_str = "GET / HTTP/1.1\r\nHost: localhost:7878\r\nUser-Agent: Test-Browser\r\nAccept-Encoding: gzip, deflate, br\r\n\r\n";
        let buffer = request_str.as_bytes().to_vec();

        let request = Request::try_from(&buffer, 0).unwrap();

        assert_eq!(request.method(), HttpRequestMethod::Get);
        assert_eq!(request.path(), "/");
        assert_eq!(request.user_agent(), "Test-Browser");
        assert!(request.accept_encoding().contains(&HttpEncoding::Gzip));
        assert!(request.accept_encoding().contains(&HttpEncoding::Deflate));
        assert!(request.accept_encoding().contains(&HttpEncoding::Br));
    }

    /// 超大的 Content-Length 不应溢出
    #[test]
    fn test_expected_length_overflow() {
        let head = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert_eq!(Request::expected_length(head), Some(usize::MAX));
    }

    /// 验证 POST 表单的解码
    #[test]
    fn test_parse_post_form() {
        let request_str = "POST /auth/login HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 42\r\n\r\nusername=alice%40example.com&password=a+b";
        let request = Request::try_from(request_str.as_bytes(), 0).unwrap();

        assert!(request.is_post());
        assert_eq!(request.data("username"), Some("alice@example.com"));
        assert_eq!(request.data("password"), Some("a b"));
        assert!(!request.has_data("_token"));
    }

    /// JSON 请求体不会被当作表单解析
    #[test]
    fn test_json_body_is_not_form() {
        let request_str = "POST /api HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{\"a\":1}";
        let request = Request::try_from(request_str.as_bytes(), 0).unwrap();

        assert!(request.is_json());
        assert_eq!(request.body(), "{\"a\":1}");
        assert!(!request.has_data("{\"a\":1}"));
    }

    #[test]
    fn test_query_params() {
        let request_str = "GET /auth/verify?k=abc%20def&waiting HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let request = Request::try_from(request_str.as_bytes(), 0).unwrap();

        assert_eq!(request.path_info(), "/auth/verify");
        assert_eq!(request.query_string(), "k=abc%20def&waiting");
        assert_eq!(request.param("k"), Some("abc def"));
        assert!(request.has_param("waiting"));
    }

    #[test]
    fn test_cookies() {
        let request_str = "GET / HTTP/1.1\r\nCookie: WEBGATESESSID=abc123; theme=dark\r\n\r\n";
        let request = Request::try_from(request_str.as_bytes(), 0).unwrap();

        assert_eq!(request.cookie(SESSION_COOKIE), Some("abc123"));
        assert_eq!(request.cookie("theme"), Some("dark"));
    }

    /// 确保不支持的版本（如 HTTP/2.0）被正确拒绝
    #[test]
    fn test_unsupported_http_version() {
        let request_str = "GET / HTTP/2.0\r\nHost: localhost:7878\r\n\r\n";
        let result = Request::try_from(request_str.as_bytes(), 0);

        assert_eq!(result.unwrap_err(), Exception::UnsupportedHttpVersion);
    }

    #[test]
    fn test_unsupported_method() {
        let request_str = "BREW /pot HTTP/1.1\r\nHost: localhost:7878\r\n\r\n";
        let result = Request::try_from(request_str.as_bytes(), 0);

        assert_eq!(result.unwrap_err(), Exception::UnSupportedRequestMethod);
    }

    /// 验证 UTF-8 编码检查
    #[test]
    fn test_invalid_utf8() {
        let buffer = vec![0xFF, 0xFE, 0xFD];
        let result = Request::try_from(&buffer, 0);

        assert_eq!(result.unwrap_err(), Exception::RequestIsNotUtf8);
    }

    /// 验证 Header 字段名是否大小写不敏感
    #[test]
    fn test_case_insensitive_headers() {
        let request_str = "GET / HTTP/1.1\r\nhost: localhost:7878\r\nuser-agent: Test\r\nX-WSSE: token\r\n\r\n";
        let request = Request::try_from(request_str.as_bytes(), 0).unwrap();

        assert_eq!(request.user_agent(), "Test");
        assert_eq!(request.header("x-wsse"), Some("token"));
        assert_eq!(request.header("X-Wsse"), Some("token"));
    }

    #[test]
    fn test_wants_json() {
        let request_str = "GET / HTTP/1.1\r\nAccept: application/json\r\n\r\n";
        let request = Request::try_from(request_str.as_bytes(), 0).unwrap();

        assert!(request.wants_json());
    }

    #[test]
    fn test_expected_length() {
        let partial = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n";
        assert_eq!(Request::expected_length(partial), None);

        let head = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(Request::expected_length(head), Some(head.len() + 5));
    }
}
