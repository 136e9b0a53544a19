use crate::{param::*, util::HtmlBuilder};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use bytes::Bytes;
use chrono::prelude::*;
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::{debug, error};
use serde_json::Value;

use std::io::{self, Write};

/// HTTP 响应。
///
/// 除 `Content-Length`、`Date`、`Server` 外的所有响应头都保存在 `headers` 中，
/// 序列化时按插入顺序输出，同名头（如 `Set-Cookie`）可以出现多次。
#[derive(Debug, Clone)]
pub struct Response {
    version: HttpVersion,
    status_code: u16,
    information: String,
    headers: Vec<(String, String)>,
    date: DateTime<Utc>,
    content_encoding: Option<HttpEncoding>,
    server_name: String,
    content: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            version: HttpVersion::V1_1,
            status_code: 200,
            information: "OK".to_string(),
            headers: Vec::new(),
            date: Utc::now(),
            content_encoding: None,
            server_name: SERVER_NAME.to_string(),
            content: Bytes::new(),
        }
    }

    /// 构造 HTML 响应
    pub fn html(code: u16, html: impl Into<String>) -> Self {
        let mut response = Self::new();
        response
            .set_code(code)
            .set_header("Content-Type", "text/html;charset=utf-8")
            .set_body(html.into());
        response
    }

    /// 构造 JSON 响应
    pub fn json(code: u16, value: &Value) -> Self {
        let mut response = Self::new();
        response
            .set_code(code)
            .set_header("Content-Type", "application/json")
            .set_body(value.to_string());
        response
    }

    /// 构造重定向响应，`code` 通常为 301、302 或 303
    pub fn redirect(url: &str, code: u16) -> Self {
        let mut response = Self::new();
        response.set_code(code).set_header("Location", url);
        response
    }

    /// 根据状态码构造默认错误页
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let html = HtmlBuilder::from_status_code(code, note).build();
        Self::html(code, html)
    }

    pub fn set_code(&mut self, code: u16) -> &mut Self {
        self.status_code = code;
        self.information = status_message(code).to_string();
        self
    }

    /// 设置响应头，已有的同名头会被替换
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// 追加响应头，保留已有的同名头
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.content = body.into();
        self
    }

    /// 按客户端的 `Accept-Encoding` 压缩响应体。
    ///
    /// 已压缩过、响应体为空或内容类型本身已经压缩（图片、压缩包等）时不做处理。
    pub fn compress_for(&mut self, accept_encoding: &[HttpEncoding], id: u128) -> &mut Self {
        if self.content_encoding.is_some() || self.content.is_empty() {
            return self;
        }
        let skip = self
            .header("Content-Type")
            .map_or(false, should_skip_compression);
        if skip {
            return self;
        }
        let encoding = match decide_encoding(accept_encoding) {
            Some(e) => e,
            None => return self,
        };
        match compress(self.content.to_vec(), Some(encoding)) {
            Ok(compressed) => {
                self.content = Bytes::from(compressed);
                self.content_encoding = Some(encoding);
            }
            Err(e) => {
                error!("[ID{}]压缩响应体失败：{}", id, e);
            }
        }
        self
    }

    /// 丢弃响应体（用于 HEAD 请求），保留原有的 `Content-Length`
    pub fn into_head(mut self) -> (Self, usize) {
        let length = self.content.len();
        self.content = Bytes::new();
        (self, length)
    }

    /// 状态行，如 `HTTP/1.1 200 OK`
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/{} {} {}",
            self.version, self.status_code, self.information
        )
    }

    /// 以换行分隔的响应头文本，供文件缓存使用
    pub fn headers_string(&self) -> String {
        self.headers
            .iter()
            .map(|(n, v)| format!("{}: {}", n, v))
            .collect::<Vec<String>>()
            .join("\n")
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.serialize(self.content.len())
    }

    /// 序列化 HEAD 响应：报文头声明原始长度，但不携带响应体
    pub fn as_head_bytes(&self, content_length: usize) -> Vec<u8> {
        self.serialize(content_length)
    }

    fn serialize(&self, content_length: usize) -> Vec<u8> {
        let mut header = String::with_capacity(256);
        header.push_str(&self.status_line());
        header.push_str(CRLF);
        for (name, value) in &self.headers {
            header.push_str(name);
            header.push_str(": ");
            header.push_str(value);
            header.push_str(CRLF);
        }
        if let Some(e) = self.content_encoding {
            header.push_str(&format!("Content-Encoding: {}{}", e, CRLF));
        }
        header.push_str(&format!("Content-Length: {}{}", content_length, CRLF));
        header.push_str(&format!("Date: {}{}", format_date(&self.date), CRLF));
        header.push_str(&format!("Server: {}{}", self.server_name, CRLF));
        header.push_str(CRLF);

        debug!("响应头：{}", header.trim_end());
        [header.as_bytes(), &self.content].concat()
    }
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn information(&self) -> &str {
        &self.information
    }

    /// 按名称读取响应头（大小写不敏感），同名头返回第一个
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &Vec<(String, String)> {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.content
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    pub fn content_encoding(&self) -> Option<HttpEncoding> {
        self.content_encoding
    }
}

/// HTTP 日期格式（RFC 7231 IMF-fixdate）
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn compress(data: Vec<u8>, mode: Option<HttpEncoding>) -> io::Result<Vec<u8>> {
    let original_size = data.len();
    let result = match mode {
        Some(HttpEncoding::Gzip) => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Deflate) => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()
        }
        Some(HttpEncoding::Br) => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
        None => Ok(data),
    };

    if let Ok(ref compressed) = result {
        let compressed_size = compressed.len();
        let ratio = if original_size > 0 {
            ((original_size as i64 - compressed_size as i64) as f64 / original_size as f64) * 100.0
        } else {
            0.0
        };
        debug!(
            "压缩完成: {:?}, 原始大小: {} bytes, 压缩后: {} bytes, 压缩率: {:.1}%",
            mode, original_size, compressed_size, ratio
        );
    }

    result
}

fn should_skip_compression(mime_type: &str) -> bool {
    let skip_types = [
        "image/",
        "video/",
        "audio/",
        "application/zip",
        "application/gzip",
        "application/x-gzip",
        "font/woff",
    ];

    skip_types
        .iter()
        .any(|&skip_type| mime_type.starts_with(skip_type))
}

fn decide_encoding(accept_encoding: &[HttpEncoding]) -> Option<HttpEncoding> {
    if accept_encoding.contains(&HttpEncoding::Br) {
        Some(HttpEncoding::Br)
    } else if accept_encoding.contains(&HttpEncoding::Gzip) {
        Some(HttpEncoding::Gzip)
    } else if accept_encoding.contains(&HttpEncoding::Deflate) {
        Some(HttpEncoding::Deflate)
    } else {
        None
    }
}
