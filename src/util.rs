use lazy_static::lazy_static;
use regex::Regex;

use crate::param::status_message;

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
            .unwrap();
}

pub struct HtmlBuilder {
    title: String,
    css: String,
    script: String,
    body: String,
}

impl HtmlBuilder {
    /// 错误页：`<h1>404 Not Found !</h1>` 加上可选的说明文字
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let reason = status_message(code);
        let title = format!("{} {}", code, reason);
        let css = r"
            body {
                width: 35em;
                margin: 0 auto;
                font-family: Tahoma, Verdana, Arial, sans-serif;
            }
            "
        .to_string();
        let description = note.unwrap_or(reason);
        let body = format!(
            r"
            <h1>{} {} !</h1>
            <p>{}</p>
            ",
            code,
            reason,
            escape_html(description)
        );
        Self {
            title,
            css,
            script: "".to_string(),
            body,
        }
    }

    /// 以任意 HTML 片段作为页面主体
    pub fn from_body(title: &str, body: String) -> Self {
        Self {
            title: escape_html(title),
            css: "".to_string(),
            script: "".to_string(),
            body,
        }
    }

    pub fn build(&self) -> String {
        format!(
            r##"<!DOCTYPE html>
            <html>
                <head>
                    <meta charset="utf-8">
                    <script>{}</script>
                    <title>{}</title>
                    <style>{}</style>
                </head>
                <body>
                {}
                </body>
            </html>"##,
            self.script, self.title, self.css, self.body
        )
    }
}

/// 转义 HTML 特殊字符
pub fn escape_html(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#039;"),
            _ => output.push(c),
        }
    }
    output
}

/// 邮箱地址的语法校验
pub fn is_valid_email(email: &str) -> bool {
    EMAIL.is_match(email)
}
