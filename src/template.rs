//! 极简模板引擎
//!
//! 支持的语法：
//! - `{{ key }}`：输出转义后的值，`key` 可以用点号访问嵌套对象
//! - `{{{ key }}}`：原样输出
//! - `{{#key}}...{{/key}}`：`key` 非空时保留内容
//! - `{{^key}}...{{/key}}`：`key` 为空时保留内容
//!
//! 模板按目录查找，后添加的目录优先，最后回退到编译进二进制的内置模板。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, error};
use serde_json::Value;

use crate::{exception::Exception, util::escape_html};

lazy_static! {
    static ref BUILTIN_TEMPLATES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("auth", include_str!("../resources/templates/auth.html"));
        map.insert(
            "mails/auth/confirm-email",
            include_str!("../resources/templates/mails/auth/confirm-email.html"),
        );
        map.insert(
            "mails/auth/renew-password",
            include_str!("../resources/templates/mails/auth/renew-password.html"),
        );
        map.insert(
            "mails/auth/password-updated",
            include_str!("../resources/templates/mails/auth/password-updated.html"),
        );
        map
    };
}

pub struct TemplateEngine {
    src_paths: Vec<PathBuf>,
    extension: String,
    data: serde_json::Map<String, Value>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// 只使用内置模板的引擎
    pub fn new() -> Self {
        Self {
            src_paths: Vec::new(),
            extension: ".html".to_string(),
            data: serde_json::Map::new(),
        }
    }

    /// 添加模板目录，目录必须存在
    pub fn add_src_path(&mut self, path: impl AsRef<Path>) -> Result<&mut Self, Exception> {
        let path = path.as_ref();
        if !path.is_dir() {
            error!("模板目录{}不存在", path.display());
            return Err(Exception::TemplateNotFound);
        }
        self.src_paths.insert(0, path.to_path_buf());
        Ok(self)
    }

    pub fn set_file_extension(&mut self, extension: &str) -> &mut Self {
        self.extension = extension.to_string();
        self
    }

    /// 设置所有模板共享的变量
    pub fn share(&mut self, key: &str, value: Value) -> &mut Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// 渲染模板，`data` 应为 JSON 对象，与共享变量合并后使用
    pub fn render(&self, name: &str, data: &Value) -> Result<String, Exception> {
        let source = self.load(name)?;
        let mut scope = self.data.clone();
        if let Value::Object(map) = data {
            for (k, v) in map {
                scope.insert(k.clone(), v.clone());
            }
        }
        Ok(render_str(&source, &Value::Object(scope)))
    }

    fn load(&self, name: &str) -> Result<String, Exception> {
        let name = name.trim_start_matches('/');
        for src in &self.src_paths {
            let full = src.join(format!("{}{}", name, self.extension));
            if full.is_file() {
                debug!("使用模板文件{}", full.display());
                return fs::read_to_string(&full).map_err(|e| {
                    error!("读取模板{}失败：{}", full.display(), e);
                    Exception::TemplateNotFound
                });
            }
        }
        match BUILTIN_TEMPLATES.get(name) {
            Some(s) => Ok(s.to_string()),
            None => {
                error!("找不到模板{}", name);
                Err(Exception::TemplateNotFound)
            }
        }
    }
}

/// 按上述语法渲染一段模板文本
pub fn render_str(source: &str, scope: &Value) -> String {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let tag = &rest[start..];

        // {{{ raw }}}
        if let Some(inner) = tag.strip_prefix("{{{") {
            match inner.find("}}}") {
                Some(end) => {
                    output.push_str(&to_text(lookup(scope, inner[..end].trim())));
                    rest = &inner[end + 3..];
                }
                None => {
                    output.push_str(tag);
                    rest = "";
                }
            }
            continue;
        }

        let inner = &tag[2..];
        let end = match inner.find("}}") {
            Some(e) => e,
            None => {
                output.push_str(tag);
                rest = "";
                continue;
            }
        };
        let expr = inner[..end].trim();
        let after = &inner[end + 2..];

        if let Some(key) = expr
            .strip_prefix('#')
            .map(|k| (k.trim(), true))
            .or_else(|| expr.strip_prefix('^').map(|k| (k.trim(), false)))
        {
            let (key, positive) = key;
            let closing = format!("{{{{/{}}}}}", key);
            match after.find(&closing) {
                Some(close) => {
                    let section = &after[..close];
                    if is_truthy(lookup(scope, key)) == positive {
                        output.push_str(&render_str(section, scope));
                    }
                    rest = &after[close + closing.len()..];
                }
                None => {
                    // 没有闭合标签，丢弃该标签
                    rest = after;
                }
            }
            continue;
        }

        if expr.starts_with('/') {
            // 多余的闭合标签
            rest = after;
            continue;
        }

        output.push_str(&escape_html(&to_text(lookup(scope, expr))));
        rest = after;
    }
    output.push_str(rest);
    output
}

fn lookup<'a>(scope: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = scope;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_variables_are_escaped() {
        let out = render_str("Hi {{ name }}!", &json!({"name": "<b>Bob</b>"}));
        assert_eq!(out, "Hi &lt;b&gt;Bob&lt;/b&gt;!");
    }

    #[test]
    fn test_raw_variables() {
        let out = render_str("{{{ html }}}", &json!({"html": "<b>x</b>"}));
        assert_eq!(out, "<b>x</b>");
    }

    #[test]
    fn test_nested_lookup_and_missing() {
        let out = render_str("{{ user.name }}/{{ nope }}/{{ n }}", &json!({"user": {"name": "Al"}, "n": 3}));
        assert_eq!(out, "Al//3");
    }

    #[test]
    fn test_sections() {
        let tpl = "{{#error}}<p>{{ error }}</p>{{/error}}{{^error}}ok{{/error}}";
        assert_eq!(render_str(tpl, &json!({"error": "bad"})), "<p>bad</p>");
        assert_eq!(render_str(tpl, &json!({"error": ""})), "ok");
        assert_eq!(render_str(tpl, &json!({})), "ok");
    }

    #[test]
    fn test_nested_sections() {
        let tpl = "{{#a}}A{{#b}}B{{/b}}{{/a}}";
        assert_eq!(render_str(tpl, &json!({"a": true, "b": true})), "AB");
        assert_eq!(render_str(tpl, &json!({"a": true, "b": false})), "A");
        assert_eq!(render_str(tpl, &json!({"a": false, "b": true})), "");
    }

    #[test]
    fn test_unclosed_tag_is_literal() {
        assert_eq!(render_str("a {{ b", &json!({})), "a {{ b");
    }

    #[test]
    fn test_builtin_fallback() {
        let engine = TemplateEngine::new();
        let html = engine
            .render("auth", &json!({"screen_login": true, "appname": "Demo"}))
            .unwrap();
        assert!(html.contains("Demo"));
        assert!(html.contains("name=\"username\""));
    }

    #[test]
    fn test_src_path_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("auth.html"), "custom {{ appname }}").unwrap();

        let mut engine = TemplateEngine::new();
        engine.add_src_path(dir.path()).unwrap();
        engine.share("appname", json!("Demo"));
        assert_eq!(engine.render("auth", &json!({})).unwrap(), "custom Demo");
    }

    #[test]
    fn test_last_added_path_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fs::write(first.path().join("page.html"), "first").unwrap();
        fs::write(second.path().join("page.html"), "second").unwrap();

        let mut engine = TemplateEngine::new();
        engine.add_src_path(first.path()).unwrap();
        engine.add_src_path(second.path()).unwrap();
        assert_eq!(engine.render("page", &json!({})).unwrap(), "second");
    }

    #[test]
    fn test_missing_template() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine.render("nope", &json!({})).unwrap_err(),
            Exception::TemplateNotFound
        );
    }

    #[test]
    fn test_missing_src_path() {
        let mut engine = TemplateEngine::new();
        assert!(engine.add_src_path("/no/such/dir").is_err());
    }
}
