//! 邮件
//!
//! `Mail` 描述一封待发送的邮件，正文由模板渲染，主题取自模板首行的 `Subject: ...`。
//! 投递由 `Mailer` 负责：`log` 驱动只写日志，`spool` 驱动把邮件写成 `.eml` 文件。

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use serde_json::Value;

use crate::{config::MailerConfig, crypto::random_token, exception::Exception, template::TemplateEngine};

/// 投递失败
#[derive(Debug, Clone, PartialEq)]
pub struct MailError(pub String);

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unable to send mail: {}", self.0)
    }
}

impl std::error::Error for MailError {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mail {
    from: String,
    from_name: String,
    reply_to: Vec<String>,
    to: Vec<String>,
    subject: String,
    body: String,
    is_html: bool,
}

impl Mail {
    pub fn new(from: &str, from_name: &str) -> Self {
        Self {
            from: from.to_string(),
            from_name: from_name.to_string(),
            ..Default::default()
        }
    }

    pub fn add_address(&mut self, address: &str) -> &mut Self {
        self.to.push(address.to_string());
        self
    }

    pub fn add_reply_to(&mut self, address: &str) -> &mut Self {
        self.reply_to.push(address.to_string());
        self
    }

    pub fn set_subject(&mut self, subject: &str) -> &mut Self {
        self.subject = subject.to_string();
        self
    }

    pub fn set_body(&mut self, body: &str, is_html: bool) -> &mut Self {
        self.body = body.to_string();
        self.is_html = is_html;
        self
    }

    /// 渲染 `mails/<template>` 作为 HTML 正文，首行 `Subject: ...` 作为主题
    pub fn set_template_body(
        &mut self,
        templates: &TemplateEngine,
        template: &str,
        vars: &Value,
    ) -> Result<&mut Self, Exception> {
        let rendered = templates.render(&format!("mails/{}", template), vars)?;
        let (subject, body) = match rendered.split_once('\n') {
            Some((first, rest)) if first.starts_with("Subject:") => {
                (first["Subject:".len()..].trim().to_string(), rest.to_string())
            }
            _ => (String::new(), rendered),
        };
        if !subject.is_empty() {
            self.subject = subject;
        }
        self.body = body;
        self.is_html = true;
        Ok(self)
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn is_html(&self) -> bool {
        self.is_html
    }

    /// RFC 5322 格式的邮件文本
    pub fn to_eml(&self) -> String {
        let from = if self.from_name.is_empty() {
            self.from.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from)
        };
        let mut eml = String::new();
        eml.push_str(&format!("From: {}\r\n", from));
        eml.push_str(&format!("To: {}\r\n", self.to.join(", ")));
        if !self.reply_to.is_empty() {
            eml.push_str(&format!("Reply-To: {}\r\n", self.reply_to.join(", ")));
        }
        eml.push_str(&format!("Subject: {}\r\n", self.subject));
        eml.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
        eml.push_str("MIME-Version: 1.0\r\n");
        eml.push_str(&format!(
            "Content-Type: {}; charset=utf-8\r\n\r\n",
            if self.is_html { "text/html" } else { "text/plain" }
        ));
        eml.push_str(&self.body);
        eml
    }
}

/// 邮件投递
pub trait Mailer: Send + Sync {
    fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// 开发用驱动，只记录日志
#[derive(Clone, Debug)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, mail: &Mail) -> Result<(), MailError> {
        if mail.to().is_empty() {
            return Err(MailError("no recipient".to_string()));
        }
        info!("发送邮件至{}：{}", mail.to().join(", "), mail.subject());
        Ok(())
    }
}

/// 把每封邮件写入目录下的 `.eml` 文件
pub struct SpoolMailer {
    dir: PathBuf,
}

impl SpoolMailer {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl Mailer for SpoolMailer {
    fn send(&self, mail: &Mail) -> Result<(), MailError> {
        if mail.to().is_empty() {
            return Err(MailError("no recipient".to_string()));
        }
        fs::create_dir_all(&self.dir).map_err(|e| MailError(e.to_string()))?;
        let name = format!(
            "{}-{}.eml",
            Utc::now().format("%Y%m%d%H%M%S%6f"),
            &random_token()[..8]
        );
        let path = self.dir.join(name);
        fs::write(&path, mail.to_eml()).map_err(|e| {
            error!("写入邮件文件{}失败：{}", path.display(), e);
            MailError(e.to_string())
        })?;
        info!("邮件已写入{}", path.display());
        Ok(())
    }
}

/// 组装并投递邮件的服务
#[derive(Clone)]
pub struct MailService {
    mailer: Arc<dyn Mailer>,
    templates: Arc<TemplateEngine>,
    from: String,
    from_name: String,
    reply_to: String,
}

impl MailService {
    pub fn new(mailer: Arc<dyn Mailer>, templates: Arc<TemplateEngine>, config: &MailerConfig) -> Self {
        Self {
            mailer,
            templates,
            from: config.from.clone(),
            from_name: config.from_name.clone(),
            reply_to: config.replyto.clone(),
        }
    }

    /// 根据 `[mailer] driver` 创建投递驱动
    pub fn driver_from_config(config: &MailerConfig) -> Arc<dyn Mailer> {
        match config.driver.as_str() {
            "spool" => Arc::new(SpoolMailer::new(&config.spool_path)),
            "log" => Arc::new(LogMailer),
            other => {
                error!("未知的邮件驱动{}，使用log驱动", other);
                Arc::new(LogMailer)
            }
        }
    }

    /// 新邮件，已填好发件人与回复地址
    pub fn compose(&self) -> Mail {
        let mut mail = Mail::new(&self.from, &self.from_name);
        if !self.reply_to.is_empty() {
            mail.add_reply_to(&self.reply_to);
        }
        mail
    }

    /// 渲染模板并发送给 `to`
    pub fn send_template(&self, to: &str, template: &str, vars: &Value) -> Result<(), MailError> {
        let mut mail = self.compose();
        mail.add_address(to);
        mail.set_template_body(&self.templates, template, vars)
            .map_err(|e| MailError(e.to_string()))?;
        self.mailer.send(&mail)
    }

    pub fn send(&self, mail: &Mail) -> Result<(), MailError> {
        self.mailer.send(mail)
    }
}
