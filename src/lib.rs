pub mod auth;
pub mod cache;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod exception;
pub mod kernel;
pub mod mailer;
pub mod param;
pub mod request;
pub mod response;
pub mod router;
pub mod session;
pub mod site;
pub mod template;
pub mod util;

pub use cache::HttpCache;
pub use config::Config;
pub use controller::{Context, Controller};
pub use exception::{AuthenticateException, Exception, HttpException};
pub use kernel::Kernel;
pub use param::{HttpEncoding, HttpRequestMethod, HttpVersion};
pub use request::Request;
pub use response::Response;
pub use router::{Route, Router};
pub use util::HtmlBuilder;
