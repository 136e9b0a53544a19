use std::sync::Arc;

use base64ct::{Base64, Encoding};
use log::debug;

use super::{AuthProvider, User, UserProvider};
use crate::{crypto::HashManager, exception::AuthenticateException, request::Request, session::Session};

/// HTTP Basic 认证
pub struct BasicAuthProvider {
    users: Arc<dyn UserProvider>,
    hasher: Arc<HashManager>,
    realm: String,
}

impl BasicAuthProvider {
    pub fn new(users: Arc<dyn UserProvider>, hasher: Arc<HashManager>, realm: &str) -> Self {
        Self {
            users,
            hasher,
            realm: realm.to_string(),
        }
    }

    fn check(&self, request: &Request) -> Result<User, String> {
        let encoded = request
            .header("authorization")
            .and_then(|h| h.strip_prefix("Basic "))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                "Missing \"Authorization\" header or wrong syntax (\"Basic ...\").".to_string()
            })?;

        let decoded = Base64::decode_vec(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| "Malformed credentials.".to_string())?;

        // 密码中允许出现冒号
        let (username, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));

        let user = self
            .users
            .get_by_username(username)
            .ok_or_else(|| "Unknown user".to_string())?;

        if !self.hasher.check(password, user.password()) {
            debug!("Basic认证失败：{}的密码不匹配", username);
            return Err("Unknown user".to_string());
        }
        Ok(user)
    }
}

impl AuthProvider for BasicAuthProvider {
    fn authenticate(&self, request: &Request, _session: &Session) -> Result<User, AuthenticateException> {
        self.check(request).map_err(|message| {
            AuthenticateException::new(message)
                .with_header("WWW-Authenticate", format!("Basic realm=\"{}\"", self.realm))
        })
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserArrayProvider;
    use crate::config::UserEntry;
    use std::collections::HashMap;

    fn provider() -> BasicAuthProvider {
        let users = UserArrayProvider::new(vec![UserEntry {
            id: 1,
            key: String::new(),
            username: "alice".to_string(),
            password: "pa:ss".to_string(),
            can_login: true,
            attributes: HashMap::new(),
        }]);
        BasicAuthProvider::new(Arc::new(users), Arc::new(HashManager::plaintext()), "Demo")
    }

    fn request(authorization: Option<&str>) -> Request {
        let raw = match authorization {
            Some(a) => format!("GET /api HTTP/1.1\r\nAuthorization: {}\r\n\r\n", a),
            None => "GET /api HTTP/1.1\r\n\r\n".to_string(),
        };
        Request::try_from(raw.as_bytes(), 0).unwrap()
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", Base64::encode_string(credentials.as_bytes()))
    }

    #[test]
    fn test_valid_credentials() {
        let user = provider()
            .authenticate(&request(Some(&basic("alice:pa:ss"))), &Session::new())
            .unwrap();
        assert_eq!(user.username, "alice");
    }

    #[test]
    fn test_wrong_password_carries_challenge() {
        let err = provider()
            .authenticate(&request(Some(&basic("alice:nope"))), &Session::new())
            .unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(err.message(), "Unknown user");
        assert_eq!(
            err.headers(),
            &vec![("WWW-Authenticate".to_string(), "Basic realm=\"Demo\"".to_string())]
        );
    }

    #[test]
    fn test_missing_header() {
        let err = provider()
            .authenticate(&request(None), &Session::new())
            .unwrap_err();
        assert!(err.message().starts_with("Missing \"Authorization\" header"));
    }

    #[test]
    fn test_unknown_user_and_garbage() {
        let p = provider();
        assert!(p
            .authenticate(&request(Some(&basic("bob:pa:ss"))), &Session::new())
            .is_err());
        assert!(p
            .authenticate(&request(Some("Basic !!!")), &Session::new())
            .is_err());
    }
}
