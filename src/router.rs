//! 约定式路由
//!
//! 路径 `/foo-bar/baz` 依次尝试 `<ns>::FooBarController`、`webgate::FooBarController`，
//! 找不到时把 `FooBar` 当作子命名空间继续匹配 `baz`。匹配段之后的部分作为参数传给控制器。

use std::collections::HashMap;

use log::debug;

use crate::{
    controller::{Controller, ControllerFactory},
    exception::HttpException,
    param::{BUILTIN_NAMESPACE, CONTROLLER_SUFFIX},
};

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// 已被控制器消费的路径部分，如 `admin/users/`
    pub routed_path: String,
    /// 去掉前缀与查询串后的请求路径
    pub requested_path: String,
    pub controller: Option<String>,
    pub args: Vec<String>,
}

pub struct Router {
    namespace: String,
    base_uri: String,
    registry: HashMap<String, ControllerFactory>,
}

impl Router {
    pub fn new(namespace: &str, base_uri: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            base_uri: base_uri.trim_end_matches('/').to_string(),
            registry: HashMap::new(),
        }
    }

    /// 注册控制器，`id` 形如 `app::Admin::UsersController`
    pub fn register(&mut self, id: &str, factory: ControllerFactory) -> &mut Self {
        self.registry.insert(id.to_string(), factory);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn instantiate(&self, id: &str) -> Option<Box<dyn Controller>> {
        self.registry.get(id).map(|factory| factory())
    }

    pub fn resolve(&self, path: &str) -> Route {
        let path = path.split('?').next().unwrap_or("");
        let path = path.strip_prefix(self.base_uri.as_str()).unwrap_or(path);
        let requested_path = path.trim_matches('/').to_string();
        let segments: Vec<&str> = requested_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let index = format!("{}::Index{}", self.namespace, CONTROLLER_SUFFIX);
        if segments.is_empty() {
            return Route {
                routed_path: String::new(),
                controller: self.contains(&index).then_some(index),
                requested_path,
                args: Vec::new(),
            };
        }

        let mut ns = self.namespace.clone();
        for (i, segment) in segments.iter().enumerate() {
            let name = pascal_case(segment);
            let candidates = [
                format!("{}::{}{}", ns, name, CONTROLLER_SUFFIX),
                format!("{}::{}{}", BUILTIN_NAMESPACE, name, CONTROLLER_SUFFIX),
            ];
            if let Some(id) = candidates.into_iter().find(|id| self.contains(id)) {
                return self.matched(&requested_path, &segments, i + 1, id);
            }

            // 子命名空间的 IndexController 同样消耗当前段
            let ns_index = format!("{}::Index{}", ns, CONTROLLER_SUFFIX);
            if ns != self.namespace && self.contains(&ns_index) {
                return self.matched(&requested_path, &segments, i + 1, ns_index);
            }
            ns = format!("{}::{}", ns, name);
        }

        debug!("没有与{}匹配的控制器", requested_path);
        Route {
            routed_path: String::new(),
            requested_path,
            controller: None,
            args: Vec::new(),
        }
    }

    /// 与 `resolve` 相同，但找不到控制器时返回 404
    pub fn dispatch(&self, path: &str) -> Result<Route, HttpException> {
        let route = self.resolve(path);
        if route.controller.is_none() {
            return Err(HttpException::new(
                404,
                format!("No suitable controller found for \"{}\".", route.requested_path),
            ));
        }
        Ok(route)
    }

    fn matched(&self, requested_path: &str, segments: &[&str], consumed: usize, id: String) -> Route {
        let routed_path = segments[..consumed]
            .iter()
            .map(|s| format!("{}/", s.to_lowercase()))
            .collect();
        debug!("路由{}匹配{}", requested_path, id);
        Route {
            routed_path,
            requested_path: requested_path.to_string(),
            controller: Some(id),
            args: segments[consumed..].iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// `foo-bar_baz` → `FooBarBaz`
pub fn pascal_case(segment: &str) -> String {
    segment
        .split(|c| c == '-' || c == '_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
