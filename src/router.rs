//! API 路由表：按注册顺序匹配路径与方法，首个匹配生效。

use axum::http::Method;
use std::collections::HashMap;

/// Every API operation the dispatcher knows how to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    Login,
    Logout,
    AuthCheck,
    GetStats,
    RecordVisit,
    GenericGet,
    GenericSave,
    GetLegalDocument,
    GetProducts,
    GetProduct,
    Upload,
    DeleteUpload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Clone, Debug)]
pub struct Route {
    segments: Vec<Segment>,
    methods: Vec<Method>,
    handler: Handler,
    auth_required: bool,
    context: Vec<(String, String)>,
}

impl Route {
    fn new(
        pattern: &str,
        methods: &[Method],
        handler: Handler,
        auth_required: bool,
        context: &[(&str, &str)],
    ) -> Self {
        let segments = split_path(pattern)
            .map(|segment| {
                match segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self {
            segments,
            methods: methods.to_vec(),
            handler,
            auth_required,
            context: context
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    /// 方法与路径都匹配时返回捕获的参数。
    fn matches(&self, path: &str, method: &Method) -> Option<HashMap<String, String>> {
        if !self.methods.contains(method) {
            return None;
        }
        let parts = split_path(path).collect::<Vec<_>>();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Param(name) if !part.is_empty() => {
                    params.insert(name.clone(), part.to_string());
                }
                _ => return None,
            }
        }
        Some(params)
    }
}

/// `"/api/shop/products"` → `["api", "shop", "products"]`. Empty segments
/// are kept so `"/api//x"` never matches a two-segment pattern.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    pub handler: Handler,
    pub params: HashMap<String, String>,
    pub auth_required: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ApiRouter {
    routes: Vec<Route>,
}

impl ApiRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        pattern: &str,
        methods: &[Method],
        handler: Handler,
        auth_required: bool,
        context: &[(&str, &str)],
    ) -> &mut Self {
        self.routes.push(Route::new(
            pattern,
            methods,
            handler,
            auth_required,
            context,
        ));
        self
    }

    pub fn get(
        &mut self,
        pattern: &str,
        handler: Handler,
        auth_required: bool,
        context: &[(&str, &str)],
    ) -> &mut Self {
        self.add(pattern, &[Method::GET], handler, auth_required, context)
    }

    pub fn post(
        &mut self,
        pattern: &str,
        handler: Handler,
        auth_required: bool,
        context: &[(&str, &str)],
    ) -> &mut Self {
        self.add(pattern, &[Method::POST], handler, auth_required, context)
    }

    pub fn put(
        &mut self,
        pattern: &str,
        handler: Handler,
        auth_required: bool,
        context: &[(&str, &str)],
    ) -> &mut Self {
        self.add(pattern, &[Method::PUT], handler, auth_required, context)
    }

    pub fn delete(
        &mut self,
        pattern: &str,
        handler: Handler,
        auth_required: bool,
        context: &[(&str, &str)],
    ) -> &mut Self {
        self.add(pattern, &[Method::DELETE], handler, auth_required, context)
    }

    /// 查找首个匹配的路由；静态上下文覆盖同名路径参数。
    pub fn resolve(&self, path: &str, method: &Method) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            let mut params = route.matches(path, method)?;
            params.extend(route.context.iter().cloned());
            Some(RouteMatch {
                handler: route.handler,
                params,
                auth_required: route.auth_required,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Content collections served by the generic GET/POST/PUT handlers.
const GENERIC_RESOURCES: &[(&str, &str)] = &[
    ("/api/masters", "masters"),
    ("/api/services", "services"),
    ("/api/articles", "articles"),
    ("/api/faq", "faq"),
    ("/api/social", "social"),
    ("/api/legal", "legal"),
    ("/api/shop/categories", "shop-categories"),
];

/// 生产环境的完整路由表。
pub fn api_router() -> ApiRouter {
    let mut router = ApiRouter::new();
    router
        .post("/api/auth/login", Handler::Login, false, &[])
        .post("/api/auth/logout", Handler::Logout, false, &[])
        .post("/api/auth/check", Handler::AuthCheck, false, &[])
        .get("/api/stats", Handler::GetStats, false, &[])
        .post("/api/stats/visit", Handler::RecordVisit, false, &[]);

    for (pattern, resource) in GENERIC_RESOURCES {
        let context = [("resource", *resource)];
        router.get(pattern, Handler::GenericGet, false, &context);
        if *resource == "legal" {
            router.get("/api/legal/{slug}", Handler::GetLegalDocument, false, &[]);
        }
        router
            .post(pattern, Handler::GenericSave, true, &context)
            .put(pattern, Handler::GenericSave, true, &context);
    }

    let products = [("resource", "shop-products")];
    router
        .get("/api/shop/products", Handler::GetProducts, false, &[])
        .get("/api/shop/products/{id}", Handler::GetProduct, false, &[])
        .post("/api/shop/products", Handler::GenericSave, true, &products)
        .put("/api/shop/products", Handler::GenericSave, true, &products)
        .post("/api/upload", Handler::Upload, true, &[])
        .delete("/api/upload/{filename}", Handler::DeleteUpload, true, &[]);
    router
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_param_segments() {
        let mut router = ApiRouter::new();
        router.get("/api/legal/{slug}", Handler::GetLegalDocument, false, &[]);

        let matched = router
            .resolve("/api/legal/privacy", &Method::GET)
            .expect("match");
        assert_eq!(matched.handler, Handler::GetLegalDocument);
        assert_eq!(matched.params.get("slug").map(String::as_str), Some("privacy"));

        assert!(router.resolve("/api/legal/", &Method::GET).is_none());
        assert!(router.resolve("/api/legal/a/b", &Method::GET).is_none());
        assert!(router.resolve("/api/legal/privacy", &Method::POST).is_none());
    }

    #[test]
    fn first_registered_route_wins() {
        let mut router = ApiRouter::new();
        router
            .get("/api/shop/products/{id}", Handler::GetProduct, false, &[])
            .get("/api/shop/products/featured", Handler::GetProducts, true, &[]);

        let matched = router
            .resolve("/api/shop/products/featured", &Method::GET)
            .expect("match");
        assert_eq!(matched.handler, Handler::GetProduct);
        assert!(!matched.auth_required);
    }

    #[test]
    fn context_overrides_captured_params() {
        let mut router = ApiRouter::new();
        router.add(
            "/api/{resource}",
            &[Method::GET, Method::PUT],
            Handler::GenericGet,
            false,
            &[("resource", "faq")],
        );
        let matched = router.resolve("/api/masters", &Method::PUT).expect("match");
        assert_eq!(matched.params.get("resource").map(String::as_str), Some("faq"));
    }

    #[test]
    fn production_table() {
        let router = api_router();

        let save = router
            .resolve("/api/shop/categories", &Method::PUT)
            .expect("save categories");
        assert_eq!(save.handler, Handler::GenericSave);
        assert!(save.auth_required);
        assert_eq!(
            save.params.get("resource").map(String::as_str),
            Some("shop-categories")
        );

        let legal = router.resolve("/api/legal/terms", &Method::GET).expect("legal");
        assert_eq!(legal.handler, Handler::GetLegalDocument);
        assert!(!legal.auth_required);

        let delete = router
            .resolve("/api/upload/abc.png", &Method::DELETE)
            .expect("delete");
        assert_eq!(delete.handler, Handler::DeleteUpload);
        assert!(delete.auth_required);

        let products = router
            .resolve("/api/shop/products", &Method::POST)
            .expect("save products");
        assert_eq!(
            products.params.get("resource").map(String::as_str),
            Some("shop-products")
        );

        assert!(router.resolve("/api/masters", &Method::DELETE).is_none());
        assert!(router.resolve("/api/unknown", &Method::GET).is_none());
        assert!(router.resolve("/api/stats", &Method::POST).is_none());
        assert_eq!(router.len(), 33);
        assert!(!router.is_empty());
        assert!(ApiRouter::default().is_empty());
    }
}
