use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Request, Service, ServiceError};
use crate::codec::{TypeRegistry, Typed, TypedPayload};

type MethodFuture =
    Pin<Box<dyn Future<Output = Result<TypedPayload, ServiceError>> + Send + 'static>>;

type MethodFn = Arc<dyn Fn(Request) -> MethodFuture + Send + Sync>;

struct Method {
    handler: MethodFn,
    register: fn(&mut TypeRegistry),
}

fn register_type<T: Typed>(types: &mut TypeRegistry) {
    types.register::<T>();
}

/// [`Service`] assembled from one async closure per method.
///
/// ```
/// use pubsub_rpc::MethodRouter;
///
/// #[derive(Clone, PartialEq, prost::Message)]
/// struct Echo {
///     #[prost(string, tag = "1")]
///     text: String,
/// }
/// impl prost::Name for Echo {
///     const NAME: &'static str = "Echo";
///     const PACKAGE: &'static str = "demo";
/// }
///
/// let service = MethodRouter::new("EchoService")
///     .method("echo", |req: Echo| async move { Ok::<_, pubsub_rpc::ServiceError>(req) });
/// ```
pub struct MethodRouter {
    name: String,
    methods: HashMap<String, Method>,
}

impl MethodRouter {
    /// Router for the service `name` with no methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method taking `Req` and answering with `Rep`.
    pub fn method<Req, Rep, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Req: Typed,
        Rep: Typed,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rep, ServiceError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: MethodFn = Arc::new(move |request: Request| -> MethodFuture {
            let f = f.clone();
            Box::pin(async move {
                let req = request.into_inner::<Req>()?;
                let rep = f(req).await?;
                Ok::<_, ServiceError>(TypedPayload::encode(&rep))
            })
        });
        self.methods.insert(
            name.into(),
            Method {
                handler,
                register: register_type::<Req>,
            },
        );
        self
    }

    /// Names of the routed methods.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

#[async_trait]
impl Service for MethodRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_types(&self, types: &mut TypeRegistry) {
        for method in self.methods.values() {
            (method.register)(types);
        }
    }

    async fn call_method(&self, request: Request) -> Result<TypedPayload, ServiceError> {
        let Some(method) = self.methods.get(request.method()) else {
            return Err(ServiceError::unknown_method(request.method()));
        };
        let handler = method.handler.clone();
        handler(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::FailureCode;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Text {
        #[prost(string, tag = "1")]
        value: String,
    }

    impl prost::Name for Text {
        const NAME: &'static str = "Text";
        const PACKAGE: &'static str = "test";
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Len {
        #[prost(uint64, tag = "1")]
        value: u64,
    }

    impl prost::Name for Len {
        const NAME: &'static str = "Len";
        const PACKAGE: &'static str = "test";
    }

    fn router() -> MethodRouter {
        MethodRouter::new("Strings")
            .method("upper", |req: Text| async move {
                Ok(Text {
                    value: req.value.to_uppercase(),
                })
            })
            .method("len", |req: Text| async move {
                Ok(Len {
                    value: req.value.len() as u64,
                })
            })
    }

    fn request(method: &str, text: &str) -> Request {
        Request::new(
            method.into(),
            TypedPayload::encode(&Text { value: text.into() }),
            None,
        )
    }

    #[tokio::test]
    async fn routes_by_method_name() {
        let router = router();
        let reply = router.call_method(request("len", "four")).await.unwrap();
        assert_eq!(reply.decode::<Len>().unwrap().value, 4);

        let reply = router.call_method(request("upper", "ab")).await.unwrap();
        assert_eq!(reply.decode::<Text>().unwrap().value, "AB");
    }

    #[tokio::test]
    async fn unknown_method_and_wrong_type() {
        let router = router();
        let err = router.call_method(request("nope", "x")).await.unwrap_err();
        assert_eq!(err.code, FailureCode::UnknownMethod);

        let wrong = Request::new("upper".into(), TypedPayload::encode(&Len { value: 1 }), None);
        let err = router.call_method(wrong).await.unwrap_err();
        assert_eq!(err.code, FailureCode::BadRequest);
    }

    #[test]
    fn registers_request_types() {
        let mut types = TypeRegistry::new();
        router().register_types(&mut types);
        assert!(types.contains("test.Text"));
        assert!(!types.contains("test.Len"));
    }
}
