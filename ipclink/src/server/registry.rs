//! Endpoint registry: name → handler.
//!
//! Handlers come from two sources:
//! - direct registrations on the server (`Handler::Plain`)
//! - components that declare routes bound to themselves
//!   (`Handler::BoundToComponent`)
//!
//! The variant is chosen when the route is registered, never inferred at
//! call time. Name collisions resolve as last write wins.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use super::request::Request;
use crate::error::{DispatchError, HandlerError};

pub type HandlerFuture = BoxFuture<'static, Result<Value, DispatchError>>;
pub type PlainFn = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;
pub type ComponentRef = Arc<dyn Any + Send + Sync>;
pub type BoundFn = Arc<dyn Fn(ComponentRef, Request) -> HandlerFuture + Send + Sync>;

/// An invocable endpoint.
#[derive(Clone)]
pub enum Handler {
    Plain(PlainFn),
    BoundToComponent { call: BoundFn, component: ComponentRef },
}

impl Handler {
    /// Wrap an async function returning any serializable value.
    pub fn plain<F, Fut, T>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + 'static,
    {
        Self::Plain(Arc::new(move |request: Request| {
            let fut = f(request);
            async move { into_wire_value(fut.await) }.boxed()
        }))
    }

    pub fn invoke(&self, request: Request) -> HandlerFuture {
        match self {
            Self::Plain(call) => call(request),
            Self::BoundToComponent { call, component } => call(Arc::clone(component), request),
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Self::BoundToComponent { .. })
    }
}

/// Convert a handler's outcome into a wire value, separating handler
/// failures from values that cannot be represented as JSON.
fn into_wire_value<T: Serialize>(
    outcome: Result<T, HandlerError>,
) -> Result<Value, DispatchError> {
    let value = outcome.map_err(DispatchError::Handler)?;
    serde_json::to_value(value).map_err(|e| DispatchError::Encode(e.into()))
}

/// One named entry in the registry.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub handler: Handler,
    /// Name of the component that declared the route, if any.
    pub owner: Option<String>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("bound", &self.handler.is_bound())
            .field("owner", &self.owner)
            .finish()
    }
}

/// A host sub-component exposing endpoints bound to itself.
pub trait Component: Send + Sync + Sized + 'static {
    /// Name recorded as the owner of this component's routes.
    fn component_name(&self) -> String {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full).to_string()
    }

    /// Declare the component's IPC routes.
    fn ipc_routes(routes: &mut ComponentRoutes<Self>);
}

/// Route collector handed to [`Component::ipc_routes`].
pub struct ComponentRoutes<C> {
    routes: Vec<(String, BoundFn)>,
    _component: PhantomData<fn() -> C>,
}

impl<C: Component> ComponentRoutes<C> {
    fn new() -> Self {
        Self {
            routes: Vec::new(),
            _component: PhantomData,
        }
    }

    pub fn route<F, Fut, T>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<C>, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + 'static,
    {
        let call: BoundFn = Arc::new(move |component: ComponentRef, request: Request| {
            match component.downcast::<C>() {
                Ok(component) => {
                    let fut = f(component, request);
                    async move { into_wire_value(fut.await) }.boxed()
                }
                Err(_) => async {
                    Err(DispatchError::Handler(HandlerError::new(
                        "ComponentMismatch",
                        "route invoked with a component of the wrong type",
                    )))
                }
                .boxed(),
            }
        });
        self.routes.push((name.into(), call));
        self
    }
}

#[derive(Clone, Default)]
pub struct EndpointRegistry {
    routes: HashMap<String, Registration>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler; returns the registration it replaced, if any.
    pub fn register(&mut self, name: impl Into<String>, handler: Handler) -> Option<Registration> {
        self.insert(Registration {
            name: name.into(),
            handler,
            owner: None,
        })
    }

    /// Register a plain async function.
    pub fn route<F, Fut, T>(&mut self, name: impl Into<String>, f: F) -> Option<Registration>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
        T: Serialize + 'static,
    {
        self.register(name, Handler::plain(f))
    }

    /// Register every route a component declares, bound to that instance.
    /// Returns how many routes were registered.
    pub fn register_component<C: Component>(&mut self, component: Arc<C>) -> usize {
        let mut routes = ComponentRoutes::<C>::new();
        C::ipc_routes(&mut routes);

        let owner = component.component_name();
        let component: ComponentRef = component;
        let count = routes.routes.len();
        for (name, call) in routes.routes {
            self.insert(Registration {
                name,
                handler: Handler::BoundToComponent {
                    call,
                    component: Arc::clone(&component),
                },
                owner: Some(owner.clone()),
            });
        }
        tracing::debug!(component = %owner, routes = count, "Registered component routes");
        count
    }

    /// Move every registration of `other` into this registry.
    pub fn merge(&mut self, other: EndpointRegistry) {
        for (_, registration) in other.routes {
            self.insert(registration);
        }
    }

    fn insert(&mut self, registration: Registration) -> Option<Registration> {
        let previous = self
            .routes
            .insert(registration.name.clone(), registration);
        if let Some(ref prev) = previous {
            tracing::debug!(endpoint = %prev.name, "Endpoint re-registered, last write wins");
        }
        previous
    }

    pub fn resolve(&self, name: &str) -> Option<&Registration> {
        self.routes.get(name)
    }

    /// Registered endpoint names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Stats {
        members: u64,
        calls: AtomicUsize,
    }

    impl Component for Stats {
        fn ipc_routes(routes: &mut ComponentRoutes<Self>) {
            routes
                .route("member_count", |stats: Arc<Stats>, _req| async move {
                    stats.calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HandlerError>(stats.members)
                })
                .route("add", |stats: Arc<Stats>, req: Request| async move {
                    let n: u64 = req.require("n")?;
                    Ok::<_, HandlerError>(stats.members + n)
                });
        }
    }

    fn empty() -> Request {
        Request::new("t", Map::new())
    }

    #[tokio::test]
    async fn plain_handler_invokes() {
        let mut registry = EndpointRegistry::new();
        registry.route("echo", |req: Request| async move {
            Ok::<_, HandlerError>(Value::Object(req.into_data()))
        });

        let reg = registry.resolve("echo").unwrap();
        assert!(!reg.handler.is_bound());
        assert!(reg.owner.is_none());

        let mut data = Map::new();
        data.insert("a".into(), json!(1));
        let out = reg.handler.invoke(Request::new("echo", data)).await.unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn component_routes_are_bound() {
        let stats = Arc::new(Stats {
            members: 10,
            calls: AtomicUsize::new(0),
        });
        let mut registry = EndpointRegistry::new();
        assert_eq!(registry.register_component(Arc::clone(&stats)), 2);

        let reg = registry.resolve("member_count").unwrap();
        assert!(reg.handler.is_bound());
        assert_eq!(reg.owner.as_deref(), Some("Stats"));

        assert_eq!(reg.handler.invoke(empty()).await.unwrap(), json!(10));
        assert_eq!(stats.calls.load(Ordering::SeqCst), 1);

        let mut data = Map::new();
        data.insert("n".into(), json!(5));
        let add = registry.resolve("add").unwrap();
        assert_eq!(add.handler.invoke(Request::new("add", data)).await.unwrap(), json!(15));
    }

    #[tokio::test]
    async fn handler_error_and_encode_error_are_distinct() {
        let mut registry = EndpointRegistry::new();
        registry.route("fails", |_req| async {
            Err::<Value, _>(HandlerError::new("ValueError", "bad input"))
        });
        registry.route("unencodable", |_req| async {
            let mut map = HashMap::new();
            map.insert((1, 2), "tuple keys are not JSON");
            Ok::<_, HandlerError>(map)
        });

        let err = registry.resolve("fails").unwrap().handler.invoke(empty()).await;
        assert!(matches!(err, Err(DispatchError::Handler(ref e)) if e.category() == "ValueError"));

        let err = registry
            .resolve("unencodable")
            .unwrap()
            .handler
            .invoke(empty())
            .await;
        assert!(matches!(err, Err(DispatchError::Encode(_))));
    }

    #[test]
    fn last_write_wins() {
        let mut registry = EndpointRegistry::new();
        assert!(registry.route("x", |_req| async { Ok::<_, HandlerError>(1) }).is_none());
        assert!(registry.route("x", |_req| async { Ok::<_, HandlerError>(2) }).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn merge_does_not_duplicate() {
        let mut base = EndpointRegistry::new();
        base.route("a", |_req| async { Ok::<_, HandlerError>(()) });

        let mut staged = EndpointRegistry::new();
        staged.route("a", |_req| async { Ok::<_, HandlerError>(()) });
        staged.route("b", |_req| async { Ok::<_, HandlerError>(()) });

        base.merge(staged.clone());
        base.merge(staged);
        assert_eq!(base.names(), vec!["a", "b"]);
    }
}
