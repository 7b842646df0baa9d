//! Operation handlers keyed by [`OperationKey`].

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::codec::{
    Arguments, ExecutionContext, OperationDefinition, OperationKey, Returned, SchemaRegistry,
};
use crate::error::{Fault, Result, RpcError};

/// What a handler knows about the request it is serving
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Operation being invoked
    pub key: OperationKey,
    /// Caller-supplied execution context
    pub context: ExecutionContext,
    /// Server-side session id
    pub session_id: String,
    /// Peer address
    pub remote_addr: SocketAddr,
}

/// Result a handler produces
pub type HandlerResult = std::result::Result<Returned, Fault>;

/// Application logic for one operation
pub trait OperationHandler: Send + Sync + 'static {
    /// Handle one request.
    fn handle(&self, request: RequestContext, args: Arguments) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> OperationHandler for F
where
    F: Fn(RequestContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(
        &self,
        request: RequestContext,
        args: Arguments,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(request, args))
    }
}

/// A registered handler together with its local definition
#[derive(Clone)]
pub(crate) struct RegisteredOperation {
    pub definition: OperationDefinition,
    pub handler: Arc<dyn OperationHandler>,
}

/// Maps operation keys to handlers
pub struct OperationRegistry {
    schemas: Arc<SchemaRegistry>,
    handlers: HashMap<OperationKey, RegisteredOperation>,
}

impl OperationRegistry {
    /// Create an empty registry over `schemas`.
    pub fn new(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            schemas,
            handlers: HashMap::new(),
        }
    }

    /// Schemas used to bind arguments.
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Register `handler` for `key`. The key must have a definition in the
    /// schema registry. A second registration replaces the first.
    pub fn register(&mut self, key: OperationKey, handler: impl OperationHandler) -> Result<()> {
        let definition = self.schemas.require_operation(&key)?.clone();
        if self
            .handlers
            .insert(
                key.clone(),
                RegisteredOperation {
                    definition,
                    handler: Arc::new(handler),
                },
            )
            .is_some()
        {
            tracing::debug!(operation = %key, "Replaced operation handler");
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, key: &OperationKey) -> Result<&RegisteredOperation> {
        self.handlers
            .get(key)
            .ok_or_else(|| RpcError::UnknownOperation(key.to_string()))
    }

    /// Registered keys.
    pub fn keys(&self) -> impl Iterator<Item = &OperationKey> {
        self.handlers.keys()
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no operation is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldDescriptor, TypeTag};

    fn key() -> OperationKey {
        OperationKey::new("Echo", "1", "echo")
    }

    fn registry() -> OperationRegistry {
        let schemas = SchemaRegistry::new().with_operation(
            OperationDefinition::new(key())
                .param(FieldDescriptor::mandatory("text", TypeTag::Str))
                .returns(TypeTag::Str),
        );
        OperationRegistry::new(Arc::new(schemas))
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut ops = registry();
        ops.register(key(), |_req: RequestContext, args: Arguments| async move {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(Returned::value(text))
        })
        .unwrap();

        let op = ops.lookup(&key()).unwrap();
        let request = RequestContext {
            key: key(),
            context: ExecutionContext::new(),
            session_id: "s".to_string(),
            remote_addr: "127.0.0.1:1".parse().unwrap(),
        };
        let returned = op
            .handler
            .handle(request, Arguments::new().with("text", "hi"))
            .await
            .unwrap();
        assert_eq!(returned.value.as_str(), Some("hi"));
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_register_requires_definition() {
        let mut ops = registry();
        let err = ops
            .register(
                OperationKey::new("Echo", "1", "missing"),
                |_r: RequestContext, _a: Arguments| async { Ok(Returned::void()) },
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownOperation(_)));
    }

    #[test]
    fn test_lookup_unknown() {
        let ops = registry();
        assert!(matches!(ops.lookup(&key()), Err(RpcError::UnknownOperation(_))));
    }
}
