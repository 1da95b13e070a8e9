//! Method routing on the server side and the call channel on the client side.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use teamserver_core::error::{Error, Result};
use teamserver_core::protocol::{
    CallPayload, ErrorPayload, MessageType, ReplyPayload, bearer_metadata, codes, decode_payload,
};
use teamserver_core::transport::{Connection, read_frame, write_frame};

use crate::auth::{Authenticator, CallOrigin, Caller};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type MethodHandler = Arc<dyn Fn(Caller, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Authenticates every call, then routes it by method name.
pub struct Dispatcher {
    auth: Arc<Authenticator>,
    routes: RwLock<HashMap<String, MethodHandler>>,
}

impl Dispatcher {
    pub fn new(auth: Arc<Authenticator>) -> Self {
        Self {
            auth,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handler` for `method`, replacing any earlier handler.
    pub fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Caller, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |caller: Caller, body: Value| {
            Box::pin(handler(caller, body)) as BoxFuture<'static, Result<Value>>
        });
        self.routes.write().insert(method.to_string(), handler);
    }

    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<_> = self.routes.read().keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Authenticates `call` for `origin` and runs its handler.
    ///
    /// Unauthenticated callers learn nothing about which methods exist.
    pub async fn dispatch(&self, origin: &CallOrigin, call: CallPayload) -> Result<Value> {
        let caller = self.auth.authenticate(origin, &call.metadata)?;
        let handler = self
            .routes
            .read()
            .get(&call.method)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("method {:?}", call.method)))?;
        handler(caller, call.body).await
    }
}

/// Maps an error to the wire code reported to the caller.
#[must_use]
pub fn error_code(err: &Error) -> &'static str {
    match err {
        Error::Authentication => codes::UNAUTHENTICATED,
        Error::NotFound(_) => codes::NOT_FOUND,
        Error::Config(_) | Error::Json(_) | Error::Certificate(_) => codes::INVALID_ARGUMENT,
        _ => codes::INTERNAL,
    }
}

/// Turns an error frame back into an [`Error`] on the client side.
#[must_use]
pub fn error_from_payload(payload: ErrorPayload) -> Error {
    match payload.code.as_str() {
        codes::UNAUTHENTICATED => Error::Authentication,
        codes::NOT_FOUND => Error::NotFound(
            payload
                .message
                .strip_suffix(" not found")
                .unwrap_or(&payload.message)
                .to_string(),
        ),
        _ => Error::Remote {
            code: payload.code,
            message: payload.message,
        },
    }
}

/// A connected, ready-to-call client channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Sends one call and waits for its reply.
    async fn call(&self, method: &str, body: Value) -> Result<Value>;

    /// Half-closes the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// Calls `method` and deserializes the reply body.
pub async fn call_as<T: DeserializeOwned>(
    channel: &dyn Channel,
    method: &str,
    body: Value,
) -> Result<T> {
    let reply = channel.call(method, body).await?;
    Ok(serde_json::from_value(reply)?)
}

struct RpcState<C> {
    conn: C,
    accum: BytesMut,
}

/// [`Channel`] over any [`Connection`]. Calls are serialized: one call is in
/// flight per connection at a time.
pub struct RpcClient<C: Connection> {
    state: tokio::sync::Mutex<RpcState<C>>,
    token: Option<String>,
    next_id: AtomicU64,
}

impl<C: Connection> RpcClient<C> {
    /// `token` is attached as a bearer token to every call; in-process
    /// connections pass `None`.
    pub fn new(conn: C, token: Option<String>) -> Self {
        Self {
            state: tokio::sync::Mutex::new(RpcState {
                conn,
                accum: BytesMut::new(),
            }),
            token,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl<C: Connection> Channel for RpcClient<C> {
    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = CallPayload {
            id,
            method: method.to_string(),
            metadata: self.token.as_deref().map(bearer_metadata).unwrap_or_default(),
            body,
        };

        let mut state = self.state.lock().await;
        let RpcState { conn, accum } = &mut *state;
        write_frame(conn, MessageType::Call, &call)
            .await
            .map_err(|e| Error::transport(&e))?;

        loop {
            let frame = read_frame(conn, accum)
                .await
                .map_err(|e| Error::transport(&e))?
                .ok_or_else(|| Error::Transport("connection closed by server".into()))?;

            match frame.header.msg_type {
                MessageType::Reply => {
                    let reply: ReplyPayload =
                        decode_payload(&frame.payload).map_err(|e| Error::transport(&e))?;
                    if reply.id == id {
                        return Ok(reply.body);
                    }
                    tracing::debug!(expected = id, got = reply.id, "Dropping stale reply");
                }
                MessageType::Error => {
                    let error: ErrorPayload =
                        decode_payload(&frame.payload).map_err(|e| Error::transport(&e))?;
                    if error.id == id || error.id == 0 {
                        return Err(error_from_payload(error));
                    }
                    tracing::debug!(expected = id, got = error.id, "Dropping stale error");
                }
                MessageType::Call => {
                    return Err(Error::Transport("unexpected call frame from server".into()));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.conn.shutdown().await.map_err(|e| Error::transport(&e))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use teamserver_core::token::hash_token;

    use super::*;
    use crate::store::{CredentialStore, Database, SqliteCredentialStore};

    fn dispatcher() -> Dispatcher {
        let store = Arc::new(SqliteCredentialStore::new(Arc::new(
            Database::open_in_memory().unwrap(),
        )));
        store.issue_token("alice", &hash_token("tok")).unwrap();
        let dispatcher = Dispatcher::new(Arc::new(Authenticator::new(store)));
        dispatcher.register("whoami", |caller: Caller, _body| async move {
            Ok(json!({ "user": caller.user }))
        });
        dispatcher
    }

    fn call(method: &str, metadata: BTreeMap<String, String>) -> CallPayload {
        CallPayload {
            id: 1,
            method: method.into(),
            metadata,
            body: Value::Null,
        }
    }

    fn remote() -> CallOrigin {
        CallOrigin::Remote {
            peer: "10.0.0.2:4000".into(),
        }
    }

    #[tokio::test]
    async fn given_authenticated_call_when_dispatched_then_handler_sees_caller() {
        let dispatcher = dispatcher();
        let reply = dispatcher
            .dispatch(&remote(), call("whoami", bearer_metadata("tok")))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "user": "alice" }));
    }

    #[tokio::test]
    async fn given_unknown_method_when_unauthenticated_then_authentication_error_wins() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(&remote(), call("nope", BTreeMap::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication));
    }

    #[tokio::test]
    async fn given_unknown_method_when_local_then_not_found() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(&CallOrigin::Local, call("nope", BTreeMap::new()))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), codes::NOT_FOUND);
    }

    #[test]
    fn given_error_payloads_when_converted_then_typed_errors_come_back() {
        let auth = error_from_payload(ErrorPayload {
            id: 1,
            code: codes::UNAUTHENTICATED.into(),
            message: "authentication failed".into(),
        });
        assert!(matches!(auth, Error::Authentication));

        let missing = error_from_payload(ErrorPayload {
            id: 1,
            code: codes::NOT_FOUND.into(),
            message: "user \"bob\" not found".into(),
        });
        assert_eq!(missing.to_string(), "user \"bob\" not found");

        let other = error_from_payload(ErrorPayload {
            id: 1,
            code: codes::INTERNAL.into(),
            message: "boom".into(),
        });
        assert!(matches!(other, Error::Remote { code, .. } if code == "internal"));
    }

    #[test]
    fn given_registered_methods_when_listing_then_sorted() {
        let dispatcher = dispatcher();
        dispatcher.register("a.first", |_, _| async { Ok(Value::Null) });
        assert_eq!(dispatcher.methods(), ["a.first", "whoami"]);
    }
}
