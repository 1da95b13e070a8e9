use std::sync::Arc;

use bytes::BytesMut;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use teamserver_core::protocol::{
    CallPayload, ErrorPayload, Frame, MessageType, ReplyPayload, codes, decode_payload,
};
use teamserver_core::transport::{Connection, read_frame, write_frame};

use crate::auth::CallOrigin;
use crate::rpc::{Dispatcher, error_code};

/// Trait for handling accepted connections.
///
/// Transport handlers call [`handle`](SessionHandler::handle) for every
/// inbound connection, each in its own spawned task, tagging it with the
/// origin only the transport can vouch for.
pub trait SessionHandler<C: Connection>: Send + Sync + 'static {
    fn handle(
        &self,
        conn: C,
        origin: CallOrigin,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Serves calls one at a time: decode, authenticate and dispatch, reply.
pub struct CallSession {
    dispatcher: Arc<Dispatcher>,
}

impl CallSession {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    async fn answer<C: Connection>(&self, conn: &mut C, origin: &CallOrigin, frame: Frame) -> anyhow::Result<()> {
        if frame.header.msg_type != MessageType::Call {
            return send_error(conn, 0, codes::INVALID_ARGUMENT, "expected a call frame").await;
        }

        let call: CallPayload = match decode_payload(&frame.payload) {
            Ok(call) => call,
            Err(e) => {
                return send_error(conn, 0, codes::INVALID_ARGUMENT, &format!("malformed call: {e}"))
                    .await;
            }
        };

        let id = call.id;
        let method = call.method.clone();
        match self.dispatcher.dispatch(origin, call).await {
            Ok(body) => write_frame(conn, MessageType::Reply, &ReplyPayload { id, body }).await,
            Err(err) => {
                debug!(method = %method, error = %err, "Call failed");
                send_error(conn, id, error_code(&err), &err.to_string()).await
            }
        }
    }
}

async fn send_error<C: Connection>(conn: &mut C, id: u64, code: &str, message: &str) -> anyhow::Result<()> {
    let payload = ErrorPayload {
        id,
        code: code.to_string(),
        message: message.to_string(),
    };
    write_frame(conn, MessageType::Error, &payload).await
}

impl<C: Connection> SessionHandler<C> for CallSession {
    async fn handle(&self, mut conn: C, origin: CallOrigin, cancel: CancellationToken) {
        let peer = conn.peer();
        info!(peer = %peer, "Session started");

        let mut accum = BytesMut::with_capacity(4096);

        loop {
            let frame = select! {
                () = cancel.cancelled() => {
                    debug!(peer = %peer, "Session cancelled");
                    break;
                }
                res = read_frame(&mut conn, &mut accum) => res,
            };

            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = self.answer(&mut conn, &origin, frame).await {
                        warn!(peer = %peer, error = %e, "Failed to answer call, closing connection");
                        break;
                    }
                }
                Ok(None) => {
                    info!(peer = %peer, "Connection closed by peer");
                    break;
                }
                Err(e) => {
                    // Bad magic, unsupported version or oversized payload:
                    // the stream cannot be resynchronized.
                    warn!(peer = %peer, error = %e, "Protocol error, closing connection");
                    let _ = send_error(&mut conn, 0, codes::INVALID_ARGUMENT, "protocol error").await;
                    break;
                }
            }
        }

        if let Err(e) = conn.shutdown().await {
            debug!(peer = %peer, error = %e, "Shutdown after session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use teamserver_core::protocol::{bearer_metadata, encode_frame_to_bytes};
    use teamserver_core::token::hash_token;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::auth::Authenticator;
    use crate::local::PipeConnection;
    use crate::store::{CredentialStore, Database, SqliteCredentialStore};

    fn session() -> Arc<CallSession> {
        let store = Arc::new(SqliteCredentialStore::new(Arc::new(
            Database::open_in_memory().unwrap(),
        )));
        store.issue_token("alice", &hash_token("tok")).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(Authenticator::new(store))));
        dispatcher.register("echo", |_, body| async move { Ok(body) });
        Arc::new(CallSession::new(dispatcher))
    }

    /// Spawns a session over a pipe and returns the client end.
    fn spawn_session(origin: CallOrigin) -> (PipeConnection, CancellationToken) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let session = session();
        let token = cancel.clone();
        tokio::spawn(async move {
            session
                .handle(PipeConnection::new(server, "test-client"), origin, token)
                .await;
        });
        (PipeConnection::new(client, "test-server"), cancel)
    }

    async fn roundtrip(conn: &mut PipeConnection, call: &CallPayload) -> Frame {
        write_frame(conn, MessageType::Call, call).await.unwrap();
        let mut accum = BytesMut::new();
        read_frame(conn, &mut accum).await.unwrap().unwrap()
    }

    fn remote() -> CallOrigin {
        CallOrigin::Remote {
            peer: "192.0.2.1:999".into(),
        }
    }

    #[tokio::test]
    async fn given_valid_call_when_served_then_reply_carries_same_id_and_body() {
        let (mut conn, _cancel) = spawn_session(remote());
        let call = CallPayload {
            id: 42,
            method: "echo".into(),
            metadata: bearer_metadata("tok"),
            body: json!({"ping": 1}),
        };

        let frame = roundtrip(&mut conn, &call).await;
        assert_eq!(frame.header.msg_type, MessageType::Reply);
        let reply: ReplyPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(reply.id, 42);
        assert_eq!(reply.body, json!({"ping": 1}));
    }

    #[tokio::test]
    async fn given_missing_token_when_served_then_unauthenticated_error_frame() {
        let (mut conn, _cancel) = spawn_session(remote());
        let call = CallPayload {
            id: 5,
            method: "echo".into(),
            metadata: Default::default(),
            body: Value::Null,
        };

        let frame = roundtrip(&mut conn, &call).await;
        let error: ErrorPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(error.id, 5);
        assert_eq!(error.code, codes::UNAUTHENTICATED);
        assert_eq!(error.message, "authentication failed");
    }

    #[tokio::test]
    async fn given_garbage_bytes_when_served_then_error_frame_and_close() {
        let (conn, _cancel) = spawn_session(remote());
        let mut stream = conn.into_inner();
        stream.write_all(b"NOPE!garbage-garbage").await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(raw.as_slice());
        let frame = teamserver_core::protocol::try_decode_frame(&mut buf).unwrap().unwrap();
        let error: ErrorPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(error.code, codes::INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn given_reply_frame_from_client_when_served_then_rejected_but_session_continues() {
        let (mut conn, _cancel) = spawn_session(CallOrigin::Local);
        conn.write_all(&encode_frame_to_bytes(MessageType::Reply, b"{\"id\":1}"))
            .await
            .unwrap();
        let mut accum = BytesMut::new();
        let frame = read_frame(&mut conn, &mut accum).await.unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::Error);

        let call = CallPayload {
            id: 2,
            method: "echo".into(),
            metadata: Default::default(),
            body: json!("still here"),
        };
        let frame = roundtrip(&mut conn, &call).await;
        assert_eq!(frame.header.msg_type, MessageType::Reply);
    }

    #[tokio::test]
    async fn given_cancelled_token_when_session_idle_then_connection_is_closed() {
        let (mut conn, cancel) = spawn_session(CallOrigin::Local);
        cancel.cancel();

        let mut accum = BytesMut::new();
        let frame = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            read_frame(&mut conn, &mut accum),
        )
        .await
        .expect("session did not close in time")
        .unwrap();
        assert!(frame.is_none());
    }
}
