use std::future::Future;

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use serde::Serialize;

use crate::protocol::{Frame, MessageType, encode_payload_frame, try_decode_frame};

const READ_CHUNK: usize = 8 * 1024;

/// A transport-agnostic bidirectional byte stream carrying protocol frames.
///
/// Implemented by the QUIC stream pair of a mutually authenticated
/// connection and by the in-process pipe, so the call loop on either side can
/// read and write without knowing which one it is talking over.
pub trait Connection: Send + 'static {
    /// Remote address for logs, or `"local"` for in-process pipes.
    fn peer(&self) -> String;

    /// Fills part of `buf`; `Ok(0)` once the peer stops sending.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send + 'a;

    fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Finishes the send side so the peer reads end of stream.
    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send + '_;
}

/// Reads from `conn` until one full frame is buffered in `accum`.
///
/// Returns `Ok(None)` on a clean end of stream between frames. Bytes left in
/// `accum` after the returned frame belong to the next one.
pub async fn read_frame<C: Connection>(conn: &mut C, accum: &mut BytesMut) -> Result<Option<Frame>> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Some(frame) = try_decode_frame(accum).context("failed to decode frame")? {
            return Ok(Some(frame));
        }

        let n = conn.read(&mut chunk).await.context("failed to read from connection")?;
        if n == 0 {
            if accum.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-frame ({} bytes buffered)", accum.len());
        }
        accum.extend_from_slice(&chunk[..n]);
    }
}

/// Serializes `payload` into a frame of type `msg_type` and writes it.
pub async fn write_frame<C: Connection, T: Serialize>(
    conn: &mut C,
    msg_type: MessageType,
    payload: &T,
) -> Result<()> {
    let frame = encode_payload_frame(msg_type, payload)?;
    conn.write_all(&frame).await.context("failed to write frame")
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::{ReplyPayload, decode_payload, encode_frame_to_bytes};

    /// In-memory connection that hands out pre-seeded chunks and records writes.
    struct ScriptedConnection {
        chunks: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedConnection {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: chunks.into(),
                written: Vec::new(),
            }
        }
    }

    impl Connection for ScriptedConnection {
        fn peer(&self) -> String {
            "scripted".into()
        }

        fn read<'a>(
            &'a mut self,
            buf: &'a mut [u8],
        ) -> impl Future<Output = Result<usize>> + Send + 'a {
            async move {
                let Some(chunk) = self.chunks.pop_front() else {
                    return Ok(0);
                };
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
        }

        fn write_all<'a>(&'a mut self, buf: &'a [u8]) -> impl Future<Output = Result<()>> + Send + 'a {
            async move {
                self.written.extend_from_slice(buf);
                Ok(())
            }
        }

        fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send + '_ {
            async { Ok(()) }
        }
    }

    #[tokio::test]
    async fn given_frame_split_across_reads_when_reading_then_frame_is_reassembled() {
        let bytes = encode_frame_to_bytes(MessageType::Reply, br#"{"id":3,"body":true}"#).to_vec();
        let (head, tail) = bytes.split_at(5);
        let mut conn = ScriptedConnection::new(vec![head.to_vec(), tail.to_vec()]);
        let mut accum = BytesMut::new();

        let frame = read_frame(&mut conn, &mut accum).await.unwrap().unwrap();
        let reply: ReplyPayload = decode_payload(&frame.payload).unwrap();
        assert_eq!(reply.id, 3);
        assert!(accum.is_empty());
    }

    #[tokio::test]
    async fn given_clean_eof_when_reading_then_returns_none() {
        let mut conn = ScriptedConnection::new(vec![]);
        let mut accum = BytesMut::new();
        assert!(read_frame(&mut conn, &mut accum).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn given_eof_mid_frame_when_reading_then_returns_error() {
        let mut conn = ScriptedConnection::new(vec![b"TEAMS\x01".to_vec()]);
        let mut accum = BytesMut::new();
        let err = read_frame(&mut conn, &mut accum).await.unwrap_err();
        assert!(err.to_string().contains("mid-frame"));
    }

    #[tokio::test]
    async fn given_payload_when_writing_frame_then_bytes_decode_back() {
        let mut conn = ScriptedConnection::new(vec![]);
        let reply = ReplyPayload {
            id: 9,
            body: serde_json::json!({"ok": true}),
        };
        write_frame(&mut conn, MessageType::Reply, &reply).await.unwrap();

        let mut buf = BytesMut::from(conn.written.as_slice());
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.msg_type, MessageType::Reply);
        assert_eq!(decode_payload::<ReplyPayload>(&frame.payload).unwrap(), reply);
    }
}
