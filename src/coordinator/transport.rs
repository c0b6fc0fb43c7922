//! TCP transport to storage nodes
//!
//! One socket per pooled connection. A writer task drains the outbound queue
//! and a reader task feeds every decoded response to the request tracker.
//! When either side stops, the connection is marked dead and is not reused;
//! requests still in flight on it resolve through their deadlines.

use crate::common::message::{encode_frame, read_frame};
use crate::common::{Error, Message, Response, Result};
use crate::coordinator::pool::{Connection, Connector, Outbound};
use crate::coordinator::tracker::RequestTracker;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        node: &str,
        tracker: Arc<RequestTracker>,
        queue_depth: usize,
    ) -> impl Future<Output = Result<Connection>> + Send {
        let node = node.to_string();
        async move {
            let stream = TcpStream::connect(&node)
                .await
                .map_err(|e| Error::unavailable(&node, e.to_string()))?;
            stream.set_nodelay(true)?;
            let (read_half, write_half) = stream.into_split();

            let (conn, outbound) = Connection::new(&node, queue_depth);
            let liveness = outbound.liveness();
            tokio::spawn(write_loop(
                node.clone(),
                write_half,
                outbound,
                tracker.clone(),
            ));
            tokio::spawn(async move {
                read_loop(&node, read_half, tracker).await;
                liveness.mark_dead();
            });

            Ok(conn)
        }
    }
}

async fn write_loop(
    node: String,
    write_half: OwnedWriteHalf,
    mut outbound: Outbound,
    tracker: Arc<RequestTracker>,
) {
    let mut writer = BufWriter::new(write_half);
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = write_message(&mut writer, &msg, &tracker).await {
            tracing::warn!("Write to {} failed: {}", node, e);
            return;
        }
        // Batch whatever else is already queued into the same flush.
        while let Some(msg) = outbound.try_recv() {
            if let Err(e) = write_message(&mut writer, &msg, &tracker).await {
                tracing::warn!("Write to {} failed: {}", node, e);
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!("Flush to {} failed: {}", node, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
    tracing::debug!("Connection to {} closed by pool", node);
}

/// Frame one message onto the socket. A message that cannot be framed fails
/// alone; only socket errors are returned.
async fn write_message<W>(writer: &mut W, msg: &Message, tracker: &RequestTracker) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match encode_frame(msg) {
        Ok(frame) => Ok(writer.write_all(&frame).await?),
        Err(e) => {
            tracing::warn!("Cannot frame {} {}: {}", msg.op, msg.id, e);
            tracker.fail(msg.id, e);
            Ok(())
        }
    }
}

async fn read_loop(node: &str, read_half: OwnedReadHalf, tracker: Arc<RequestTracker>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Some(response)) => {
                tracker.resolve(response);
            }
            Ok(None) => {
                tracing::debug!("Node {} closed the connection", node);
                return;
            }
            Err(e) => {
                tracing::warn!("Dropping connection to {}: {}", node, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::message::encode_frame;
    use crate::common::{ClientMetrics, Message, Op};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_request_and_response_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Echo node: answer every message with its own key as payload.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.split();
            let mut reader = BufReader::new(read_half);
            while let Ok(Some(msg)) = read_frame::<_, Message>(&mut reader).await {
                let frame = encode_frame(&Response::ok(msg.id, msg.key)).unwrap();
                write_half.write_all(&frame).await.unwrap();
            }
        });

        let tracker = Arc::new(RequestTracker::new(Arc::new(ClientMetrics::new())));
        let conn = TcpConnector::new()
            .connect(&addr, tracker.clone(), 8)
            .await
            .unwrap();

        let msg = Message::new(Op::Read, b"cf", Some(b"k1"), None);
        let pending = tracker
            .register(msg.id, &addr, Duration::from_secs(5))
            .unwrap();
        conn.send(msg).unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(response.payload.as_deref(), Some(&b"k1"[..]));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let tracker = Arc::new(RequestTracker::new(Arc::new(ClientMetrics::new())));
        let result = TcpConnector::new().connect(&addr, tracker, 8).await;
        assert!(matches!(result, Err(Error::NodeUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_peer_close_marks_connection_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            let _ = socket.read(&mut buf).await;
        });

        let tracker = Arc::new(RequestTracker::new(Arc::new(ClientMetrics::new())));
        let conn = TcpConnector::new().connect(&addr, tracker, 8).await.unwrap();
        conn.send(Message::new(Op::Read, b"cf", Some(b"k"), None))
            .unwrap();
        server.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.is_alive() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unframeable_message_fails_alone() {
        use crate::common::message::MAX_FRAME_SIZE;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.split();
            let mut reader = BufReader::new(read_half);
            while let Ok(Some(msg)) = read_frame::<_, Message>(&mut reader).await {
                let frame = encode_frame(&Response::ok(msg.id, msg.key)).unwrap();
                write_half.write_all(&frame).await.unwrap();
            }
        });

        let tracker = Arc::new(RequestTracker::new(Arc::new(ClientMetrics::new())));
        let conn = TcpConnector::new()
            .connect(&addr, tracker.clone(), 8)
            .await
            .unwrap();

        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        let oversized = Message::new(Op::Write, b"cf", Some(b"big"), Some(&huge));
        let small = Message::new(Op::Read, b"cf", Some(b"k1"), None);
        let timeout = Duration::from_secs(5);
        let pending_oversized = tracker.register(oversized.id, &addr, timeout).unwrap();
        let pending_small = tracker.register(small.id, &addr, timeout).unwrap();
        conn.send(oversized).unwrap();
        conn.send(small).unwrap();

        assert!(matches!(
            pending_oversized.wait().await,
            Err(Error::FrameTooLarge { .. })
        ));
        let response = pending_small.wait().await.unwrap();
        assert_eq!(response.payload.as_deref(), Some(&b"k1"[..]));
        assert!(conn.is_alive());
    }
}
