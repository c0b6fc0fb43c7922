//! Storage node server
//!
//! Accepts coordinator connections, applies each framed message to the
//! storage engine on the blocking pool and writes responses back as they
//! complete. Responses may leave in a different order than requests arrived;
//! correlation ids tie them together.

use crate::common::message::{encode_frame, read_frame};
use crate::common::{Message, NodeConfig, Response, Result};
use crate::node::handler::handle;
use crate::node::storage::{open_storage, StorageProvider};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Responses queued per connection before request handling waits on the writer
const RESPONSE_QUEUE_DEPTH: usize = 1024;

pub struct NodeServer {
    storage: Arc<dyn StorageProvider>,
}

impl NodeServer {
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    /// Open the configured storage backend.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        Ok(Self::new(open_storage(config)?))
    }

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// Serve connections from `listener` until `shutdown` completes.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!("Node listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        tokio::spawn(serve_connection(self.storage.clone(), socket, peer));
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                () = &mut shutdown => {
                    tracing::info!("Node shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(storage: Arc<dyn StorageProvider>, socket: TcpStream, peer: SocketAddr) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!("set_nodelay for {} failed: {}", peer, e);
    }
    let (read_half, write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::channel::<Response>(RESPONSE_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_response(&mut writer, &response).await {
                tracing::warn!("Write to {} failed: {}", peer, e);
                return;
            }
            while let Ok(response) = rx.try_recv() {
                if let Err(e) = write_response(&mut writer, &response).await {
                    tracing::warn!("Write to {} failed: {}", peer, e);
                    return;
                }
            }
            if let Err(e) = writer.flush().await {
                tracing::warn!("Flush to {} failed: {}", peer, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut reader = BufReader::new(read_half);
    loop {
        match read_frame::<_, Message>(&mut reader).await {
            Ok(Some(msg)) => {
                let storage = storage.clone();
                let tx = tx.clone();
                tokio::task::spawn_blocking(move || {
                    let response = handle(storage.as_ref(), msg);
                    let _ = tx.blocking_send(response);
                });
            }
            Ok(None) => {
                tracing::debug!("Connection from {} closed", peer);
                break;
            }
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
        }
    }

    // The writer finishes once every in-flight request has answered.
    drop(tx);
    let _ = writer.await;
}

/// Frame a response, replacing it with an error reply if it cannot be framed.
async fn write_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = match encode_frame(response) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Cannot frame response {}: {}", response.id, e);
            encode_frame(&Response::error(response.id, e.to_string()))?
        }
    };
    writer.write_all(&frame).await?;
    Ok(())
}
