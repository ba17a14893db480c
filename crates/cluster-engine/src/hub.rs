//! The broadcast hub: fan-out of JSON frames to a dynamic set of connected
//! clients, with best-effort, remove-on-failure delivery.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

/// A registered client's identity within one server process.
pub type ClientId = u64;

/// A client's writable sink, shared so the hub and the client's own reader
/// task (for direct replies) can both hold it.
pub type ClientSink = Arc<AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>>;

/// The set of currently connected clients. Membership mutation (register/
/// remove) is synchronous and cheap; delivery is async and must happen
/// outside whatever lock guards this set.
#[derive(Default)]
pub struct ClientSet {
    next_id: ClientId,
    clients: HashMap<ClientId, ClientSink>,
}

impl ClientSet {
    /// Register a new client sink, returning its id.
    pub fn register(&mut self, sink: ClientSink) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(id, sink);
        id
    }

    /// Remove a client (on disconnect or write failure).
    pub fn remove(&mut self, id: ClientId) {
        self.clients.remove(&id);
    }

    /// Snapshot every currently registered sink, for use after releasing
    /// whatever lock guards this set.
    pub fn snapshot(&self) -> Vec<(ClientId, ClientSink)> {
        self.clients
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect()
    }
}

/// Encode `obj` as compact JSON plus a trailing newline.
fn encode_frame(obj: &impl Serialize) -> serde_json::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(obj)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Write one frame to one client. Returns `Err` (meaning the client should
/// be removed) on any I/O failure.
pub async fn send_one(sink: &ClientSink, obj: &impl Serialize) -> std::io::Result<()> {
    let frame = encode_frame(obj).expect("wire types always serialize");
    let mut writer = sink.lock().await;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Broadcast one frame to every sink in `targets`, returning the ids whose
/// write failed (the caller should remove them from the [`ClientSet`]).
pub async fn broadcast(targets: &[(ClientId, ClientSink)], obj: &impl Serialize) -> Vec<ClientId> {
    let frame = match encode_frame(obj) {
        Ok(frame) => frame,
        Err(_) => return Vec::new(),
    };

    let mut failed = Vec::new();
    for (id, sink) in targets {
        let mut writer = sink.lock().await;
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            failed.push(*id);
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("write failed")))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn broadcast_reports_failed_clients() {
        let mut set = ClientSet::default();
        let good: ClientSink = Arc::new(AsyncMutex::new(
            Box::new(Vec::new()) as Box<dyn AsyncWrite + Unpin + Send>
        ));
        let bad: ClientSink = Arc::new(AsyncMutex::new(
            Box::new(FailingWriter) as Box<dyn AsyncWrite + Unpin + Send>
        ));
        let good_id = set.register(good);
        let bad_id = set.register(bad);

        let failed = broadcast(&set.snapshot(), &json!({"type": "ping"})).await;
        assert_eq!(failed, vec![bad_id]);
        assert_ne!(failed, vec![good_id]);
    }

    #[tokio::test]
    async fn register_then_remove_empties_snapshot() {
        let mut set = ClientSet::default();
        let sink: ClientSink = Arc::new(AsyncMutex::new(
            Box::new(Vec::new()) as Box<dyn AsyncWrite + Unpin + Send>
        ));
        let id = set.register(sink);
        assert_eq!(set.snapshot().len(), 1);
        set.remove(id);
        assert!(set.snapshot().is_empty());
    }
}
