use ahash::AHashMap;
use codec::{Message, MessageId};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    channel::{ChannelId, ChannelIo, CommChannel},
    error::CommError,
};

struct SyncEntry {
    request_id: MessageId,
    operation: String,
    tx: Option<oneshot::Sender<Message>>,
    rx: Option<oneshot::Receiver<Message>>,
}

struct AsyncEntry {
    operation: String,
    tx: Option<oneshot::Sender<Message>>,
    rx: Option<oneshot::Receiver<Message>>,
}

/// Pairs pending requests with their responses.
///
/// The synchronous variant binds a channel identity to the one
/// outstanding request on it: the requester keeps the channel guard and
/// decodes responses itself, so pairing is by channel exclusivity plus
/// an id check. The asynchronous variant binds a message id to a
/// completion and serves concurrent protocols where responses are
/// decoded by whichever reactor sees them first.
#[derive(Default)]
pub struct MessagePool {
    synchronous: Mutex<AHashMap<ChannelId, SyncEntry>>,
    asynchronous: Mutex<AHashMap<MessageId, AsyncEntry>>,
}

impl MessagePool {
    /// Register the outstanding request of a non-concurrent channel.
    pub fn register_synchronous(&self, channel: &CommChannel, request: &Message) {
        let (tx, rx) = oneshot::channel();
        self.synchronous.lock().insert(
            channel.id(),
            SyncEntry {
                request_id: request.id,
                operation: request.operation.clone(),
                tx: Some(tx),
                rx: Some(rx),
            },
        );
    }

    /// Register a request multiplexed by id on a concurrent channel.
    pub fn register_asynchronous(&self, id: MessageId, operation: &str) {
        let (tx, rx) = oneshot::channel();
        self.asynchronous.lock().insert(
            id,
            AsyncEntry {
                operation: operation.to_string(),
                tx: Some(tx),
                rx: Some(rx),
            },
        );
    }

    /// The request registered on `channel`, if any, as (id, operation).
    pub fn retrieve_synchronous_request(
        &self,
        channel: &CommChannel,
    ) -> Option<(MessageId, String)> {
        self.synchronous
            .lock()
            .get(&channel.id())
            .map(|entry| (entry.request_id, entry.operation.clone()))
    }

    /// The operation name registered for an asynchronous request id.
    pub fn retrieve_asynchronous_request(&self, id: MessageId) -> Option<String> {
        self.asynchronous
            .lock()
            .get(&id)
            .map(|entry| entry.operation.clone())
    }

    /// Drop a registration whose request never made it onto the wire.
    pub fn cancel_synchronous(&self, channel: &CommChannel) {
        self.synchronous.lock().remove(&channel.id());
    }

    pub fn cancel_asynchronous(&self, id: MessageId) {
        self.asynchronous.lock().remove(&id);
    }

    /// Deliver a decoded response. Responses without a registration are
    /// logged and discarded; delivery never fails.
    pub fn receive_response(&self, channel: &CommChannel, message: Message) {
        {
            let mut synchronous = self.synchronous.lock();
            if let Some(entry) = synchronous.get_mut(&channel.id()) {
                if entry.request_id == message.id {
                    if let Some(tx) = entry.tx.take() {
                        let _ = tx.send(message);
                    }
                    return;
                }
            }
        }

        let tx = self
            .asynchronous
            .lock()
            .get_mut(&message.id)
            .and_then(|entry| entry.tx.take());

        match tx {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                log::debug!(
                    "uncorrelated response discarded: channel={}, id={}, op={}",
                    channel.id(),
                    message.id,
                    message.operation,
                );
            }
        }
    }

    /// Await the response to an asynchronously registered request.
    pub async fn recv_response_for(&self, request: &Message) -> Result<Message, CommError> {
        let rx = self
            .asynchronous
            .lock()
            .get_mut(&request.id)
            .and_then(|entry| entry.rx.take())
            .ok_or_else(|| {
                CommError::CorrelationError(format!("no registration for request {}", request.id))
            })?;

        let result = rx.await.map_err(|_| {
            CommError::CorrelationError(format!("registration for request {} dropped", request.id))
        });

        self.asynchronous.lock().remove(&request.id);
        result
    }

    /// Await the response on a non-concurrent channel, decoding inline
    /// while the caller's guard keeps the channel exclusive. Messages
    /// that do not match the outstanding request are fed back through
    /// `receive_response`.
    pub async fn recv_response_sync(
        &self,
        channel: &CommChannel,
        io: &mut ChannelIo,
        request: &Message,
    ) -> Result<Message, CommError> {
        let mut rx = self
            .synchronous
            .lock()
            .get_mut(&channel.id())
            .and_then(|entry| entry.rx.take())
            .ok_or_else(|| {
                CommError::CorrelationError(format!("no registration for request {}", request.id))
            })?;

        let result = loop {
            if let Ok(message) = rx.try_recv() {
                break Ok(message);
            }

            match io.recv().await {
                Ok(Some(message)) => self.receive_response(channel, message),
                Ok(None) => {
                    break Err(CommError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "channel closed before the response arrived",
                    )));
                }
                Err(e) => break Err(e),
            }
        };

        self.synchronous.lock().remove(&channel.id());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Value;

    use crate::testutil::memory_channel_pair;

    fn request(id: u64) -> Message {
        Message::request(MessageId(id), "op", "/", Value::Void)
    }

    #[tokio::test]
    async fn synchronous_pairing_by_id() {
        let (client, server) = memory_channel_pair();
        let pool = MessagePool::default();
        let req = request(5);

        pool.register_synchronous(&client, &req);
        assert_eq!(
            pool.retrieve_synchronous_request(&client),
            Some((MessageId(5), "op".to_string()))
        );

        // peer replies with a stale id first, then the real response
        server
            .send(&Message::response(MessageId(4), "op", Value::Void))
            .await
            .unwrap();
        server
            .send(&Message::response(MessageId(5), "op", Value::from("done")))
            .await
            .unwrap();

        let mut io = client.lock().await;
        let response = pool.recv_response_sync(&client, &mut io, &req).await.unwrap();
        assert_eq!(response.id, MessageId(5));
        assert_eq!(response.value, Value::from("done"));
    }

    #[tokio::test]
    async fn asynchronous_completion() {
        let (client, _server) = memory_channel_pair();
        let pool = MessagePool::default();
        let req = request(9);

        pool.register_asynchronous(req.id, &req.operation);
        assert_eq!(
            pool.retrieve_asynchronous_request(req.id),
            Some("op".to_string())
        );

        pool.receive_response(&client, Message::response(MessageId(9), "op", Value::Void));
        let response = pool.recv_response_for(&req).await.unwrap();
        assert_eq!(response.id, MessageId(9));
        assert!(pool.retrieve_asynchronous_request(req.id).is_none());
    }

    #[tokio::test]
    async fn unregistered_request_is_correlation_error() {
        let pool = MessagePool::default();
        let err = pool.recv_response_for(&request(1)).await.unwrap_err();
        assert!(matches!(err, CommError::CorrelationError(_)));
    }

    #[tokio::test]
    async fn unregistered_response_is_discarded() {
        let (client, _server) = memory_channel_pair();
        let pool = MessagePool::default();

        // must not panic or leave state behind
        pool.receive_response(&client, Message::response(MessageId(3), "op", Value::Void));
        assert!(pool.retrieve_asynchronous_request(MessageId(3)).is_none());
    }
}
