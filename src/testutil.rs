use std::sync::Arc;

use codec::Message;

use crate::{
    channel::CommChannel,
    core::{CommCore, CommCoreOptions, RuntimeContext},
    error::CommError,
    port::OutputPort,
    protocol::wire::WireProtocol,
    transport::{MemoryStream, TransportStream},
};

/// Runtime that answers request-response operations by echoing the
/// request value and stays silent on everything else.
pub struct EchoRuntime;

#[async_trait::async_trait]
impl RuntimeContext for EchoRuntime {
    async fn deliver(
        &self,
        message: Message,
        channel: Arc<CommChannel>,
    ) -> Result<Option<Message>, CommError> {
        let request_response = channel
            .input_port()
            .and_then(|port| port.operations.get(&message.operation))
            .is_some_and(|op| op.kind == crate::port::OperationKind::RequestResponse);

        Ok(request_response.then(|| {
            Message::response(message.id, &message.operation, message.value.clone())
        }))
    }
}

pub fn test_core() -> Arc<CommCore> {
    CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default())
}

/// A connected pair of wire-protocol channels over a memory pipe, both
/// built as client-side endpoints of a throwaway output port.
pub fn memory_channel_pair() -> (Arc<CommChannel>, Arc<CommChannel>) {
    let location = url::Url::parse("memory://pair:1").unwrap();
    let port = Arc::new(OutputPort::new("pair", location.clone(), "wire"));

    let (a, b) = MemoryStream::pair();
    let left = CommChannel::client_side(
        crate::channel::ChannelId(u64::MAX - 1),
        location.clone(),
        TransportStream::Memory(a),
        Box::new(WireProtocol::default()),
        port.clone(),
    );
    let right = CommChannel::client_side(
        crate::channel::ChannelId(u64::MAX),
        location,
        TransportStream::Memory(b),
        Box::new(WireProtocol::default()),
        port,
    );

    (left, right)
}
