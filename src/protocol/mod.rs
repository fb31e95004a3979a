pub mod tls;
pub mod wire;

use async_trait::async_trait;
use codec::Message;
use url::Url;

use crate::{config::SslConfig, error::CommError, transport::TransportStream};

/// One application protocol instance, owned by exactly one channel.
///
/// Instances are stateful (decoders keep partially received frames), so
/// factories hand out a fresh one per channel.
#[async_trait]
pub trait Protocol: Send {
    fn name(&self) -> &'static str;

    /// Whether interleaved use by concurrent requesters is permitted.
    /// Non-concurrent protocols pair request and response by channel
    /// exclusivity instead of by id multiplexing.
    fn is_concurrent(&self) -> bool {
        false
    }

    /// Bytes already decoded (or decryptable) without touching the
    /// transport. Channels with buffered input skip readiness
    /// registration and go straight to a handler.
    fn has_buffered_input(&self) -> bool {
        false
    }

    /// Encode and write one message.
    async fn send(
        &mut self,
        stream: &mut TransportStream,
        message: &Message,
    ) -> Result<(), CommError>;

    /// Decode exactly one message. `Ok(None)` means the peer closed
    /// cleanly before the next frame started.
    async fn recv(&mut self, stream: &mut TransportStream) -> Result<Option<Message>, CommError>;
}

/// Factory SPI: builds protocol instances for the two port directions.
///
/// A factory may declare itself publish-subscribe, in which case its
/// inbound channels are obtained from the `pubsubchannel` transport
/// instead of the location's scheme.
pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_publish_subscribe(&self) -> bool {
        false
    }

    fn create_input(
        &self,
        ssl: Option<&SslConfig>,
        location: &Url,
    ) -> Result<Box<dyn Protocol>, CommError>;

    fn create_output(
        &self,
        ssl: Option<&SslConfig>,
        location: &Url,
    ) -> Result<Box<dyn Protocol>, CommError>;
}
