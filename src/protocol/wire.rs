use async_trait::async_trait;
use bytes::BytesMut;
use codec::{Decoder, Message, encode};
use url::Url;

use crate::{
    config::SslConfig,
    error::CommError,
    protocol::{Protocol, ProtocolFactory},
    transport::TransportStream,
};

/// The built-in framed protocol: length-prefixed frames straight over
/// the transport. Not concurrent; request and response alternate on
/// the channel, paired by exclusivity.
#[derive(Default)]
pub struct WireProtocol {
    decoder: Decoder,
}

#[async_trait]
impl Protocol for WireProtocol {
    fn name(&self) -> &'static str {
        "wire"
    }

    fn has_buffered_input(&self) -> bool {
        self.decoder.has_complete_frame()
    }

    async fn send(
        &mut self,
        stream: &mut TransportStream,
        message: &Message,
    ) -> Result<(), CommError> {
        let mut buf = BytesMut::new();
        encode(message, &mut buf)?;
        stream.write_all(&buf).await?;
        Ok(())
    }

    async fn recv(&mut self, stream: &mut TransportStream) -> Result<Option<Message>, CommError> {
        loop {
            if let Some(message) = self.decoder.decode()? {
                return Ok(Some(message));
            }

            let read = stream.read_buf(self.decoder.buffer_mut()).await?;
            if read == 0 {
                return if self.decoder.has_pending() {
                    Err(CommError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream closed inside a frame",
                    )))
                } else {
                    Ok(None)
                };
            }
        }
    }
}

pub struct WireProtocolFactory;

impl ProtocolFactory for WireProtocolFactory {
    fn name(&self) -> &'static str {
        "wire"
    }

    fn create_input(
        &self,
        _ssl: Option<&SslConfig>,
        _location: &Url,
    ) -> Result<Box<dyn Protocol>, CommError> {
        Ok(Box::new(WireProtocol::default()))
    }

    fn create_output(
        &self,
        _ssl: Option<&SslConfig>,
        _location: &Url,
    ) -> Result<Box<dyn Protocol>, CommError> {
        Ok(Box::new(WireProtocol::default()))
    }
}
