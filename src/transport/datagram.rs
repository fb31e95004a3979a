use std::sync::Arc;

use async_trait::async_trait;
use tokio::{net::UdpSocket, sync::Notify};
use url::Url;

use crate::{
    channel::CommChannel,
    core::CommCore,
    error::CommError,
    port::{InputPort, OutputPort},
    protocol::Protocol,
    transport::{ListenerHandle, TransportFactory, TransportStream, UdpStream, socket_addr_of},
};

/// The `datagram://` (UDP) transport.
///
/// One frame per datagram. The server side is a single channel over the
/// bound socket: the stream remembers the last sender, so a decoded
/// request can be answered before the next datagram is read (the
/// channel guard already serialises exactly that window).
pub struct DatagramTransport;

#[async_trait]
impl TransportFactory for DatagramTransport {
    fn name(&self) -> &'static str {
        "datagram"
    }

    async fn create_channel(
        &self,
        core: &Arc<CommCore>,
        location: &Url,
        port: &Arc<OutputPort>,
        protocol: Box<dyn Protocol>,
    ) -> Result<Arc<CommChannel>, CommError> {
        let (host, udp_port) = socket_addr_of(location)?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host.as_str(), udp_port)).await?;

        Ok(CommChannel::client_side(
            core.next_channel_id(),
            location.clone(),
            TransportStream::Udp(UdpStream::connected(socket)),
            protocol,
            port.clone(),
        ))
    }

    async fn create_listener(
        &self,
        core: &Arc<CommCore>,
        port: &Arc<InputPort>,
    ) -> Result<ListenerHandle, CommError> {
        let (host, udp_port) = socket_addr_of(&port.location)?;
        let socket = UdpSocket::bind((host.as_str(), udp_port)).await?;
        let local_addr = socket.local_addr()?;

        let protocol = core.build_input_protocol(port)?;
        let channel = CommChannel::server_side(
            core.next_channel_id(),
            port.location.clone(),
            TransportStream::Udp(UdpStream::unconnected(socket)),
            protocol,
            port.clone(),
        );

        core.register_for_input(channel.clone())?;

        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let name = port.name.clone();

        let handle = tokio::spawn(async move {
            stop_signal.notified().await;
            channel.close().await;
            log::info!("datagram listener stopped: name={}", name);
        });

        Ok(ListenerHandle::new(
            port.name.clone(),
            Some(local_addr),
            stop,
            handle,
        ))
    }
}
