use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Notify,
};
use url::Url;

use crate::{
    channel::CommChannel,
    core::CommCore,
    error::CommError,
    port::{InputPort, OutputPort},
    protocol::Protocol,
    statistics::Stats,
    transport::{ListenerHandle, TransportFactory, TransportStream, socket_addr_of},
};

/// The built-in `socket://` (TCP) transport.
pub struct SocketTransport;

#[async_trait]
impl TransportFactory for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn create_channel(
        &self,
        core: &Arc<CommCore>,
        location: &Url,
        port: &Arc<OutputPort>,
        protocol: Box<dyn Protocol>,
    ) -> Result<Arc<CommChannel>, CommError> {
        let (host, tcp_port) = socket_addr_of(location)?;
        let stream = TcpStream::connect((host.as_str(), tcp_port)).await?;

        // Disable the Nagle algorithm: request/response traffic wants
        // every frame on the wire as soon as it is encoded.
        if let Err(e) = stream.set_nodelay(true) {
            log::error!("tcp socket set nodelay failed!: location={}, err={}", location, e);
        }

        Ok(CommChannel::client_side(
            core.next_channel_id(),
            location.clone(),
            TransportStream::Tcp(stream),
            protocol,
            port.clone(),
        ))
    }

    async fn create_listener(
        &self,
        core: &Arc<CommCore>,
        port: &Arc<InputPort>,
    ) -> Result<ListenerHandle, CommError> {
        let (host, tcp_port) = socket_addr_of(&port.location)?;
        let listener = TcpListener::bind((host.as_str(), tcp_port)).await?;
        let local_addr = listener.local_addr()?;

        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let core = Arc::downgrade(core);
        let port = port.clone();
        let port_name = port.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (socket, addr) = tokio::select! {
                    _ = stop_signal.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!(
                                "tcp accept failed: interface={}, err={}",
                                local_addr,
                                e,
                            );
                            break;
                        }
                    },
                };

                log::info!("tcp socket accept: addr={}, interface={}", addr, local_addr);

                if let Err(e) = socket.set_nodelay(true) {
                    log::error!("tcp socket set nodelay failed!: addr={}, err={}", addr, e);
                }

                let Some(core) = core.upgrade() else { break };
                let protocol = match core.build_input_protocol(&port) {
                    Ok(protocol) => protocol,
                    Err(e) => {
                        log::error!("tcp accept failed: name={}, err={}", port.name, e);
                        continue;
                    }
                };

                let channel = CommChannel::server_side(
                    core.next_channel_id(),
                    port.location.clone(),
                    TransportStream::Tcp(socket),
                    protocol,
                    port.clone(),
                );

                core.statistics().report(&[Stats::ConnectionsAccepted(1)]);

                if let Err(e) = core.register_for_input(channel) {
                    log::debug!("tcp channel dropped at accept: addr={}, err={}", addr, e);
                }
            }

            log::info!("tcp listener stopped: interface={}", local_addr);
        });

        Ok(ListenerHandle::new(
            port_name,
            Some(local_addr),
            stop,
            handle,
        ))
    }
}
