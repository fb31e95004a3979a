pub mod datagram;
pub mod memory;
pub mod socket;

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::Notify,
    task::JoinHandle,
};
use url::Url;

use crate::{
    channel::CommChannel,
    core::CommCore,
    error::CommError,
    port::{InputPort, OutputPort},
    protocol::Protocol,
};

pub use self::memory::MemoryStream;

/// Connected-UDP style wrapper: the server side stays unconnected and
/// replies to the last sender, the client side is connected.
pub struct UdpStream {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    connected: bool,
}

impl UdpStream {
    pub fn connected(socket: UdpSocket) -> Self {
        Self {
            socket,
            peer: None,
            connected: true,
        }
    }

    pub fn unconnected(socket: UdpSocket) -> Self {
        Self {
            socket,
            peer: None,
            connected: false,
        }
    }
}

/// In-memory byte source/sink handed to inner protocols by wrapper
/// protocols: reads drain `input`, writes accumulate in `output`.
#[derive(Default)]
pub struct BufferStream {
    input: BytesMut,
    output: BytesMut,
}

/// The byte stream carried by a channel.
///
/// New transports reuse one of these stream shapes; the memory
/// transport is the template.
pub enum TransportStream {
    Tcp(TcpStream),
    Udp(UdpStream),
    Memory(MemoryStream),
    Buffer(BufferStream),
}

impl TransportStream {
    pub fn buffer(input: BytesMut) -> Self {
        Self::Buffer(BufferStream {
            input,
            output: BytesMut::new(),
        })
    }

    /// Bytes written into a `Buffer` stream so far.
    pub fn take_output(&mut self) -> BytesMut {
        match self {
            Self::Buffer(b) => b.output.split(),
            _ => BytesMut::new(),
        }
    }

    /// Unread bytes left in a `Buffer` stream.
    pub fn take_unread(&mut self) -> BytesMut {
        match self {
            Self::Buffer(b) => b.input.split(),
            _ => BytesMut::new(),
        }
    }

    /// Append whatever the transport has into `buf`; 0 means the peer
    /// closed (or, for `Buffer`, that the input is exhausted).
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read_buf(buf).await,
            Self::Udp(udp) => {
                if udp.connected {
                    udp.socket.recv_buf(buf).await
                } else {
                    let (n, peer) = udp.socket.recv_buf_from(buf).await?;
                    udp.peer = Some(peer);
                    Ok(n)
                }
            }
            Self::Memory(stream) => stream.read_buf(buf).await,
            Self::Buffer(b) => {
                let n = b.input.len();
                buf.extend_from_slice(&b.input);
                b.input.advance(n);
                Ok(n)
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.write_all(data).await,
            Self::Udp(udp) => {
                if udp.connected {
                    udp.socket.send(data).await.map(|_| ())
                } else {
                    let peer = udp.peer.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotConnected, "no datagram peer yet")
                    })?;
                    udp.socket.send_to(data, peer).await.map(|_| ())
                }
            }
            Self::Memory(stream) => stream.write_all(data),
            Self::Buffer(b) => {
                b.output.extend_from_slice(data);
                Ok(())
            }
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush().await,
            _ => Ok(()),
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown().await,
            Self::Memory(stream) => {
                stream.shutdown();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Wait until a read would make progress. Streams that cannot
    /// report readiness (`supports_readiness` is false) pend forever;
    /// they belong to the polling loop, not a reactor.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.readable().await,
            Self::Udp(udp) => udp.socket.readable().await,
            Self::Memory(_) | Self::Buffer(_) => std::future::pending().await,
        }
    }

    pub fn supports_readiness(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::Udp(_))
    }

    /// Non-consuming probe used by the polling loop.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Memory(stream) => stream.is_ready(),
            Self::Buffer(b) => !b.input.is_empty(),
            // one throwaway poll of the readiness future; the loop
            // probes again on its next sweep
            Self::Tcp(stream) => stream
                .readable()
                .now_or_never()
                .is_some_and(|r| r.is_ok()),
            Self::Udp(udp) => udp
                .socket
                .readable()
                .now_or_never()
                .is_some_and(|r| r.is_ok()),
        }
    }
}

/// Handle of a started listener; dropping it does not stop the task,
/// `stop` does.
pub struct ListenerHandle {
    pub name: String,
    pub local_addr: Option<SocketAddr>,
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn new(
        name: String,
        local_addr: Option<SocketAddr>,
        stop: Arc<Notify>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            local_addr,
            stop,
            handle,
        }
    }

    pub async fn shutdown(self) {
        // notify_one leaves a permit, so a listener that has not
        // reached its select yet still sees the stop
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}

/// Factory for one URI scheme.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// The URI scheme this factory serves.
    fn name(&self) -> &'static str;

    /// Open an outbound channel to `location` on behalf of an output
    /// port, carrying the given protocol instance.
    async fn create_channel(
        &self,
        core: &Arc<CommCore>,
        location: &Url,
        port: &Arc<OutputPort>,
        protocol: Box<dyn Protocol>,
    ) -> Result<Arc<CommChannel>, CommError>;

    /// Bind and start a listener for an input port.
    async fn create_listener(
        &self,
        core: &Arc<CommCore>,
        port: &Arc<InputPort>,
    ) -> Result<ListenerHandle, CommError>;
}

/// host:port of a location URI, for transports that dial sockets.
pub(crate) fn socket_addr_of(location: &Url) -> Result<(String, u16), CommError> {
    let host = location
        .host_str()
        .ok_or_else(|| CommError::Config(format!("location {location} has no host")))?;
    let port = location
        .port()
        .ok_or_else(|| CommError::Config(format!("location {location} has no port")))?;
    Ok((host.to_string(), port))
}
