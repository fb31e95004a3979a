use std::io::{Read, Write};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use codec::Message;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};
use url::Url;

use crate::{
    config::SslConfig,
    error::CommError,
    protocol::Protocol,
    transport::TransportStream,
};

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(
    name: &str,
) -> Result<&'static [&'static rustls::SupportedProtocolVersion], CommError> {
    match name {
        "TLSv1.2" => Ok(rustls::ALL_VERSIONS),
        "TLSv1.3" => Ok(TLS13_ONLY),
        other => Err(CommError::Config(format!(
            "ssl.protocol {other:?} is not supported, the minimum is TLSv1.2"
        ))),
    }
}

fn pem_error(e: rustls_pki_types::pem::Error) -> CommError {
    CommError::Config(format!("ssl store unreadable: {e}"))
}

fn warn_on_passwords(cfg: &SslConfig) {
    if cfg.key_store_password.is_some() || cfg.trust_store_password.is_some() {
        log::warn!("ssl store passwords are ignored: PEM stores are not password wrapped");
    }
}

fn check_store_format(format: &str) -> Result<(), CommError> {
    if format.eq_ignore_ascii_case("pem") {
        Ok(())
    } else {
        Err(CommError::Config(format!(
            "ssl store format {format:?} is not supported, only PEM is"
        )))
    }
}

/// Wraps an inner protocol with transport-layer security.
///
/// The rustls connection is driven sans-io: ciphertext moves between
/// the transport stream and the session here, plaintext moves between
/// the session and the inner protocol through an in-memory hop. The
/// inner protocol never sees a single encrypted byte.
pub struct TlsProtocol {
    session: Connection,
    inner: Box<dyn Protocol>,
    /// Ciphertext read from the transport, not yet fed to the session.
    incoming: BytesMut,
    /// Decrypted bytes the inner protocol has not consumed yet.
    plain: BytesMut,
    closed: bool,
}

impl std::fmt::Debug for TlsProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsProtocol")
            .field("incoming", &self.incoming)
            .field("plain", &self.plain)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl TlsProtocol {
    /// Client-side wrapper. The trust store is mandatory: there is no
    /// platform fallback.
    pub fn client(
        cfg: &SslConfig,
        location: &Url,
        inner: Box<dyn Protocol>,
    ) -> Result<Self, CommError> {
        warn_on_passwords(cfg);
        check_store_format(&cfg.trust_store_format)?;

        let trust_store = cfg.trust_store.as_ref().ok_or_else(|| {
            CommError::Config("ssl.trust_store is mandatory in client mode".to_string())
        })?;

        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(trust_store).map_err(pem_error)? {
            roots.add(cert.map_err(pem_error)?)?;
        }

        let config = ClientConfig::builder_with_protocol_versions(protocol_versions(
            &cfg.protocol,
        )?)
        .with_root_certificates(roots)
        .with_no_client_auth();

        let host = location
            .host_str()
            .ok_or_else(|| CommError::Config(format!("location {location} has no host")))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| CommError::Config(format!("bad TLS server name {host:?}: {e}")))?;

        let session = ClientConnection::new(config.into(), server_name)?;
        Ok(Self::new(Connection::Client(session), inner))
    }

    /// Server-side wrapper. The key store (PEM chain plus private key
    /// in one file) is mandatory.
    pub fn server(cfg: &SslConfig, inner: Box<dyn Protocol>) -> Result<Self, CommError> {
        warn_on_passwords(cfg);
        check_store_format(&cfg.key_store_format)?;

        let key_store = cfg.key_store.as_ref().ok_or_else(|| {
            CommError::Config("ssl.key_store is mandatory in server mode".to_string())
        })?;

        let certs = CertificateDer::pem_file_iter(key_store)
            .map_err(pem_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(pem_error)?;
        let key = PrivateKeyDer::from_pem_file(key_store).map_err(pem_error)?;

        let config = ServerConfig::builder_with_protocol_versions(protocol_versions(
            &cfg.protocol,
        )?)
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

        let session = ServerConnection::new(config.into())?;
        Ok(Self::new(Connection::Server(session), inner))
    }

    fn new(session: Connection, inner: Box<dyn Protocol>) -> Self {
        Self {
            session,
            inner,
            incoming: BytesMut::new(),
            plain: BytesMut::new(),
            closed: false,
        }
    }

    /// Write every pending ciphertext record to the transport.
    async fn flush_tls(&mut self, stream: &mut TransportStream) -> Result<(), CommError> {
        while self.session.wants_write() {
            let mut out = Vec::new();
            self.session.write_tls(&mut out)?;
            if out.is_empty() {
                break;
            }
            stream.write_all(&out).await?;
        }

        stream.flush().await?;
        Ok(())
    }

    /// Pull ciphertext from the transport (or the leftover buffer) and
    /// turn every complete record into plaintext. A transport close
    /// latches `closed`.
    async fn unwrap_more(&mut self, stream: &mut TransportStream) -> Result<(), CommError> {
        if self.closed {
            return Ok(());
        }

        if self.incoming.is_empty() {
            let read = stream.read_buf(&mut self.incoming).await?;
            if read == 0 {
                self.closed = true;
                return Ok(());
            }
        }

        while !self.incoming.is_empty() {
            let mut cursor: &[u8] = &self.incoming;
            let consumed = self.session.read_tls(&mut cursor)?;
            self.incoming.advance(consumed);
            if consumed == 0 {
                break;
            }

            let state = self.session.process_new_packets()?;

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let mut plaintext = vec![0u8; pending];
                self.session.reader().read_exact(&mut plaintext)?;
                self.plain.extend_from_slice(&plaintext);
            }

            if state.peer_has_closed() {
                self.closed = true;
                break;
            }
        }

        Ok(())
    }

    /// Drive the handshake to completion. Each turn either wraps a
    /// pending outbound flight or unwraps more inbound records; short
    /// reads simply loop again.
    async fn complete_handshake(&mut self, stream: &mut TransportStream) -> Result<(), CommError> {
        while self.session.is_handshaking() {
            if self.session.wants_write() {
                self.flush_tls(stream).await?;
                continue;
            }

            self.unwrap_more(stream).await?;
            if self.closed && self.session.is_handshaking() {
                return Err(CommError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed during the TLS handshake",
                )));
            }
        }

        // final flight (client Finished, server tickets)
        self.flush_tls(stream).await
    }
}

#[async_trait]
impl Protocol for TlsProtocol {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn is_concurrent(&self) -> bool {
        self.inner.is_concurrent()
    }

    fn has_buffered_input(&self) -> bool {
        !self.plain.is_empty() || !self.incoming.is_empty() || self.inner.has_buffered_input()
    }

    async fn send(
        &mut self,
        stream: &mut TransportStream,
        message: &Message,
    ) -> Result<(), CommError> {
        self.complete_handshake(stream).await?;

        let mut hop = TransportStream::buffer(BytesMut::new());
        self.inner.send(&mut hop, message).await?;
        let plaintext = hop.take_output();

        self.session
            .writer()
            .write_all(&plaintext)
            .map_err(CommError::Io)?;
        self.flush_tls(stream).await
    }

    async fn recv(&mut self, stream: &mut TransportStream) -> Result<Option<Message>, CommError> {
        self.complete_handshake(stream).await?;

        loop {
            let mut hop = TransportStream::buffer(self.plain.split());
            let result = self.inner.recv(&mut hop).await;
            self.plain = hop.take_unread();

            match result {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) if self.closed => return Ok(None),
                Ok(None) => {}
                Err(CommError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof && !self.closed => {}
                Err(e) => return Err(e),
            }

            self.unwrap_more(stream).await?;
        }
    }
}
