use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use commux::{
    CommChannel, CommCore, CommError, InputPort, Message, MessageId, Operation, OperationKind,
    OutputPort, RuntimeContext, Value, ValueKind,
    core::CommCoreOptions,
    faults,
    port::Aggregator,
};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Correlation engine used by the test gateways: records every
/// delivered request and echoes request-response operations.
#[derive(Default)]
struct RecordingRuntime {
    received: Mutex<Vec<Message>>,
}

impl RecordingRuntime {
    fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeContext for RecordingRuntime {
    async fn deliver(
        &self,
        message: Message,
        channel: Arc<CommChannel>,
    ) -> Result<Option<Message>, CommError> {
        self.received.lock().unwrap().push(message.clone());

        let request_response = channel
            .input_port()
            .and_then(|port| port.operations.get(&message.operation))
            .is_some_and(|op| op.kind == OperationKind::RequestResponse);

        Ok(request_response
            .then(|| Message::response(message.id, &message.operation, message.value.clone())))
    }

    fn persistent_connection_timeout(&self) -> Duration {
        Duration::from_millis(500)
    }
}

fn location(addr: std::net::SocketAddr) -> Url {
    Url::parse(&format!("socket://{addr}")).unwrap()
}

/// Server core with one socket input port bound to an ephemeral port.
async fn start_server(port: InputPort) -> (Arc<CommCore>, Arc<RecordingRuntime>, Url) {
    let runtime = Arc::new(RecordingRuntime::default());
    let core = CommCore::new(runtime.clone(), CommCoreOptions::default());

    let name = port.name.clone();
    core.init(&[Arc::new(port)]).await.unwrap();

    let addr = core.listener_addr(&name).unwrap();
    (core, runtime, location(addr))
}

fn client_core() -> Arc<CommCore> {
    CommCore::new(
        Arc::new(RecordingRuntime::default()),
        CommCoreOptions::default(),
    )
}

fn echo_port(location: Url) -> InputPort {
    InputPort::new("server", location, "wire")
        .with_operation(Operation::one_way("echo", ValueKind::String))
        .with_operation(Operation::request_response("ping", ValueKind::Any))
}

fn listen_location() -> Url {
    Url::parse("socket://127.0.0.1:0").unwrap()
}

#[tokio::test]
async fn echo_direct_one_way() -> Result<()> {
    let (server, runtime, location) = start_server(echo_port(listen_location())).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("server", location, "wire"));
    let channel = client.acquire_output_channel(&out).await?;

    let request = Message::request(MessageId(1), "echo", "/", Value::from("hi"));
    let ack = client.call(&channel, request).await?;

    // empty acknowledgement under the request id, no fault
    assert_eq!(ack.id, MessageId(1));
    assert_eq!(ack.value, Value::Void);
    assert!(!ack.is_fault());

    let delivered = runtime.received();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].operation, "echo");

    client.release_output_channel(channel).await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_operation_faults() -> Result<()> {
    let (server, runtime, location) = start_server(echo_port(listen_location())).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("server", location, "wire"));
    let channel = client.acquire_output_channel(&out).await?;

    let request = Message::request(MessageId(9), "nope", "/", Value::Void);
    let reply = client.call(&channel, request).await?;

    let fault = reply.fault.expect("fault reply expected");
    assert_eq!(fault.name, faults::IO_EXCEPTION);
    assert_eq!(fault.detail, "Invalid operation: nope");

    // no handler state retained
    assert!(runtime.received().is_empty());

    client.release_output_channel(channel).await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn type_mismatch_faults() -> Result<()> {
    let (server, runtime, location) = start_server(echo_port(listen_location())).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("server", location, "wire"));
    let channel = client.acquire_output_channel(&out).await?;

    // echo expects a string
    let request = Message::request(MessageId(2), "echo", "/", Value::Int(1));
    let reply = client.call(&channel, request).await?;

    let fault = reply.fault.expect("fault reply expected");
    assert_eq!(fault.name, faults::TYPE_MISMATCH);
    assert!(runtime.received().is_empty());

    client.release_output_channel(channel).await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn redirection_round_trip() -> Result<()> {
    // backend answering "ping"
    let (backend, backend_runtime, backend_location) =
        start_server(echo_port(listen_location())).await;

    // gateway with no own operations, only the redirection
    let backend_port = Arc::new(OutputPort::new("backend", backend_location, "wire"));
    let gateway_port = InputPort::new("gateway", listen_location(), "wire")
        .with_redirection("svcA", backend_port);
    let (gateway, _, gateway_location) = start_server(gateway_port).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("gateway", gateway_location, "wire"));
    let channel = client.acquire_output_channel(&out).await?;

    let request = Message::request(MessageId(7), "ping", "/svcA/deep", Value::from("hello"));
    let response = client.call(&channel, request).await?;

    // original id restored, payload echoed through the backend
    assert_eq!(response.id, MessageId(7));
    assert_eq!(response.value, Value::from("hello"));
    assert!(!response.is_fault());

    // the backend saw the trimmed path and a rewritten id
    let delivered = backend_runtime.received();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].resource_path, "/deep");
    assert_ne!(delivered[0].id, MessageId(7));

    // the gateway closes the inbound channel after the response
    let mut io = channel.lock().await;
    assert!(io.recv().await?.is_none());
    drop(io);

    gateway.shutdown().await;
    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_redirection_target_faults() -> Result<()> {
    let (server, _, location) = start_server(echo_port(listen_location())).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("server", location, "wire"));
    let channel = client.acquire_output_channel(&out).await?;

    let request = Message::request(MessageId(4), "ping", "/missing/deep", Value::Void);
    let reply = client.call(&channel, request).await?;

    let fault = reply.fault.expect("fault reply expected");
    assert_eq!(fault.name, faults::IO_EXCEPTION);
    assert_eq!(fault.detail, "Invalid redirection: missing");

    client.release_output_channel(channel).await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn aggregation_branch_replies() -> Result<()> {
    struct UpperCase;

    #[async_trait]
    impl Aggregator for UpperCase {
        async fn aggregate(
            &self,
            message: Message,
            _channel: Arc<CommChannel>,
        ) -> Result<Option<Message>, CommError> {
            let value = match &message.value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other.clone(),
            };
            Ok(Some(Message::response(message.id, &message.operation, value)))
        }
    }

    let port = InputPort::new("server", listen_location(), "wire")
        .with_aggregation("shout", Arc::new(UpperCase));
    let (server, _, location) = start_server(port).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("server", location, "wire"));
    let channel = client.acquire_output_channel(&out).await?;

    let request = Message::request(MessageId(5), "shout", "/", Value::from("quiet"));
    let reply = client.call(&channel, request).await?;
    assert_eq!(reply.value, Value::from("QUIET"));

    client.release_output_channel(channel).await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn persistent_channel_reused_across_calls() -> Result<()> {
    let (server, _, location) = start_server(echo_port(listen_location())).await;

    let client = client_core();
    let out = Arc::new(OutputPort::new("server", location, "wire"));

    for round in 0..2u64 {
        let channel = client.acquire_output_channel(&out).await?;
        let request = Message::request(
            MessageId(100 + round),
            "ping",
            "/",
            Value::Int(round as i64),
        );
        let response = client.call(&channel, request).await?;
        assert_eq!(response.value, Value::Int(round as i64));
        client.release_output_channel(channel).await;
    }

    // one TCP connection end to end: the second round reused the first
    let client_stats = client.statistics().snapshot();
    assert_eq!(client_stats.connections_opened, 1);
    assert_eq!(client_stats.connections_reused, 1);

    let server_stats = server.statistics().snapshot();
    assert_eq!(server_stats.connections_accepted, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn memory_transport_served_by_polling_loop() -> Result<()> {
    let runtime = Arc::new(RecordingRuntime::default());
    let core = CommCore::new(runtime.clone(), CommCoreOptions::default());

    let port = InputPort::new(
        "pipe",
        Url::parse("memory://pipe-echo:1").unwrap(),
        "wire",
    )
    .with_operation(Operation::request_response("ping", ValueKind::Any));
    core.init(&[Arc::new(port)]).await.unwrap();

    let out = Arc::new(OutputPort::new(
        "pipe",
        Url::parse("memory://pipe-echo:1").unwrap(),
        "wire",
    ));
    let channel = core.acquire_output_channel(&out).await?;

    let request = Message::request(MessageId(11), "ping", "/", Value::from("through the pipe"));
    let response = core.call(&channel, request).await?;
    assert_eq!(response.value, Value::from("through the pipe"));

    core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn datagram_transport_round_trip() -> Result<()> {
    let runtime = Arc::new(RecordingRuntime::default());
    let core = CommCore::new(runtime.clone(), CommCoreOptions::default());

    let port = InputPort::new(
        "udp",
        Url::parse("datagram://127.0.0.1:0").unwrap(),
        "wire",
    )
    .with_operation(Operation::request_response("ping", ValueKind::Any));
    core.init(&[Arc::new(port)]).await.unwrap();

    let addr = core.listener_addr("udp").unwrap();
    let out = Arc::new(
        OutputPort::new(
            "udp",
            Url::parse(&format!("datagram://{addr}")).unwrap(),
            "wire",
        )
        .with_persistent(false),
    );

    let channel = core.acquire_output_channel(&out).await?;
    let request = Message::request(MessageId(12), "ping", "/", Value::Int(42));
    let response = core.call(&channel, request).await?;
    assert_eq!(response.value, Value::Int(42));

    core.release_output_channel(channel).await;
    core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let client = client_core();
    let out = Arc::new(OutputPort::new(
        "nowhere",
        Url::parse("warp://127.0.0.1:1").unwrap(),
        "wire",
    ));

    let err = client.acquire_output_channel(&out).await.unwrap_err();
    assert!(matches!(err, CommError::UnsupportedMedium(_)));
}

#[tokio::test]
async fn unsupported_protocol_is_rejected() {
    let client = client_core();
    let out = Arc::new(OutputPort::new(
        "nowhere",
        Url::parse("socket://127.0.0.1:1").unwrap(),
        "soap",
    ));

    let err = client.acquire_output_channel(&out).await.unwrap_err();
    assert!(matches!(err, CommError::UnsupportedProtocol(_)));
}

#[tokio::test]
async fn clean_shutdown_is_quick_and_final() -> Result<()> {
    let (server, _, location) = start_server(echo_port(listen_location())).await;

    let started = Instant::now();
    server.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!server.is_active());

    // listeners are gone: connecting now fails
    let (host, port) = (
        location.host_str().unwrap().to_string(),
        location.port().unwrap(),
    );
    assert!(
        tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .is_err()
    );

    // idempotent
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_a_blocked_handler() -> Result<()> {
    let (server, _, location) = start_server(echo_port(listen_location())).await;

    // park a handler mid-frame: a header promising bytes that never come
    let (host, port) = (
        location.host_str().unwrap().to_string(),
        location.port().unwrap(),
    );
    let mut stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
    stream.write_all(&64u32.to_be_bytes()).await?;
    stream.write_all(b"stub").await?;
    stream.flush().await?;

    // let the reactor hand the channel to a handler
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    server.shutdown().await;

    // drain window (5 s) plus the executor grace (500 ms here)
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(!server.is_active());
    Ok(())
}
