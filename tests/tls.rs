use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use commux::{
    CommChannel, CommCore, CommError, InputPort, Message, MessageId, Operation, OperationKind,
    OutputPort, RuntimeContext, Value, ValueKind,
    config::SslConfig,
    core::CommCoreOptions,
};
use url::Url;

struct EchoRuntime;

#[async_trait]
impl RuntimeContext for EchoRuntime {
    async fn deliver(
        &self,
        message: Message,
        channel: Arc<CommChannel>,
    ) -> Result<Option<Message>, CommError> {
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

/// Self-signed identity for localhost written as PEM files.
fn write_stores(tag: &str) -> (PathBuf, PathBuf) {
    let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();

    let key_store = dir.join(format!("commux-e2e-{tag}-{}-key.pem", std::process::id()));
    let trust_store = dir.join(format!("commux-e2e-{tag}-{}-trust.pem", std::process::id()));

    fs::write(
        &key_store,
        format!(
            "{}{}",
            identity.cert.pem(),
            identity.key_pair.serialize_pem()
        ),
    )
    .unwrap();
    fs::write(&trust_store, identity.cert.pem()).unwrap();

    (key_store, trust_store)
}

fn server_ssl(key_store: PathBuf) -> SslConfig {
    SslConfig {
        key_store: Some(key_store),
        ..SslConfig::default()
    }
}

fn client_ssl(trust_store: PathBuf) -> SslConfig {
    SslConfig {
        trust_store: Some(trust_store),
        ..SslConfig::default()
    }
}

async fn exchange(core: &Arc<CommCore>, out: &Arc<OutputPort>, value: Value) -> Result<Message> {
    let channel = core.acquire_output_channel(out).await?;
    let request = Message::request(MessageId(1), "secure", "/", value);
    let response = core.call(&channel, request).await?;
    core.release_output_channel(channel).await;
    Ok(response)
}

/// E4: handshake plus one request-response; the wrapped exchange
/// matches the plaintext baseline.
#[tokio::test]
async fn tls_transparent_round_trip() -> Result<()> {
    let (key_store, trust_store) = write_stores("roundtrip");

    let secure_port = InputPort::new(
        "secure",
        Url::parse("socket://localhost:0").unwrap(),
        "wire",
    )
    .with_operation(Operation::request_response("secure", ValueKind::Any))
    .with_ssl(server_ssl(key_store));

    let plain_port = InputPort::new(
        "plain",
        Url::parse("socket://localhost:0").unwrap(),
        "wire",
    )
    .with_operation(Operation::request_response("secure", ValueKind::Any));

    let server = CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default());
    server
        .init(&[Arc::new(secure_port), Arc::new(plain_port)])
        .await
        .unwrap();

    let secure_addr = server.listener_addr("secure").unwrap();
    let plain_addr = server.listener_addr("plain").unwrap();

    let client = CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default());

    let secure_out = Arc::new(
        OutputPort::new(
            "secure",
            Url::parse(&format!("socket://localhost:{}", secure_addr.port())).unwrap(),
            "wire",
        )
        .with_ssl(client_ssl(trust_store)),
    );
    let plain_out = Arc::new(OutputPort::new(
        "plain",
        Url::parse(&format!("socket://localhost:{}", plain_addr.port())).unwrap(),
        "wire",
    ));

    let payload = Value::from("same over both stacks");
    let secured = exchange(&client, &secure_out, payload.clone()).await?;
    let baseline = exchange(&client, &plain_out, payload).await?;

    assert_eq!(secured.value, baseline.value);
    assert_eq!(secured.id, baseline.id);
    assert!(!secured.is_fault());

    server.shutdown().await;
    Ok(())
}

/// A client without a matching trust anchor must not complete the
/// handshake.
#[tokio::test]
async fn tls_untrusted_server_rejected() -> Result<()> {
    let (key_store, _trust_store) = write_stores("untrusted-server");
    // roots from a different identity
    let (_unrelated_key, unrelated_trust) = write_stores("untrusted-roots");

    let secure_port = InputPort::new(
        "secure",
        Url::parse("socket://localhost:0").unwrap(),
        "wire",
    )
    .with_operation(Operation::request_response("secure", ValueKind::Any))
    .with_ssl(server_ssl(key_store));

    let server = CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default());
    server.init(&[Arc::new(secure_port)]).await.unwrap();
    let addr = server.listener_addr("secure").unwrap();

    let client = CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default());
    let out = Arc::new(
        OutputPort::new(
            "secure",
            Url::parse(&format!("socket://localhost:{}", addr.port())).unwrap(),
            "wire",
        )
        .with_ssl(client_ssl(unrelated_trust)),
    );

    let err = exchange(&client, &out, Value::Void).await;
    assert!(err.is_err());

    server.shutdown().await;
    Ok(())
}

/// TLS reuse composes with the persistent pool: the handshake happens
/// once for two calls.
#[tokio::test]
async fn tls_channel_is_pooled() -> Result<()> {
    let (key_store, trust_store) = write_stores("pooled");

    let secure_port = InputPort::new(
        "secure",
        Url::parse("socket://localhost:0").unwrap(),
        "wire",
    )
    .with_operation(Operation::request_response("secure", ValueKind::Any))
    .with_ssl(server_ssl(key_store));

    let server = CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default());
    server.init(&[Arc::new(secure_port)]).await.unwrap();
    let addr = server.listener_addr("secure").unwrap();

    let client = CommCore::new(Arc::new(EchoRuntime), CommCoreOptions::default());
    let out = Arc::new(
        OutputPort::new(
            "secure",
            Url::parse(&format!("socket://localhost:{}", addr.port())).unwrap(),
            "wire",
        )
        .with_ssl(client_ssl(trust_store)),
    );

    for round in 0..2i64 {
        let response = exchange(&client, &out, Value::Int(round)).await?;
        assert_eq!(response.value, Value::Int(round));
    }

    let stats = client.statistics().snapshot();
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.connections_reused, 1);

    server.shutdown().await;
    Ok(())
}
