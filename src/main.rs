use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use commux::{
    CommChannel, CommError, Message, OperationKind, RuntimeContext, config::Config,
};

/// Stand-in correlation engine for the gateway daemon: echo every
/// request-response operation, absorb one-ways (the core acknowledges
/// them on its own). Real deployments inject their interpreter here.
struct EchoRuntime {
    persistent_connection_timeout: Duration,
}

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
        self.persistent_connection_timeout
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    let runtime = Arc::new(EchoRuntime {
        persistent_connection_timeout: config.runtime.persistent_connection_timeout(),
    });

    let core = commux::server_main(config, runtime).await?;

    tokio::signal::ctrl_c().await?;
    core.shutdown().await;
    Ok(())
}
