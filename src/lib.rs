pub mod channel;
pub mod config;
pub mod core;
pub mod correlation;
mod dispatcher;
pub mod error;
pub mod executor;
pub mod polling;
pub mod pool;
pub mod port;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod statistics;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;

pub use codec::{Fault, Message, MessageId, Value, ValueKind, faults};

pub use crate::{
    channel::{ChannelId, CommChannel},
    config::Config,
    core::{CommCore, CommCoreOptions, RuntimeContext},
    error::CommError,
    port::{InputPort, Operation, OperationKind, OutputPort},
};

/// Build and start a core from a loaded configuration. Opened up so
/// that integration tests can start the gateway in-process instead of
/// going through the binary.
pub async fn server_main(
    config: Arc<Config>,
    context: Arc<dyn RuntimeContext>,
) -> anyhow::Result<Arc<CommCore>> {
    let (inputs, _outputs) = config.build_ports()?;
    let core = CommCore::new(context, CommCoreOptions::from(&config.runtime));
    core.init(&inputs).await?;
    Ok(core)
}
