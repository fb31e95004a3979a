use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use codec::{Message, ValueKind};
use serde::Deserialize;
use url::Url;

use crate::{channel::CommChannel, config::SslConfig, error::CommError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    OneWay,
    RequestResponse,
}

/// One operation declared at an input port.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub kind: OperationKind,
    pub request_type: ValueKind,
}

impl Operation {
    pub fn one_way(name: impl Into<String>, request_type: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::OneWay,
            request_type,
        }
    }

    pub fn request_response(name: impl Into<String>, request_type: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::RequestResponse,
            request_type,
        }
    }
}

/// Server-side composition hook: the port forwards or transforms an
/// incoming operation into calls to sub-services. External collaborator
/// of the core; returning a message means "reply with this".
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(
        &self,
        message: Message,
        channel: Arc<CommChannel>,
    ) -> Result<Option<Message>, CommError>;
}

/// Server-side binding of a location to a protocol and an interface.
pub struct InputPort {
    pub name: String,
    pub location: Url,
    pub protocol: String,
    pub ssl: Option<SslConfig>,
    pub operations: AHashMap<String, Operation>,
    pub redirections: AHashMap<String, Arc<OutputPort>>,
    pub aggregations: AHashMap<String, Arc<dyn Aggregator>>,
}

impl InputPort {
    pub fn new(name: impl Into<String>, location: Url, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location,
            protocol: protocol.into(),
            ssl: None,
            operations: AHashMap::new(),
            redirections: AHashMap::new(),
            aggregations: AHashMap::new(),
        }
    }

    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.insert(operation.name.clone(), operation);
        self
    }

    pub fn with_redirection(mut self, target: impl Into<String>, port: Arc<OutputPort>) -> Self {
        self.redirections.insert(target.into(), port);
        self
    }

    pub fn with_aggregation(
        mut self,
        operation: impl Into<String>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        self.aggregations.insert(operation.into(), aggregator);
        self
    }
}

/// Client-side binding of a location to a protocol.
pub struct OutputPort {
    pub name: String,
    pub location: Url,
    pub protocol: String,
    pub ssl: Option<SslConfig>,
    /// Whether released channels go to the persistent pool.
    pub persistent: bool,
}

impl OutputPort {
    pub fn new(name: impl Into<String>, location: Url, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location,
            protocol: protocol.into(),
            ssl: None,
            persistent: true,
        }
    }

    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}
