use std::sync::Arc;

use codec::Message;

use crate::{
    channel::{ChannelGuard, CommChannel, Redirection},
    core::CommCore,
    error::CommError,
    port::{InputPort, OperationKind},
    session::{ContextGuard, SessionKey},
    statistics::Stats,
};

enum Routed {
    /// The channel goes back to its readiness source (or closes).
    Dispose,
    /// The channel stays out of the reactors: it waits for a redirected
    /// response, or the runtime owes it a deferred reply and disposes
    /// it after sending.
    Parked,
}

/// One handler run: decode exactly one message on the channel and route
/// it. Bound to (channel, optionally pre-acquired guard) at creation.
pub(crate) async fn receive_task(
    core: Arc<CommCore>,
    channel: Arc<CommChannel>,
    guard: Option<ChannelGuard>,
) {
    let mut io = match guard {
        Some(guard) => guard,
        None => channel.lock().await,
    };

    if !core.is_active() {
        return;
    }

    // shutdown owns (or is waiting for) the write side; late handlers
    // step aside instead of extending the drain window
    let latch = core.executor().latch().clone();
    let Ok(_latch) = latch.try_read() else {
        return;
    };

    if let Some(redirection) = channel.take_redirection() {
        forward_response(&core, &channel, &mut io, redirection).await;
        return;
    }

    match io.recv().await {
        Ok(Some(message)) => {
            core.statistics().report(&[Stats::MessagesReceived(1)]);

            match channel.input_port().cloned() {
                Some(port) => dispatch(&core, &channel, io, port, message).await,
                None => {
                    deliver_response(&core, &channel, message);
                    dispose_for_input(&core, &channel, io).await;
                }
            }
        }
        Ok(None) => {
            // peer closed cleanly between messages
            channel.mark_to_be_closed();
            dispose_for_input(&core, &channel, io).await;
        }
        Err(e) if e.is_benign() => {
            log::debug!("receive raced a close: id={}", channel.id());
            channel.close_with(&mut io).await;
        }
        Err(e) => {
            log::error!(
                "channel receive failed: id={}, location={}, err={}",
                channel.id(),
                channel.location(),
                e,
            );
            channel.close_with(&mut io).await;
        }
    }
}

/// Route one inbound request; fault branches reply on the same channel.
async fn dispatch(
    core: &Arc<CommCore>,
    channel: &Arc<CommChannel>,
    mut io: ChannelGuard,
    port: Arc<InputPort>,
    message: Message,
) {
    let outcome = match route(core, channel, &mut io, &port, &message).await {
        Ok(routed) => Ok(routed),
        Err(e) => match e.to_fault() {
            Some(fault) => {
                log::warn!(
                    "request faulted: op={}, id={}, err={}",
                    message.operation,
                    message.id,
                    e,
                );

                let reply = Message::fault(message.id, &message.operation, fault);
                io.send(&reply).await.map(|()| {
                    core.statistics()
                        .report(&[Stats::FaultsSent(1), Stats::MessagesSent(1)]);
                    Routed::Dispose
                })
            }
            None => Err(e),
        },
    };

    match outcome {
        Ok(Routed::Dispose) => dispose_for_input(core, channel, io).await,
        Ok(Routed::Parked) => drop(io),
        Err(e) => {
            log::error!(
                "request handling failed: id={}, location={}, err={}",
                channel.id(),
                channel.location(),
                e,
            );
            channel.close_with(&mut io).await;
        }
    }
}

async fn route(
    core: &Arc<CommCore>,
    channel: &Arc<CommChannel>,
    io: &mut ChannelGuard,
    port: &Arc<InputPort>,
    message: &Message,
) -> Result<Routed, CommError> {
    // more than one non-empty segment: segment[0] names a redirection
    if message.path_segments().nth(1).is_some() {
        return redirect(core, channel, port, message).await;
    }

    if let Some(operation) = port.operations.get(&message.operation) {
        if !operation.request_type.accepts(&message.value) {
            return Err(CommError::TypeMismatch(format!(
                "operation {} expects {}, got {}",
                operation.name,
                operation.request_type,
                message.value.kind(),
            )));
        }

        let response = core
            .context()
            .deliver(message.clone(), channel.clone())
            .await
            .map_err(|e| CommError::CorrelationError(e.to_string()))?;

        if operation.kind == OperationKind::OneWay {
            io.send(&Message::ack(message)).await?;
            core.statistics().report(&[Stats::MessagesSent(1)]);
            return Ok(Routed::Dispose);
        }

        return match response {
            Some(response) => {
                io.send(&response).await?;
                core.statistics().report(&[Stats::MessagesSent(1)]);
                Ok(Routed::Dispose)
            }
            // the runtime replies later; it disposes the channel after
            // that send, so it must not go back to a reactor now
            None => Ok(Routed::Parked),
        };
    }

    if let Some(aggregator) = port.aggregations.get(&message.operation).cloned() {
        if let Some(reply) = aggregator
            .aggregate(message.clone(), channel.clone())
            .await?
        {
            io.send(&reply).await?;
            core.statistics().report(&[Stats::MessagesSent(1)]);
        }

        return Ok(Routed::Dispose);
    }

    Err(CommError::InvalidOperation(message.operation.clone()))
}

/// Open a forwarder to the redirection target and send the rewritten
/// request. The original channel parks until the response comes back.
async fn redirect(
    core: &Arc<CommCore>,
    channel: &Arc<CommChannel>,
    port: &Arc<InputPort>,
    message: &Message,
) -> Result<Routed, CommError> {
    let mut segments = message.path_segments();
    let target = segments.next().unwrap_or("");
    let out_port = port
        .redirections
        .get(target)
        .cloned()
        .ok_or_else(|| CommError::InvalidRedirection(target.to_string()))?;

    let rest: Vec<&str> = segments.collect();
    let forwarded_path = if rest.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", rest.join("/"))
    };

    let outbound = Message::request(
        core.next_message_id(),
        &message.operation,
        forwarded_path,
        message.value.clone(),
    );

    let forwarder = core.acquire_output_channel(&out_port).await?;
    forwarder.set_redirection(channel.clone(), message.id);

    let mut forwarder_io = forwarder.lock().await;
    if let Err(e) = forwarder_io.send(&outbound).await {
        forwarder.take_redirection();
        forwarder.close_with(&mut forwarder_io).await;
        return Err(e);
    }

    core.statistics().report(&[Stats::MessagesSent(1)]);
    log::debug!(
        "request redirected: target={}, inbound_id={}, outbound_id={}",
        target,
        message.id,
        outbound.id,
    );

    dispose_for_input(core, &forwarder, forwarder_io).await;
    Ok(Routed::Parked)
}

/// Forwarder role: the decoded message is the response to a redirected
/// request. Rewrite it under the original id, hand it back, and retire
/// both ends of the bridge.
async fn forward_response(
    core: &Arc<CommCore>,
    forwarder: &Arc<CommChannel>,
    io: &mut ChannelGuard,
    redirection: Redirection,
) {
    match io.recv().await {
        Ok(Some(response)) => {
            core.statistics().report(&[Stats::MessagesReceived(1)]);

            let rewritten = response.with_id(redirection.message_id);
            match redirection.partner.send(&rewritten).await {
                Ok(()) => core.statistics().report(&[Stats::MessagesSent(1)]),
                Err(e) => log::error!(
                    "redirected response delivery failed: id={}, err={}",
                    redirection.message_id,
                    e,
                ),
            }
        }
        Ok(None) => log::error!(
            "redirect target closed before responding: id={}",
            redirection.message_id,
        ),
        Err(e) => log::error!(
            "redirect response receive failed: id={}, err={}",
            redirection.message_id,
            e,
        ),
    }

    redirection.partner.close().await;
    forwarder.close_with(io).await;
}

/// Restore the originating execution context, then hand the response to
/// the correlation layer.
fn deliver_response(core: &Arc<CommCore>, channel: &Arc<CommChannel>, message: Message) {
    let registry = core.response_sessions();
    let context = registry
        .get(SessionKey::Channel(channel.id()))
        .or_else(|| registry.get(SessionKey::Message(message.id)));

    let _context = context.map(ContextGuard::install);
    core.messages().receive_response(channel, message);
}

/// Return the channel to its readiness source, or close it when marked.
pub(crate) async fn dispose_for_input(
    core: &Arc<CommCore>,
    channel: &Arc<CommChannel>,
    io: ChannelGuard,
) {
    let mut io = io;

    if channel.to_be_closed() || !channel.is_open() {
        channel.close_with(&mut io).await;
        return;
    }

    if io.has_buffered_input() {
        // already-decoded input: skip readiness, go straight back to a
        // handler
        core.executor()
            .schedule_receive(core.clone(), channel.clone(), Some(io));
        return;
    }

    drop(io);
    if let Err(e) = core.register_for_input(channel.clone()) {
        log::debug!("channel left unregistered: id={}, err={}", channel.id(), e);
        channel.close().await;
    }
}
