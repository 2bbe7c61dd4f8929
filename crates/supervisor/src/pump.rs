use std::sync::Arc;

use {
    tokio::sync::broadcast::{Receiver, error::RecvError},
    tracing::{debug, warn},
};

use {
    warden_extensions::{CallbackTasks, ClientHandle, ExtensionRegistry, deliver_event, dispatch},
    warden_protocol::Event,
};

/// Feed one connection's events to extension hooks, then route messages.
/// One event is handled completely before the next is read. Callbacks run
/// in `tasks`, which the supervisor closes before tearing extensions down.
pub(crate) async fn pump(
    registry: Arc<ExtensionRegistry>,
    tasks: Arc<CallbackTasks>,
    client: ClientHandle,
    mut events: Receiver<Event>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                deliver_event(&registry, &tasks, &client, &event).await;
                if let Event::Message(message) = &event {
                    let routed = dispatch(&registry, &tasks, &client, message).await;
                    debug!(client = %client.name, sender = %message.sender, ?routed, "message routed");
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(client = %client.name, skipped, "event pump fell behind");
            },
            Err(RecvError::Closed) => break,
        }
        if tasks.is_closed() {
            break;
        }
    }
}
