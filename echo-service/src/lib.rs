/*!
An in-process echo service.

Registers on a service endpoint and reflects every received payload
back to the bundle's source, mirroring the original bundle's lifetime.
Useful for reachability testing between nodes.
*/

use std::sync::Arc;
use tracing::{debug, warn};
use tundra_bpa::{
    agent::Agent,
    registration::{ServiceEvent, ServiceToken},
};
use tundra_bpv6::bundle::{BlockFlags, BlockType, Bundle as WireBundle};

/// The conventional echo service number.
pub const ECHO_SERVICE: u32 = 7;

pub struct EchoService {
    agent: Arc<Agent>,
    token: ServiceToken,
}

impl EchoService {
    /// Registers the echo service and starts its task.
    pub fn start(
        agent: Arc<Agent>,
        service: u32,
    ) -> Result<Arc<Self>, tundra_bpa::registration::Error> {
        let (token, events) = agent.register_service(service)?;
        let echo = Arc::new(Self { agent, token });

        let this = echo.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if let ServiceEvent::Deliver(handle) = event {
                    this.echo(&handle);
                    this.agent.processing_finished(handle);
                }
            }
        });

        Ok(echo)
    }

    pub fn unregister(&self) {
        self.agent.unregister_service(self.token);
    }

    fn echo(&self, handle: &tundra_bpa::slot::Handle) {
        let (source, lifetime, payload) = {
            let guard = handle.read();
            let Some(payload) = guard.bundle.payload_block() else {
                warn!("Echo request without payload, ignoring");
                return;
            };
            (
                guard.bundle.source,
                guard.bundle.lifetime,
                payload.data.clone(),
            )
        };

        if source.is_null() {
            // Anonymous bundles have nowhere to echo to.
            return;
        }

        debug!("Echoing {} octets back to {source}", payload.len());

        // The requester becomes the destination; the agent's send path
        // fills in our side.
        let mut reply = WireBundle {
            destination: source,
            lifetime,
            ..Default::default()
        };
        reply.flags.is_singleton = true;
        reply.add_block(BlockType::Payload, BlockFlags::default(), payload);

        if self.agent.submit(self.token, reply).is_err() {
            warn!("Failed to send echo reply to {source}");
        }
    }
}
