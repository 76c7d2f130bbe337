/*!
Service registrations and local delivery.

A service registers an `(app id, node id)` endpoint together with an
inbox channel; the agent delivers at most one bundle per registration
at a time. The busy flag is cleared when the service reports that it
finished processing.
*/

use super::*;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// `0xFFFF` is the unregistered sentinel and can never be a live
    /// application id.
    #[error("Application id 0xFFFF is reserved")]
    ReservedAppId,
}

/// The unregistered sentinel.
pub const APP_ID_NONE: u32 = 0xFFFF;

/// Identifies one registration; services pass it back when sending
/// bundles and signalling completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ServiceToken(usize);

/// Messages from the agent to a registered service.
#[derive(Debug)]
pub enum ServiceEvent {
    /// A bundle addressed to this service. The service must call
    /// `processing_finished` when done to receive the next one.
    Deliver(slot::Handle),
    /// A bundle submitted by this service reached storage.
    Stored { bundle_number: u32 },
    /// A bundle submitted by this service could not be stored.
    StoreFailed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Active,
    Passive,
}

struct Registration {
    token: ServiceToken,
    node_id: u32,
    app_id: u32,
    status: ServiceStatus,
    busy: bool,
    inbox: flume::Sender<ServiceEvent>,
}

/// Outcome of a local delivery attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to a service; await `processing_finished`.
    Delivered,
    /// The matching service is processing another bundle.
    Busy,
    /// No active registration for the destination service; the bundle
    /// stays in storage.
    NoService,
}

pub struct ServiceRegistry {
    node: node_ids::NodeId,
    inner: Mutex<Vec<Registration>>,
    next_token: std::sync::atomic::AtomicUsize,
}

impl ServiceRegistry {
    pub fn new(node: node_ids::NodeId) -> Self {
        Self {
            node,
            inner: Mutex::new(Vec::new()),
            next_token: std::sync::atomic::AtomicUsize::new(1),
        }
    }

    /// Registers `app_id` with an inbox. A node id of `None` registers
    /// on the local node. Registering an existing endpoint again
    /// returns the existing registration.
    pub fn register(
        &self,
        app_id: u32,
        node_id: Option<u32>,
        inbox: flume::Sender<ServiceEvent>,
    ) -> core::result::Result<ServiceToken, Error> {
        if app_id == APP_ID_NONE {
            return Err(Error::ReservedAppId);
        }
        let node_id = node_id.unwrap_or(self.node.node_number());

        let mut inner = self.inner.lock().trace_expect("registry poisoned");
        if let Some(existing) = inner
            .iter()
            .find(|r| r.node_id == node_id && r.app_id == app_id)
        {
            debug!("Endpoint ipn:{node_id}.{app_id} is already registered");
            return Ok(existing.token);
        }

        let token = ServiceToken(
            self.next_token
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        inner.push(Registration {
            token,
            node_id,
            app_id,
            status: ServiceStatus::Active,
            busy: false,
            inbox,
        });
        info!("New service registration for endpoint ipn:{node_id}.{app_id}");
        Ok(token)
    }

    pub fn unregister(&self, token: ServiceToken) {
        self.inner
            .lock()
            .trace_expect("registry poisoned")
            .retain(|r| r.token != token);
    }

    pub fn set_status(&self, token: ServiceToken, status: ServiceStatus) -> bool {
        let mut inner = self.inner.lock().trace_expect("registry poisoned");
        match inner.iter_mut().find(|r| r.token == token) {
            Some(r) => {
                r.status = status;
                true
            }
            None => false,
        }
    }

    /// The application id behind `token`, or `APP_ID_NONE`.
    pub fn app_id_of(&self, token: ServiceToken) -> u32 {
        self.inner
            .lock()
            .trace_expect("registry poisoned")
            .iter()
            .find(|r| r.token == token)
            .map(|r| r.app_id)
            .unwrap_or(APP_ID_NONE)
    }

    /// Whether a registration exists for the endpoint.
    pub fn is_local(&self, app_id: u32, node_id: u32) -> bool {
        let node_id = if node_id == 0 {
            self.node.node_number()
        } else {
            node_id
        };
        self.inner
            .lock()
            .trace_expect("registry poisoned")
            .iter()
            .any(|r| r.node_id == node_id && r.app_id == app_id)
    }

    /// Attempts to hand `handle` to the service registered for its
    /// destination. At most one bundle is in flight per registration;
    /// successful delivery marks the bundle in the redundancy filter.
    pub fn deliver(
        &self,
        handle: &slot::Handle,
        redundancy: &redundancy::RedundancyFilter,
    ) -> DeliveryOutcome {
        let (dst_srv, bundle_number) = {
            let guard = handle.read();
            (guard.bundle.destination.service, guard.bundle_number())
        };

        let mut inner = self.inner.lock().trace_expect("registry poisoned");
        let mut saw_busy = false;
        let mut selected = None;
        for (index, registration) in inner
            .iter()
            .enumerate()
            .filter(|(_, r)| r.app_id == dst_srv && r.status == ServiceStatus::Active)
        {
            if registration.busy {
                trace!("Service {dst_srv} is busy");
                saw_busy = true;
                continue;
            }
            selected = Some(index);
            break;
        }

        let Some(index) = selected else {
            return if saw_busy {
                DeliveryOutcome::Busy
            } else {
                DeliveryOutcome::NoService
            };
        };

        inner[index].busy = true;
        if inner[index]
            .inbox
            .send(ServiceEvent::Deliver(handle.clone()))
            .is_err()
        {
            // Inbox gone; the service died without unregistering.
            warn!("Service {dst_srv} inbox is closed, dropping registration");
            let token = inner[index].token;
            inner.retain(|r| r.token != token);
            return DeliveryOutcome::NoService;
        }

        debug!("Delivered bundle {bundle_number} to service {dst_srv}");
        redundancy.set(bundle_number);
        DeliveryOutcome::Delivered
    }

    /// Posts an event to the service behind `token`.
    pub fn notify(&self, token: ServiceToken, event: ServiceEvent) {
        let inner = self.inner.lock().trace_expect("registry poisoned");
        if let Some(registration) = inner.iter().find(|r| r.token == token) {
            let _ = registration.inbox.send(event);
        }
    }

    /// Clears the busy flag after the service signalled completion.
    pub fn unblock(&self, app_id: u32) {
        let mut inner = self.inner.lock().trace_expect("registry poisoned");
        for registration in inner
            .iter_mut()
            .filter(|r| r.app_id == app_id && r.status == ServiceStatus::Active)
        {
            if registration.busy {
                registration.busy = false;
                return;
            }
        }
        warn!("No busy service found to unblock for {app_id}");
    }
}
