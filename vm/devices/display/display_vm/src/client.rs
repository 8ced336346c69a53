// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registration of the subsystems that touch the display hardware and must be
//! told before it is handed away and after it comes back.

use crate::error::ClientPhase;
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;

/// The answer to a readiness poll.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    /// The client has no hardware requests in flight.
    Ready,
    /// The client is still using the hardware.
    Busy,
}

/// A subsystem that uses the display hardware.
///
/// Calls may block; they are made without any registry lock held.
pub trait VmClient: Send + Sync {
    /// A name for diagnostics.
    fn name(&self) -> &str;

    /// Reports whether the hardware can be released now.
    fn check(&self) -> anyhow::Result<ClientStatus>;

    /// Stop issuing hardware requests; the hardware is about to be released.
    fn pre_release(&self) -> anyhow::Result<()>;

    /// Resume hardware requests; the hardware has been acquired.
    fn post_acquire(&self) -> anyhow::Result<()>;
}

struct Entry {
    id: u64,
    client: Arc<dyn VmClient>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// The set of registered [`VmClient`]s.
#[derive(Clone, Default)]
pub struct VmClientRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

/// A client registration. The client is unregistered when this is dropped.
#[must_use]
pub struct VmClientHandle {
    inner: Arc<Mutex<RegistryInner>>,
    id: u64,
}

impl Drop for VmClientHandle {
    fn drop(&mut self) {
        self.inner.lock().entries.retain(|entry| entry.id != self.id);
    }
}

impl VmClientRegistry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client` for broadcasts until the returned handle is
    /// dropped. Clients are called in registration order.
    pub fn register(&self, client: Arc<dyn VmClient>) -> VmClientHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        tracing::debug!(name = client.name(), id, "registered vm client");
        inner.entries.push(Entry { id, client });
        VmClientHandle {
            inner: self.inner.clone(),
            id,
        }
    }

    /// The number of registered clients.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn VmClient>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.client.clone())
            .collect()
    }

    /// Polls every client, failing on the first one that is not ready.
    pub fn check(&self) -> Result<(), Error> {
        for client in self.snapshot() {
            match client.check() {
                Ok(ClientStatus::Ready) => {}
                Ok(ClientStatus::Busy) => {
                    tracing::info!(name = client.name(), "vm client busy");
                    return Err(Error::ClientNotReady(client.name().to_owned()));
                }
                Err(source) => {
                    return Err(client_failed(client.as_ref(), ClientPhase::Check, source));
                }
            }
        }
        Ok(())
    }

    /// Tells every client the hardware is about to be released.
    ///
    /// If a client fails, the clients already told are resumed before the
    /// error is returned.
    pub fn pre_release(&self) -> Result<(), Error> {
        let clients = self.snapshot();
        if let Err((told, err)) = broadcast(&clients, ClientPhase::PreRelease, |client| {
            client.pre_release()
        }) {
            resume(&clients[..told]);
            return Err(err);
        }
        Ok(())
    }

    /// Tells every client the hardware has been acquired.
    pub fn post_acquire(&self) -> Result<(), Error> {
        broadcast(&self.snapshot(), ClientPhase::PostAcquire, |client| {
            client.post_acquire()
        })
        .map_err(|(_, err)| err)
    }

    /// Undoes a pre-release broadcast when the release did not go ahead.
    pub(crate) fn resume_after_abort(&self) {
        resume(&self.snapshot());
    }
}

fn client_failed(client: &dyn VmClient, phase: ClientPhase, source: anyhow::Error) -> Error {
    let err = Error::Client {
        name: client.name().to_owned(),
        phase,
        source,
    };
    tracing::warn!(error = &err as &dyn std::error::Error, "vm client failed");
    err
}

/// Calls `f` on each client in order, stopping at the first failure. On
/// failure returns the number of clients that succeeded.
fn broadcast(
    clients: &[Arc<dyn VmClient>],
    phase: ClientPhase,
    f: impl Fn(&dyn VmClient) -> anyhow::Result<()>,
) -> Result<(), (usize, Error)> {
    for (i, client) in clients.iter().enumerate() {
        if let Err(source) = f(client.as_ref()) {
            return Err((i, client_failed(client.as_ref(), phase, source)));
        }
    }
    tracing::trace!(%phase, "vm client broadcast complete");
    Ok(())
}

/// Tells `clients` to resume after an aborted release. Failures are logged;
/// every client is still called.
fn resume(clients: &[Arc<dyn VmClient>]) {
    for client in clients {
        if let Err(err) = client.post_acquire() {
            tracing::warn!(
                name = client.name(),
                error = err.as_ref() as &dyn std::error::Error,
                "failed to resume vm client after aborted release"
            );
        }
    }
}
