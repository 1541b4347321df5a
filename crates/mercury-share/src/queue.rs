//! Response buffering for guest catch-up, and ordered replay on guests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{StreamExt, stream};
use mercury_core::{Cell, CellStream, Error, Result, now_millis};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

use crate::protocol::{Notification, ServerResponse};
use crate::rpc::RpcPeer;
use crate::translator::PathTranslator;

struct HostQueueState {
    responses: VecDeque<ServerResponse>,
    /// Guests that joined but have not caught up yet.
    pending: FxHashSet<u64>,
    /// Caught-up guests that receive responses as they are produced.
    live: FxHashMap<u64, RpcPeer>,
}

/// Host-side buffer of recently produced responses.
///
/// Responses older than the lifetime are pruned on every push. The buffer,
/// the pending catch-up set and the live guests change under one lock, so a
/// response is either part of a guest's catch-up or sent to it live.
pub struct ResponseQueue {
    lifetime: Duration,
    state: Mutex<HostQueueState>,
}

impl ResponseQueue {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            state: Mutex::new(HostQueueState {
                responses: VecDeque::new(),
                pending: FxHashSet::default(),
                live: FxHashMap::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, response: ServerResponse) {
        let mut state = self.state();
        self.buffer(&mut state, response);
    }

    fn buffer(&self, state: &mut HostQueueState, response: ServerResponse) {
        let cutoff = now_millis().saturating_sub(self.lifetime.as_millis() as u64);
        state.responses.push_back(response);
        state.responses.retain(|r| r.time() >= cutoff);
    }

    /// Buffer a response and send it to every caught-up guest.
    ///
    /// Guests whose link has closed are dropped. Returns how many guests
    /// received it.
    pub fn broadcast(&self, response: ServerResponse, translator: &dyn PathTranslator) -> usize {
        let notification =
            Notification::ServerResponse(response.clone().map_files(|f| translator.to_shared(f)));
        let mut state = self.state();
        self.buffer(&mut state, response);
        state.live.retain(|id, peer| match peer.notify(&notification) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Dropping closed guest {}", id);
                false
            }
        });
        state.live.len()
    }

    pub fn len(&self) -> usize {
        self.state().responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn guest_joined(&self, peer: u64) {
        self.state().pending.insert(peer);
    }

    /// Caught-up guests.
    pub fn guest_count(&self) -> usize {
        self.state().live.len()
    }

    pub fn guest_left(&self, peer: u64) {
        let mut state = self.state();
        state.live.remove(&peer);
        if state.pending.remove(&peer) && state.pending.is_empty() {
            state.responses.clear();
        }
    }

    /// Whether `peer` still waits for its catch-up.
    pub fn is_pending(&self, peer: u64) -> bool {
        self.state().pending.contains(&peer)
    }

    /// Replay buffered responses produced at or after `since` to `peer`, in
    /// the order they were produced. Returns how many were sent.
    ///
    /// Marks the guest as caught up, after which it receives broadcasts.
    /// Once no guest is pending the buffer is cleared.
    pub fn send(
        &self,
        peer: &RpcPeer,
        translator: &dyn PathTranslator,
        since: u64,
    ) -> Result<usize> {
        let mut state = self.state();
        let mut sent = 0;
        let mut result = Ok(());
        for response in state.responses.iter().filter(|r| r.time() >= since) {
            let response = response.clone().map_files(|f| translator.to_shared(f));
            result = peer.notify(&Notification::ServerResponse(response));
            if result.is_err() {
                break;
            }
            sent += 1;
        }

        state.pending.remove(&peer.id());
        if result.is_ok() {
            state.live.insert(peer.id(), peer.clone());
        }
        if state.pending.is_empty() {
            state.responses.clear();
        }
        result.map(|()| sent)
    }

    /// Close every guest link and forget all guests.
    pub fn close_all(&self) {
        let mut state = self.state();
        for peer in state.live.values() {
            peer.close();
        }
        state.live.clear();
        state.pending.clear();
        state.responses.clear();
    }

    /// Empty the buffer if every known guest has caught up.
    pub fn clear(&self) -> bool {
        let mut state = self.state();
        if state.pending.is_empty() {
            state.responses.clear();
            true
        } else {
            false
        }
    }
}

enum Item {
    Cells(Vec<Cell>),
    Failed(String),
    Complete,
}

#[derive(Default)]
struct Execution {
    /// Highest position accepted so far (positions start at 1).
    last_pos: u64,
    items: VecDeque<Item>,
    finished: bool,
    updated: u64,
    /// Open `observe` streams.
    observers: usize,
}

/// Registration of an open `observe` stream; released on drop.
struct Observer {
    queue: Arc<GuestResponseQueue>,
    id: String,
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(execution) = self.queue.executions().get_mut(&self.id) {
            execution.observers = execution.observers.saturating_sub(1);
        }
    }
}

/// Guest-side store of responses received from the host.
///
/// Each execution id gets a stream of cell snapshots in strictly increasing
/// `pos` order. Duplicate and already-passed positions are dropped.
pub struct GuestResponseQueue {
    lifetime: Duration,
    executions: Mutex<FxHashMap<String, Execution>>,
    changed: Notify,
}

impl GuestResponseQueue {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            executions: Mutex::new(FxHashMap::default()),
            changed: Notify::new(),
        }
    }

    fn executions(&self) -> MutexGuard<'_, FxHashMap<String, Execution>> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, response: ServerResponse) {
        let now = now_millis();
        {
            let mut executions = self.executions();
            match response {
                ServerResponse::ExecuteObservable { pos, cells, id, .. } => {
                    let execution = executions.entry(id).or_default();
                    if execution.finished || pos <= execution.last_pos {
                        tracing::trace!("Dropping response at position {}", pos);
                        return;
                    }
                    execution.last_pos = pos;
                    execution.updated = now;
                    match cells {
                        Some(cells) => execution.items.push_back(Item::Cells(cells)),
                        None => {
                            execution.finished = true;
                            execution.items.push_back(Item::Complete);
                        }
                    }
                }
                ServerResponse::Exception {
                    message,
                    id: Some(id),
                    ..
                } => {
                    let execution = executions.entry(id).or_default();
                    fail(execution, message, now);
                }
                ServerResponse::Exception { message, id: None, .. } => {
                    for execution in executions.values_mut() {
                        fail(execution, message.clone(), now);
                    }
                }
            }

            let cutoff = now.saturating_sub(self.lifetime.as_millis() as u64);
            executions.retain(|_, e| !(e.finished && e.observers == 0 && e.updated < cutoff));
        }
        self.changed.notify_waiters();
    }

    /// Executions currently tracked.
    pub fn len(&self) -> usize {
        self.executions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, id: &str) -> Option<Item> {
        self.executions().get_mut(id)?.items.pop_front()
    }

    /// Stream the cell snapshots of execution `id`.
    ///
    /// Ends after the host's completion marker; yields one error and ends if
    /// the host reported an exception.
    pub fn observe(self: &Arc<Self>, id: &str) -> CellStream {
        self.executions()
            .entry(id.to_string())
            .or_insert_with(|| Execution {
                updated: now_millis(),
                ..Execution::default()
            })
            .observers += 1;

        let observer = Observer {
            queue: self.clone(),
            id: id.to_string(),
        };
        stream::unfold(Some(observer), |state| async move {
            let observer = state?;
            loop {
                let item = {
                    let notified = observer.queue.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    match observer.queue.take(&observer.id) {
                        Some(item) => item,
                        None => {
                            notified.await;
                            continue;
                        }
                    }
                };
                return match item {
                    Item::Cells(cells) => Some((Ok(cells), Some(observer))),
                    Item::Failed(message) => Some((Err(Error::Kernel(message)), None)),
                    Item::Complete => None,
                };
            }
        })
        .boxed()
    }
}

fn fail(execution: &mut Execution, message: String, now: u64) {
    if !execution.finished {
        execution.finished = true;
        execution.updated = now;
        execution.items.push_back(Item::Failed(message));
    }
}
