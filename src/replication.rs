use crate::future::{verify_vote, VerifyRef};
use crate::inflight::Inflight;
use crate::peer::Address;
use crate::raft::{random_timeout, Shared};
use crate::transport::{AppendEntriesRequest, InstallSnapshotRequest};

use ::log::{error, info, warn};
use crossbeam_channel::{select, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Instant;

/// The leader's handle to one follower's replication worker.
pub(crate) struct ReplicationHandle {
    pub peer: Address,
    /// Closing this stops the worker. Sending a final index first makes it
    /// flush up to that index before exiting (peer removal).
    pub stop_tx: Sender<u64>,
    /// Pulsed when new entries have been dispatched.
    pub trigger_tx: Sender<()>,
    /// Pulsed to request an immediate heartbeat (leadership verification).
    pub notify_tx: Sender<()>,
    /// When the follower last acknowledged us. Read by the lease check.
    pub last_contact: Arc<RwLock<Instant>>,
    /// Verifications awaiting this follower's next heartbeat.
    pub pending_verify: Arc<Mutex<Vec<VerifyRef>>>,
}

/// A per-follower replication worker. Owns the follower's progress
/// (next_index/match_index) and runs on its own thread while the local node
/// leads, with a sibling thread heartbeating the follower to maintain the
/// lease.
pub(crate) struct Replication {
    pub shared: Arc<Shared>,
    pub inflight: Arc<Inflight>,
    pub peer: Address,
    /// The term we were elected in. Replication never outlives it.
    pub current_term: u64,
    pub next_index: u64,
    pub match_index: u64,
    pub stop_rx: Receiver<u64>,
    pub trigger_rx: Receiver<()>,
    pub notify_rx: Receiver<()>,
    pub step_down_tx: Sender<()>,
    pub last_contact: Arc<RwLock<Instant>>,
    pub pending_verify: Arc<Mutex<Vec<VerifyRef>>>,
}

/// The outcome of shipping a snapshot to a lagging follower.
enum SnapshotOutcome {
    /// The follower installed it; replication resumes past it.
    Installed,
    /// The attempt failed; retry after the next trigger or tick.
    Failed,
    /// The follower is in a newer term; stop replicating.
    StepDown,
}

impl Replication {
    /// Runs the worker until stopped or deposed.
    pub fn run(mut self) {
        // The heartbeat runs on its own thread so that a slow bulk
        // replication can't starve the lease.
        let (heartbeat_stop_tx, heartbeat_stop_rx) = crossbeam_channel::bounded::<()>(1);
        let heartbeat = {
            let shared = self.shared.clone();
            let peer = self.peer.clone();
            let term = self.current_term;
            let notify_rx = self.notify_rx.clone();
            let last_contact = self.last_contact.clone();
            let pending_verify = self.pending_verify.clone();
            thread::spawn(move || {
                run_heartbeat(
                    shared,
                    peer,
                    term,
                    notify_rx,
                    last_contact,
                    pending_verify,
                    heartbeat_stop_rx,
                )
            })
        };

        let stop_rx = self.stop_rx.clone();
        let trigger_rx = self.trigger_rx.clone();
        let retry_interval = self.shared.conf.heartbeat_timeout / 10;

        let mut should_stop = false;
        while !should_stop {
            select! {
                recv(stop_rx) -> msg => {
                    // A final index means the peer was removed: flush its
                    // removal entry to it before stopping.
                    if let Ok(last_index) = msg {
                        if last_index > 0 {
                            self.replicate_to(last_index);
                        }
                    }
                    break;
                }
                recv(trigger_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    should_stop = self.replicate_to(self.shared.state.last_log_index());
                }
                // Retry tick, in case a previous attempt failed and no new
                // dispatch comes along to re-trigger us.
                recv(random_timeout(retry_interval)) -> _ => {
                    should_stop = self.replicate_to(self.shared.state.last_log_index());
                }
            }
        }

        drop(heartbeat_stop_tx);
        let _ = heartbeat.join();
    }

    /// Replicates entries up to last_index, pipelining batches of
    /// max_append_entries. A caught-up follower still gets one empty
    /// append, which carries the commit index and probes that the logs
    /// agree. Returns true if the worker should stop because the follower
    /// is in a newer term.
    fn replicate_to(&mut self, last_index: u64) -> bool {
        loop {
            // Determine the term of the entry preceding next_index. It may
            // live in the log, be covered by our last snapshot, or have
            // been compacted away entirely, in which case the follower is
            // too far behind and needs the snapshot.
            let prev_log_index = self.next_index - 1;
            let prev_log_term = if prev_log_index == 0 {
                0
            } else if prev_log_index == self.shared.state.last_snapshot_index() {
                self.shared.state.last_snapshot_term()
            } else {
                match self.shared.logs.get_log(prev_log_index) {
                    Ok(entry) => entry.term,
                    Err(_) => match self.send_snapshot() {
                        SnapshotOutcome::Installed => continue,
                        SnapshotOutcome::Failed => return false,
                        SnapshotOutcome::StepDown => return true,
                    },
                }
            };

            let mut entries = Vec::new();
            let mut compacted = false;
            if self.next_index <= last_index {
                let batch_end = std::cmp::min(
                    last_index,
                    prev_log_index + self.shared.conf.max_append_entries as u64,
                );
                for index in self.next_index..=batch_end {
                    match self.shared.logs.get_log(index) {
                        Ok(entry) => entries.push(entry),
                        Err(_) => {
                            compacted = true;
                            break;
                        }
                    }
                }
            }
            if compacted {
                match self.send_snapshot() {
                    SnapshotOutcome::Installed => continue,
                    SnapshotOutcome::Failed => return false,
                    SnapshotOutcome::StepDown => return true,
                }
            }
            let last_sent = entries.last().map(|e| e.index);

            let request = AppendEntriesRequest {
                term: self.current_term,
                leader: self.shared.trans.encode_peer(&self.shared.local_addr),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit_index: self.shared.state.commit_index(),
            };
            let response = match self.shared.trans.append_entries(&self.peer, request) {
                Ok(response) => response,
                Err(err) => {
                    warn!("failed to append entries to {}: {}", self.peer, err);
                    return false;
                }
            };

            if response.term > self.current_term {
                return self.handle_stale_term();
            }
            self.set_last_contact();

            if response.success {
                if let Some(last_sent) = last_sent {
                    self.match_index = last_sent;
                    self.next_index = last_sent + 1;
                    self.inflight.commit(&self.peer, self.match_index);
                }
                self.notify_all(true);
            } else {
                // The follower's log diverges before next_index. Back up one
                // entry and try again; repeated rejections walk us back to
                // the last matching entry.
                self.next_index = std::cmp::max(self.next_index.saturating_sub(1), 1);
                warn!(
                    "append entries to {} rejected, sending older logs (next: {})",
                    self.peer, self.next_index
                );
                continue;
            }

            if self.next_index > last_index {
                return false;
            }
        }
    }

    /// Ships the latest snapshot to the follower, used when the entries it
    /// needs have been compacted out of the log.
    fn send_snapshot(&mut self) -> SnapshotOutcome {
        let snapshots = match self.shared.snapshots.list() {
            Ok(snapshots) => snapshots,
            Err(err) => {
                error!("failed to list snapshots: {err}");
                return SnapshotOutcome::Failed;
            }
        };
        let Some(meta) = snapshots.into_iter().next() else {
            error!("no snapshot available to send to {}", self.peer);
            return SnapshotOutcome::Failed;
        };
        let (meta, source) = match self.shared.snapshots.open(&meta.id) {
            Ok(opened) => opened,
            Err(err) => {
                error!("failed to open snapshot {}: {}", meta.id, err);
                return SnapshotOutcome::Failed;
            }
        };

        let request = InstallSnapshotRequest {
            term: self.current_term,
            leader: self.shared.trans.encode_peer(&self.shared.local_addr),
            last_log_index: meta.index,
            last_log_term: meta.term,
            peers: meta.peers.clone(),
            size: meta.size,
        };
        let response = match self.shared.trans.install_snapshot(&self.peer, request, source) {
            Ok(response) => response,
            Err(err) => {
                warn!("failed to install snapshot on {}: {}", self.peer, err);
                return SnapshotOutcome::Failed;
            }
        };

        if response.term > self.current_term {
            return match self.handle_stale_term() {
                true => SnapshotOutcome::StepDown,
                false => SnapshotOutcome::Failed,
            };
        }
        self.set_last_contact();

        if response.success {
            info!("installed snapshot {} on {}", meta.id, self.peer);
            self.match_index = meta.index;
            self.next_index = meta.index + 1;
            self.inflight.commit(&self.peer, self.match_index);
            self.notify_all(true);
            SnapshotOutcome::Installed
        } else {
            warn!("snapshot {} rejected by {}", meta.id, self.peer);
            SnapshotOutcome::Failed
        }
    }

    /// The follower is in a newer term: fail pending verifications, signal
    /// the leader to step down, and stop replicating.
    fn handle_stale_term(&self) -> bool {
        error!("peer {} has a newer term, stopping replication", self.peer);
        self.notify_all(false);
        let _ = self.step_down_tx.try_send(());
        true
    }

    fn notify_all(&self, leader_ok: bool) {
        notify_pending(&self.pending_verify, leader_ok);
    }

    fn set_last_contact(&self) {
        *self.last_contact.write().expect("lock poisoned") = Instant::now();
    }
}

/// Votes on every verification waiting on this follower.
fn notify_pending(pending: &Mutex<Vec<VerifyRef>>, leader_ok: bool) {
    let drained: Vec<VerifyRef> = pending.lock().expect("lock poisoned").drain(..).collect();
    for verify in drained {
        verify_vote(&verify, leader_ok);
    }
}

/// Heartbeats the follower at a fraction of the heartbeat timeout to
/// maintain the leader lease, and on demand when a leadership verification
/// needs an immediate answer.
fn run_heartbeat(
    shared: Arc<Shared>,
    peer: Address,
    term: u64,
    notify_rx: Receiver<()>,
    last_contact: Arc<RwLock<Instant>>,
    pending_verify: Arc<Mutex<Vec<VerifyRef>>>,
    stop_rx: Receiver<()>,
) {
    let request = AppendEntriesRequest {
        term,
        leader: shared.trans.encode_peer(&shared.local_addr),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: Vec::new(),
        leader_commit_index: 0,
    };
    let interval = shared.conf.heartbeat_timeout / 10;
    loop {
        select! {
            recv(stop_rx) -> _ => return,
            recv(notify_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
            }
            recv(random_timeout(interval)) -> _ => {}
        }
        match shared.trans.append_entries(&peer, request.clone()) {
            Ok(response) => {
                *last_contact.write().expect("lock poisoned") = Instant::now();
                notify_pending(&pending_verify, response.success);
            }
            Err(err) => {
                warn!("failed to heartbeat to {}: {}", peer, err);
            }
        }
    }
}
