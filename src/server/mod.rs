//! The daemon core: one task owning all queue state, fed by per-connection
//! framing tasks over channels.
//!
//! Connection tasks never touch the registry; they decode frames and
//! forward envelopes, so every registry mutation happens inside a single
//! request handler with no interleaving. Parked replies (WAITJOB, a held
//! NEWJOB_OK) are recorded as connection ids on the job and completed by
//! the core when the state transition arrives.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Level};

use crate::types::job::{ConnId, ExecResult, WaitKind};
use crate::types::registry::Registry;
use crate::types::states::JobState;
use crate::wire::{self, protocol::Envelope, protocol::Message};

pub mod dispatch;
pub mod dump;
pub mod gpu;
pub mod sched;
pub mod slots;

use gpu::GpuOracle;
use slots::SlotBudget;

/// Daemon-wide knobs, fixed at startup (slots and the GPU retry interval
/// stay reconfigurable over the protocol).
#[derive(Clone, Debug)]
pub struct Config {
    /// Initial slot ceiling.
    pub max_slots: i32,
    /// Jobs allowed in the queue (queued or holding a reservation) before
    /// NEWJOB is refused or held.
    pub max_jobs: usize,
    /// Initial GPU retry interval, in seconds.
    pub gpu_wait_time: i32,
    /// Uid stamped on daemon-originated records.
    pub uid: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_slots: 1,
            max_jobs: 1000,
            gpu_wait_time: 30,
            uid: 0,
        }
    }
}

/// Events flowing from connection tasks into the core.
#[derive(Debug)]
enum CoreEvent {
    Opened {
        conn: ConnId,
        tx: mpsc::UnboundedSender<Message>,
    },
    Request {
        conn: ConnId,
        env: Envelope,
    },
    Closed {
        conn: ConnId,
    },
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Message>,
}

/// The queue state and everything needed to answer requests. Owned by the
/// serve loop; request handlers live in [dispatch].
pub struct Core {
    uid: i32,
    max_jobs: usize,
    gpu_wait_time: i32,
    registry: Registry,
    slots: SlotBudget,
    oracle: Box<dyn GpuOracle + Send>,
    conns: HashMap<ConnId, ConnHandle>,
    cancel: CancellationToken,
}

impl Core {
    pub fn new(
        cfg: Config,
        oracle: Box<dyn GpuOracle + Send>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            uid: cfg.uid,
            max_jobs: cfg.max_jobs.max(1),
            gpu_wait_time: cfg.gpu_wait_time,
            registry: Registry::new(),
            slots: SlotBudget::new(cfg.max_slots),
            oracle,
            conns: HashMap::new(),
            cancel,
        }
    }

    /// The registry, for the shutdown dump.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn handle_event(&mut self, evt: CoreEvent) {
        match evt {
            CoreEvent::Opened { conn, tx } => {
                self.conns.insert(conn, ConnHandle { tx });
            },
            CoreEvent::Request { conn, env } => self.handle_request(conn, env),
            CoreEvent::Closed { conn } => self.handle_closed(conn),
        }
    }

    /// Queues a message for a connection. A send to a connection that is
    /// already gone is dropped; its Closed event does the cleanup.
    fn send(&mut self, conn: ConnId, msg: Message) {
        if let Some(h) = self.conns.get(&conn) {
            let _ = h.tx.send(msg);
        }
    }

    /// Drops the connection handle: buffered replies still flush, then the
    /// connection task closes the socket.
    fn close(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
    }

    /// Reports a request error as a single human-readable line and closes
    /// the request's connection.
    fn error_line(&mut self, conn: ConnId, text: String) {
        self.send(conn, Message::ListLine(text.into_bytes()));
        self.close(conn);
    }

    fn handle_closed(&mut self, conn: ConnId) {
        self.conns.remove(&conn);

        // A runner that vanishes mid-run takes its job down with it.
        let broken: Vec<i32> = self
            .registry
            .iter()
            .filter(|j| j.conn == Some(conn) && j.state.is_busy())
            .map(|j| j.jobid)
            .collect();
        for jobid in broken {
            warn!(jobid, "runner connection lost; closing out job");
            // Panic safety: jobid was collected from the registry above and
            // nothing removes jobs in between.
            let job = self.registry.get_mut(jobid).unwrap();
            let released = job.num_slots;
            job.state = JobState::Finished;
            job.result = Some(ExecResult::broken());
            job.conn = None;
            job.assigned_gpus.clear();
            self.slots.release(released);
            self.notify_transition(jobid);
        }

        // Queued and held jobs outlive their submitter; they merely lose
        // their runner. Parked replies for this connection are forgotten.
        for job in self.registry.iter_mut() {
            if job.conn == Some(conn) {
                job.conn = None;
            }
            job.waiters.retain(|w| w.conn != conn);
        }

        self.schedule();
    }

    /// Completes every parked reply the job's current state satisfies.
    fn notify_transition(&mut self, jobid: i32) {
        let Some(job) = self.registry.get_mut(jobid) else {
            return;
        };
        let state = job.state;
        let result = job.result;

        let mut due = Vec::new();
        job.waiters.retain(|w| {
            let fire = match w.kind {
                WaitKind::Terminal => state.is_terminal(),
                WaitKind::LeftQueue => !matches!(
                    state,
                    JobState::Queued
                        | JobState::Allocating
                        | JobState::HoldingClient
                ),
                WaitKind::Enqueued => state != JobState::HoldingClient,
            };
            if fire {
                due.push(*w);
            }
            !fire
        });

        for w in due {
            let msg = match w.kind {
                WaitKind::Enqueued => Message::NewJobOk { jobid },
                _ => Message::WaitJobOk {
                    result: result.unwrap_or_default(),
                },
            };
            self.send(w.conn, msg);
        }
    }

    /// Runs a scheduling pass and carries out its verdicts.
    fn schedule(&mut self) {
        let actions = {
            let Core {
                registry,
                slots,
                oracle,
                conns,
                max_jobs,
                ..
            } = self;
            let live = |c: ConnId| conns.contains_key(&c);
            sched::schedule_pass(registry, slots, oracle.as_mut(), *max_jobs, &live)
        };

        for action in actions {
            match action {
                sched::Action::Enqueued { jobid } => {
                    debug!(jobid, "held submission admitted to the queue");
                    self.notify_transition(jobid);
                },
                sched::Action::Run {
                    jobid,
                    conn,
                    last_errorlevel,
                    gpus,
                } => {
                    info!(jobid, "issuing run ticket");
                    self.send(
                        conn,
                        Message::RunJob {
                            last_errorlevel,
                            gpus,
                        },
                    );
                },
                sched::Action::Remind { jobid, conn } => {
                    debug!(jobid, "gpus scarce; sending retry nudge");
                    self.send(
                        conn,
                        Message::Reminder {
                            gpu_wait_time: self.gpu_wait_time,
                        },
                    );
                },
                sched::Action::Skipped { jobid } => {
                    info!(jobid, "job skipped");
                    self.notify_transition(jobid);
                },
            }
        }
    }
}

/// Accepts connections and runs the core until the token cancels, then
/// hands the core back so the caller can dump its registry.
///
/// Every connection task holds a clone of `shutdown_hold` until it has
/// flushed and closed its socket; the caller blocks on the paired receiver
/// after this returns, so no task is torn down mid-reply with the runtime.
pub async fn serve(
    listener: tokio::net::UnixListener,
    cfg: Config,
    oracle: Box<dyn GpuOracle + Send>,
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
) -> Result<Core> {
    let (core_tx, mut core_rx) = mpsc::unbounded_channel();
    let mut core = Core::new(cfg, oracle, cancel.clone());
    let mut next_conn: ConnId = 0;

    info!(addr = ?listener.local_addr()?, "listening");

    loop {
        select! {
            _ = cancel.cancelled() => break,
            evt = core_rx.recv() => match evt {
                // Unreachable while we hold core_tx, but complete the match.
                None => break,
                Some(evt) => core.handle_event(evt),
            },
            accept = listener.accept() => match accept {
                Ok((conn, _)) => {
                    let id = next_conn;
                    next_conn += 1;
                    tokio::spawn(conn_loop(
                        cancel.clone(),
                        shutdown_hold.clone(),
                        core_tx.clone(),
                        id,
                        core.uid,
                        conn,
                    ));
                },
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                },
            },
        }
    }

    Ok(core)
}

/// Frames one client connection: decoded envelopes flow to the core,
/// queued replies flow back out.
#[instrument(name = "client_loop", err(level = Level::WARN), skip_all, fields(conn = conn_id))]
async fn conn_loop(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    core_tx: mpsc::UnboundedSender<CoreEvent>,
    conn_id: ConnId,
    daemon_uid: i32,
    conn: UnixStream,
) -> Result<()> {
    debug!("accepted connection");

    let mut framed = wire::framed(conn);
    let (tx, mut rx) = mpsc::unbounded_channel();

    if core_tx.send(CoreEvent::Opened { conn: conn_id, tx }).is_err() {
        return Ok(());
    }

    let conn_result = loop {
        select! {
            out = rx.recv() => match out {
                Some(msg) => {
                    let env = Envelope::new(daemon_uid, msg);
                    if let Err(error) = framed.send(env).await {
                        break Err(error.into());
                    }
                },
                // The core dropped our handle: everything it wanted to say
                // has been sent.
                None => break Ok(()),
            },
            evt = framed.next() => match evt {
                None => {
                    debug!("connection dropped");
                    break Ok(());
                },
                Some(Ok(env)) => {
                    if core_tx
                        .send(CoreEvent::Request { conn: conn_id, env })
                        .is_err()
                    {
                        break Ok(());
                    }
                },
                // Protocol error: drop the peer without touching the queue.
                Some(Err(error)) => {
                    break Err(anyhow!(error)
                        .context("client sent a malformed message"));
                },
            },
            _ = cancel.cancelled() => {
                // Going down: first flush whatever the core already queued
                // for this connection, so parked replies and list streams
                // are not dropped mid-send.
                let mut flush = Ok(());
                while let Ok(msg) = rx.try_recv() {
                    let env = Envelope::new(daemon_uid, msg);
                    if let Err(error) = framed.send(env).await {
                        flush = Err(error.into());
                        break;
                    }
                }
                break flush;
            },
        }
    };

    let _ = core_tx.send(CoreEvent::Closed { conn: conn_id });

    framed
        .into_inner()
        .shutdown()
        .await
        .context("during shutdown")?;

    conn_result
}
