use serde::Serialize;

use super::states::JobState;
use crate::wire::protocol::NewJob;

/// Identifier of a client connection within the daemon's connection table.
/// Jobs refer to connections only by id; the table owns the sockets.
pub type ConnId = u64;

/// Final accounting for a job, reported by the runner on ENDJOB or filled
/// in by the daemon when the job is skipped or its runner vanishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ExecResult {
    pub errorlevel: i32,
    pub skipped: bool,
    pub user_ms: f64,
    pub system_ms: f64,
    pub real_ms: f64,
}

impl ExecResult {
    /// A result for a job that never ran. Errorlevel -1 marks both skipped
    /// and broken-channel outcomes.
    pub fn skipped() -> Self {
        Self {
            errorlevel: -1,
            skipped: true,
            ..Default::default()
        }
    }

    /// A result for a job whose runner connection vanished mid-run.
    pub fn broken() -> Self {
        Self {
            errorlevel: -1,
            skipped: false,
            ..Default::default()
        }
    }
}

/// What a parked connection is waiting for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitKind {
    /// WAITJOB: the job reaching FINISHED or SKIPPED.
    Terminal,
    /// WAIT_RUNNING_JOB: the job leaving QUEUED/ALLOCATING.
    LeftQueue,
    /// A deferred NEWJOB_OK: the job leaving HOLDING_CLIENT.
    Enqueued,
}

/// A connection parked on a future state transition of one job.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Waiter {
    pub conn: ConnId,
    pub kind: WaitKind,
}

/// One job known to the daemon.
#[derive(Clone, Debug)]
pub struct Job {
    pub jobid: i32,
    /// Submitter uid, as stamped on the NEWJOB record. Advisory.
    pub uid: i32,
    pub command: Vec<u8>,
    pub label: Option<Vec<u8>>,
    pub env: Option<Vec<u8>>,
    pub state: JobState,
    pub store_output: bool,
    pub should_keep_finished: bool,
    pub wait_enqueuing: bool,
    pub num_slots: i32,
    pub num_gpus: i32,
    pub wait_free_gpus: bool,
    /// A REMINDER ticket is outstanding: the runner is sleeping out the
    /// retry interval and the scheduler must not send another until the
    /// nudge comes back.
    pub gpu_waiting: bool,
    /// Explicit GPU indices overriding the allocator; empty means none.
    pub gpu_nums: Vec<i32>,
    /// Concrete dependency jobids. The submission-time -1 sentinel has
    /// already been resolved away by the time a Job exists.
    pub depend_on: Vec<i32>,
    pub require_elevel: bool,
    pub result: Option<ExecResult>,
    pub output_filename: Option<Vec<u8>>,
    /// Process group reported by the runner; 0 until then.
    pub pid: i32,
    /// GPU indices assigned at admission, as shipped in the RUN ticket.
    pub assigned_gpus: Vec<i32>,
    /// The connection that submitted this job and will run it. None once
    /// the submitter has gone away.
    pub conn: Option<ConnId>,
    /// Connections parked on this job's state transitions.
    pub waiters: Vec<Waiter>,
}

impl Job {
    /// Builds a registry entry from a wire submission. `depend_on` must
    /// already hold concrete jobids.
    pub fn from_submission(
        jobid: i32,
        uid: i32,
        conn: ConnId,
        req: NewJob,
        depend_on: Vec<i32>,
        state: JobState,
    ) -> Self {
        Self {
            jobid,
            uid,
            command: req.command,
            label: req.label,
            env: req.env,
            state,
            store_output: req.store_output,
            should_keep_finished: req.should_keep_finished,
            wait_enqueuing: req.wait_enqueuing,
            num_slots: req.num_slots.max(1),
            num_gpus: req.num_gpus.max(0),
            wait_free_gpus: req.wait_free_gpus,
            gpu_waiting: false,
            gpu_nums: req.gpu_nums,
            depend_on,
            require_elevel: req.require_elevel,
            result: None,
            output_filename: None,
            pid: 0,
            assigned_gpus: Vec::new(),
            conn: Some(conn),
            waiters: Vec::new(),
        }
    }

    pub fn command_lossy(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }
}
