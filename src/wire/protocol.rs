use crate::types::job::ExecResult;
use crate::types::states::JobState;

/// Protocol version. Bumped on any change to the record layout or to the
/// payload conventions. A client whose GET_VERSION exchange reports a
/// different number must abort with a clear error.
pub const PROTOCOL_VERSION: i32 = 1;

/// Size of the fixed message record on the wire.
///
/// Every message occupies exactly this many bytes regardless of variant:
/// sender uid at 0..4, type tag at 4..8, variant fields packed from 8, and
/// zero padding to the end. Records are fully zeroed before the variant
/// fields are written, so unused bytes never leak sender memory.
pub const RECORD_SIZE: usize = 64;

/// Upper bound accepted for any single payload segment (command, label,
/// environment dump, listing line, dependency/GPU/PID arrays).
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Wire type tags. The numbering is part of the protocol and never reused.
pub mod tag {
    pub const KILL_SERVER: i32 = 0;
    pub const NEWJOB: i32 = 1;
    pub const NEWJOB_OK: i32 = 2;
    pub const NEWJOB_NOK: i32 = 3;
    pub const RUNJOB: i32 = 4;
    pub const RUNJOB_OK: i32 = 5;
    pub const ENDJOB: i32 = 6;
    pub const LIST: i32 = 7;
    pub const LIST_LINE: i32 = 8;
    pub const CLEAR_FINISHED: i32 = 9;
    pub const ASK_OUTPUT: i32 = 10;
    pub const ANSWER_OUTPUT: i32 = 11;
    pub const REMOVEJOB: i32 = 12;
    pub const REMOVEJOB_OK: i32 = 13;
    pub const WAITJOB: i32 = 14;
    pub const WAIT_RUNNING_JOB: i32 = 15;
    pub const WAITJOB_OK: i32 = 16;
    pub const URGENT: i32 = 17;
    pub const URGENT_OK: i32 = 18;
    pub const GET_STATE: i32 = 19;
    pub const ANSWER_STATE: i32 = 20;
    pub const SWAP_JOBS: i32 = 21;
    pub const SWAP_JOBS_OK: i32 = 22;
    pub const INFO: i32 = 23;
    pub const INFO_DATA: i32 = 24;
    pub const LAST_ID: i32 = 25;
    pub const GET_VERSION: i32 = 26;
    pub const VERSION: i32 = 27;
    pub const COUNT_RUNNING: i32 = 28;
    pub const GET_LABEL: i32 = 29;
    pub const GET_CMD: i32 = 30;
    pub const SET_MAX_SLOTS: i32 = 31;
    pub const GET_MAX_SLOTS: i32 = 32;
    pub const GET_MAX_SLOTS_OK: i32 = 33;
    pub const KILL_ALL: i32 = 34;
    pub const GET_GPU_WAIT_TIME: i32 = 35;
    pub const SET_GPU_WAIT_TIME: i32 = 36;
    pub const REMINDER: i32 = 37;
}

/// A NEWJOB submission.
///
/// Record fields: command size, label size, environment size, dependency
/// count, explicit-GPU count, then the boolean/numeric knobs, each as an
/// `i32`. Payloads follow in this order: dependency jobids, explicit GPU
/// indices, command, label, environment — sizes as carried in the record.
///
/// All byte-string sizes include the terminating null byte; a size of zero
/// means the field is absent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewJob {
    /// The joined argv, as opaque bytes.
    pub command: Vec<u8>,
    /// Optional display label.
    pub label: Option<Vec<u8>>,
    /// Optional environment dump captured at submission (newline-delimited
    /// `key=value` lines).
    pub env: Option<Vec<u8>>,
    /// Dependency jobids. `-1` entries mean "the last submitted job at the
    /// time of enqueue" and are resolved server-side at insert.
    pub depend_on: Vec<i32>,
    /// Explicit GPU indices overriding the allocator. Empty means "let the
    /// allocator pick".
    pub gpu_nums: Vec<i32>,
    /// Capture stdout to a file.
    pub store_output: bool,
    /// Keep the job listed after completion until cleared.
    pub should_keep_finished: bool,
    /// Block the submitting client until the job is admitted to the queue
    /// rather than rejecting when the queue is full.
    pub wait_enqueuing: bool,
    /// Skip this job if any dependency finished with a non-zero errorlevel.
    pub require_elevel: bool,
    /// Admission weight in slots. Positive.
    pub num_slots: i32,
    /// GPUs requested. Zero means no GPU needed.
    pub num_gpus: i32,
    /// On GPU scarcity, hold the job and retry on REMINDER instead of
    /// skipping it.
    pub wait_free_gpus: bool,
}

/// A message exchanged between client and daemon.
///
/// The union is symmetric: one set of variants covers both directions, and
/// every record has the same fixed layout either way. Which variants are
/// legal at which point is the dispatcher's business, not the codec's; a
/// tag that exists in no direction is a hard protocol error at decode time.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Asks the daemon to shut down. Clients refuse to send this unless
    /// running with euid 0; the daemon itself does not enforce it.
    KillServer,
    /// Registers a new job. See [NewJob] for record and payload layout.
    NewJob(NewJob),
    /// Accepts a submission, naming the allocated jobid.
    NewJobOk { jobid: i32 },
    /// Rejects a submission because the queue is full.
    NewJobNok,
    /// The daemon's RUN ticket: the addressed connection should now exec
    /// its command.
    ///
    /// Record fields: dependency errorlevel summary (first non-zero
    /// dependency errorlevel, -1 for a skipped dependency, else 0) and the
    /// assigned GPU count. Payload: the assigned GPU indices, from which
    /// the runner publishes `CUDA_VISIBLE_DEVICES` (comma-joined, or `-1`
    /// when no GPUs were requested).
    RunJob { last_errorlevel: i32, gpus: Vec<i32> },
    /// The runner's answer to [Message::RunJob].
    ///
    /// `pid` is the spawned process group, or `-1` if the runner skipped
    /// execution (dependency failure or GPU scarcity it discovered).
    /// Payload: the output filename when `store_output` is set.
    RunJobOk {
        pid: i32,
        store_output: bool,
        ofilename: Option<Vec<u8>>,
    },
    /// The runner's completion report, finalizing a RUNNING job.
    EndJob { result: ExecResult },
    /// Requests a job listing. Carries the client's terminal width so the
    /// daemon can cap the command cell.
    List { term_width: i32 },
    /// One line of listing output, also used to carry human-readable
    /// request errors (a single line, then the request's scope is closed).
    /// Payload: the line text.
    ListLine(Vec<u8>),
    /// Prunes FINISHED/SKIPPED jobs not marked keep-finished.
    ClearFinished,
    /// Asks for a job's output filename and pid.
    AskOutput { jobid: i32 },
    /// Answer to [Message::AskOutput]. Payload: the output filename when
    /// `store_output` is set.
    AnswerOutput {
        store_output: bool,
        pid: i32,
        ofilename: Option<Vec<u8>>,
    },
    /// Removes a queued or finished job.
    RemoveJob { jobid: i32 },
    RemoveJobOk,
    /// Parks the connection until the job reaches a terminal state.
    WaitJob { jobid: i32 },
    /// Parks the connection until the job leaves QUEUED/ALLOCATING.
    WaitRunningJob { jobid: i32 },
    /// Completion of a WAITJOB or WAIT_RUNNING_JOB park. The result is
    /// whatever the job carries at wake-up time (zeroed when the job has
    /// merely started running).
    WaitJobOk { result: ExecResult },
    /// Moves a queued job to the front of the queued segment.
    Urgent { jobid: i32 },
    UrgentOk,
    GetState { jobid: i32 },
    AnswerState { state: JobState },
    /// Exchanges the queue positions of two queued jobs.
    SwapJobs { jobid1: i32, jobid2: i32 },
    SwapJobsOk,
    /// Requests the job metadata dump, answered by a stream of
    /// [Message::InfoData].
    Info { jobid: i32 },
    /// One chunk of job metadata. Payload: the text.
    InfoData(Vec<u8>),
    /// Request and reply share the tag: the request carries 0, the reply
    /// the last allocated jobid (-1 when none was ever allocated).
    LastId { jobid: i32 },
    GetVersion,
    Version { version: i32 },
    /// Reply to COUNT_RUNNING and KILL_ALL. The KILL_ALL reply additionally
    /// carries the running jobs' process group ids as payload, for the
    /// client to signal.
    CountRunning { count: i32, pids: Option<Vec<i32>> },
    /// Asks for a job's label, answered by one LIST_LINE.
    GetLabel { jobid: i32 },
    /// Asks for a job's command, answered by one LIST_LINE.
    GetCmd { jobid: i32 },
    SetMaxSlots { max_slots: i32 },
    GetMaxSlots,
    GetMaxSlotsOk { max_slots: i32 },
    /// Asks for the running jobs' pids so the client can signal them all.
    KillAll,
    /// Request and reply share the tag: the request carries 0, the reply
    /// the configured retry interval in seconds.
    GetGpuWaitTime { secs: i32 },
    SetGpuWaitTime { secs: i32 },
    /// GPU-retry nudge. Daemon to client it carries the interval the client
    /// should sleep before nudging back; client to daemon it requests a
    /// scheduling pass.
    Reminder { gpu_wait_time: i32 },
}

impl Message {
    pub fn tag(&self) -> i32 {
        use Message::*;

        match self {
            KillServer => tag::KILL_SERVER,
            NewJob(_) => tag::NEWJOB,
            NewJobOk { .. } => tag::NEWJOB_OK,
            NewJobNok => tag::NEWJOB_NOK,
            RunJob { .. } => tag::RUNJOB,
            RunJobOk { .. } => tag::RUNJOB_OK,
            EndJob { .. } => tag::ENDJOB,
            List { .. } => tag::LIST,
            ListLine(_) => tag::LIST_LINE,
            ClearFinished => tag::CLEAR_FINISHED,
            AskOutput { .. } => tag::ASK_OUTPUT,
            AnswerOutput { .. } => tag::ANSWER_OUTPUT,
            RemoveJob { .. } => tag::REMOVEJOB,
            RemoveJobOk => tag::REMOVEJOB_OK,
            WaitJob { .. } => tag::WAITJOB,
            WaitRunningJob { .. } => tag::WAIT_RUNNING_JOB,
            WaitJobOk { .. } => tag::WAITJOB_OK,
            Urgent { .. } => tag::URGENT,
            UrgentOk => tag::URGENT_OK,
            GetState { .. } => tag::GET_STATE,
            AnswerState { .. } => tag::ANSWER_STATE,
            SwapJobs { .. } => tag::SWAP_JOBS,
            SwapJobsOk => tag::SWAP_JOBS_OK,
            Info { .. } => tag::INFO,
            InfoData(_) => tag::INFO_DATA,
            LastId { .. } => tag::LAST_ID,
            GetVersion => tag::GET_VERSION,
            Version { .. } => tag::VERSION,
            CountRunning { .. } => tag::COUNT_RUNNING,
            GetLabel { .. } => tag::GET_LABEL,
            GetCmd { .. } => tag::GET_CMD,
            SetMaxSlots { .. } => tag::SET_MAX_SLOTS,
            GetMaxSlots => tag::GET_MAX_SLOTS,
            GetMaxSlotsOk { .. } => tag::GET_MAX_SLOTS_OK,
            KillAll => tag::KILL_ALL,
            GetGpuWaitTime { .. } => tag::GET_GPU_WAIT_TIME,
            SetGpuWaitTime { .. } => tag::SET_GPU_WAIT_TIME,
            Reminder { .. } => tag::REMINDER,
        }
    }
}

/// One message plus the uid its sender stamped on the record.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub uid: i32,
    pub msg: Message,
}

impl Envelope {
    pub fn new(uid: i32, msg: Message) -> Self {
        Self { uid, msg }
    }
}
