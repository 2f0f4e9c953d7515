use serde::Serialize;

/// Lifecycle state of a job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Pre-admission: the queue was full and the submitter asked to block
    /// until its job can be enqueued. Not counted against the queue cap.
    HoldingClient,
    /// Waiting its turn in the FIFO queue.
    Queued,
    /// Admitted; slots reserved; RUN ticket issued, awaiting the runner's
    /// confirmation.
    Allocating,
    /// Executing under the runner's reported pid.
    Running,
    /// Terminal, with a populated result.
    Finished,
    /// Terminal without running: a dependency failed or GPUs were scarce.
    Skipped,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        use JobState::*;

        match self {
            HoldingClient => "holding",
            Queued => "queued",
            Allocating => "allocating",
            Running => "running",
            Finished => "finished",
            Skipped => "skipped",
        }
    }

    /// Finished or skipped: the job will never run (again).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Skipped)
    }

    /// Holding a slot reservation (and, for a removal attempt, immovable).
    pub fn is_busy(self) -> bool {
        matches!(self, JobState::Allocating | JobState::Running)
    }

    /// Wire representation, carried in ANSWER_STATE.
    pub fn code(self) -> i32 {
        use JobState::*;

        match self {
            HoldingClient => 0,
            Queued => 1,
            Allocating => 2,
            Running => 3,
            Finished => 4,
            Skipped => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use JobState::*;

        Some(match code {
            0 => HoldingClient,
            1 => Queued,
            2 => Allocating,
            3 => Running,
            4 => Finished,
            5 => Skipped,
            _ => return None,
        })
    }
}

// This impl is used to allow the INFO metadata dump to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
