//! Typed client operations, one per protocol exchange. The user-facing CLI
//! sits on top of these; the end-to-end tests drive the daemon through
//! them directly.
//!
//! Every operation expects its own connection, matching the daemon's
//! one-request-scope error handling: listing and info streams, and any
//! error line, end with the daemon closing the stream.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::sink::SinkExt;
use itertools::Itertools;
use tokio::net::UnixStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::types::job::ExecResult;
use crate::types::states::JobState;
use crate::wire::protocol::{Envelope, Message, NewJob, PROTOCOL_VERSION};
use crate::wire::{self, Codec};

/// Exit code for a submission refused because the queue is full.
pub const EXITCODE_QUEUE_FULL: i32 = 2;

/// Exit code for protocol or local errors.
pub const EXITCODE_ERROR: i32 = -1;

/// Outcome of a NEWJOB exchange.
#[derive(Debug, Eq, PartialEq)]
pub enum Submitted {
    /// The daemon accepted the job under this id.
    Accepted(i32),
    /// The queue is full and the submission did not ask to wait.
    QueueFull,
}

/// The daemon's instruction to an admitted runner.
#[derive(Debug)]
pub struct RunTicket {
    /// First non-zero dependency errorlevel, else 0. A runner may decide
    /// to skip on this even when the daemon did not.
    pub last_errorlevel: i32,
    /// GPU indices assigned to this job; empty when none were requested.
    pub gpus: Vec<i32>,
}

impl RunTicket {
    /// Value to publish as `CUDA_VISIBLE_DEVICES` before exec: the
    /// comma-joined assignment, or `-1` for a GPU-less job.
    pub fn cuda_visible_devices(&self) -> String {
        if self.gpus.is_empty() {
            "-1".to_owned()
        } else {
            self.gpus.iter().join(",")
        }
    }
}

pub struct Client {
    framed: Framed<UnixStream, Codec>,
    uid: i32,
}

impl Client {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to {}", path.display()))?;

        Ok(Self {
            framed: wire::framed(stream),
            uid: nix::unistd::getuid().as_raw() as i32,
        })
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        self.framed
            .send(Envelope::new(self.uid, msg))
            .await
            .context("sending request")
    }

    async fn recv(&mut self) -> Result<Message> {
        match self.recv_opt().await? {
            Some(msg) => Ok(msg),
            None => bail!("server closed the connection"),
        }
    }

    async fn recv_opt(&mut self) -> Result<Option<Message>> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Ok(env)) => Ok(Some(env.msg)),
            Some(Err(e)) => Err(e).context("reading reply"),
        }
    }

    /// Fails on anything that is not the wanted reply, turning an error
    /// line into a readable failure.
    fn unexpected(msg: Message) -> anyhow::Error {
        match msg {
            Message::ListLine(line) => {
                anyhow::anyhow!(
                    "error in the request: {}",
                    String::from_utf8_lossy(&line).trim_end()
                )
            },
            other => anyhow::anyhow!("unexpected reply type {}", other.tag()),
        }
    }

    /// Verifies the protocol version. The request goes out twice so that a
    /// server speaking an older layout answers at least one of them; both
    /// replies are drained on success.
    pub async fn check_version(&mut self) -> Result<()> {
        self.send(Message::GetVersion).await?;
        self.send(Message::GetVersion).await?;

        match self.recv().await? {
            Message::Version { version } if version == PROTOCOL_VERSION => {},
            Message::Version { version } => bail!(
                "wrong server version: received {version}, expecting {PROTOCOL_VERSION}"
            ),
            other => return Err(Self::unexpected(other)),
        }

        match self.recv().await? {
            Message::Version { .. } => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Registers a job. With `wait_enqueuing` set this resolves only once
    /// the daemon finds queue room for the job.
    pub async fn submit(&mut self, req: NewJob) -> Result<Submitted> {
        self.send(Message::NewJob(req)).await?;

        match self.recv().await? {
            Message::NewJobOk { jobid } => Ok(Submitted::Accepted(jobid)),
            Message::NewJobNok => Ok(Submitted::QueueFull),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Blocks until the daemon issues this connection's run ticket,
    /// sleeping out and answering GPU retry nudges on the way.
    pub async fn await_run(&mut self) -> Result<RunTicket> {
        loop {
            match self.recv().await? {
                Message::RunJob {
                    last_errorlevel,
                    gpus,
                } => {
                    return Ok(RunTicket {
                        last_errorlevel,
                        gpus,
                    });
                },
                Message::Reminder { gpu_wait_time } => {
                    tokio::time::sleep(Duration::from_secs(
                        gpu_wait_time.max(0) as u64,
                    ))
                    .await;
                    self.send(Message::Reminder { gpu_wait_time: 0 }).await?;
                },
                other => return Err(Self::unexpected(other)),
            }
        }
    }

    /// Reports the spawned process group, and the output file when
    /// capturing.
    pub async fn report_started(
        &mut self,
        pid: i32,
        ofilename: Option<&[u8]>,
    ) -> Result<()> {
        self.send(Message::RunJobOk {
            pid,
            store_output: ofilename.is_some(),
            ofilename: ofilename.map(<[u8]>::to_vec),
        })
        .await
    }

    /// Declines to run after receiving the ticket (dependency failure or
    /// GPU scarcity found at exec time).
    pub async fn report_skipped(&mut self) -> Result<()> {
        self.send(Message::RunJobOk {
            pid: -1,
            store_output: false,
            ofilename: None,
        })
        .await
    }

    pub async fn report_end(&mut self, result: ExecResult) -> Result<()> {
        self.send(Message::EndJob { result }).await
    }

    /// Blocks until the job is terminal, returning its result.
    pub async fn wait_job(&mut self, jobid: i32) -> Result<ExecResult> {
        self.send(Message::WaitJob { jobid }).await?;
        self.recv_waitjob_ok().await
    }

    /// Blocks until the job has left the queue (started or terminal).
    pub async fn wait_running_job(&mut self, jobid: i32) -> Result<ExecResult> {
        self.send(Message::WaitRunningJob { jobid }).await?;
        self.recv_waitjob_ok().await
    }

    async fn recv_waitjob_ok(&mut self) -> Result<ExecResult> {
        match self.recv().await? {
            Message::WaitJobOk { result } => Ok(result),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get_state(&mut self, jobid: i32) -> Result<JobState> {
        self.send(Message::GetState { jobid }).await?;

        match self.recv().await? {
            Message::AnswerState { state } => Ok(state),
            other => Err(Self::unexpected(other)),
        }
    }

    /// The whole listing, one string per line.
    pub async fn list(&mut self, term_width: i32) -> Result<Vec<String>> {
        self.send(Message::List { term_width }).await?;

        let mut lines = Vec::new();
        while let Some(msg) = self.recv_opt().await? {
            match msg {
                Message::ListLine(line) => lines
                    .push(String::from_utf8_lossy(&line).trim_end().to_owned()),
                other => return Err(Self::unexpected(other)),
            }
        }
        Ok(lines)
    }

    /// The job metadata dump.
    pub async fn info(&mut self, jobid: i32) -> Result<String> {
        self.send(Message::Info { jobid }).await?;

        let mut text = String::new();
        let mut saw_data = false;
        while let Some(msg) = self.recv_opt().await? {
            match msg {
                Message::InfoData(chunk) => {
                    saw_data = true;
                    text.push_str(&String::from_utf8_lossy(&chunk));
                },
                other => return Err(Self::unexpected(other)),
            }
        }
        if !saw_data {
            bail!("server closed the connection");
        }
        Ok(text)
    }

    pub async fn last_id(&mut self) -> Result<i32> {
        self.send(Message::LastId { jobid: 0 }).await?;

        match self.recv().await? {
            Message::LastId { jobid } => Ok(jobid),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Output filename (when captured) and pid of a started job.
    pub async fn ask_output(
        &mut self,
        jobid: i32,
    ) -> Result<(i32, Option<String>)> {
        self.send(Message::AskOutput { jobid }).await?;

        match self.recv().await? {
            Message::AnswerOutput {
                store_output,
                pid,
                ofilename,
            } => {
                let name = if store_output {
                    ofilename.map(|f| String::from_utf8_lossy(&f).into_owned())
                } else {
                    None
                };
                Ok((pid, name))
            },
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn remove_job(&mut self, jobid: i32) -> Result<()> {
        self.send(Message::RemoveJob { jobid }).await?;

        match self.recv().await? {
            Message::RemoveJobOk => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn clear_finished(&mut self) -> Result<()> {
        self.send(Message::ClearFinished).await
    }

    pub async fn urgent(&mut self, jobid: i32) -> Result<()> {
        self.send(Message::Urgent { jobid }).await?;

        match self.recv().await? {
            Message::UrgentOk => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn swap_jobs(&mut self, jobid1: i32, jobid2: i32) -> Result<()> {
        self.send(Message::SwapJobs { jobid1, jobid2 }).await?;

        match self.recv().await? {
            Message::SwapJobsOk => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn count_running(&mut self) -> Result<i32> {
        self.send(Message::CountRunning {
            count: 0,
            pids: None,
        })
        .await?;

        match self.recv().await? {
            Message::CountRunning { count, .. } => Ok(count),
            other => Err(Self::unexpected(other)),
        }
    }

    /// The running jobs' process groups. Signalling them is the caller's
    /// business: the daemon never kills anything itself.
    pub async fn kill_all(&mut self) -> Result<Vec<i32>> {
        self.send(Message::KillAll).await?;

        match self.recv().await? {
            Message::CountRunning { pids, .. } => Ok(pids.unwrap_or_default()),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn get_label(&mut self, jobid: i32) -> Result<String> {
        self.send(Message::GetLabel { jobid }).await?;
        self.recv_line().await
    }

    pub async fn get_cmd(&mut self, jobid: i32) -> Result<String> {
        self.send(Message::GetCmd { jobid }).await?;
        self.recv_line().await
    }

    async fn recv_line(&mut self) -> Result<String> {
        match self.recv().await? {
            Message::ListLine(line) => {
                Ok(String::from_utf8_lossy(&line).trim_end().to_owned())
            },
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn set_max_slots(&mut self, max_slots: i32) -> Result<()> {
        self.send(Message::SetMaxSlots { max_slots }).await
    }

    pub async fn get_max_slots(&mut self) -> Result<i32> {
        self.send(Message::GetMaxSlots).await?;

        match self.recv().await? {
            Message::GetMaxSlotsOk { max_slots } => Ok(max_slots),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn set_gpu_wait_time(&mut self, secs: i32) -> Result<()> {
        self.send(Message::SetGpuWaitTime { secs }).await
    }

    pub async fn get_gpu_wait_time(&mut self) -> Result<i32> {
        self.send(Message::GetGpuWaitTime { secs: 0 }).await?;

        match self.recv().await? {
            Message::GetGpuWaitTime { secs } => Ok(secs),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Asks the daemon to shut down. Refused locally unless running as
    /// root; the daemon itself trusts the socket's filesystem permissions.
    pub async fn kill_server(&mut self) -> Result<()> {
        if !nix::unistd::geteuid().is_root() {
            bail!("not enough permission to perform the action");
        }
        self.send(Message::KillServer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_visible_devices() {
        let none = RunTicket {
            last_errorlevel: 0,
            gpus: vec![],
        };
        assert_eq!(none.cuda_visible_devices(), "-1");

        let some = RunTicket {
            last_errorlevel: 0,
            gpus: vec![2, 0, 3],
        };
        assert_eq!(some.cuda_visible_devices(), "2,0,3");
    }
}
