//! Request handling: one incoming envelope maps to registry mutations and
//! replies. Errors a human should read go back as a single LIST_LINE and
//! close that request's connection; resource outcomes (queue full, GPU
//! scarcity) are structural and never textual.

use tracing::{debug, info, warn};

use super::Core;
use crate::list;
use crate::types::job::{ConnId, ExecResult, Job, WaitKind, Waiter};
use crate::types::registry::{RemoveError, ReorderError};
use crate::types::states::JobState;
use crate::wire::protocol::{Envelope, Message, NewJob, PROTOCOL_VERSION};

impl Core {
    pub(super) fn handle_request(&mut self, conn: ConnId, env: Envelope) {
        let Envelope { uid, msg } = env;

        match msg {
            Message::NewJob(req) => self.newjob(conn, uid, req),

            Message::List { term_width } => self.list(conn, term_width),

            Message::GetVersion => self.send(
                conn,
                Message::Version {
                    version: PROTOCOL_VERSION,
                },
            ),

            Message::Info { jobid } => self.info(conn, jobid),

            Message::LastId { .. } => {
                let jobid = self.registry.last_jobid();
                self.send(conn, Message::LastId { jobid });
            },

            Message::AskOutput { jobid } => self.ask_output(conn, jobid),

            Message::KillServer => {
                info!(uid, "shutdown requested over the socket");
                self.cancel.cancel();
            },

            Message::ClearFinished => {
                let removed = self.registry.clear_finished();
                debug!(count = removed.len(), "cleared finished jobs");
                self.schedule();
            },

            Message::RemoveJob { jobid } => self.remove_job(conn, jobid),

            Message::WaitJob { jobid } => {
                self.wait_job(conn, jobid, WaitKind::Terminal)
            },

            Message::WaitRunningJob { jobid } => {
                self.wait_job(conn, jobid, WaitKind::LeftQueue)
            },

            Message::SetMaxSlots { max_slots } => {
                info!(max_slots, "slot ceiling reconfigured");
                self.slots.set_max(max_slots);
                self.schedule();
            },

            Message::GetMaxSlots => {
                let max_slots = self.slots.max();
                self.send(conn, Message::GetMaxSlotsOk { max_slots });
            },

            Message::Urgent { jobid } => match self.registry.urgent(jobid) {
                Ok(()) => {
                    self.send(conn, Message::UrgentOk);
                    self.schedule();
                },
                Err(e) => self.reorder_error(conn, e),
            },

            Message::GetState { jobid } => {
                match self.registry.get(jobid).map(|j| j.state) {
                    Some(state) => {
                        self.send(conn, Message::AnswerState { state })
                    },
                    None => {
                        self.error_line(conn, format!("Job {jobid} not found"))
                    },
                }
            },

            Message::SwapJobs { jobid1, jobid2 } => {
                match self.registry.swap(jobid1, jobid2) {
                    Ok(()) => {
                        self.send(conn, Message::SwapJobsOk);
                        self.schedule();
                    },
                    Err(e) => self.reorder_error(conn, e),
                }
            },

            Message::CountRunning { .. } => {
                let count = self.registry.running_pids().len() as i32;
                self.send(conn, Message::CountRunning { count, pids: None });
            },

            Message::KillAll => {
                let pids = self.registry.running_pids();
                self.send(
                    conn,
                    Message::CountRunning {
                        count: pids.len() as i32,
                        pids: Some(pids),
                    },
                );
            },

            Message::GetLabel { jobid } => self.get_label(conn, jobid),

            Message::GetCmd { jobid } => self.get_cmd(conn, jobid),

            Message::GetGpuWaitTime { .. } => {
                let secs = self.gpu_wait_time;
                self.send(conn, Message::GetGpuWaitTime { secs });
            },

            Message::SetGpuWaitTime { secs } => {
                info!(secs, "gpu retry interval reconfigured");
                self.gpu_wait_time = secs;
                self.schedule();
            },

            Message::Reminder { .. } => self.reminder(conn),

            Message::EndJob { result } => self.end_job(conn, result),

            Message::RunJobOk {
                pid,
                store_output,
                ofilename,
            } => self.runjob_ok(conn, pid, store_output, ofilename),

            // Reply-only tags arriving at the daemon mean the peer is out
            // of sync; drop it without touching the queue.
            other => {
                warn!(tag = other.tag(), "unexpected message type from client");
                self.close(conn);
            },
        }
    }

    fn newjob(&mut self, conn: ConnId, uid: i32, req: NewJob) {
        let depend_on =
            super::sched::resolve_depend_on(&req.depend_on, self.registry.last_jobid());

        let full = self.registry.count_queued_or_busy() >= self.max_jobs;
        if full && !req.wait_enqueuing {
            debug!(uid, "queue full; refusing submission");
            self.send(conn, Message::NewJobNok);
            return;
        }

        let state = if full {
            JobState::HoldingClient
        } else {
            JobState::Queued
        };
        let req = NewJob {
            depend_on: Vec::new(),
            ..req
        };
        let jobid = self.registry.insert_with(|id| {
            Job::from_submission(id, uid, conn, req, depend_on, state)
        });

        if full {
            // The NEWJOB_OK is owed once the job makes it into the queue.
            debug!(jobid, "queue full; holding client");
            self.registry.get_mut(jobid).unwrap().waiters.push(Waiter {
                conn,
                kind: WaitKind::Enqueued,
            });
        } else {
            info!(jobid, uid, "job submitted");
            self.send(conn, Message::NewJobOk { jobid });
        }

        self.schedule();
    }

    fn list(&mut self, conn: ConnId, term_width: i32) {
        let mut lines = vec![list::header(self.slots.busy(), self.slots.max())];
        lines.extend(self.registry.iter().map(|j| list::line(j, term_width)));

        for line in lines {
            self.send(conn, Message::ListLine(line));
        }
        // End of listing is signalled by end of stream.
        self.close(conn);
    }

    fn info(&mut self, conn: ConnId, jobid: i32) {
        match self.registry.get(jobid).map(list::info_dump) {
            Some(dump) => {
                self.send(conn, Message::InfoData(dump));
                self.close(conn);
            },
            None => self.error_line(conn, format!("Job {jobid} not found")),
        }
    }

    fn ask_output(&mut self, conn: ConnId, jobid: i32) {
        let reply = match self.registry.get(jobid) {
            None => Err(format!("Job {jobid} not found")),
            Some(job) if !job.state.is_terminal() && job.state != JobState::Running => {
                Err(format!("Job {jobid} is not running yet"))
            },
            Some(job) => Ok(Message::AnswerOutput {
                store_output: job.store_output,
                pid: job.pid,
                ofilename: job.output_filename.clone(),
            }),
        };

        match reply {
            Ok(msg) => self.send(conn, msg),
            Err(text) => self.error_line(conn, text),
        }
    }

    fn remove_job(&mut self, conn: ConnId, jobid: i32) {
        match self.registry.remove(jobid) {
            Ok(mut job) => {
                info!(jobid, "job removed");
                // Whoever was parked on this job gets closure now: a held
                // submitter learns its job never made the queue, waiters
                // get the result the job will never improve on.
                for w in job.waiters.drain(..) {
                    let msg = match w.kind {
                        WaitKind::Enqueued => Message::NewJobNok,
                        _ => Message::WaitJobOk {
                            result: job.result.unwrap_or(ExecResult::skipped()),
                        },
                    };
                    self.send(w.conn, msg);
                }
                self.send(conn, Message::RemoveJobOk);
                self.schedule();
            },
            Err(RemoveError::Busy) => self.error_line(
                conn,
                format!("Job {jobid} is running or being allocated"),
            ),
            Err(RemoveError::NotFound) => {
                self.error_line(conn, format!("Job {jobid} not found"))
            },
        }
    }

    fn wait_job(&mut self, conn: ConnId, jobid: i32, kind: WaitKind) {
        if self.registry.get(jobid).is_none() {
            self.error_line(conn, format!("Job {jobid} not found"));
            return;
        }

        // Panic safety: presence checked above.
        let job = self.registry.get_mut(jobid).unwrap();
        let park = match kind {
            WaitKind::Terminal => !job.state.is_terminal(),
            WaitKind::LeftQueue => matches!(
                job.state,
                JobState::Queued | JobState::Allocating | JobState::HoldingClient
            ),
            WaitKind::Enqueued => unreachable!("not a client request"),
        };

        if park {
            job.waiters.push(Waiter { conn, kind });
        } else {
            let result = job.result.unwrap_or_default();
            self.send(conn, Message::WaitJobOk { result });
        }
    }

    fn get_label(&mut self, conn: ConnId, jobid: i32) {
        let reply = match self.registry.get(jobid) {
            None => Err(format!("Job {jobid} not found")),
            Some(job) => match &job.label {
                Some(label) => {
                    let mut line = label.clone();
                    line.push(b'\n');
                    Ok(Message::ListLine(line))
                },
                None => Err(format!("Job {jobid} has no label")),
            },
        };

        match reply {
            Ok(msg) => self.send(conn, msg),
            Err(text) => self.error_line(conn, text),
        }
    }

    fn get_cmd(&mut self, conn: ConnId, jobid: i32) {
        match self.registry.get(jobid) {
            None => self.error_line(conn, format!("Job {jobid} not found")),
            Some(job) => {
                let mut line = job.command.clone();
                line.push(b'\n');
                self.send(conn, Message::ListLine(line));
            },
        }
    }

    /// A GPU-waiting runner slept out its interval and wants another
    /// scheduling attempt.
    fn reminder(&mut self, conn: ConnId) {
        for job in self.registry.iter_mut() {
            if job.conn == Some(conn) {
                job.gpu_waiting = false;
            }
        }
        self.schedule();
    }

    fn end_job(&mut self, conn: ConnId, result: ExecResult) {
        let jobid = self
            .registry
            .iter()
            .find(|j| j.conn == Some(conn) && j.state.is_busy())
            .map(|j| j.jobid);

        let Some(jobid) = jobid else {
            // Local-skip flows report RUNJOB_OK(pid=-1) and then ENDJOB for
            // a job that is already terminal; nothing left to record.
            debug!("ENDJOB with no busy job on this connection");
            return;
        };

        info!(jobid, errorlevel = result.errorlevel, "job finished");
        // Panic safety: jobid came out of the registry just above.
        let job = self.registry.get_mut(jobid).unwrap();
        let released = job.num_slots;
        job.state = JobState::Finished;
        job.result = Some(result);
        job.assigned_gpus.clear();
        self.slots.release(released);

        self.notify_transition(jobid);
        self.schedule();
    }

    fn runjob_ok(
        &mut self,
        conn: ConnId,
        pid: i32,
        store_output: bool,
        ofilename: Option<Vec<u8>>,
    ) {
        let jobid = self
            .registry
            .iter()
            .find(|j| j.conn == Some(conn) && j.state == JobState::Allocating)
            .map(|j| j.jobid);

        let Some(jobid) = jobid else {
            warn!("RUNJOB_OK from a connection with no allocated job");
            self.close(conn);
            return;
        };

        if pid == -1 {
            // The runner skipped: a dependency failure it checks itself, or
            // GPU scarcity it discovered at exec time.
            info!(jobid, "runner skipped the job");
            let job = self.registry.get_mut(jobid).unwrap();
            let released = job.num_slots;
            job.state = JobState::Finished;
            job.result = Some(ExecResult::skipped());
            job.assigned_gpus.clear();
            self.slots.release(released);

            self.notify_transition(jobid);
            self.schedule();
        } else {
            info!(jobid, pid, "job running");
            let job = self.registry.get_mut(jobid).unwrap();
            job.state = JobState::Running;
            job.pid = pid;
            job.store_output = store_output;
            job.output_filename = if store_output { ofilename } else { None };

            self.notify_transition(jobid);
        }
    }

    fn reorder_error(&mut self, conn: ConnId, e: ReorderError) {
        let text = match e {
            ReorderError::NotFound(id) => format!("Job {id} not found"),
            ReorderError::NotQueued(id) => {
                format!("Job {id} is not in the queue")
            },
        };
        self.error_line(conn, text);
    }
}
