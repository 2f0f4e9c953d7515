use std::{error, fmt, io};

use bytes::BufMut;
use tokio_util::codec;

use super::protocol::{Envelope, Message, MAX_PAYLOAD, RECORD_SIZE};
use crate::types::job::ExecResult;

// An encoder producing spooler protocol messages
#[derive(Debug, Default)]
pub struct Encoder {}

/// A fixed record under construction. Starts fully zeroed so unused variant
/// bytes never carry stale memory onto the wire.
struct Record {
    buf: [u8; RECORD_SIZE],
    at: usize,
}

impl Record {
    fn new(uid: i32, tag: i32) -> Self {
        let mut r = Record {
            buf: [0; RECORD_SIZE],
            at: 8,
        };
        r.buf[0..4].copy_from_slice(&uid.to_le_bytes());
        r.buf[4..8].copy_from_slice(&tag.to_le_bytes());
        r
    }

    fn i32(mut self, v: i32) -> Self {
        // Panic safety: variant layouts are fixed at compile time and all
        // fit in RECORD_SIZE; the slice indexing below cannot go out of
        // bounds for any arm of encode().
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
        self
    }

    fn f64(mut self, v: f64) -> Self {
        self.buf[self.at..self.at + 8].copy_from_slice(&v.to_le_bytes());
        self.at += 8;
        self
    }

    fn flag(self, v: bool) -> Self {
        self.i32(v as i32)
    }

    fn result(self, r: &ExecResult) -> Self {
        self.i32(r.errorlevel)
            .flag(r.skipped)
            .f64(r.user_ms)
            .f64(r.system_ms)
            .f64(r.real_ms)
    }
}

/// Wire size of an optional byte string: length plus the terminating null,
/// or zero when absent.
fn cstr_size(s: &Option<Vec<u8>>) -> Result<i32, Error> {
    match s {
        None => Ok(0),
        Some(s) => sized(s.len() + 1),
    }
}

fn sized(n: usize) -> Result<i32, Error> {
    if n > MAX_PAYLOAD {
        Err(Error::Oversize(n))
    } else {
        Ok(n as i32)
    }
}

/// Wire count of an `i32` array, bounded so the byte length stays within
/// [MAX_PAYLOAD].
fn counted(n: usize) -> Result<i32, Error> {
    if n > MAX_PAYLOAD / 4 {
        Err(Error::Oversize(4 * n))
    } else {
        Ok(n as i32)
    }
}

fn put_record(dst: &mut bytes::BytesMut, rec: Record) {
    dst.put_slice(&rec.buf);
}

fn put_cstr(dst: &mut bytes::BytesMut, s: &[u8]) {
    dst.reserve(s.len() + 1);
    dst.put_slice(s);
    dst.put_u8(0);
}

fn put_opt_cstr(dst: &mut bytes::BytesMut, s: &Option<Vec<u8>>) {
    if let Some(s) = s {
        put_cstr(dst, s);
    }
}

fn put_i32s(dst: &mut bytes::BytesMut, vals: &[i32]) {
    dst.reserve(4 * vals.len());
    for v in vals {
        dst.put_i32_le(*v);
    }
}

impl codec::Encoder<Envelope> for Encoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Envelope,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        use Message::*;

        let Envelope { uid, msg } = item;
        let rec = Record::new(uid, msg.tag());

        dst.reserve(RECORD_SIZE);

        match msg {
            KillServer | NewJobNok | ClearFinished | RemoveJobOk
            | UrgentOk | SwapJobsOk | GetVersion | GetMaxSlots | KillAll => {
                put_record(dst, rec)
            },

            NewJob(req) => {
                let rec = rec
                    .i32(sized(req.command.len() + 1)?)
                    .i32(cstr_size(&req.label)?)
                    .i32(cstr_size(&req.env)?)
                    .i32(counted(req.depend_on.len())?)
                    .i32(counted(req.gpu_nums.len())?)
                    .flag(req.store_output)
                    .flag(req.should_keep_finished)
                    .flag(req.wait_enqueuing)
                    .flag(req.require_elevel)
                    .i32(req.num_slots)
                    .i32(req.num_gpus)
                    .flag(req.wait_free_gpus);
                put_record(dst, rec);
                put_i32s(dst, &req.depend_on);
                put_i32s(dst, &req.gpu_nums);
                put_cstr(dst, &req.command);
                put_opt_cstr(dst, &req.label);
                put_opt_cstr(dst, &req.env);
            },

            NewJobOk { jobid }
            | AskOutput { jobid }
            | RemoveJob { jobid }
            | WaitJob { jobid }
            | WaitRunningJob { jobid }
            | Urgent { jobid }
            | GetState { jobid }
            | Info { jobid }
            | LastId { jobid }
            | GetLabel { jobid }
            | GetCmd { jobid } => put_record(dst, rec.i32(jobid)),

            RunJob {
                last_errorlevel,
                gpus,
            } => {
                let rec = rec.i32(last_errorlevel).i32(counted(gpus.len())?);
                put_record(dst, rec);
                put_i32s(dst, &gpus);
            },

            RunJobOk {
                pid,
                store_output,
                ofilename,
            }
            | AnswerOutput {
                store_output,
                pid,
                ofilename,
            } => {
                let rec = rec
                    .flag(store_output)
                    .i32(pid)
                    .i32(cstr_size(&ofilename)?);
                put_record(dst, rec);
                put_opt_cstr(dst, &ofilename);
            },

            EndJob { result } | WaitJobOk { result } => {
                put_record(dst, rec.result(&result))
            },

            List { term_width } => put_record(dst, rec.i32(term_width)),

            ListLine(line) | InfoData(line) => {
                put_record(dst, rec.i32(sized(line.len() + 1)?));
                put_cstr(dst, &line);
            },

            AnswerState { state } => put_record(dst, rec.i32(state.code())),

            SwapJobs { jobid1, jobid2 } => {
                put_record(dst, rec.i32(jobid1).i32(jobid2))
            },

            Version { version } => put_record(dst, rec.i32(version)),

            CountRunning { count, pids } => {
                let batch = pids.as_deref().unwrap_or(&[]);
                let rec = rec.i32(count).i32(counted(batch.len())?);
                put_record(dst, rec);
                put_i32s(dst, batch);
            },

            SetMaxSlots { max_slots } | GetMaxSlotsOk { max_slots } => {
                put_record(dst, rec.i32(max_slots))
            },

            GetGpuWaitTime { secs } | SetGpuWaitTime { secs } => {
                put_record(dst, rec.i32(secs))
            },

            Reminder { gpu_wait_time } => {
                put_record(dst, rec.i32(gpu_wait_time))
            },
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    /// A payload segment exceeds [MAX_PAYLOAD].
    Oversize(usize),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IO(e) => write!(f, "{e}"),
            Error::Oversize(n) => {
                write!(f, "payload of {n} bytes exceeds the protocol limit")
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}
