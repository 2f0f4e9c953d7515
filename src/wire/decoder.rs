use std::{error, fmt, io};

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use super::protocol::{tag, Envelope, Message, MAX_PAYLOAD, RECORD_SIZE};
use crate::types::job::ExecResult;
use crate::types::states::JobState;

/// A decoder for a stream of spooler protocol messages.
///
/// Messages arrive as fixed-size records optionally followed by payload
/// bytes whose lengths the record carries. The decoder assembles the whole
/// message (record plus payloads) before yielding it: payloads are bounded
/// by [MAX_PAYLOAD], so buffering them is cheap, and handlers never see a
/// half-received message.
///
/// Message boundaries are never inferred from content. A record whose tag
/// is unknown, whose state code is invalid, or whose size fields are out of
/// range is an unrecoverable framing error: client and server are
/// out-of-sync at the protocol level and the connection must be dropped. A
/// partial record or payload at end of stream surfaces as the framing
/// layer's bytes-remaining error.
#[derive(Debug, Default)]
pub enum Decoder {
    #[default]
    ReadRecord,
    ReadPayload {
        uid: i32,
        pending: Pending,
        need: usize,
    },
}

/// A parsed record still waiting for its payload bytes.
#[derive(Debug)]
pub enum Pending {
    NewJob(NewJobHead),
    RunJob {
        last_errorlevel: i32,
        gpu_count: usize,
    },
    RunJobOk {
        store_output: bool,
        pid: i32,
        ofilename_size: usize,
    },
    AnswerOutput {
        store_output: bool,
        pid: i32,
        ofilename_size: usize,
    },
    ListLine {
        size: usize,
    },
    InfoData {
        size: usize,
    },
    CountRunning {
        count: i32,
        pid_count: usize,
    },
}

/// The payload-bearing fields of a NEWJOB record.
#[derive(Debug)]
pub struct NewJobHead {
    command_size: usize,
    label_size: usize,
    env_size: usize,
    depend_count: usize,
    gpu_count: usize,
    store_output: bool,
    should_keep_finished: bool,
    wait_enqueuing: bool,
    require_elevel: bool,
    num_slots: i32,
    num_gpus: i32,
    wait_free_gpus: bool,
}

impl Pending {
    /// Total payload bytes this record announces.
    fn need(&self) -> usize {
        use Pending::*;

        match self {
            NewJob(h) => {
                4 * (h.depend_count + h.gpu_count)
                    + h.command_size
                    + h.label_size
                    + h.env_size
            },
            RunJob { gpu_count, .. } => 4 * gpu_count,
            RunJobOk { ofilename_size, .. } => *ofilename_size,
            AnswerOutput { ofilename_size, .. } => *ofilename_size,
            ListLine { size } => *size,
            InfoData { size } => *size,
            CountRunning { pid_count, .. } => 4 * pid_count,
        }
    }

    /// Consumes exactly [Pending::need] bytes from `buf` and builds the
    /// message.
    fn finish(self, buf: &mut BytesMut) -> Message {
        use Pending::*;

        match self {
            NewJob(h) => {
                let depend_on = take_i32s(buf, h.depend_count);
                let gpu_nums = take_i32s(buf, h.gpu_count);
                let command = take_string(buf, h.command_size);
                let label = take_opt_string(buf, h.label_size);
                let env = take_opt_string(buf, h.env_size);

                Message::NewJob(super::protocol::NewJob {
                    command,
                    label,
                    env,
                    depend_on,
                    gpu_nums,
                    store_output: h.store_output,
                    should_keep_finished: h.should_keep_finished,
                    wait_enqueuing: h.wait_enqueuing,
                    require_elevel: h.require_elevel,
                    num_slots: h.num_slots,
                    num_gpus: h.num_gpus,
                    wait_free_gpus: h.wait_free_gpus,
                })
            },
            RunJob {
                last_errorlevel,
                gpu_count,
            } => Message::RunJob {
                last_errorlevel,
                gpus: take_i32s(buf, gpu_count),
            },
            RunJobOk {
                store_output,
                pid,
                ofilename_size,
            } => Message::RunJobOk {
                pid,
                store_output,
                ofilename: take_opt_string(buf, ofilename_size),
            },
            AnswerOutput {
                store_output,
                pid,
                ofilename_size,
            } => Message::AnswerOutput {
                store_output,
                pid,
                ofilename: take_opt_string(buf, ofilename_size),
            },
            ListLine { size } => Message::ListLine(take_string(buf, size)),
            InfoData { size } => Message::InfoData(take_string(buf, size)),
            CountRunning { count, pid_count } => Message::CountRunning {
                count,
                pids: if pid_count == 0 {
                    None
                } else {
                    Some(take_i32s(buf, pid_count))
                },
            },
        }
    }
}

// Panic safety for all three helpers: the decoder only calls finish() once
// the buffer holds at least need() bytes, which is the sum of the segment
// lengths consumed here.

fn take_i32s(buf: &mut BytesMut, count: usize) -> Vec<i32> {
    (0..count).map(|_| buf.get_i32_le()).collect()
}

/// Takes a sized byte string, dropping the terminating null the size field
/// accounts for.
fn take_string(buf: &mut BytesMut, size: usize) -> Vec<u8> {
    let raw = buf.split_to(size);
    match raw.strip_suffix(b"\0") {
        Some(s) => s.to_vec(),
        None => raw.to_vec(),
    }
}

fn take_opt_string(buf: &mut BytesMut, size: usize) -> Option<Vec<u8>> {
    if size == 0 {
        None
    } else {
        Some(take_string(buf, size))
    }
}

/// Outcome of parsing one fixed record.
enum Parsed {
    Done(Message),
    Await(Pending),
}

fn size_field(v: i32) -> Result<usize, Error> {
    if v < 0 || v as usize > MAX_PAYLOAD {
        Err(WireError::BadSize(v).into())
    } else {
        Ok(v as usize)
    }
}

fn count_field(v: i32) -> Result<usize, Error> {
    // Counts are multiplied by 4 on the wire; cap accordingly.
    if v < 0 || v as usize > MAX_PAYLOAD / 4 {
        Err(WireError::BadSize(v).into())
    } else {
        Ok(v as usize)
    }
}

fn bool_field(v: i32) -> bool {
    v != 0
}

fn result_fields(rec: &mut impl Buf) -> ExecResult {
    ExecResult {
        errorlevel: rec.get_i32_le(),
        skipped: bool_field(rec.get_i32_le()),
        user_ms: rec.get_f64_le(),
        system_ms: rec.get_f64_le(),
        real_ms: rec.get_f64_le(),
    }
}

/// Parses the variant fields of one record. `rec` holds the full
/// [RECORD_SIZE] bytes with uid and tag already consumed.
fn parse_record(t: i32, rec: &mut impl Buf) -> Result<Parsed, Error> {
    use Message::*;

    let msg = match t {
        tag::KILL_SERVER => KillServer,
        tag::NEWJOB => {
            return Ok(Parsed::Await(Pending::NewJob(NewJobHead {
                command_size: size_field(rec.get_i32_le())?,
                label_size: size_field(rec.get_i32_le())?,
                env_size: size_field(rec.get_i32_le())?,
                depend_count: count_field(rec.get_i32_le())?,
                gpu_count: count_field(rec.get_i32_le())?,
                store_output: bool_field(rec.get_i32_le()),
                should_keep_finished: bool_field(rec.get_i32_le()),
                wait_enqueuing: bool_field(rec.get_i32_le()),
                require_elevel: bool_field(rec.get_i32_le()),
                num_slots: rec.get_i32_le(),
                num_gpus: rec.get_i32_le(),
                wait_free_gpus: bool_field(rec.get_i32_le()),
            })));
        },
        tag::NEWJOB_OK => NewJobOk {
            jobid: rec.get_i32_le(),
        },
        tag::NEWJOB_NOK => NewJobNok,
        tag::RUNJOB => {
            return Ok(Parsed::Await(Pending::RunJob {
                last_errorlevel: rec.get_i32_le(),
                gpu_count: count_field(rec.get_i32_le())?,
            }));
        },
        tag::RUNJOB_OK => {
            return Ok(Parsed::Await(Pending::RunJobOk {
                store_output: bool_field(rec.get_i32_le()),
                pid: rec.get_i32_le(),
                ofilename_size: size_field(rec.get_i32_le())?,
            }));
        },
        tag::ENDJOB => EndJob {
            result: result_fields(rec),
        },
        tag::LIST => List {
            term_width: rec.get_i32_le(),
        },
        tag::LIST_LINE => {
            return Ok(Parsed::Await(Pending::ListLine {
                size: size_field(rec.get_i32_le())?,
            }));
        },
        tag::CLEAR_FINISHED => ClearFinished,
        tag::ASK_OUTPUT => AskOutput {
            jobid: rec.get_i32_le(),
        },
        tag::ANSWER_OUTPUT => {
            return Ok(Parsed::Await(Pending::AnswerOutput {
                store_output: bool_field(rec.get_i32_le()),
                pid: rec.get_i32_le(),
                ofilename_size: size_field(rec.get_i32_le())?,
            }));
        },
        tag::REMOVEJOB => RemoveJob {
            jobid: rec.get_i32_le(),
        },
        tag::REMOVEJOB_OK => RemoveJobOk,
        tag::WAITJOB => WaitJob {
            jobid: rec.get_i32_le(),
        },
        tag::WAIT_RUNNING_JOB => WaitRunningJob {
            jobid: rec.get_i32_le(),
        },
        tag::WAITJOB_OK => WaitJobOk {
            result: result_fields(rec),
        },
        tag::URGENT => Urgent {
            jobid: rec.get_i32_le(),
        },
        tag::URGENT_OK => UrgentOk,
        tag::GET_STATE => GetState {
            jobid: rec.get_i32_le(),
        },
        tag::ANSWER_STATE => {
            let code = rec.get_i32_le();
            AnswerState {
                state: JobState::from_code(code)
                    .ok_or(WireError::BadState(code))?,
            }
        },
        tag::SWAP_JOBS => SwapJobs {
            jobid1: rec.get_i32_le(),
            jobid2: rec.get_i32_le(),
        },
        tag::SWAP_JOBS_OK => SwapJobsOk,
        tag::INFO => Info {
            jobid: rec.get_i32_le(),
        },
        tag::INFO_DATA => {
            return Ok(Parsed::Await(Pending::InfoData {
                size: size_field(rec.get_i32_le())?,
            }));
        },
        tag::LAST_ID => LastId {
            jobid: rec.get_i32_le(),
        },
        tag::GET_VERSION => GetVersion,
        tag::VERSION => Version {
            version: rec.get_i32_le(),
        },
        tag::COUNT_RUNNING => {
            return Ok(Parsed::Await(Pending::CountRunning {
                count: rec.get_i32_le(),
                pid_count: count_field(rec.get_i32_le())?,
            }));
        },
        tag::GET_LABEL => GetLabel {
            jobid: rec.get_i32_le(),
        },
        tag::GET_CMD => GetCmd {
            jobid: rec.get_i32_le(),
        },
        tag::SET_MAX_SLOTS => SetMaxSlots {
            max_slots: rec.get_i32_le(),
        },
        tag::GET_MAX_SLOTS => GetMaxSlots,
        tag::GET_MAX_SLOTS_OK => GetMaxSlotsOk {
            max_slots: rec.get_i32_le(),
        },
        tag::KILL_ALL => KillAll,
        tag::GET_GPU_WAIT_TIME => GetGpuWaitTime {
            secs: rec.get_i32_le(),
        },
        tag::SET_GPU_WAIT_TIME => SetGpuWaitTime {
            secs: rec.get_i32_le(),
        },
        tag::REMINDER => Reminder {
            gpu_wait_time: rec.get_i32_le(),
        },
        other => return Err(WireError::UnknownTag(other).into()),
    };

    Ok(Parsed::Done(msg))
}

impl codec::Decoder for Decoder {
    type Item = Envelope;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self {
                Decoder::ReadRecord => {
                    if src.len() < RECORD_SIZE {
                        src.reserve(RECORD_SIZE - src.len());
                        return Ok(None);
                    }

                    // Panic safety: split_to panics unless
                    // src.len() >= RECORD_SIZE, asserted above.
                    let record = src.split_to(RECORD_SIZE);
                    let mut rec = record.as_ref();
                    let uid = rec.get_i32_le();
                    let t = rec.get_i32_le();

                    match parse_record(t, &mut rec)? {
                        Parsed::Done(msg) => {
                            return Ok(Some(Envelope { uid, msg }));
                        },
                        Parsed::Await(pending) => {
                            let need = pending.need();
                            *self = Decoder::ReadPayload {
                                uid,
                                pending,
                                need,
                            };
                            // The payload may already be buffered; loop to
                            // find out rather than waiting for more bytes.
                        },
                    }
                },
                Decoder::ReadPayload { uid, need, .. } => {
                    if src.len() < *need {
                        src.reserve(*need - src.len());
                        return Ok(None);
                    }

                    let uid = *uid;
                    let Decoder::ReadPayload { pending, need, .. } =
                        std::mem::take(self)
                    else {
                        unreachable!()
                    };

                    // Panic safety: split_to panics unless
                    // src.len() >= need, asserted above.
                    let mut buf = src.split_to(need);
                    let msg = pending.finish(&mut buf);

                    return Ok(Some(Envelope { uid, msg }));
                },
            }
        }
    }
}

/// A record-level protocol violation.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    /// The type tag exists in no direction of the protocol.
    UnknownTag(i32),
    /// A size or count field is negative or beyond [MAX_PAYLOAD].
    BadSize(i32),
    /// An ANSWER_STATE record names no known state.
    BadState(i32),
}

#[derive(Debug)]
pub enum Error {
    Wire(WireError),
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Wire(WireError::UnknownTag(t)) => {
                write!(f, "unknown message tag {t}")
            },
            Error::Wire(WireError::BadSize(n)) => {
                write!(f, "payload size {n} out of range")
            },
            Error::Wire(WireError::BadState(c)) => {
                write!(f, "invalid job state code {c}")
            },
            Error::IO(e) => write!(f, "{e}"),
        }
    }
}

impl From<WireError> for Error {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}
