//! Text emitted on LIST_LINE and INFO_DATA. Only the daemon-side rendering
//! lives here; anything fancier (colour, column tuning) belongs to the
//! client surface.

use itertools::Itertools;
use serde::Serialize;

use crate::types::job::Job;
use crate::types::states::JobState;

/// Columns reserved ahead of the command cell, used to fit the command into
/// the client's terminal width.
const FIXED_COLS: i32 = 60;

pub fn header(busy_slots: i32, max_slots: i32) -> Vec<u8> {
    format!(
        "{:<4} {:<8} {:<10} {:<20} {:<8} {:<6} {:<5} {} [run={}/{}]\n",
        "ID",
        "User",
        "State",
        "Output",
        "E-Level",
        "Time",
        "GPUs",
        "Command",
        busy_slots,
        max_slots,
    )
    .into_bytes()
}

/// One listing row. `term_width` caps the command cell; zero or negative
/// means unlimited.
pub fn line(job: &Job, term_width: i32) -> Vec<u8> {
    let (elevel, time) = match (job.state, job.result) {
        (JobState::Finished, Some(r)) => {
            (r.errorlevel.to_string(), time_cell(r.real_ms))
        },
        _ => (String::new(), String::new()),
    };

    let cmd_cap = if term_width > 0 {
        (term_width - FIXED_COLS).max(20) as usize
    } else {
        usize::MAX
    };

    let mut cmd = String::new();
    cmd.push_str(&depend_cell(job));
    if let Some(label) = &job.label {
        cmd.push('[');
        cmd.push_str(&shorten(&String::from_utf8_lossy(label), 20));
        cmd.push(']');
    }
    cmd.push_str(&shorten(&job.command_lossy(), cmd_cap));

    format!(
        "{:<4} {:<8} {:<10} {:<20} {:<8} {:<6} {:<5} {}\n",
        job.jobid,
        job.uid,
        job.state.as_str(),
        output_cell(job),
        elevel,
        time,
        job.num_gpus,
        cmd,
    )
    .into_bytes()
}

fn output_cell(job: &Job) -> String {
    if job.state == JobState::Skipped {
        return "(no output)".into();
    }
    if !job.store_output {
        return "stdout".into();
    }

    match (job.state, &job.output_filename) {
        (JobState::Queued | JobState::Allocating | JobState::HoldingClient, _) => {
            "(file)".into()
        },
        // May happen when the runner died before reporting the filename.
        (_, None) => "(...)".into(),
        (_, Some(name)) => String::from_utf8_lossy(name).into_owned(),
    }
}

/// Renders a wall-clock duration, escalating through s/m/h/d.
fn time_cell(real_ms: f64) -> String {
    let mut t = real_ms / 1000.0;
    let mut unit = "s";

    if t > 60.0 {
        t /= 60.0;
        unit = "m";

        if t > 60.0 {
            t /= 60.0;
            unit = "h";

            if t > 24.0 {
                t /= 24.0;
                unit = "d";
            }
        }
    }

    format!("{t:5.2}{unit}")
}

fn depend_cell(job: &Job) -> String {
    if job.depend_on.is_empty() {
        return String::new();
    }

    format!("[{}]&& ", job.depend_on.iter().join(","))
}

fn shorten(line: &str, len: usize) -> String {
    if line.chars().count() <= len {
        line.to_owned()
    } else {
        let cut: String = line.chars().take(len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Job metadata as dumped on INFO_DATA, in YAML dictionary format.
#[derive(Debug, Serialize)]
struct JobInfo<'a> {
    id: i32,
    uid: i32,
    state: JobState,
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    slots: i32,
    #[serde(rename = "gpus-requested")]
    gpus_requested: i32,
    #[serde(rename = "gpus-assigned", skip_serializing_if = "<[_]>::is_empty")]
    gpus_assigned: &'a [i32],
    #[serde(rename = "depends-on", skip_serializing_if = "<[_]>::is_empty")]
    depends_on: &'a [i32],
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<i32>,
    #[serde(rename = "output-file", skip_serializing_if = "Option::is_none")]
    output_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errorlevel: Option<i32>,
    #[serde(rename = "real-ms", skip_serializing_if = "Option::is_none")]
    real_ms: Option<f64>,
    #[serde(rename = "env-bytes", skip_serializing_if = "Option::is_none")]
    env_bytes: Option<usize>,
}

pub fn info_dump(job: &Job) -> Vec<u8> {
    let info = JobInfo {
        id: job.jobid,
        uid: job.uid,
        state: job.state,
        command: job.command_lossy(),
        label: job
            .label
            .as_ref()
            .map(|l| String::from_utf8_lossy(l).into_owned()),
        slots: job.num_slots,
        gpus_requested: job.num_gpus,
        gpus_assigned: &job.assigned_gpus,
        depends_on: &job.depend_on,
        pid: (job.pid != 0).then_some(job.pid),
        output_file: job
            .output_filename
            .as_ref()
            .map(|f| String::from_utf8_lossy(f).into_owned()),
        errorlevel: job.result.map(|r| r.errorlevel),
        real_ms: job.result.map(|r| r.real_ms),
        env_bytes: job.env.as_ref().map(Vec::len),
    };

    match serde_yaml::to_string(&info) {
        Ok(text) => text.into_bytes(),
        // Nothing in JobInfo can fail to serialise; belt and braces.
        Err(_) => b"(unrenderable job)\n".to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::ExecResult;
    use crate::wire::protocol::NewJob;

    fn sample(state: JobState) -> Job {
        let mut job = Job::from_submission(
            3,
            1000,
            1,
            NewJob {
                command: b"make -j8 world".to_vec(),
                store_output: true,
                num_slots: 1,
                ..Default::default()
            },
            vec![0, 2],
            state,
        );
        job.state = state;
        job
    }

    #[test]
    fn test_header_shows_slot_usage() {
        let text = String::from_utf8(header(2, 4)).unwrap();
        assert!(text.starts_with("ID"));
        assert!(text.contains("[run=2/4]"));
    }

    #[test]
    fn test_queued_line() {
        let text = String::from_utf8(line(&sample(JobState::Queued), 0)).unwrap();
        assert!(text.contains("queued"));
        assert!(text.contains("(file)"));
        assert!(text.contains("[0,2]&& make -j8 world"));
    }

    #[test]
    fn test_finished_line_has_result() {
        let mut job = sample(JobState::Finished);
        job.result = Some(ExecResult {
            errorlevel: 2,
            real_ms: 1500.0,
            ..Default::default()
        });
        job.output_filename = Some(b"/tmp/ts-out.abc".to_vec());

        let text = String::from_utf8(line(&job, 0)).unwrap();
        assert!(text.contains("/tmp/ts-out.abc"));
        assert!(text.contains(" 1.50s"));
        assert!(text.contains(" 2 "));
    }

    #[test]
    fn test_skipped_line_has_no_output() {
        let text = String::from_utf8(line(&sample(JobState::Skipped), 0)).unwrap();
        assert!(text.contains("(no output)"));
    }

    #[test]
    fn test_narrow_terminal_truncates_command() {
        let mut job = sample(JobState::Queued);
        job.command = b"sh -c 'for i in $(seq 100); do echo $i; done'".to_vec();

        let text = String::from_utf8(line(&job, 70)).unwrap();
        assert!(text.contains("..."));
        assert!(!text.contains("done"));
    }

    #[test]
    fn test_info_dump_is_yaml() {
        let mut job = sample(JobState::Running);
        job.pid = 4242;

        let text = String::from_utf8(info_dump(&job)).unwrap();
        assert!(text.contains("id: 3"));
        assert!(text.contains("state: running"));
        assert!(text.contains("pid: 4242"));
        assert!(text.contains("command: make -j8 world"));
    }
}
