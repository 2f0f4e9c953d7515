use std::io;
use std::path::Path;

use crate::types::registry::Registry;

/// Renders the registry as a best-effort shell script: terminal jobs as
/// comments, everything still pending or running as a resubmittable line.
/// Commands are written verbatim, so exotic quoting may not survive the
/// round trip.
pub fn render(reg: &Registry) -> String {
    let mut out = String::from(
        "#!/bin/sh\n\
         # - tspool job dump\n\
         # This file has been created because a SIGTERM killed\n\
         # your queue server.\n\
         # The finished commands are listed first.\n\
         # The commands running or to be run are stored as you would\n\
         # probably run them. Take care - some quotes may have got broken\n\n",
    );

    for job in reg.iter().filter(|j| j.state.is_terminal()) {
        out.push_str("# ");
        out.push_str(&job.command_lossy());
        out.push('\n');
    }
    for job in reg.iter().filter(|j| !j.state.is_terminal()) {
        out.push_str("tspool ");
        out.push_str(&job.command_lossy());
        out.push('\n');
    }

    out
}

pub fn write(path: &Path, reg: &Registry) -> io::Result<()> {
    std::fs::write(path, render(reg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::{ExecResult, Job};
    use crate::types::states::JobState;
    use crate::wire::protocol::NewJob;

    #[test]
    fn test_render_splits_terminal_and_pending() {
        let mut reg = Registry::new();
        for (cmd, state) in [
            ("make all", JobState::Finished),
            ("make check", JobState::Running),
            ("make dist", JobState::Queued),
        ] {
            reg.insert_with(|id| {
                let mut job = Job::from_submission(
                    id,
                    0,
                    1,
                    NewJob {
                        command: cmd.as_bytes().to_vec(),
                        num_slots: 1,
                        ..Default::default()
                    },
                    vec![],
                    state,
                );
                if state == JobState::Finished {
                    job.result = Some(ExecResult::default());
                }
                job
            });
        }

        let script = render(&reg);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("# make all\n"));
        assert!(script.contains("tspool make check\n"));
        assert!(script.contains("tspool make dist\n"));
        // The finished block comes first.
        assert!(
            script.find("# make all").unwrap()
                < script.find("tspool make check").unwrap()
        );
    }
}
