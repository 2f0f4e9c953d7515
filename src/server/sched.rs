use std::collections::HashSet;

use crate::types::job::{ConnId, ExecResult, Job};
use crate::types::registry::Registry;
use crate::types::states::JobState;

use super::gpu::{allocate, GpuGrant, GpuOracle};
use super::slots::SlotBudget;

/// What the core must carry out after a scheduling pass. The pass itself
/// only mutates the registry and the slot budget; talking to connections is
/// the core's job.
#[derive(Debug, Eq, PartialEq)]
pub enum Action {
    /// A held submission entered the queue: complete its deferred
    /// NEWJOB_OK.
    Enqueued { jobid: i32 },
    /// A RUN ticket for the job's runner connection.
    Run {
        jobid: i32,
        conn: ConnId,
        last_errorlevel: i32,
        gpus: Vec<i32>,
    },
    /// GPU scarcity with wait_free_gpus set: nudge the runner to come back
    /// after the retry interval.
    Remind { jobid: i32, conn: ConnId },
    /// The job became terminal without running: its waiters need replies.
    Skipped { jobid: i32 },
}

/// Resolves the submission-time dependency list to concrete jobids. Each
/// `-1` names the most recently submitted job; before any job exists it is
/// dropped silently.
pub fn resolve_depend_on(raw: &[i32], last_jobid: i32) -> Vec<i32> {
    raw.iter()
        .filter_map(|&d| {
            if d == -1 {
                (last_jobid >= 0).then_some(last_jobid)
            } else {
                Some(d)
            }
        })
        .collect()
}

/// Every dependency is terminal or no longer in the registry (a removed
/// dependency counts as satisfied).
fn dependency_ready(job: &Job, reg: &Registry) -> bool {
    job.depend_on
        .iter()
        .all(|&d| reg.get(d).map_or(true, |j| j.state.is_terminal()))
}

/// The dependency errorlevel summary carried in the RUN ticket: the first
/// non-zero dependency errorlevel in declaration order (skipped and broken
/// dependencies carry -1), else 0.
fn dep_errorlevel(job: &Job, reg: &Registry) -> i32 {
    job.depend_on
        .iter()
        .filter_map(|&d| reg.get(d).and_then(|j| j.result))
        .map(|r| r.errorlevel)
        .find(|&e| e != 0)
        .unwrap_or(0)
}

/// Skips every queued require_elevel job whose dependencies are settled
/// with a failure, repeating until no more fall: skipping one job can doom
/// a job that depends on it.
fn propagate_skips(reg: &mut Registry, actions: &mut Vec<Action>) {
    loop {
        let target = reg
            .iter()
            .find(|j| {
                j.state == JobState::Queued
                    && j.require_elevel
                    && dependency_ready(j, reg)
                    && dep_errorlevel(j, reg) != 0
            })
            .map(|j| j.jobid);

        let Some(jobid) = target else { break };

        // Panic safety: found in the registry just above.
        let job = reg.get_mut(jobid).unwrap();
        job.state = JobState::Skipped;
        job.result = Some(ExecResult::skipped());
        actions.push(Action::Skipped { jobid });
    }
}

/// Moves held submissions into the queue, oldest first, while the queue cap
/// allows.
fn promote_holding(reg: &mut Registry, max_jobs: usize, actions: &mut Vec<Action>) {
    while reg.count_queued_or_busy() < max_jobs {
        let Some(jobid) = reg.first_holding() else {
            break;
        };

        reg.get_mut(jobid).unwrap().state = JobState::Queued;
        actions.push(Action::Enqueued { jobid });
    }
}

enum Decision {
    Run {
        jobid: i32,
        conn: ConnId,
        gpus: Vec<i32>,
    },
    Remind {
        jobid: i32,
        conn: ConnId,
    },
    Skip {
        jobid: i32,
    },
}

/// One admission scan: the first QUEUED job in enqueue order that is
/// dependency-ready, has a live runner, fits in slots, and (if it asked for
/// GPUs) can be allocated. Filters pass over a blocked job without letting
/// it hold back later eligible jobs.
fn next_decision(
    reg: &Registry,
    slots: &SlotBudget,
    oracle: &mut dyn GpuOracle,
    live: &dyn Fn(ConnId) -> bool,
) -> Option<Decision> {
    let in_use: HashSet<i32> = reg
        .iter()
        .filter(|j| j.state.is_busy())
        .flat_map(|j| j.assigned_gpus.iter().copied())
        .collect();

    for job in reg.iter() {
        if job.state != JobState::Queued || !dependency_ready(job, reg) {
            continue;
        }
        // No runner, no ticket: a job whose submitter went away stays
        // queued but cannot start.
        let Some(conn) = job.conn.filter(|&c| live(c)) else {
            continue;
        };
        if !slots.fits(job.num_slots) {
            continue;
        }

        match allocate(job.num_gpus, &job.gpu_nums, &in_use, oracle) {
            GpuGrant::NotNeeded => {
                return Some(Decision::Run {
                    jobid: job.jobid,
                    conn,
                    gpus: Vec::new(),
                });
            },
            GpuGrant::Granted(gpus) => {
                return Some(Decision::Run {
                    jobid: job.jobid,
                    conn,
                    gpus,
                });
            },
            GpuGrant::Insufficient if !job.wait_free_gpus => {
                return Some(Decision::Skip { jobid: job.jobid });
            },
            GpuGrant::Insufficient => {
                if !job.gpu_waiting {
                    return Some(Decision::Remind {
                        jobid: job.jobid,
                        conn,
                    });
                }
                // Nudge already outstanding: pass over until it returns.
            },
        }
    }

    None
}

/// Re-evaluates admission until nothing more can move: promotes held
/// submissions, settles dependency skips, and admits every job that fits.
/// Invoked by the core after each mutating request, on REMINDER, and on
/// connection loss.
pub fn schedule_pass(
    reg: &mut Registry,
    slots: &mut SlotBudget,
    oracle: &mut dyn GpuOracle,
    max_jobs: usize,
    live: &dyn Fn(ConnId) -> bool,
) -> Vec<Action> {
    let mut actions = Vec::new();

    loop {
        promote_holding(reg, max_jobs, &mut actions);
        propagate_skips(reg, &mut actions);

        match next_decision(reg, slots, oracle, live) {
            Some(Decision::Run { jobid, conn, gpus }) => {
                // Panic safety (all three arms): next_decision found the
                // job in the registry.
                let last_errorlevel = dep_errorlevel(reg.get(jobid).unwrap(), reg);
                let job = reg.get_mut(jobid).unwrap();
                job.state = JobState::Allocating;
                job.assigned_gpus = gpus.clone();
                let admitted = slots.try_admit(job.num_slots);
                debug_assert!(admitted);

                actions.push(Action::Run {
                    jobid,
                    conn,
                    last_errorlevel,
                    gpus,
                });
            },
            Some(Decision::Skip { jobid }) => {
                let job = reg.get_mut(jobid).unwrap();
                job.state = JobState::Skipped;
                job.result = Some(ExecResult::skipped());
                actions.push(Action::Skipped { jobid });
            },
            Some(Decision::Remind { jobid, conn }) => {
                reg.get_mut(jobid).unwrap().gpu_waiting = true;
                actions.push(Action::Remind { jobid, conn });
            },
            None => break,
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::gpu::FixedOracle;
    use crate::wire::protocol::NewJob;

    struct Bench {
        reg: Registry,
        slots: SlotBudget,
        oracle: FixedOracle,
        max_jobs: usize,
    }

    impl Bench {
        fn new(max_slots: i32) -> Self {
            Self {
                reg: Registry::new(),
                slots: SlotBudget::new(max_slots),
                oracle: FixedOracle::default(),
                max_jobs: 1000,
            }
        }

        fn submit(&mut self, tweak: impl FnOnce(&mut NewJob)) -> i32 {
            let mut req = NewJob {
                command: b"true".to_vec(),
                num_slots: 1,
                ..Default::default()
            };
            tweak(&mut req);

            let deps = resolve_depend_on(&req.depend_on, self.reg.last_jobid());
            self.reg.insert_with(|id| {
                Job::from_submission(
                    id,
                    1000,
                    100 + id as ConnId,
                    NewJob {
                        depend_on: Vec::new(),
                        ..req
                    },
                    deps,
                    JobState::Queued,
                )
            })
        }

        fn pass(&mut self) -> Vec<Action> {
            schedule_pass(
                &mut self.reg,
                &mut self.slots,
                &mut self.oracle,
                self.max_jobs,
                &|_| true,
            )
        }

        fn finish(&mut self, jobid: i32, errorlevel: i32) {
            let job = self.reg.get_mut(jobid).unwrap();
            assert!(job.state.is_busy());
            let slots = job.num_slots;
            job.state = JobState::Finished;
            job.result = Some(ExecResult {
                errorlevel,
                ..Default::default()
            });
            self.slots.release(slots);
        }
    }

    fn run_ids(actions: &[Action]) -> Vec<i32> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Run { jobid, .. } => Some(*jobid),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fifo_admission_within_slots() {
        let mut b = Bench::new(1);
        let a = b.submit(|_| {});
        let c = b.submit(|_| {});

        assert_eq!(run_ids(&b.pass()), vec![a]);
        assert_eq!(b.reg.get(c).unwrap().state, JobState::Queued);

        // Nothing moves until the running job ends.
        assert_eq!(b.pass(), vec![]);

        b.finish(a, 0);
        assert_eq!(run_ids(&b.pass()), vec![c]);
    }

    #[test]
    fn test_wide_job_never_admits_but_does_not_block() {
        let mut b = Bench::new(2);
        let wide = b.submit(|r| r.num_slots = 3);
        let narrow = b.submit(|_| {});

        // num_slots beyond the ceiling can never run; later jobs still do.
        assert_eq!(run_ids(&b.pass()), vec![narrow]);
        assert_eq!(b.reg.get(wide).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_blocked_dependency_lets_ready_job_through() {
        let mut b = Bench::new(2);
        let a = b.submit(|_| {});
        assert_eq!(run_ids(&b.pass()), vec![a]);

        let blocked = b.submit(|r| r.depend_on = vec![-1]);
        let free = b.submit(|_| {});

        // `blocked` waits on the running job; `free` takes the other slot.
        assert_eq!(run_ids(&b.pass()), vec![free]);
        assert_eq!(b.reg.get(blocked).unwrap().state, JobState::Queued);
        assert_eq!(b.reg.get(blocked).unwrap().depend_on, vec![a]);
    }

    #[test]
    fn test_require_elevel_skip_chain() {
        let mut b = Bench::new(1);
        let a = b.submit(|_| {});
        assert_eq!(run_ids(&b.pass()), vec![a]);

        let c = b.submit(|r| {
            r.depend_on = vec![a];
            r.require_elevel = true;
        });
        let d = b.submit(|r| {
            r.depend_on = vec![c];
            r.require_elevel = true;
        });

        b.finish(a, 1);
        let actions = b.pass();

        // Both fall without consuming a slot, in one pass.
        assert!(actions.contains(&Action::Skipped { jobid: c }));
        assert!(actions.contains(&Action::Skipped { jobid: d }));
        assert_eq!(b.reg.get(c).unwrap().state, JobState::Skipped);
        assert_eq!(b.reg.get(c).unwrap().result.unwrap().errorlevel, -1);
        assert!(b.reg.get(c).unwrap().result.unwrap().skipped);
        assert_eq!(b.slots.busy(), 0);
    }

    #[test]
    fn test_dep_summary_carried_in_ticket() {
        let mut b = Bench::new(2);
        let a = b.submit(|_| {});
        b.pass();
        b.finish(a, 3);

        // Not require_elevel: the job still runs, but the ticket carries
        // the failing dependency's errorlevel for the runner to judge.
        let c = b.submit(|r| r.depend_on = vec![a]);
        let actions = b.pass();
        assert_eq!(
            actions,
            vec![Action::Run {
                jobid: c,
                conn: 100 + c as ConnId,
                last_errorlevel: 3,
                gpus: vec![],
            }]
        );
    }

    #[test]
    fn test_gpu_wait_reminds_once_then_admits() {
        let mut b = Bench::new(4);
        b.oracle.set_free(vec![0]);

        let j = b.submit(|r| {
            r.num_gpus = 2;
            r.wait_free_gpus = true;
        });

        let actions = b.pass();
        assert_eq!(
            actions,
            vec![Action::Remind {
                jobid: j,
                conn: 100 + j as ConnId,
            }]
        );

        // The nudge is outstanding; re-evaluations stay quiet.
        assert_eq!(b.pass(), vec![]);

        // The nudge comes back with enough devices free.
        b.reg.get_mut(j).unwrap().gpu_waiting = false;
        b.oracle.set_free(vec![0, 1]);
        let actions = b.pass();
        match &actions[..] {
            [Action::Run { jobid, gpus, .. }] => {
                assert_eq!(*jobid, j);
                assert_eq!(gpus.len(), 2);
            },
            other => panic!("expected a run ticket, got {other:?}"),
        }
    }

    #[test]
    fn test_gpu_scarcity_without_wait_skips() {
        let mut b = Bench::new(4);
        b.oracle.set_free(vec![0]);

        let j = b.submit(|r| r.num_gpus = 2);
        let actions = b.pass();

        assert!(actions.contains(&Action::Skipped { jobid: j }));
        assert_eq!(b.reg.get(j).unwrap().state, JobState::Skipped);
        assert_eq!(b.slots.busy(), 0);
    }

    #[test]
    fn test_assigned_gpus_count_as_busy() {
        let mut b = Bench::new(4);
        b.oracle.set_free(vec![0, 1]);

        let first = b.submit(|r| r.num_gpus = 2);
        let second = b.submit(|r| {
            r.num_gpus = 1;
            r.wait_free_gpus = true;
        });

        let actions = b.pass();
        // The oracle still reports 0 and 1 free (the driver has not seen
        // the first job start), but they are spoken for.
        assert_eq!(run_ids(&actions), vec![first]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Remind { jobid, .. } if *jobid == second)));
    }

    #[test]
    fn test_dead_runner_passed_over() {
        let mut reg = Registry::new();
        let mut slots = SlotBudget::new(1);
        let mut oracle = FixedOracle::default();

        let dead = reg.insert_with(|id| {
            Job::from_submission(
                id,
                0,
                1,
                NewJob {
                    command: b"true".to_vec(),
                    num_slots: 1,
                    ..Default::default()
                },
                vec![],
                JobState::Queued,
            )
        });
        let alive = reg.insert_with(|id| {
            Job::from_submission(
                id,
                0,
                2,
                NewJob {
                    command: b"true".to_vec(),
                    num_slots: 1,
                    ..Default::default()
                },
                vec![],
                JobState::Queued,
            )
        });

        let actions =
            schedule_pass(&mut reg, &mut slots, &mut oracle, 1000, &|c| c == 2);

        assert_eq!(run_ids(&actions), vec![alive]);
        // Never deleted, never started.
        assert_eq!(reg.get(dead).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_holding_promoted_in_order() {
        let mut b = Bench::new(1);
        b.max_jobs = 2;

        let a = b.submit(|_| {});
        let c = b.submit(|_| {});
        // Queue cap reached: the next submissions are held.
        let held1 = {
            let id = b.submit(|_| {});
            b.reg.get_mut(id).unwrap().state = JobState::HoldingClient;
            id
        };
        let held2 = {
            let id = b.submit(|_| {});
            b.reg.get_mut(id).unwrap().state = JobState::HoldingClient;
            id
        };

        let actions = b.pass();
        assert_eq!(run_ids(&actions), vec![a]);
        assert!(!actions.iter().any(|a| matches!(a, Action::Enqueued { .. })));

        b.finish(a, 0);
        b.reg.remove(a).unwrap();
        let actions = b.pass();
        assert!(actions.contains(&Action::Enqueued { jobid: held1 }));
        assert_eq!(b.reg.get(held2).unwrap().state, JobState::HoldingClient);
        assert_eq!(run_ids(&actions), vec![c]);
    }

    #[test]
    fn test_resolve_depend_on_sentinel() {
        // First-ever submission: -1 resolves to nothing at all.
        assert_eq!(resolve_depend_on(&[-1], -1), Vec::<i32>::new());
        assert_eq!(resolve_depend_on(&[-1], 4), vec![4]);
        assert_eq!(resolve_depend_on(&[2, -1, 3], 7), vec![2, 7, 3]);
    }
}
