//! End-to-end scenarios: a served unix socket in a tempdir, driven through
//! the client library the way real submitters and runners drive it.

use std::path::PathBuf;

use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tspool::client::{Client, Submitted};
use tspool::server::gpu::FixedOracle;
use tspool::server::{self, dump, Config};
use tspool::types::job::ExecResult;
use tspool::types::states::JobState;
use tspool::wire::protocol::NewJob;

struct Daemon {
    // Held so the socket directory outlives the test.
    _dir: TempDir,
    path: PathBuf,
    cancel: CancellationToken,
    oracle: FixedOracle,
    handle: tokio::task::JoinHandle<anyhow::Result<server::Core>>,
    shutdown_wait: mpsc::Receiver<()>,
}

async fn start(cfg: Config, free_gpus: Vec<i32>) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tspool.socket");
    let listener = UnixListener::bind(&path).unwrap();
    let cancel = CancellationToken::new();
    let oracle = FixedOracle::new(free_gpus);
    let (shutdown_hold, shutdown_wait) = mpsc::channel::<()>(1);

    let handle = tokio::spawn(server::serve(
        listener,
        cfg,
        Box::new(oracle.clone()),
        cancel.clone(),
        shutdown_hold,
    ));

    Daemon {
        _dir: dir,
        path,
        cancel,
        oracle,
        handle,
        shutdown_wait,
    }
}

impl Daemon {
    async fn client(&self) -> Client {
        Client::connect(&self.path).await.unwrap()
    }

    async fn stop(mut self) -> server::Core {
        self.cancel.cancel();
        let core = self.handle.await.unwrap().unwrap();
        // All connection tasks have flushed and closed once this resolves.
        self.shutdown_wait.recv().await;
        core
    }
}

fn cmd(s: &str) -> NewJob {
    NewJob {
        command: s.as_bytes().to_vec(),
        num_slots: 1,
        ..Default::default()
    }
}

fn result(errorlevel: i32, real_ms: f64) -> ExecResult {
    ExecResult {
        errorlevel,
        real_ms,
        ..Default::default()
    }
}

// Submit `echo hi`, run it with captured output, report the end.
#[tokio::test]
async fn test_submit_capture_finish() {
    let d = start(Config::default(), vec![]).await;

    let mut runner = d.client().await;
    runner.check_version().await.unwrap();
    assert_eq!(
        runner
            .submit(NewJob {
                store_output: true,
                ..cmd("echo hi")
            })
            .await
            .unwrap(),
        Submitted::Accepted(0),
    );

    let ticket = runner.await_run().await.unwrap();
    assert_eq!(ticket.last_errorlevel, 0);
    assert_eq!(ticket.cuda_visible_devices(), "-1");

    runner
        .report_started(1234, Some(b"/tmp/ts-out.4F2a1x"))
        .await
        .unwrap();

    let mut waiter = d.client().await;
    let waited = tokio::spawn(async move { waiter.wait_job(0).await });
    runner.report_end(result(0, 5.0)).await.unwrap();
    assert_eq!(waited.await.unwrap().unwrap().errorlevel, 0);

    let mut q = d.client().await;
    assert_eq!(q.get_state(0).await.unwrap(), JobState::Finished);
    assert_eq!(
        q.ask_output(0).await.unwrap(),
        (1234, Some("/tmp/ts-out.4F2a1x".to_owned())),
    );

    d.stop().await;
}

// A dependency that fails skips its require_elevel dependent.
#[tokio::test]
async fn test_dependency_failure_skips_dependent() {
    let d = start(Config { max_slots: 2, ..Default::default() }, vec![]).await;

    let mut a = d.client().await;
    assert_eq!(a.submit(cmd("false")).await.unwrap(), Submitted::Accepted(0));
    a.await_run().await.unwrap();
    a.report_started(100, None).await.unwrap();

    let mut b = d.client().await;
    assert_eq!(
        b.submit(NewJob {
            depend_on: vec![0],
            require_elevel: true,
            ..cmd("echo next")
        })
        .await
        .unwrap(),
        Submitted::Accepted(1),
    );

    let mut waiter = d.client().await;
    let waited = tokio::spawn(async move { waiter.wait_job(1).await });

    a.report_end(result(1, 10.0)).await.unwrap();

    let skipped = waited.await.unwrap().unwrap();
    assert_eq!(skipped.errorlevel, -1);
    assert!(skipped.skipped);

    let mut q = d.client().await;
    assert_eq!(q.get_state(1).await.unwrap(), JobState::Skipped);

    d.stop().await;
}

// One slot: the second job stays queued until the first reports its end.
#[tokio::test]
async fn test_single_slot_serializes() {
    let d = start(Config::default(), vec![]).await;

    let mut a = d.client().await;
    a.submit(cmd("sleep 5")).await.unwrap();
    a.await_run().await.unwrap();
    a.report_started(10, None).await.unwrap();

    let mut b = d.client().await;
    assert_eq!(b.submit(cmd("echo b")).await.unwrap(), Submitted::Accepted(1));

    let mut q = d.client().await;
    assert_eq!(q.get_state(1).await.unwrap(), JobState::Queued);

    let mut waiter = d.client().await;
    let started = tokio::spawn(async move { waiter.wait_running_job(1).await });

    a.report_end(result(0, 5000.0)).await.unwrap();

    b.await_run().await.unwrap();
    b.report_started(11, None).await.unwrap();
    started.await.unwrap().unwrap();

    b.report_end(result(0, 1.0)).await.unwrap();
    let mut waiter = d.client().await;
    assert_eq!(waiter.wait_job(1).await.unwrap().errorlevel, 0);

    d.stop().await;
}

// GPU scarcity with wait_free_gpus: the runner is nudged, retries, and is
// admitted once enough devices free up.
#[tokio::test]
async fn test_gpu_wait_then_admit() {
    let d = start(
        Config {
            max_slots: 4,
            gpu_wait_time: 0,
            ..Default::default()
        },
        vec![0],
    )
    .await;

    let mut runner = d.client().await;
    assert_eq!(
        runner
            .submit(NewJob {
                num_gpus: 2,
                wait_free_gpus: true,
                ..cmd("train.py")
            })
            .await
            .unwrap(),
        Submitted::Accepted(0),
    );

    // The first nudge is already on the wire; free a second device before
    // answering it.
    d.oracle.set_free(vec![0, 1]);

    let ticket = runner.await_run().await.unwrap();
    assert_eq!(ticket.gpus.len(), 2);
    assert!(ticket.cuda_visible_devices().contains(','));

    d.stop().await;
}

// SWAP_JOBS reorders two queued jobs; swapping a running one is an error.
#[tokio::test]
async fn test_swap_reorders_admission() {
    let d = start(Config::default(), vec![]).await;

    let mut a = d.client().await;
    a.submit(cmd("first")).await.unwrap();
    a.await_run().await.unwrap();
    a.report_started(10, None).await.unwrap();

    let mut b = d.client().await;
    b.submit(cmd("second")).await.unwrap();
    let mut c = d.client().await;
    c.submit(cmd("third")).await.unwrap();

    let mut ctl = d.client().await;
    ctl.swap_jobs(1, 2).await.unwrap();

    let mut ctl = d.client().await;
    let err = ctl.swap_jobs(0, 2).await.unwrap_err();
    assert!(err.to_string().contains("not in the queue"));

    a.report_end(result(0, 1.0)).await.unwrap();

    // Job 2 was swapped ahead: its runner gets the next ticket.
    c.await_run().await.unwrap();

    d.stop().await;
}

// KILL_ALL hands back every running pid; the runners then report ends.
#[tokio::test]
async fn test_kill_all_returns_pids() {
    let d = start(Config { max_slots: 3, ..Default::default() }, vec![]).await;

    let mut runners = Vec::new();
    for pid in [501, 502, 503] {
        let mut r = d.client().await;
        r.submit(cmd("spin")).await.unwrap();
        r.await_run().await.unwrap();
        r.report_started(pid, None).await.unwrap();
        runners.push(r);
    }

    let mut ctl = d.client().await;
    assert_eq!(ctl.count_running().await.unwrap(), 3);
    assert_eq!(ctl.kill_all().await.unwrap(), vec![501, 502, 503]);

    // The client signals the pids; each job then reports a signal death.
    for r in &mut runners {
        r.report_end(result(143, 7.0)).await.unwrap();
    }
    for jobid in 0..3 {
        let mut w = d.client().await;
        assert_eq!(w.wait_job(jobid).await.unwrap().errorlevel, 143);
    }

    d.stop().await;
}

// Queue full: non-waiting submissions bounce, waiting ones are held until
// room frees up.
#[tokio::test]
async fn test_queue_full_holds_waiting_submitter() {
    let d = start(
        Config {
            max_jobs: 1,
            ..Default::default()
        },
        vec![],
    )
    .await;

    let mut a = d.client().await;
    a.submit(cmd("only")).await.unwrap();
    a.await_run().await.unwrap();
    a.report_started(7, None).await.unwrap();

    let mut b = d.client().await;
    assert_eq!(b.submit(cmd("bounced")).await.unwrap(), Submitted::QueueFull);

    let mut c = d.client().await;
    let held = tokio::spawn(async move {
        let accepted = c
            .submit(NewJob {
                wait_enqueuing: true,
                ..cmd("held")
            })
            .await?;
        let ticket = c.await_run().await?;
        Ok::<_, anyhow::Error>((accepted, ticket))
    });

    a.report_end(result(0, 2.0)).await.unwrap();

    let (accepted, _ticket) = held.await.unwrap().unwrap();
    assert_eq!(accepted, Submitted::Accepted(1));

    d.stop().await;
}

// Listing and info rendering over the wire.
#[tokio::test]
async fn test_list_and_info() {
    let d = start(Config::default(), vec![]).await;

    let mut a = d.client().await;
    a.submit(NewJob {
        label: Some(b"build".to_vec()),
        ..cmd("make world")
    })
    .await
    .unwrap();
    a.await_run().await.unwrap();
    a.report_started(41, None).await.unwrap();

    let lines = d.client().await.list(0).await.unwrap();
    assert!(lines[0].contains("[run=1/1]"));
    assert!(lines[1].contains("running"));
    assert!(lines[1].contains("[build]make world"));

    let info = d.client().await.info(0).await.unwrap();
    assert!(info.contains("state: running"));
    assert!(info.contains("pid: 41"));

    let mut q = d.client().await;
    assert_eq!(q.get_label(0).await.unwrap(), "build");
    assert_eq!(q.get_cmd(0).await.unwrap(), "make world");
    assert_eq!(q.last_id().await.unwrap(), 0);

    d.stop().await;
}

// Reconfiguration round-trips over the wire.
#[tokio::test]
async fn test_reconfiguration_roundtrips() {
    let d = start(Config::default(), vec![]).await;

    let mut c = d.client().await;
    c.set_max_slots(5).await.unwrap();
    assert_eq!(c.get_max_slots().await.unwrap(), 5);

    c.set_gpu_wait_time(9).await.unwrap();
    assert_eq!(c.get_gpu_wait_time().await.unwrap(), 9);

    // Stored verbatim: a zero ceiling and a negative interval read back
    // exactly as set.
    c.set_max_slots(0).await.unwrap();
    assert_eq!(c.get_max_slots().await.unwrap(), 0);

    c.set_gpu_wait_time(-1).await.unwrap();
    assert_eq!(c.get_gpu_wait_time().await.unwrap(), -1);

    d.stop().await;
}

// The shutdown dump renders pending jobs as replayable lines.
#[tokio::test]
async fn test_shutdown_dump_renders_pending_jobs() {
    let d = start(Config::default(), vec![]).await;

    let mut a = d.client().await;
    a.submit(cmd("make all")).await.unwrap();
    a.await_run().await.unwrap();
    a.report_started(10, None).await.unwrap();
    a.report_end(result(0, 3.0)).await.unwrap();

    let mut b = d.client().await;
    b.submit(cmd("make dist")).await.unwrap();
    // Confirm the daemon has settled both jobs before stopping.
    let mut q = d.client().await;
    assert_eq!(q.get_state(0).await.unwrap(), JobState::Finished);

    let core = d.stop().await;
    let script = dump::render(core.registry());
    assert!(script.contains("# make all"));
    assert!(script.contains("tspool make dist"));
}
