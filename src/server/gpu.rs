use std::collections::HashSet;
use std::process::Command;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tracing::warn;

/// External capability reporting which GPU device indices are currently
/// free. Queried afresh at every scheduling attempt; nothing is cached or
/// reserved between attempts.
pub trait GpuOracle {
    fn free_gpus(&mut self) -> Vec<i32>;
}

/// Oracle shelling out to `nvidia-smi`: every device minus those with a
/// compute process. Devices are reported free when the tool is missing or
/// unparseable output appears, erring on the side of running jobs.
#[derive(Debug, Default)]
pub struct SmiOracle {}

impl GpuOracle for SmiOracle {
    fn free_gpus(&mut self) -> Vec<i32> {
        let all = match query_lines(&["--query-gpu=index", "--format=csv,noheader,nounits"]) {
            Some(lines) => lines,
            None => return Vec::new(),
        };

        let busy: HashSet<i32> = query_lines(&[
            "--query-compute-apps=gpu_bus_id",
            "--format=csv,noheader",
        ])
        .map(busy_indices)
        .unwrap_or_default();

        all.iter()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .filter(|i| !busy.contains(i))
            .collect()
    }
}

fn query_lines(args: &[&str]) -> Option<Vec<String>> {
    let out = match Command::new("nvidia-smi").args(args).output() {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            warn!(status = %out.status, "nvidia-smi failed");
            return None;
        },
        Err(error) => {
            warn!(%error, "could not run nvidia-smi");
            return None;
        },
    };

    let text = String::from_utf8_lossy(&out.stdout).into_owned();
    Some(text.lines().map(str::to_owned).collect())
}

/// Maps busy bus ids back to indices via a second index,pci query.
fn busy_indices(bus_ids: Vec<String>) -> HashSet<i32> {
    let busy_buses: HashSet<String> =
        bus_ids.iter().map(|l| l.trim().to_owned()).collect();
    if busy_buses.is_empty() {
        return HashSet::new();
    }

    query_lines(&[
        "--query-gpu=index,pci.bus_id",
        "--format=csv,noheader,nounits",
    ])
    .unwrap_or_default()
    .iter()
    .filter_map(|l| {
        let (idx, bus) = l.split_once(',')?;
        if !busy_buses.contains(bus.trim()) {
            return None;
        }
        idx.trim().parse::<i32>().ok()
    })
    .collect()
}

/// Oracle whose free set is maintained externally rather than discovered:
/// deployments without a GPU driver, and tests. Clones share the set, so a
/// holder can adjust it while the daemon owns another handle.
#[derive(Clone, Debug, Default)]
pub struct FixedOracle {
    free: Arc<Mutex<Vec<i32>>>,
}

impl FixedOracle {
    pub fn new(free: Vec<i32>) -> Self {
        Self {
            free: Arc::new(Mutex::new(free)),
        }
    }

    pub fn set_free(&self, free: Vec<i32>) {
        *lock(&self.free) = free;
    }
}

impl GpuOracle for FixedOracle {
    fn free_gpus(&mut self) -> Vec<i32> {
        lock(&self.free).clone()
    }
}

fn lock(m: &Mutex<Vec<i32>>) -> std::sync::MutexGuard<'_, Vec<i32>> {
    // A poisoned free-set is still a free-set.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outcome of one allocation attempt.
#[derive(Debug, Eq, PartialEq)]
pub enum GpuGrant {
    /// The job asked for no GPUs.
    NotNeeded,
    /// Device indices assigned to the job.
    Granted(Vec<i32>),
    /// Fewer free devices than requested. Whether that skips the job or
    /// parks it for a retry is the scheduler's call.
    Insufficient,
}

/// Picks devices for a job at the moment of admission.
///
/// An explicit index list is accepted verbatim. Otherwise `requested`
/// devices are drawn uniformly at random from the oracle's free set minus
/// `in_use` (devices already assigned to admitted jobs the driver may not
/// have noticed yet).
pub fn allocate(
    requested: i32,
    explicit: &[i32],
    in_use: &HashSet<i32>,
    oracle: &mut dyn GpuOracle,
) -> GpuGrant {
    if !explicit.is_empty() {
        return GpuGrant::Granted(explicit.to_vec());
    }
    if requested <= 0 {
        return GpuGrant::NotNeeded;
    }

    let mut free: Vec<i32> = oracle
        .free_gpus()
        .into_iter()
        .filter(|i| !in_use.contains(i))
        .collect();

    let requested = requested as usize;
    if free.len() < requested {
        return GpuGrant::Insufficient;
    }

    let (picked, _) = free.partial_shuffle(&mut rand::thread_rng(), requested);
    GpuGrant::Granted(picked.to_vec())
}
