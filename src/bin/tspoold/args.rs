use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Path of the listening socket. Defaults to $TSPOOL_SOCKET, then to a
    /// per-uid file under the system temp directory.
    #[arg(short, long)]
    pub socket: Option<PathBuf>,
    /// Initial number of job slots.
    #[arg(short = 'S', long, default_value_t = 1)]
    pub slots: i32,
    /// Jobs allowed in the queue before new submissions are refused or
    /// held.
    #[arg(short, long, default_value_t = 1000)]
    pub max_jobs: usize,
    /// Seconds a GPU-waiting runner sleeps between retries.
    #[arg(long, default_value_t = 30)]
    pub gpu_wait_time: i32,
    /// Where the replay script lands on SIGTERM. Defaults to
    /// $TSPOOL_SAVELIST, then to the socket path plus ".dump".
    #[arg(long)]
    pub dump_file: Option<PathBuf>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}

impl Args {
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket {
            return path.clone();
        }
        if let Ok(path) = std::env::var("TSPOOL_SOCKET") {
            return PathBuf::from(path);
        }

        let uid = nix::unistd::getuid().as_raw();
        std::env::temp_dir().join(format!("tspool-{uid}.socket"))
    }

    pub fn dump_path(&self) -> PathBuf {
        if let Some(path) = &self.dump_file {
            return path.clone();
        }
        if let Ok(path) = std::env::var("TSPOOL_SAVELIST") {
            return PathBuf::from(path);
        }

        let mut path = self.socket_path().into_os_string();
        path.push(".dump");
        PathBuf::from(path)
    }
}
