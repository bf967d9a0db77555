//! Daemon lifecycle: supervisord-first, PID-file fallback.
//!
//! supervisord is preferred when installed (restart on crash, log rotation).
//! Otherwise each daemon is a detached child of the current binary with its
//! PID in `<index-dir>/<name>.pid` and output appended to
//! `<index-dir>/logs/<name>.log`. Operations return `(ok, message)` pairs
//! and tolerate missing or stale PID files idempotently.

use crate::config::KgConfig;
use crate::vector_client;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    Watcher,
    VectorServer,
}

impl DaemonKind {
    pub fn name(self) -> &'static str {
        match self {
            DaemonKind::Watcher => "watcher",
            DaemonKind::VectorServer => "vector-server",
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            DaemonKind::Watcher => "watch",
            DaemonKind::VectorServer => "vector-server",
        }
    }
}

pub struct Daemon<'a> {
    cfg: &'a KgConfig,
    kind: DaemonKind,
}

impl<'a> Daemon<'a> {
    pub fn new(cfg: &'a KgConfig, kind: DaemonKind) -> Self {
        Self { cfg, kind }
    }

    fn pid_file(&self) -> PathBuf {
        self.cfg.pid_path(self.kind.name())
    }

    fn log_file(&self) -> PathBuf {
        self.cfg.log_dir().join(format!("{}.log", self.kind.name()))
    }

    /// Make sure the daemon is running. `(ok, human message)`.
    pub fn ensure(&self) -> (bool, String) {
        if supervisord_running(self.cfg) {
            return (true, "already running via supervisord".into());
        }
        if start_supervisord(self.cfg) {
            return (true, "started via supervisord".into());
        }

        let pid_file = self.pid_file();
        if let Some(pid) = read_live_pid(&pid_file) {
            return (true, format!("already running (pid {pid})"));
        }
        match self.start_background() {
            Ok(pid) => (true, format!("started (pid {pid})")),
            Err(e) => (false, format!("failed to start: {e}")),
        }
    }

    /// Stop a PID-file managed daemon. supervisord-managed processes are
    /// left to supervisorctl.
    pub fn stop(&self) -> (bool, String) {
        let pid_file = self.pid_file();
        if let Some(pid) = read_live_pid(&pid_file) {
            let ok = terminate(pid);
            let _ = fs::remove_file(&pid_file);
            if ok {
                return (true, "stopped".into());
            }
            return (false, format!("failed to signal pid {pid}"));
        }
        // Stale or missing PID file: clean up and report.
        let _ = fs::remove_file(&pid_file);
        if supervisord_running(self.cfg) {
            return (
                true,
                "supervisord manages this daemon — use supervisorctl to stop".into(),
            );
        }
        (true, "not running".into())
    }

    pub fn status(&self) -> String {
        if supervisord_running(self.cfg) {
            return "running via supervisord".into();
        }
        if let Some(pid) = read_live_pid(&self.pid_file()) {
            if self.kind == DaemonKind::VectorServer {
                return if vector_client::is_server_running(self.cfg) {
                    format!("running (pid {pid}, healthy)")
                } else {
                    format!("running (pid {pid}, health check failing)")
                };
            }
            return format!("running (pid {pid})");
        }
        "stopped".into()
    }

    fn start_background(&self) -> std::io::Result<u32> {
        let exe = std::env::current_exe()?;
        let log_path = self.log_file();
        fs::create_dir_all(log_path.parent().expect("log file has a parent"))?;
        let log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(exe);
        command
            .arg(self.kind.subcommand())
            .arg(&self.cfg.root)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);

        // Detach from our session so the daemon outlives the caller.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;
        let pid = child.id();
        fs::write(self.pid_file(), pid.to_string())?;
        Ok(pid)
    }
}

// ---------------------------------------------------------------------------
// supervisord path
// ---------------------------------------------------------------------------

fn supervisord_conf_path(cfg: &KgConfig) -> PathBuf {
    cfg.index_dir.join("supervisord.conf")
}

fn supervisord_pid_path(cfg: &KgConfig) -> PathBuf {
    cfg.index_dir.join("supervisord.pid")
}

fn supervisord_running(cfg: &KgConfig) -> bool {
    read_live_pid(&supervisord_pid_path(cfg)).is_some()
}

fn supervisord_installed() -> bool {
    Command::new("supervisord")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Emit a supervisord config covering both daemons and start it. The
/// supervisor then owns restart policy and log rotation.
fn start_supervisord(cfg: &KgConfig) -> bool {
    if !supervisord_installed() {
        return false;
    }
    let conf_path = supervisord_conf_path(cfg);
    if let Err(e) = write_supervisord_conf(cfg, &conf_path) {
        warn!(error = %e, "could not write supervisord config");
        return false;
    }
    Command::new("supervisord")
        .arg("-c")
        .arg(&conf_path)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn write_supervisord_conf(cfg: &KgConfig, conf_path: &PathBuf) -> std::io::Result<()> {
    let log_dir = cfg.log_dir();
    fs::create_dir_all(&log_dir)?;
    let exe = std::env::current_exe()?;
    let exe = exe.display();
    let root = cfg.root.display();

    let conf = format!(
        "[supervisord]\n\
         pidfile={pidfile}\n\
         logfile={logfile}\n\
         logfile_maxbytes=5MB\n\
         logfile_backups=3\n\
         loglevel=info\n\
         nodaemon=false\n\
         silent=true\n\
         \n\
         [supervisorctl]\n\
         serverurl=unix://{sock}\n\
         \n\
         [unix_http_server]\n\
         file={sock}\n\
         chmod=0700\n\
         \n\
         [rpcinterface:supervisor]\n\
         supervisor.rpcinterface_factory=supervisor.rpcinterface:make_main_rpcinterface\n\
         \n\
         [program:kg-watcher]\n\
         command={exe} watch {root}\n\
         autostart=true\n\
         autorestart=true\n\
         startretries=5\n\
         stdout_logfile={watcher_log}\n\
         stderr_logfile={watcher_log}\n\
         stdout_logfile_maxbytes=2MB\n\
         stdout_logfile_backups=2\n\
         \n\
         [program:kg-vector-server]\n\
         command={exe} vector-server {root}\n\
         autostart=true\n\
         autorestart=true\n\
         startretries=5\n\
         stdout_logfile={vector_log}\n\
         stderr_logfile={vector_log}\n\
         stdout_logfile_maxbytes=2MB\n\
         stdout_logfile_backups=2\n",
        pidfile = supervisord_pid_path(cfg).display(),
        logfile = log_dir.join("supervisord.log").display(),
        sock = cfg.index_dir.join("supervisor.sock").display(),
        watcher_log = log_dir.join("watcher.log").display(),
        vector_log = log_dir.join("vector-server.log").display(),
    );
    fs::write(conf_path, conf)
}

// ---------------------------------------------------------------------------
// PID helpers
// ---------------------------------------------------------------------------

/// Read the PID file and verify the process is alive; stale files yield None.
fn read_live_pid(pid_file: &PathBuf) -> Option<u32> {
    let text = fs::read_to_string(pid_file).ok()?;
    let pid: u32 = text.trim().parse().ok()?;
    if process_alive(pid) {
        Some(pid)
    } else {
        None
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}
