use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Optional on-disk record of live child PIDs, one `<server>.pid` file per
/// child, used to clean up orphans after a crash of the aggregator itself.
#[derive(Debug)]
pub struct PidTracker {
    dir: PathBuf,
}

impl PidTracker {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create pid directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, server: &str) -> PathBuf {
        self.dir.join(format!("{server}.pid"))
    }

    pub fn record(&self, server: &str, pid: u32) {
        let path = self.path_for(server);
        if let Err(error) = std::fs::write(&path, format!("{pid}\n")) {
            tracing::warn!(server = %server, error = %error, "failed to write pid file");
        }
    }

    pub fn clear(&self, server: &str) {
        let path = self.path_for(server);
        if path.exists() {
            if let Err(error) = std::fs::remove_file(&path) {
                tracing::debug!(server = %server, error = %error, "failed to remove pid file");
            }
        }
    }

    /// Signal process groups recorded by a previous run and remove the
    /// stale files. Returns the number of files swept.
    pub fn sweep(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };

        let mut swept = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            if let Some(pid) = read_pid(&path) {
                tracing::info!(pid, path = %path.display(), "terminating orphaned child from previous run");
                terminate_group(pid);
            }
            let _ = std::fs::remove_file(&path);
            swept += 1;
        }
        swept
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn terminate_group(pid: u32) {
    #[cfg(unix)]
    {
        // Children run in their own process group (setsid at spawn), so a
        // negative pid reaches the whole tree.
        // SAFETY: kill with a signal argument has no other preconditions.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
