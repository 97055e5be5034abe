//! Host checks run before a process starts serving, and the shutdown signal.

use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Environment check failed: {0}")]
    Environment(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verifies every directory the process will write to.
pub fn environment_check<P: AsRef<Path>>(dirs: &[P]) -> Result<(), SystemError> {
    for dir in dirs {
        check_storage_dir(dir.as_ref())?;
    }
    report_memory();
    Ok(())
}

/// Creates `path` if needed and proves it is a writable directory.
pub fn check_storage_dir(path: &Path) -> Result<(), SystemError> {
    if let Err(e) = fs::create_dir_all(path) {
        return Err(SystemError::Environment(format!(
            "Cannot create storage directory {}: {}",
            path.display(),
            e
        )));
    }

    let metadata = fs::metadata(path)?;
    if !metadata.is_dir() {
        return Err(SystemError::Environment(format!(
            "Storage path {} is not a directory",
            path.display()
        )));
    }

    let marker = path.join(".write-check");
    fs::write(&marker, b"check").map_err(|e| {
        SystemError::Environment(format!("Storage path {} is not writable: {}", path.display(), e))
    })?;
    fs::remove_file(&marker)?;

    tracing::info!("Storage check passed: {} is accessible", path.display());
    Ok(())
}

fn report_memory() {
    let meminfo = match fs::read_to_string("/proc/meminfo") {
        Ok(meminfo) => meminfo,
        Err(_) => return,
    };

    let total_memory_kb = meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u64>().ok());

    if let Some(kb) = total_memory_kb {
        tracing::debug!("Host memory: {} MiB", kb / 1024);
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
