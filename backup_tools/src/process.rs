//! Small helpers around external child processes.

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Starts collecting the child's piped stderr in the background, so the
/// child never stalls on a full stderr pipe while we are busy with its
/// stdout.
pub(crate) fn spawn_stderr_collector(child: &mut Child) -> Option<JoinHandle<Vec<u8>>> {
    let mut stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    }))
}

/// Finishes a collector started by [`spawn_stderr_collector`].
pub(crate) async fn collected_stderr(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => String::from_utf8_lossy(&handle.await.unwrap_or_default())
            .trim()
            .to_string(),
        None => String::new(),
    }
}
