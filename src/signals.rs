/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both raise the same flag: the cycle in
/// progress runs to its normal resolution, no further cycle is started,
/// and the report is still printed.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

pub struct SignalHandler {
    shutdown: Arc<AtomicBool>,
    listener: JoinHandle<()>,
}

impl SignalHandler {
    /// Register for SIGINT and SIGTERM. Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<SignalHandler> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let listener = tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                };
                if flag.swap(true, Ordering::SeqCst) {
                    tracing::info!(signal = name, "shutdown already requested");
                } else {
                    tracing::warn!(
                        signal = name,
                        "shutdown requested, finishing current cycle"
                    );
                }
            }
        });

        Ok(SignalHandler { shutdown, listener })
    }

    /// Shared flag the loop controller checks before each cycle.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
