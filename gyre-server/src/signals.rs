//! OS signal integration
//!
//! SIGTERM and SIGINT stop the server; SIGUSR1 reloads the event workers.
//! Off unix only Ctrl-C is observed.

use crate::server::ServerHandle;
use tokio::task::JoinHandle;

/// Route signals to `handle` until the returned task is aborted
pub(crate) fn install(handle: ServerHandle) -> JoinHandle<()> {
    tokio::spawn(watch(handle))
}

#[cfg(unix)]
async fn watch(handle: ServerHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::user_defined1()),
    );
    let (mut terminate, mut interrupt, mut reload) = match streams {
        (Ok(t), Ok(i), Ok(r)) => (t, i, r),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            crate::log_error!("signal handlers unavailable: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                crate::log_info!("SIGTERM received, stopping");
                break;
            }
            _ = interrupt.recv() => {
                crate::log_info!("SIGINT received, stopping");
                break;
            }
            _ = reload.recv() => {
                crate::log_info!("SIGUSR1 received, reloading workers");
                if let Err(e) = handle.request_reload() {
                    crate::log_warn!("reload request failed: {}", e);
                }
            }
        }
    }
    if let Err(e) = handle.request_stop() {
        crate::log_warn!("stop request failed: {}", e);
    }
}

#[cfg(not(unix))]
async fn watch(handle: ServerHandle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            crate::log_info!("Ctrl-C received, stopping");
            if let Err(e) = handle.request_stop() {
                crate::log_warn!("stop request failed: {}", e);
            }
        }
        Err(e) => crate::log_error!("signal handlers unavailable: {}", e),
    }
}
