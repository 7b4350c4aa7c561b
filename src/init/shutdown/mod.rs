use anyhow::Result;
use smol::channel::{self, Receiver, Sender};

/// Broadcast stop flag shared by the accept loop and the eviction ticker.
///
/// Built on a channel that never carries a message: `stop` closes the
/// sender half, which fails every pending `recv` at once and stays latched
/// for late callers. Worker accounting is not handled here; the supervisor
/// owns that directly.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    pub fn stop(&self) {
        self.tx.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once `stop` has been called, immediately if it already was.
    pub async fn stopped(&self) {
        let _ = self.rx.recv().await;
    }
}

/// Installs the Ctrl-C hook; the interrupt trips the returned signal.
pub fn init() -> Result<StopSignal> {
    let ctrlc = ctrlc2::AsyncCtrlC::new(|| true)?;
    let signal = StopSignal::new();
    let tripped = signal.clone();
    smol::spawn(async move {
        let _ = ctrlc.await;
        log::info!("interrupt received, stopping proxy...");
        tripped.stop();
    })
    .detach();
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_wakes_pending_waiters() {
        smol::block_on(async {
            let signal = StopSignal::new();
            assert!(!signal.is_stopped());
            assert!(
                smol::future::poll_once(signal.stopped()).await.is_none(),
                "stopped() must pend before stop()"
            );

            let waiter = {
                let signal = signal.clone();
                smol::spawn(async move { signal.stopped().await })
            };
            signal.stop();
            waiter.await;
            assert!(signal.is_stopped());
        });
    }

    #[test]
    fn test_stop_is_latched_for_late_callers() {
        smol::block_on(async {
            let signal = StopSignal::new();
            signal.stop();
            signal.stop(); // idempotent
            signal.stopped().await;

            let late = signal.clone();
            late.stopped().await;
            assert!(late.is_stopped());
        });
    }
}
