use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, watch};

/// The future the handler watches: resolves when the process receives
/// SIGINT or SIGTERM (ctrl-c on windows).
pub fn signal_stream() -> impl Future<Output = Option<()>> + Send + 'static {
    async {
        #[cfg(unix)]
        {
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok()?;
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok()?;
            tokio::select! {
                res = sigint.recv() => res,
                res = sigterm.recv() => res,
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok()
        }
    }
}

/// Why the run is being cancelled. An OS signal maps to exit code 130;
/// a requested close (end of run, bail cleanup) keeps the run's own exit
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Interrupt,
    Requested,
}

/// The run's cancellation token. One per invocation, shared by the
/// executor and the cache: a single close reason fans out to any number
/// of subscribers over a watch channel, and shutdown waits until every
/// subscriber's cleanup guard has been dropped before the process is
/// allowed to exit.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    cancel: watch::Sender<Option<CloseReason>>,
    /// Cloned into each subscriber; the handler's own copy is given up
    /// when shutdown starts so the channel closes once the last
    /// subscriber finishes.
    guard_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    guard_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
}

pub struct SignalSubscriber {
    cancel: watch::Receiver<Option<CloseReason>>,
    guard: mpsc::Sender<()>,
}

/// Keep the guard until the subscriber is done processing the
/// cancellation; dropping it is what lets the handler finish.
pub struct SubscriberGuard(#[allow(dead_code)] mpsc::Sender<()>);

impl SignalHandler {
    pub fn new(signal_source: impl Future<Output = Option<()>> + Send + 'static) -> Self {
        let (cancel, _) = watch::channel(None);
        let (guard_tx, guard_rx) = mpsc::channel(1);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            if signal_source.await.is_some() {
                Self::fire(&trigger, CloseReason::Interrupt);
            }
        });

        Self {
            cancel,
            guard_tx: Arc::new(Mutex::new(Some(guard_tx))),
            guard_rx: Arc::new(tokio::sync::Mutex::new(guard_rx)),
        }
    }

    // The first reason wins: a signal arriving during a requested close
    // must not demote the exit code, and vice versa.
    fn fire(cancel: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
        cancel.send_modify(|state| {
            if state.is_none() {
                *state = Some(reason);
            }
        });
    }

    /// Register a new subscriber. Returns `None` if shutdown has already
    /// started.
    pub fn subscribe(&self) -> Option<SignalSubscriber> {
        if self.cancel.borrow().is_some() {
            return None;
        }
        let guard = self.guard_tx.lock().expect("poisoned lock").clone()?;
        Some(SignalSubscriber {
            cancel: self.cancel.subscribe(),
            guard,
        })
    }

    /// Whether shutdown has been triggered.
    pub fn is_closing(&self) -> bool {
        self.cancel.borrow().is_some()
    }

    /// Whether the shutdown came from an OS signal.
    pub fn interrupted(&self) -> bool {
        *self.cancel.borrow() == Some(CloseReason::Interrupt)
    }

    /// Start a requested shutdown and wait for subscribers to finish.
    pub async fn close(&self) {
        Self::fire(&self.cancel, CloseReason::Requested);
        self.done().await;
    }

    /// Wait until every subscriber's guard has been dropped.
    pub async fn done(&self) {
        // Give up the handler's own guard sender so the channel can close.
        self.guard_tx.lock().expect("poisoned lock").take();
        let mut guards = self.guard_rx.lock().await;
        // Guards never send; recv yields None once the last one drops.
        while guards.recv().await.is_some() {}
    }
}

impl SignalSubscriber {
    /// Resolves when the run is cancelled. The returned guard must be
    /// held until cleanup is complete.
    pub async fn listen(mut self) -> SubscriberGuard {
        loop {
            if self.cancel.borrow_and_update().is_some() {
                break;
            }
            if self.cancel.changed().await.is_err() {
                // handler dropped entirely; treat as cancelled
                break;
            }
        }
        SubscriberGuard(self.guard)
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_subscribers_triggered_from_signal() {
        let (tx, rx) = oneshot::channel();
        let handler = SignalHandler::new(async move { rx.await.ok() });
        let subscriber = handler.subscribe().unwrap();
        // mock SIGINT
        tx.send(()).unwrap();

        let guard = subscriber.listen().await;
        assert!(handler.is_closing());
        assert!(handler.interrupted());
        drop(guard);
        handler.done().await;
    }

    #[tokio::test]
    async fn test_requested_close_is_not_an_interrupt() {
        let (_tx, rx) = oneshot::channel::<()>();
        let handler = SignalHandler::new(async move { rx.await.ok() });
        handler.close().await;
        assert!(handler.is_closing());
        assert!(!handler.interrupted());
    }

    #[tokio::test]
    async fn test_done_waits_for_subscriber_guard() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (tx, rx) = oneshot::channel();
        let handler = SignalHandler::new(async move { rx.await.ok() });
        let subscriber = handler.subscribe().unwrap();

        let cleanup_finished = std::sync::Arc::new(AtomicBool::new(false));
        let flag = cleanup_finished.clone();
        let cleanup = tokio::spawn(async move {
            let guard = subscriber.listen().await;
            // simulate cleanup work before releasing the guard
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
            drop(guard);
        });

        tx.send(()).unwrap();
        handler.done().await;
        // done() only returns after the subscriber dropped its guard
        assert!(cleanup_finished.load(Ordering::SeqCst));
        cleanup.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (_tx, rx) = oneshot::channel::<()>();
        let handler = SignalHandler::new(async move { rx.await.ok() });
        handler.close().await;
        handler.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_after_close() {
        let (_tx, rx) = oneshot::channel::<()>();
        let handler = SignalHandler::new(async move { rx.await.ok() });
        handler.close().await;
        assert!(
            handler.subscribe().is_none(),
            "a closing handler should not accept new subscribers"
        );
    }

    #[tokio::test]
    async fn test_signal_does_not_demote_requested_close() {
        let (tx, rx) = oneshot::channel();
        let handler = SignalHandler::new(async move { rx.await.ok() });
        handler.close().await;
        // a late signal must not rewrite the reason
        tx.send(()).unwrap();
        tokio::task::yield_now().await;
        assert!(!handler.interrupted());
    }
}
