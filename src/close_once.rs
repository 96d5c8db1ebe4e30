//! Shared once-guard making every connector's `Close` idempotent.
//!
//! Spec: `Close()` is idempotent (once-guard); calling it N times must
//! invoke each child's `Close` exactly once and yield the same returned
//! error value every time. [`CloseOnce`] runs the wrapped future at most
//! once and replays a snapshot of its outcome on every later call.

use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;

struct Snapshot {
    kind: ErrorKind,
    path: Vec<Identity>,
    message: String,
    timestamp: DateTime<Utc>,
    duration: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct CachedCloseCause(String);

/// Wraps a connector's real close logic so it only ever runs once.
pub(crate) struct CloseOnce {
    cell: OnceCell<Option<Snapshot>>,
}

impl CloseOnce {
    pub(crate) fn new() -> Self {
        CloseOnce { cell: OnceCell::new() }
    }

    /// Runs `close` the first time this is called; every later call skips
    /// `close` entirely and reconstructs the first call's error (or `Ok`)
    /// from a cached snapshot.
    pub(crate) async fn run<F>(&self, close: F) -> Result<(), Error<()>>
    where
        F: Future<Output = Result<(), Error<()>>>,
    {
        let snapshot = self
            .cell
            .get_or_init(|| async move {
                close.await.err().map(|err| Snapshot {
                    kind: err.kind().clone(),
                    path: err.path().to_vec(),
                    message: err.cause().to_string(),
                    timestamp: err.timestamp(),
                    duration: err.duration(),
                })
            })
            .await;

        match snapshot {
            None => Ok(()),
            Some(s) => {
                let built = Error::new(s.kind.clone(), CachedCloseCause(s.message.clone()), None)
                    .with_duration(s.duration)
                    .with_timestamp(s.timestamp);
                let built = s.path.iter().rev().cloned().fold(built, |err, identity| err.with_prefixed_path(identity));
                Err(built)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn replays_success_without_rerunning() {
        let calls = AtomicU32::new(0);
        let guard = CloseOnce::new();
        for _ in 0..3 {
            let calls = &calls;
            guard
                .run(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replays_failure_without_rerunning() {
        let calls = AtomicU32::new(0);
        let guard = CloseOnce::new();
        let identity = Identity::new("child");
        let mut last_message = String::new();
        for _ in 0..3 {
            let calls = &calls;
            let identity = identity.clone();
            let err = guard
                .run(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::new(ErrorKind::ProcessorFailure, Boom, None).with_prefixed_path(identity))
                })
                .await
                .unwrap_err();
            last_message = err.to_string();
            assert_eq!(err.path().first().unwrap().name(), "child");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(last_message.contains("boom"));
    }
}
