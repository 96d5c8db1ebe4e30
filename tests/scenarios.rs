//! End-to-end scenarios drawn from the connector kernel's testable
//! properties: sequence short-circuiting with error path composition, rate
//! limiter admission bounds, and race/contest winner selection.

use flowline::adapters::{Apply, Transform};
use flowline::clock::TestClock;
use flowline::connectors::rate_limiter::{Mode, RateLimiter};
use flowline::connectors::race::{Contest, Race};
use flowline::connectors::sequence::Sequence;
use flowline::context::Context;
use flowline::error::ErrorKind;
use flowline::identity::Identity;
use flowline::processor::{BoxProcessor, Processor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("{0} is odd")]
struct Odd(i32);

fn double() -> BoxProcessor<i32> {
    Arc::new(Transform::new(Identity::new("double"), |_ctx, x: i32| async move { x * 2 }))
}

fn fail_if_odd() -> BoxProcessor<i32> {
    Arc::new(Apply::new(Identity::new("fail_if_odd"), |_ctx, x: i32| async move {
        if x % 2 != 0 {
            Err(Odd(x))
        } else {
            Ok(x)
        }
    }))
}

fn add_ten() -> BoxProcessor<i32> {
    Arc::new(Transform::new(Identity::new("add_ten"), |_ctx, x: i32| async move { x + 10 }))
}

/// S1. Sequence [double, fail_if_odd, add_ten] on input 3 fails at
/// `fail_if_odd` with `input_data = 6` and a path of [seq, fail_if_odd].
#[tokio::test]
async fn sequence_stops_at_first_failure_with_composed_path() {
    let seq = Sequence::with_children(Identity::new("seq"), vec![double(), fail_if_odd(), add_ten()]);

    let err = seq.process(&Context::new(), 3).await.unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::ProcessorFailure));
    let names: Vec<&str> = err.path().iter().map(|id| id.name()).collect();
    assert_eq!(names, vec!["seq", "fail_if_odd"]);
    assert_eq!(err.input_data(), Some(&6));
}

/// S1 corollary: an even input sails through every stage.
#[tokio::test]
async fn sequence_succeeds_on_even_input() {
    let seq = Sequence::with_children(Identity::new("seq"), vec![double(), fail_if_odd(), add_ten()]);
    let out = seq.process(&Context::new(), 4).await.unwrap();
    assert_eq!(out, 4 * 2 + 10);
}

/// S3. RateLimiter(rate=10, burst=5, mode=drop) admits exactly 5 requests in
/// the first 0ms window, then 1 additional every 100ms of advanced clock
/// time.
#[tokio::test]
async fn rate_limiter_admits_burst_then_one_per_hundred_millis() {
    let passthrough: BoxProcessor<i32> =
        Arc::new(Transform::new(Identity::new("passthrough"), |_ctx, x: i32| async move { x }));
    let clock = Arc::new(TestClock::new());
    let limiter =
        RateLimiter::new(Identity::new("limiter"), passthrough, 10.0, 5.0).with_mode(Mode::Drop).with_clock(clock.clone());

    for _ in 0..5 {
        limiter.process(&Context::new(), 1).await.unwrap();
    }
    let err = limiter.process(&Context::new(), 1).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::RateLimited));

    for _ in 0..3 {
        clock.advance(Duration::from_millis(100)).await;
        limiter.process(&Context::new(), 1).await.unwrap();
        let err = limiter.process(&Context::new(), 1).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RateLimited));
    }
}

/// S5. Race over [slow -> "A" after 50ms, fast -> "B" after 10ms] returns
/// "B", and the slow child observes its context canceled before it would
/// have naturally completed.
#[tokio::test]
async fn race_cancels_losing_child_context() {
    let slow_was_canceled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&slow_was_canceled);

    let slow: BoxProcessor<&'static str> = Arc::new(Transform::new(Identity::new("slow"), move |ctx, _x| {
        let flag = Arc::clone(&flag);
        async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => "A",
                _ = ctx.canceled() => {
                    flag.store(true, Ordering::SeqCst);
                    "A"
                }
            }
        }
    }));
    let fast: BoxProcessor<&'static str> = Arc::new(Transform::new(Identity::new("fast"), |_ctx, _x| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        "B"
    }));

    let race = Race::new(Identity::new("race"), vec![slow, fast]);
    let out = race.process(&Context::new(), "").await.unwrap();

    assert_eq!(out, "B");
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(slow_was_canceled.load(Ordering::SeqCst));
}

/// S6. Contest with predicate `len(result) >= 3` over children yielding
/// "abc" (40ms), "no" (10ms), "fine" (60ms) returns "abc", the first result
/// to satisfy the predicate, not "no" (which finishes first but fails it)
/// and not "fine" (which finishes last but is never reached).
#[tokio::test]
async fn contest_returns_first_satisfying_result_not_first_to_finish() {
    fn delayed(name: &str, value: &'static str, delay: Duration) -> BoxProcessor<&'static str> {
        Arc::new(Transform::new(Identity::new(name), move |_ctx, _x| async move {
            tokio::time::sleep(delay).await;
            value
        }))
    }

    let contest = Contest::new(
        Identity::new("contest"),
        vec![
            delayed("abc", "abc", Duration::from_millis(40)),
            delayed("no", "no", Duration::from_millis(10)),
            delayed("fine", "fine", Duration::from_millis(60)),
        ],
        |_ctx, value: &&'static str| {
            let satisfies = value.len() >= 3;
            async move { satisfies }
        },
    );

    let out = contest.process(&Context::new(), "").await.unwrap();
    assert_eq!(out, "abc");
}
