//! Integration tests for the ordered group supervisor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stevedore::error::{Error, Result};
use stevedore::supervisor::{
    InterruptSignal, Member, OrderedGroup, ReadySignal, Runner,
};

/// Runner whose behavior is scripted per test.
struct ScriptedRunner {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    /// Delay before signalling ready.
    ready_after: Duration,
    /// Exit with this error right after becoming ready.
    fail_after_ready: Option<&'static str>,
}

impl ScriptedRunner {
    fn member(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        ready_after: Duration,
        fail_after_ready: Option<&'static str>,
    ) -> Member {
        Member::new(
            name,
            Box::new(Self {
                name,
                log: Arc::clone(log),
                ready_after,
                fail_after_ready,
            }),
        )
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(
        self: Box<Self>,
        ready: ReadySignal,
        mut interrupt: InterruptSignal,
    ) -> Result<()> {
        self.log.lock().unwrap().push(format!("start:{}", self.name));
        tokio::select! {
            _ = tokio::time::sleep(self.ready_after) => {}
            _ = interrupt.interrupted() => return Ok(()),
        }
        ready.notify();
        if let Some(msg) = self.fail_after_ready {
            return Err(Error::Internal(msg.to_string()));
        }
        interrupt.interrupted().await;
        self.log.lock().unwrap().push(format!("stop:{}", self.name));
        Ok(())
    }
}

#[tokio::test]
async fn test_each_ready_gates_the_next_start() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = OrderedGroup::new(vec![
        ScriptedRunner::member("slow", &log, Duration::from_millis(50), None),
        ScriptedRunner::member("fast", &log, Duration::ZERO, None),
    ])
    .spawn();

    assert!(handle.ready().await);
    // "fast" must not have started before "slow" became ready.
    assert_eq!(
        *log.lock().unwrap(),
        vec!["start:slow".to_string(), "start:fast".to_string()]
    );

    handle.signal_interrupt();
    assert!(handle.wait().await.is_ok());
}

#[tokio::test]
async fn test_first_failing_member_wins() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = OrderedGroup::new(vec![
        ScriptedRunner::member("a", &log, Duration::ZERO, Some("a blew up")),
        ScriptedRunner::member("b", &log, Duration::from_millis(20), Some("b blew up")),
    ])
    .spawn();

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.member, "a");
    assert_eq!(err.message, "internal error: a blew up");
}

#[tokio::test]
async fn test_interrupt_before_ready_aborts_startup() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = OrderedGroup::new(vec![
        ScriptedRunner::member("a", &log, Duration::ZERO, None),
        ScriptedRunner::member("slow", &log, Duration::from_secs(30), None),
        ScriptedRunner::member("never", &log, Duration::ZERO, None),
    ])
    .spawn();

    // Give the first two members time to start.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.signal_interrupt();

    assert!(!handle.ready().await);
    assert!(handle.wait().await.is_ok());
    assert!(!log.lock().unwrap().contains(&"start:never".to_string()));
}

#[tokio::test]
async fn test_wait_observes_the_same_result_from_every_handle() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = OrderedGroup::new(vec![ScriptedRunner::member(
        "a",
        &log,
        Duration::ZERO,
        Some("boom"),
    )])
    .spawn();

    let other = handle.clone();
    let first = handle.wait().await.unwrap_err();
    let second = other.wait().await.unwrap_err();
    assert_eq!(first, second);
}
