//! Ordered supervision of long-lived activities.
//!
//! An [`OrderedGroup`] runs N named members with deterministic start
//! order: member N+1 is started only once member N has signalled ready,
//! and the group as a whole is ready when the last member is. Teardown
//! is the mirror image: on interrupt (or on the first member exit) the
//! members are signalled in reverse start order and drained.
//!
//! The group runs on a background task; the returned [`ProcessHandle`]
//! exposes the ready signal, the final result, and the interrupt switch.
//! Dropping every handle also interrupts the group.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::Result;

// =============================================================================
// Signals
// =============================================================================

/// Handed to a member so it can announce readiness exactly once.
/// Dropping it without calling [`ReadySignal::notify`] counts as never
/// becoming ready.
pub struct ReadySignal {
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    /// Marks the member ready. Idempotent.
    pub fn notify(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cooperative shutdown signal observed by a member.
pub struct InterruptSignal {
    rx: watch::Receiver<bool>,
}

impl InterruptSignal {
    /// Resolves once the member has been asked to shut down.
    pub async fn interrupted(&mut self) {
        let _ = self.rx.wait_for(|v| *v).await;
    }

    /// Non-blocking check.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// A long-lived supervised activity.
///
/// Implementations must signal `ready` once their startup work is done
/// and return promptly after `interrupt` fires.
#[async_trait]
pub trait Runner: Send {
    async fn run(self: Box<Self>, ready: ReadySignal, interrupt: InterruptSignal) -> Result<()>;
}

/// A runner that is immediately ready and simply parks until interrupted.
pub struct IdleRunner;

#[async_trait]
impl Runner for IdleRunner {
    async fn run(
        self: Box<Self>,
        ready: ReadySignal,
        mut interrupt: InterruptSignal,
    ) -> Result<()> {
        ready.notify();
        interrupt.interrupted().await;
        Ok(())
    }
}

/// A named member of an ordered group.
pub struct Member {
    name: &'static str,
    runner: Box<dyn Runner>,
}

impl Member {
    /// Creates a member.
    #[must_use]
    pub fn new(name: &'static str, runner: Box<dyn Runner>) -> Self {
        Self { name, runner }
    }
}

// =============================================================================
// Group Result
// =============================================================================

/// The first failing member's exit, by exit order. Later failures are
/// logged but not surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupError {
    pub member: &'static str,
    pub message: String,
}

/// Final outcome of an ordered group.
pub type GroupResult = std::result::Result<(), GroupError>;

// =============================================================================
// Ordered Group
// =============================================================================

/// Supervisor for a fixed, ordered set of members.
pub struct OrderedGroup {
    members: Vec<Member>,
}

impl OrderedGroup {
    /// Creates a group over `members` in start order.
    #[must_use]
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    /// Launches the group on a background task.
    #[must_use]
    pub fn spawn(self) -> ProcessHandle {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (result_tx, result_rx) = watch::channel(None::<GroupResult>);
        let (interrupt_tx, interrupt_rx) = watch::channel(false);

        tokio::spawn(drive(self.members, ready_tx, result_tx, interrupt_rx));

        ProcessHandle {
            ready_rx,
            result_rx,
            interrupt: Arc::new(interrupt_tx),
        }
    }
}

/// Handle to a spawned group.
#[derive(Clone)]
pub struct ProcessHandle {
    ready_rx: watch::Receiver<bool>,
    result_rx: watch::Receiver<Option<GroupResult>>,
    interrupt: Arc<watch::Sender<bool>>,
}

impl ProcessHandle {
    /// Resolves `true` once every member is ready, `false` if the group
    /// exited before reaching readiness.
    pub async fn ready(&self) -> bool {
        let mut rx = self.ready_rx.clone();
        let result = rx.wait_for(|v| *v).await.is_ok();
        result
    }

    /// Awaits the group's final result. May be called by any number of
    /// handle clones; all observe the same outcome.
    pub async fn wait(&self) -> GroupResult {
        let mut rx = self.result_rx.clone();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => (*value).clone().expect("checked is_some"),
            Err(_) => Err(GroupError {
                member: "supervisor",
                message: "supervisor task exited without a result".to_string(),
            }),
        };
        result
    }

    /// Asks the group to shut down. Idempotent.
    pub fn signal_interrupt(&self) {
        let _ = self.interrupt.send(true);
    }
}

// =============================================================================
// Driver
// =============================================================================

async fn drive(
    members: Vec<Member>,
    group_ready: watch::Sender<bool>,
    result_tx: watch::Sender<Option<GroupResult>>,
    mut group_interrupt: watch::Receiver<bool>,
) {
    let total = members.len();
    let (done_tx, mut done_rx) = mpsc::channel::<(&'static str, Result<()>)>(total.max(1));
    let mut started: Vec<(&'static str, watch::Sender<bool>)> = Vec::new();
    let mut exits: Vec<(&'static str, Result<()>)> = Vec::new();
    let mut startup_aborted = false;

    'startup: for member in members {
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let (member_interrupt_tx, member_interrupt_rx) = watch::channel(false);
        let name = member.name;
        let done = done_tx.clone();
        tokio::spawn(async move {
            let res = member
                .runner
                .run(
                    ReadySignal { tx: ready_tx },
                    InterruptSignal {
                        rx: member_interrupt_rx,
                    },
                )
                .await;
            let _ = done.send((name, res)).await;
        });
        started.push((name, member_interrupt_tx));

        let mut member_ready = false;
        tokio::select! {
            // A member signals ready strictly before it can exit; keep
            // that ordering observable by polling readiness first.
            biased;
            r = ready_rx.wait_for(|v| *v) => {
                member_ready = r.is_ok();
            }
            Some(exit) = done_rx.recv() => {
                exits.push(exit);
            }
            _ = group_interrupt.wait_for(|v| *v) => {}
        }
        if !member_ready {
            // Member exited or the group was interrupted before this
            // member became ready; a dropped ready signal means the
            // exit is still in flight on the done channel.
            if exits.is_empty() && !*group_interrupt.borrow() {
                if let Some(exit) = done_rx.recv().await {
                    exits.push(exit);
                }
            }
            startup_aborted = true;
            break 'startup;
        }
        tracing::debug!(member = name, "group member ready");
    }

    if !startup_aborted {
        let _ = group_ready.send(true);
        tracing::debug!("group ready");

        tokio::select! {
            Some(exit) = done_rx.recv() => {
                tracing::debug!(member = exit.0, "group member exited");
                exits.push(exit);
            }
            _ = group_interrupt.wait_for(|v| *v) => {
                tracing::debug!("group interrupted");
            }
        }
    }

    // Teardown in reverse start order, then drain every started member.
    for (_, interrupt) in started.iter().rev() {
        let _ = interrupt.send(true);
    }
    while exits.len() < started.len() {
        match done_rx.recv().await {
            Some(exit) => exits.push(exit),
            None => break,
        }
    }

    let mut result: GroupResult = Ok(());
    for &(name, ref res) in &exits {
        if let Err(err) = res {
            if result.is_ok() {
                result = Err(GroupError {
                    member: name,
                    message: err.to_string(),
                });
            } else {
                tracing::debug!(member = name, error = %err, "later group member error");
            }
        }
    }
    let _ = result_tx.send(Some(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Runner that appends to a shared log on start and stop.
    struct LogRunner {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_with: Option<String>,
        ready: bool,
    }

    #[async_trait]
    impl Runner for LogRunner {
        async fn run(
            self: Box<Self>,
            ready: ReadySignal,
            mut interrupt: InterruptSignal,
        ) -> Result<()> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if let Some(msg) = self.fail_with {
                return Err(Error::Internal(msg));
            }
            if self.ready {
                ready.notify();
            }
            interrupt.interrupted().await;
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    fn member(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_with: Option<&str>,
    ) -> Member {
        Member::new(
            name,
            Box::new(LogRunner {
                name,
                log: Arc::clone(log),
                fail_with: fail_with.map(str::to_string),
                ready: true,
            }),
        )
    }

    #[tokio::test]
    async fn test_members_start_in_order_and_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = OrderedGroup::new(vec![
            member("a", &log, None),
            member("b", &log, None),
            member("c", &log, None),
        ])
        .spawn();

        assert!(handle.ready().await);
        handle.signal_interrupt();
        assert_eq!(handle.wait().await, Ok(()));

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn test_failure_before_ready_skips_later_members() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = OrderedGroup::new(vec![
            member("a", &log, None),
            member("b", &log, Some("boom")),
            member("c", &log, None),
        ])
        .spawn();

        assert!(!handle.ready().await);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.member, "b");
        assert_eq!(err.message, "internal error: boom");

        let log = log.lock().unwrap();
        assert!(!log.contains(&"start:c".to_string()));
        assert!(log.contains(&"stop:a".to_string()));
    }

    #[tokio::test]
    async fn test_idle_runner_parks_until_interrupt() {
        let handle =
            OrderedGroup::new(vec![Member::new("idle", Box::new(IdleRunner))]).spawn();
        assert!(handle.ready().await);
        handle.signal_interrupt();
        assert_eq!(handle.wait().await, Ok(()));
    }
}
