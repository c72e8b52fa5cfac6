// ABOUTME: races a script's natural exit against its deadline and external cancellation.
// ABOUTME: escalates from a graceful terminate to a forced kill after the grace period.

use std::io;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::runner::{ExitOutcome, ScriptProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Option<Duration>,
    grace: Duration,
}

enum Trigger {
    Exit(io::Result<ExitOutcome>),
    Cancel,
}

impl Watchdog {
    /// `timeout` of `None` never fires; cancellation still applies.
    pub fn new(timeout: Option<Duration>, grace: Duration) -> Self {
        Self { timeout, grace }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn supervise(&self, process: &mut ScriptProcess, cancel: &CancellationToken) -> io::Result<Verdict> {
        let trigger = tokio::select! {
            biased;
            outcome = process.wait(self.timeout) => Trigger::Exit(outcome),
            () = cancel.cancelled() => Trigger::Cancel,
        };

        match trigger {
            Trigger::Exit(outcome) => match outcome? {
                ExitOutcome::Exited(code) => Ok(Verdict::Exited(code)),
                ExitOutcome::TimedOut => {
                    warn!(pid = ?process.pid(), timeout = ?self.timeout, "deadline elapsed; stopping process");
                    escalate(process, self.grace).await?;
                    Ok(Verdict::TimedOut)
                }
            },
            Trigger::Cancel => {
                debug!(pid = ?process.pid(), "cancellation requested; stopping process");
                escalate(process, self.grace).await?;
                Ok(Verdict::Cancelled)
            }
        }
    }
}

/// terminate, wait up to `grace`, then kill and reap.
async fn escalate(process: &mut ScriptProcess, grace: Duration) -> io::Result<()> {
    if let Err(err) = process.terminate() {
        warn!(pid = ?process.pid(), error = %err, "terminate failed; killing");
    } else if let ExitOutcome::Exited(_) = process.wait(Some(grace)).await? {
        return Ok(());
    }

    warn!(pid = ?process.pid(), grace = ?grace, "process ignored terminate; killing");
    process.kill()?;
    process.wait(None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::runner::{spawn, Invocation, SpawnedScript};
    use scriptbox_common::ScriptType;
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn start(content: &str) -> SpawnedScript {
        let invocation = Invocation::for_script(&EngineConfig::default(), ScriptType::Shell, content).unwrap();
        spawn(&invocation, &BTreeMap::new()).unwrap()
    }

    #[tokio::test]
    async fn natural_exit_reports_code() {
        let mut spawned = start("exit 4");
        let watchdog = Watchdog::new(Some(Duration::from_secs(5)), Duration::from_millis(200));
        let verdict = watchdog
            .supervise(&mut spawned.process, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Exited(4));
    }

    #[tokio::test]
    async fn deadline_terminates_long_script() {
        let mut spawned = start("sleep 5");
        let watchdog = Watchdog::new(Some(Duration::from_millis(200)), Duration::from_millis(500));
        let started = Instant::now();
        let verdict = watchdog
            .supervise(&mut spawned.process, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn script_ignoring_term_is_killed_after_grace() {
        let mut spawned = start("trap '' TERM; sleep 5; sleep 5");
        let grace = Duration::from_millis(300);
        let watchdog = Watchdog::new(Some(Duration::from_millis(200)), grace);
        let started = Instant::now();
        let verdict = watchdog
            .supervise(&mut spawned.process, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(verdict, Verdict::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancellation_without_timeout() {
        let mut spawned = start("sleep 5");
        let watchdog = Watchdog::new(None, Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trip.cancel();
        });

        let verdict = watchdog.supervise(&mut spawned.process, &cancel).await.unwrap();
        assert_eq!(verdict, Verdict::Cancelled);
    }

    #[tokio::test]
    async fn exit_wins_over_already_tripped_cancel() {
        let mut spawned = start("exit 0");
        // let the process finish before supervision starts
        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let watchdog = Watchdog::new(None, Duration::from_millis(100));
        let verdict = watchdog.supervise(&mut spawned.process, &cancel).await.unwrap();
        assert_eq!(verdict, Verdict::Exited(0));
    }
}
