//! Recovery controller: classifies automation faults and owns the session.
//!
//! The controller holds the one live [`AutomationSource`] handle. A reset
//! closes it and opens a replacement through the [`SourceFactory`]; nobody
//! else keeps a reference to a session across a reset.

use crate::config::CrawlConfig;
use crate::error::{CrawlError, Result};
use crate::source::{AutomationSource, NodePath, SourceFactory, SourceFault};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What to do with the node whose attempt just ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep the session and attempt the node again after the fault delay.
    RetrySameNode,
    /// The node does not exist; drop it for good.
    DropNode,
    /// The session is assumed corrupted: rebuild it, then retry the node.
    ResetAndRetry,
    /// The fault budget is spent; stop the run.
    EscalateFatal,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetrySameNode => write!(f, "retry"),
            Self::DropNode => write!(f, "drop"),
            Self::ResetAndRetry => write!(f, "reset"),
            Self::EscalateFatal => write!(f, "escalate"),
        }
    }
}

/// Lifecycle of one node attempt.
///
/// `Succeeded` and `Absent` are terminal for the node; `Faulted` goes back
/// to `Attempting` on the next try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Attempting,
    Succeeded,
    Absent,
    Faulted,
}

/// Decision for a fault, ignoring the budget.
pub fn classify(fault: &SourceFault) -> Decision {
    match fault {
        // The surface is alive, just slow.
        SourceFault::Timeout(_) => Decision::RetrySameNode,
        SourceFault::Interaction(_) | SourceFault::Lookup(_) | SourceFault::Unclassified(_) => {
            Decision::ResetAndRetry
        }
    }
}

pub struct RecoveryController {
    factory: Box<dyn SourceFactory>,
    source: Option<Box<dyn AutomationSource>>,
    state: AttemptState,
    /// Node the consecutive fault count belongs to.
    faulted_path: Option<NodePath>,
    consecutive_faults: u32,
    max_consecutive_faults: u32,
    fault_retry_delay: Duration,
    reset_retry_delay: Duration,
    resets: u32,
}

impl RecoveryController {
    pub fn new(factory: Box<dyn SourceFactory>, config: &CrawlConfig) -> Self {
        Self {
            factory,
            source: None,
            state: AttemptState::Idle,
            faulted_path: None,
            consecutive_faults: 0,
            max_consecutive_faults: config.max_consecutive_faults,
            fault_retry_delay: config.fault_retry_delay,
            reset_retry_delay: config.reset_retry_delay,
            resets: 0,
        }
    }

    /// The live session, opened on first use.
    pub async fn source(&mut self) -> Result<&mut dyn AutomationSource> {
        if self.source.is_none() {
            let session = self.open_session().await?;
            self.source = Some(session);
        }
        match self.source.as_deref_mut() {
            Some(source) => Ok(source),
            None => Err(CrawlError::SessionUnavailable("no live session".into())),
        }
    }

    /// Sessions rebuilt so far.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.consecutive_faults
    }

    pub fn begin(&mut self, path: &NodePath) {
        if self.state == AttemptState::Faulted {
            debug!("{path}: attempt {} after fault", self.consecutive_faults + 1);
        }
        self.state = AttemptState::Attempting;
    }

    pub fn succeeded(&mut self) {
        self.state = AttemptState::Succeeded;
        self.clear_faults();
    }

    pub fn absent(&mut self) -> Decision {
        self.state = AttemptState::Absent;
        self.clear_faults();
        Decision::DropNode
    }

    /// Decide on a fault raised while attempting `path`, and carry out the
    /// wait or reset it calls for before returning.
    pub async fn fault(&mut self, path: &NodePath, fault: &SourceFault) -> Result<Decision> {
        self.state = AttemptState::Faulted;
        if self.faulted_path.as_ref() == Some(path) {
            self.consecutive_faults += 1;
        } else {
            self.faulted_path = Some(path.clone());
            self.consecutive_faults = 1;
        }

        match fault {
            SourceFault::Unclassified(_) => error!("{path}: {fault}"),
            _ => warn!("{path}: {fault}"),
        }

        if self.max_consecutive_faults > 0 && self.consecutive_faults >= self.max_consecutive_faults
        {
            error!(
                "{path}: {} consecutive fault(s), giving up",
                self.consecutive_faults
            );
            return Ok(Decision::EscalateFatal);
        }

        let decision = classify(fault);
        match decision {
            Decision::ResetAndRetry => self.reset().await?,
            _ => sleep(self.fault_retry_delay).await,
        }
        Ok(decision)
    }

    /// Close the live session and open a replacement.
    pub async fn reset(&mut self) -> Result<()> {
        warn!("resetting automation session");
        self.close_session().await;
        let session = self.open_session().await?;
        self.source = Some(session);
        self.resets += 1;
        sleep(self.fault_retry_delay).await;
        Ok(())
    }

    /// Release the session at the end of a run.
    pub async fn shutdown(&mut self) {
        self.close_session().await;
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.source.take() {
            if let Err(e) = session.close().await {
                warn!("failed to close automation session: {e}");
            }
        }
    }

    /// Open a session, retrying with the reset delay. Bounded by the fault
    /// budget when one is configured.
    async fn open_session(&mut self) -> Result<Box<dyn AutomationSource>> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.factory.open().await {
                Ok(session) => {
                    if attempts > 1 {
                        info!("automation session ready after {attempts} attempt(s)");
                    }
                    return Ok(session);
                }
                Err(e) => {
                    if self.max_consecutive_faults > 0 && attempts >= self.max_consecutive_faults {
                        return Err(CrawlError::SessionUnavailable(format!(
                            "{e} (after {attempts} attempt(s))"
                        )));
                    }
                    warn!(
                        "failed to open automation session (attempt {attempts}): {e}; retrying in {}ms",
                        self.reset_retry_delay.as_millis()
                    );
                    sleep(self.reset_retry_delay).await;
                }
            }
        }
    }

    fn clear_faults(&mut self) {
        self.faulted_path = None;
        self.consecutive_faults = 0;
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::scripted::{Catalog, ScriptedFactory};

    fn config(max_consecutive_faults: u32) -> CrawlConfig {
        let mut config = CrawlConfig::default().without_delays();
        config.max_consecutive_faults = max_consecutive_faults;
        config
    }

    fn path(label: &str) -> NodePath {
        NodePath::root().child("janeiro/2020").child(label)
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&SourceFault::Timeout("x".into())),
            Decision::RetrySameNode
        );
        assert_eq!(
            classify(&SourceFault::Interaction("x".into())),
            Decision::ResetAndRetry
        );
        assert_eq!(
            classify(&SourceFault::Lookup("x".into())),
            Decision::ResetAndRetry
        );
        assert_eq!(
            classify(&SourceFault::Unclassified("x".into())),
            Decision::ResetAndRetry
        );
    }

    #[test]
    fn test_attempt_state_transitions() {
        let factory = ScriptedFactory::new(Catalog::default());
        let mut controller = RecoveryController::new(Box::new(factory), &config(0));
        assert_eq!(controller.state, AttemptState::Idle);

        controller.begin(&path("Acme"));
        assert_eq!(controller.state, AttemptState::Attempting);
        controller.succeeded();
        assert_eq!(controller.state, AttemptState::Succeeded);

        controller.begin(&path("Bolt"));
        assert_eq!(controller.absent(), Decision::DropNode);
        assert_eq!(controller.state, AttemptState::Absent);
    }

    #[tokio::test]
    async fn test_interaction_fault_resets_session() {
        let factory = ScriptedFactory::new(Catalog::default());
        let mut controller = RecoveryController::new(Box::new(factory.clone()), &config(0));
        controller.source().await.unwrap();

        controller.begin(&path("Acme"));
        let decision = controller
            .fault(&path("Acme"), &SourceFault::Interaction("button".into()))
            .await
            .unwrap();
        assert_eq!(decision, Decision::ResetAndRetry);
        assert_eq!(controller.state, AttemptState::Faulted);
        assert_eq!(controller.resets(), 1);

        let stats = factory.stats();
        assert_eq!(stats.sessions_opened, 2);
        assert_eq!(stats.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_session() {
        let factory = ScriptedFactory::new(Catalog::default());
        let mut controller = RecoveryController::new(Box::new(factory.clone()), &config(0));
        controller.source().await.unwrap();

        let decision = controller
            .fault(&path("Acme"), &SourceFault::Timeout("options".into()))
            .await
            .unwrap();
        assert_eq!(decision, Decision::RetrySameNode);
        assert_eq!(controller.resets(), 0);
        assert_eq!(factory.stats().sessions_opened, 1);
    }

    #[tokio::test]
    async fn test_budget_counts_consecutive_faults_per_node() {
        let factory = ScriptedFactory::new(Catalog::default());
        let mut controller = RecoveryController::new(Box::new(factory), &config(3));
        let fault = SourceFault::Timeout("options".into());

        controller.fault(&path("Acme"), &fault).await.unwrap();
        controller.fault(&path("Acme"), &fault).await.unwrap();
        // A different node starts a new count.
        controller.fault(&path("Bolt"), &fault).await.unwrap();
        assert_eq!(controller.consecutive_faults(), 1);
        controller.fault(&path("Bolt"), &fault).await.unwrap();
        assert_eq!(
            controller.fault(&path("Bolt"), &fault).await.unwrap(),
            Decision::EscalateFatal
        );

        controller.succeeded();
        assert_eq!(controller.consecutive_faults(), 0);
        assert_eq!(controller.absent(), Decision::DropNode);
    }

    #[tokio::test]
    async fn test_failed_opens_are_retried() {
        let factory = ScriptedFactory::new(Catalog::default()).with_failing_opens(2);
        let mut controller = RecoveryController::new(Box::new(factory.clone()), &config(0));

        controller.source().await.unwrap();
        let stats = factory.stats();
        assert_eq!(stats.failed_opens, 2);
        assert_eq!(stats.sessions_opened, 1);
    }

    #[tokio::test]
    async fn test_failed_opens_exhaust_budget() {
        let factory = ScriptedFactory::new(Catalog::default()).with_failing_opens(5);
        let mut controller = RecoveryController::new(Box::new(factory), &config(2));

        let err = controller.source().await.err().unwrap();
        assert!(matches!(err, CrawlError::SessionUnavailable(_)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let factory = ScriptedFactory::new(Catalog::default());
        let mut controller = RecoveryController::new(Box::new(factory.clone()), &config(0));
        controller.source().await.unwrap();
        controller.shutdown().await;
        controller.shutdown().await;
        assert_eq!(factory.stats().sessions_closed, 1);
    }
}
