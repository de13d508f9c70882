//! Operation wrapper: classify, back off, refresh, retry, log.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{HttpSessionRefresher, SessionRefresher, SessionStore};
use crate::classifier::{ErrorClassification, ErrorClassifier, ErrorShape};
use crate::config::{self, RecoveryConfig};
use crate::context::OperationContext;
use crate::log::{ErrorLog, ErrorLogEntry, ErrorStats, SessionId};
use crate::policy::RetryPolicy;
use crate::probe::{ConnectivityProbe, HttpConnectivityProbe};

/// Remediation step taken automatically before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    TokenRefresh { succeeded: bool },
}

impl RecoveryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::TokenRefresh { succeeded: true } => "token_refreshed",
            RecoveryAction::TokenRefresh { succeeded: false } => "token_refresh_failed",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a wrapped operation did not produce a value.
#[derive(Debug)]
pub enum RecoveryFailure<E> {
    /// The last error was not retryable, or no retries were left.
    Failed {
        classification: ErrorClassification,
        error: E,
    },
    /// The caller cancelled between attempts.
    Cancelled {
        last_error: Option<(ErrorClassification, E)>,
    },
}

impl<E> RecoveryFailure<E> {
    pub fn classification(&self) -> Option<ErrorClassification> {
        match self {
            RecoveryFailure::Failed { classification, .. } => Some(*classification),
            RecoveryFailure::Cancelled { last_error } => last_error.as_ref().map(|(c, _)| *c),
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            RecoveryFailure::Failed { error, .. } => Some(error),
            RecoveryFailure::Cancelled { last_error } => last_error.as_ref().map(|(_, e)| e),
        }
    }

    pub fn into_error(self) -> Option<E> {
        match self {
            RecoveryFailure::Failed { error, .. } => Some(error),
            RecoveryFailure::Cancelled { last_error } => last_error.map(|(_, e)| e),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RecoveryFailure::Cancelled { .. })
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            RecoveryFailure::Failed { classification, .. } => classification.user_message(),
            RecoveryFailure::Cancelled { .. } => "The request was cancelled.",
        }
    }
}

impl<E: fmt::Display> fmt::Display for RecoveryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryFailure::Failed {
                classification,
                error,
            } => write!(f, "{classification} error: {error}"),
            RecoveryFailure::Cancelled {
                last_error: Some((classification, error)),
            } => write!(f, "cancelled after {classification} error: {error}"),
            RecoveryFailure::Cancelled { last_error: None } => f.write_str("cancelled"),
        }
    }
}

impl<E> std::error::Error for RecoveryFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Terminal outcome of [`ErrorRecoveryService::execute_with_retry`].
#[derive(Debug)]
pub struct RecoveryResult<T, E> {
    pub outcome: Result<T, RecoveryFailure<E>>,
    /// Number of times the operation was invoked. Always at least 1.
    pub attempts: u32,
    pub total_time: Duration,
    /// Non-empty only when a recovery step actually ran.
    pub recovery_actions: Vec<RecoveryAction>,
}

impl<T, E> RecoveryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RecoveryFailure<E>> {
        self.outcome.as_ref().err()
    }

    pub fn total_time_ms(&self) -> u128 {
        self.total_time.as_millis()
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        self.recovery_actions.iter().map(|a| a.as_str()).collect()
    }

    pub fn into_result(self) -> Result<T, RecoveryFailure<E>> {
        self.outcome
    }
}

/// One iteration of the retry loop, traced and then dropped.
#[derive(Debug)]
struct AttemptRecord {
    attempt_number: u32,
    delay_before: Duration,
    error: Option<ErrorClassification>,
    succeeded: bool,
}

/// Client details stamped on error log entries.
#[derive(Debug, Clone)]
pub struct ClientEnvironment {
    pub user_agent: String,
    pub url: Option<String>,
}

impl Default for ClientEnvironment {
    fn default() -> Self {
        Self {
            user_agent: format!("helpdesk-recovery/{}", crate::VERSION),
            url: None,
        }
    }
}

/// Retry, recovery, and diagnostics for backend calls.
///
/// Cheap to clone; clones share the error log and collaborators. Each call to
/// [`execute_with_retry`](Self::execute_with_retry) is independent of any
/// other call in flight.
#[derive(Clone)]
pub struct ErrorRecoveryService {
    classifier: Arc<ErrorClassifier>,
    default_policy: Arc<RetryPolicy>,
    refresher: Arc<dyn SessionRefresher>,
    probe: Arc<dyn ConnectivityProbe>,
    log: ErrorLog,
    environment: Arc<ClientEnvironment>,
}

impl fmt::Debug for ErrorRecoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRecoveryService")
            .field("default_policy", &self.default_policy)
            .field("log", &self.log)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl ErrorRecoveryService {
    pub fn new(refresher: Arc<dyn SessionRefresher>, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            classifier: Arc::new(ErrorClassifier::default()),
            default_policy: Arc::new(RetryPolicy::default()),
            refresher,
            probe,
            log: ErrorLog::new(),
            environment: Arc::new(ClientEnvironment::default()),
        }
    }

    /// Wires the HTTP collaborators described by `config`.
    pub fn from_config(config: &RecoveryConfig, sessions: SessionStore) -> config::Result<Self> {
        config.validate()?;

        let mut environment = ClientEnvironment::default();
        if let Some(user_agent) = &config.log.user_agent {
            environment.user_agent = user_agent.clone();
        }
        environment.url = config.log.url.clone();

        let client = reqwest::Client::builder()
            .timeout(config.backend.request_timeout())
            .user_agent(environment.user_agent.clone())
            .build()?;

        let refresher = HttpSessionRefresher::new(client.clone(), &config.backend, sessions);
        let probe = HttpConnectivityProbe::new(client, &config.backend);

        Ok(Self::new(Arc::new(refresher), Arc::new(probe))
            .with_classifier(ErrorClassifier::new(config.keyword_table()))
            .with_default_policy(config.retry_policy()?)
            .with_error_log(ErrorLog::with_capacity(config.log.capacity))
            .with_environment(environment))
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = Arc::new(policy);
        self
    }

    pub fn with_error_log(mut self, log: ErrorLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_environment(mut self, environment: ClientEnvironment) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    pub fn classify<E: ErrorShape + ?Sized>(&self, error: &E) -> ErrorClassification {
        self.classifier.classify(error)
    }

    /// Runs `operation`, retrying retryable failures with exponential backoff.
    ///
    /// `operation` may run several times, so it must be idempotent. Callers
    /// wrapping a side-effecting call (creating a ticket, inviting a user)
    /// must make it safe to repeat, e.g. by sending the key set with
    /// [`OperationContext::with_idempotency_key`] to the backend.
    ///
    /// Never panics on operation failure; inspect [`RecoveryResult::outcome`].
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        operation: F,
        context: OperationContext,
        policy: Option<&RetryPolicy>,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorShape + fmt::Debug,
    {
        let never = CancellationToken::new();
        self.execute_with_retry_cancellable(operation, context, policy, &never)
            .await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), but stops
    /// between attempts once `cancel` fires.
    ///
    /// The first attempt always runs. Cancellation is checked after each
    /// failure and raced against the backoff wait; an in-flight attempt is
    /// never interrupted. Cancelled sequences are not written to the error log.
    pub async fn execute_with_retry_cancellable<F, Fut, T, E>(
        &self,
        mut operation: F,
        context: OperationContext,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
    ) -> RecoveryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorShape + fmt::Debug,
    {
        let policy = policy.unwrap_or_else(|| self.default_policy.as_ref());
        let start = Instant::now();
        let mut attempt: u32 = 0;
        let mut delay_before = Duration::ZERO;
        let mut recovery_actions = Vec::new();

        loop {
            let output = operation().await;
            let attempts = attempt + 1;

            let error = match output {
                Ok(data) => {
                    trace_attempt(&AttemptRecord {
                        attempt_number: attempts,
                        delay_before,
                        error: None,
                        succeeded: true,
                    });
                    if attempt > 0 {
                        tracing::info!(
                            "{} recovered after {attempts} attempts",
                            context.operation()
                        );
                    }
                    return RecoveryResult {
                        outcome: Ok(data),
                        attempts,
                        total_time: start.elapsed(),
                        recovery_actions,
                    };
                }
                Err(error) => error,
            };

            let classification = self.classifier.classify(&error);
            trace_attempt(&AttemptRecord {
                attempt_number: attempts,
                delay_before,
                error: Some(classification),
                succeeded: false,
            });

            if !policy.is_retryable(classification) || attempt >= policy.max_retries() {
                self.record_failure(&error, classification, &context, attempts);
                return RecoveryResult {
                    outcome: Err(RecoveryFailure::Failed {
                        classification,
                        error,
                    }),
                    attempts,
                    total_time: start.elapsed(),
                    recovery_actions,
                };
            }

            if cancel.is_cancelled() {
                return cancelled(attempts, start, recovery_actions, classification, error);
            }

            if classification == ErrorClassification::Authentication {
                let succeeded = self.refresh_auth_token().await;
                recovery_actions.push(RecoveryAction::TokenRefresh { succeeded });
            }

            let delay = policy.delay_for_attempt(attempt);
            tracing::debug!(
                operation = context.operation(),
                idempotency_key = context.idempotency_key(),
                %classification,
                "attempt {attempts} failed, retrying in {delay:?}"
            );
            if !wait_with_cancel(cancel, delay).await {
                return cancelled(attempts, start, recovery_actions, classification, error);
            }

            attempt += 1;
            delay_before = delay;
        }
    }

    /// Asks the backend for a fresh session. `true` only when one was established.
    pub async fn refresh_auth_token(&self) -> bool {
        match self.refresher.refresh().await {
            Ok(_) => {
                tracing::info!("session refreshed after authentication failure");
                true
            }
            Err(e) => {
                tracing::warn!("session refresh failed: {e}");
                false
            }
        }
    }

    /// Reachability of the backend. Never fails; errors read as unreachable.
    pub async fn test_connectivity(&self) -> bool {
        match self.probe.probe().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("connectivity probe failed: {e}");
                false
            }
        }
    }

    /// Snapshot of the error log, oldest first.
    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        self.log.snapshot()
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.log.stats()
    }

    pub fn clear_error_log(&self) {
        self.log.clear();
    }

    pub fn session_id(&self) -> &SessionId {
        self.log.session_id()
    }

    fn record_failure<E>(
        &self,
        error: &E,
        classification: ErrorClassification,
        context: &OperationContext,
        attempts: u32,
    ) where
        E: ErrorShape + fmt::Debug,
    {
        let descriptor = error.descriptor();
        tracing::error!(
            session_id = %self.log.session_id(),
            operation = context.operation(),
            %classification,
            attempts,
            "operation failed: {}",
            descriptor.message
        );
        self.log.record(ErrorLogEntry {
            error_type: classification,
            message: descriptor.message,
            original_error: format!("{error:?}"),
            timestamp: Utc::now(),
            context: context.clone(),
            stack_trace: error.stack_trace(),
            user_agent: self.environment.user_agent.clone(),
            url: self.environment.url.clone(),
            session_id: self.log.session_id().clone(),
        });
    }
}

fn trace_attempt(record: &AttemptRecord) {
    tracing::debug!(
        attempt = record.attempt_number,
        delay_before_ms = record.delay_before.as_millis() as u64,
        error = record.error.map(ErrorClassification::as_str),
        succeeded = record.succeeded,
        "attempt finished"
    );
}

fn cancelled<T, E>(
    attempts: u32,
    start: Instant,
    recovery_actions: Vec<RecoveryAction>,
    classification: ErrorClassification,
    error: E,
) -> RecoveryResult<T, E> {
    tracing::debug!("retry sequence cancelled after {attempts} attempts");
    RecoveryResult {
        outcome: Err(RecoveryFailure::Cancelled {
            last_error: Some((classification, error)),
        }),
        attempts,
        total_time: start.elapsed(),
        recovery_actions,
    }
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` on cancel.
async fn wait_with_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::classifier::OperationError;
    use crate::error::{RecoveryError, Result};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct StaticRefresher(bool);

    #[async_trait]
    impl SessionRefresher for StaticRefresher {
        async fn refresh(&self) -> Result<Session> {
            if self.0 {
                Ok(Session::new("fresh", None))
            } else {
                Err(RecoveryError::NoSession)
            }
        }
    }

    struct StaticProbe(bool);

    #[async_trait]
    impl ConnectivityProbe for StaticProbe {
        async fn probe(&self) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(RecoveryError::Unhealthy(503))
            }
        }
    }

    fn service(refresh_ok: bool, probe_ok: bool) -> ErrorRecoveryService {
        ErrorRecoveryService::new(
            Arc::new(StaticRefresher(refresh_ok)),
            Arc::new(StaticProbe(probe_ok)),
        )
    }

    #[test]
    fn action_names() {
        assert_eq!(
            RecoveryAction::TokenRefresh { succeeded: true }.to_string(),
            "token_refreshed"
        );
        assert_eq!(
            RecoveryAction::TokenRefresh { succeeded: false }.to_string(),
            "token_refresh_failed"
        );
    }

    #[test]
    fn failure_accessors() {
        let failed: RecoveryFailure<OperationError> = RecoveryFailure::Failed {
            classification: ErrorClassification::Validation,
            error: OperationError::new("Invalid input"),
        };
        assert_eq!(
            failed.classification(),
            Some(ErrorClassification::Validation)
        );
        assert_eq!(failed.to_string(), "validation error: Invalid input");
        assert_eq!(
            failed.user_message(),
            ErrorClassification::Validation.user_message()
        );
        assert!(!failed.is_cancelled());

        let cancelled: RecoveryFailure<OperationError> =
            RecoveryFailure::Cancelled { last_error: None };
        assert!(cancelled.is_cancelled());
        assert!(cancelled.error().is_none());
        assert_eq!(cancelled.to_string(), "cancelled");
    }

    #[tokio::test]
    async fn refresh_maps_to_bool() {
        assert!(service(true, true).refresh_auth_token().await);
        assert!(!service(false, true).refresh_auth_token().await);
    }

    #[tokio::test]
    async fn connectivity_maps_to_bool() {
        assert!(service(true, true).test_connectivity().await);
        assert!(!service(true, false).test_connectivity().await);
    }

    #[tokio::test]
    async fn wait_returns_false_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_with_cancel(&cancel, Duration::from_secs(60)).await);
        assert!(wait_with_cancel(&CancellationToken::new(), Duration::ZERO).await);
    }

    #[tokio::test]
    async fn immediate_success_records_nothing() {
        let svc = service(true, true);
        let result = svc
            .execute_with_retry(
                || async { Ok::<_, OperationError>(42) },
                OperationContext::named("noop"),
                None,
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.data(), Some(&42));
        assert_eq!(result.attempts, 1);
        assert!(result.recovery_actions.is_empty());
        assert!(svc.error_log().is_empty());
    }

    #[tokio::test]
    async fn terminal_failure_is_logged_with_environment() {
        let svc = service(true, true).with_environment(ClientEnvironment {
            user_agent: "desk-ui/1.0".to_string(),
            url: Some("https://desk.example.co/tickets".to_string()),
        });
        let result = svc
            .execute_with_retry(
                || async { Err::<(), _>(OperationError::new("Invalid input: email required")) },
                OperationContext::named("users.invite").with("team", "support"),
                None,
            )
            .await;

        assert!(!result.is_success());
        let log = svc.error_log();
        assert_eq!(log.len(), 1);
        let entry = &log[0];
        assert_eq!(entry.error_type, ErrorClassification::Validation);
        assert_eq!(entry.message, "Invalid input: email required");
        assert!(entry.original_error.contains("OperationError"));
        assert_eq!(entry.user_agent, "desk-ui/1.0");
        assert_eq!(entry.url.as_deref(), Some("https://desk.example.co/tickets"));
        assert_eq!(entry.context.operation(), "users.invite");
        assert_eq!(&entry.session_id, svc.session_id());

        svc.clear_error_log();
        assert_eq!(svc.error_stats().total_errors, 0);
    }
}
