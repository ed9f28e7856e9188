//! Retry orchestration across directory endpoints.
//!
//! Every public operation is an [`Operation`] run by [`RetryOrchestrator::execute`]. The
//! orchestrator ranks the server's endpoints once per call, then walks the ranking: the `n`th
//! endpoint contacted is the candidate at offset `n`, wrapping around when there are fewer
//! candidates than attempts. A transient failure is charged to the endpoint that was contacted
//! and the next candidate is tried; any other failure ends the call.

use crate::{
    factory::{release, SessionFactory},
    resolver::{Endpoint, EndpointResolver, RankedEndpoints},
    session::DirectorySession,
    Result,
};
use async_trait::async_trait;
use directory_core::Error;
use tracing::{debug, error, warn};

/// One unit of work run against a bound session.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Value produced on success.
    type Output: Send;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs the operation.
    ///
    /// `endpoint` is the server the session is bound to, for operations that need a second
    /// connection to the same machine.
    async fn run(
        &self,
        session: &mut dyn DirectorySession,
        endpoint: &Endpoint,
    ) -> Result<Self::Output>;
}

/// Bounded failover loop around [`Operation`]s.
pub struct RetryOrchestrator {
    resolver: EndpointResolver,
    factory: SessionFactory,
    server: String,
    max_attempts: u32,
    local: Endpoint,
}

impl RetryOrchestrator {
    /// Creates an orchestrator for `server`.
    ///
    /// An empty `server` means the local directory at `local`, used once without failover.
    #[must_use]
    pub fn new(
        resolver: EndpointResolver,
        factory: SessionFactory,
        server: impl Into<String>,
        max_attempts: u32,
        local: Endpoint,
    ) -> Self {
        Self {
            resolver,
            factory,
            server: server.into(),
            max_attempts: max_attempts.max(1),
            local,
        }
    }

    /// The session factory used for every attempt.
    #[must_use]
    pub const fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// The endpoint resolver used for every attempt.
    #[must_use]
    pub const fn resolver(&self) -> &EndpointResolver {
        &self.resolver
    }

    /// Runs `operation`, failing over between endpoints on transient errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerUnavailable`] once `max_attempts` attempts have failed
    /// transiently (or the local directory failed transiently), or the first non-transient
    /// error unchanged.
    pub async fn execute<O: Operation>(&self, operation: &O) -> Result<O::Output> {
        if self.server.is_empty() {
            return match self.attempt(operation, &self.local).await {
                Err(Error::Transient { endpoint, message }) => {
                    error!(
                        %endpoint,
                        operation = operation.name(),
                        %message,
                        "local directory unavailable"
                    );
                    Err(Error::ServerUnavailable(format!("{endpoint}: {message}")))
                }
                outcome => outcome,
            };
        }

        let mut ranked: Option<RankedEndpoints> = None;
        let mut contacted = 0;
        let mut last_failure = String::new();

        for attempt in 0..self.max_attempts {
            if ranked.is_none() {
                match self.resolver.rank(&self.server).await {
                    Ok(endpoints) => ranked = Some(endpoints),
                    Err(err) => {
                        warn!(
                            server = %self.server,
                            operation = operation.name(),
                            attempt,
                            error = %err,
                            "failed to resolve directory server"
                        );
                        last_failure = err.to_string();
                        continue;
                    }
                }
            }
            let Some(endpoints) = ranked.as_ref() else {
                continue;
            };

            let endpoint = endpoints.select(contacted);
            contacted += 1;
            match self.attempt(operation, endpoint).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_transient() => {
                    warn!(
                        %endpoint,
                        operation = operation.name(),
                        attempt,
                        error = %err,
                        "directory endpoint failed, trying next candidate"
                    );
                    self.resolver.record_failure(endpoint);
                    last_failure = err.to_string();
                }
                Err(err) => {
                    if err.should_log() {
                        error!(
                            %endpoint,
                            operation = operation.name(),
                            code = err.error_code(),
                            error = %err,
                            "directory operation failed"
                        );
                    } else {
                        debug!(
                            %endpoint,
                            operation = operation.name(),
                            code = err.error_code(),
                            error = %err,
                            "directory operation rejected"
                        );
                    }
                    return Err(err);
                }
            }
        }

        error!(
            server = %self.server,
            operation = operation.name(),
            attempts = self.max_attempts,
            last_failure = %last_failure,
            "directory server unavailable"
        );
        Err(Error::ServerUnavailable(format!(
            "{}: no endpoint answered after {} attempts ({last_failure})",
            self.server, self.max_attempts
        )))
    }

    async fn attempt<O: Operation>(
        &self,
        operation: &O,
        endpoint: &Endpoint,
    ) -> Result<O::Output> {
        let mut session = self.factory.open(endpoint).await?;
        debug!(%endpoint, operation = operation.name(), "running directory operation");
        let outcome = operation.run(session.as_mut(), endpoint).await;
        release(session.as_mut(), endpoint).await;
        outcome
    }
}
