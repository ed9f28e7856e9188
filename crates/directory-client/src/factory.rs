//! Opens bound sessions to resolved endpoints.

use crate::{
    config::Credentials,
    resolver::Endpoint,
    session::{Connector, DirectorySession},
    Result,
};
use std::sync::Arc;
use tracing::debug;

/// Connects and binds sessions with the client's credentials.
pub struct SessionFactory {
    connector: Arc<dyn Connector>,
    credentials: Option<Arc<Credentials>>,
}

impl SessionFactory {
    /// Creates a factory. Without credentials, sessions bind as the calling process.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, credentials: Option<Arc<Credentials>>) -> Self {
        Self {
            connector,
            credentials,
        }
    }

    /// Opens a session to `endpoint` bound with the configured identity.
    ///
    /// # Errors
    ///
    /// Returns [`directory_core::Error::Transient`] if the endpoint cannot be reached, or the
    /// bind error otherwise.
    pub async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn DirectorySession>> {
        let mut session = self.connector.connect(endpoint).await?;
        let bound = match &self.credentials {
            Some(credentials) => {
                session
                    .simple_bind(credentials.username(), credentials.password())
                    .await
            }
            None => session.ambient_bind().await,
        };
        if let Err(err) = bound {
            release(session.as_mut(), endpoint).await;
            return Err(err);
        }
        debug!(
            %endpoint,
            explicit = self.credentials.is_some(),
            "opened directory session"
        );
        Ok(session)
    }

    /// Opens a session to `endpoint` bound as `dn` with `password`.
    ///
    /// # Errors
    ///
    /// Returns [`directory_core::Error::Authentication`] if the server rejects the credentials.
    pub async fn open_as(
        &self,
        endpoint: &Endpoint,
        dn: &str,
        password: &str,
    ) -> Result<Box<dyn DirectorySession>> {
        let mut session = self.connector.connect(endpoint).await?;
        if let Err(err) = session.simple_bind(dn, password).await {
            release(session.as_mut(), endpoint).await;
            return Err(err);
        }
        Ok(session)
    }
}

/// Unbinds, logging rather than propagating failures.
pub(crate) async fn release(session: &mut dyn DirectorySession, endpoint: &Endpoint) {
    if let Err(err) = session.unbind().await {
        debug!(%endpoint, error = %err, "failed to release directory session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockConnector, MockDirectorySession};
    use directory_core::Error;
    use mockall::predicate::eq;
    use std::net::IpAddr;

    fn endpoint() -> Endpoint {
        Endpoint::new("dc.corp.example", IpAddr::from([192, 0, 2, 1]), 389, false)
    }

    fn connector_with(session: MockDirectorySession) -> Arc<dyn Connector> {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(Box::new(session)));
        Arc::new(connector)
    }

    #[tokio::test]
    async fn explicit_credentials_use_simple_bind() {
        let mut session = MockDirectorySession::new();
        session
            .expect_simple_bind()
            .with(eq("svc@corp.example"), eq("secret"))
            .times(1)
            .returning(|_, _| Ok(()));
        session.expect_ambient_bind().never();

        let factory = SessionFactory::new(
            connector_with(session),
            Some(Arc::new(Credentials::new("svc@corp.example", "secret"))),
        );
        assert!(factory.open(&endpoint()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_credentials_use_the_process_identity() {
        let mut session = MockDirectorySession::new();
        session.expect_simple_bind().never();
        session.expect_ambient_bind().times(1).returning(|| Ok(()));

        let factory = SessionFactory::new(connector_with(session), None);
        assert!(factory.open(&endpoint()).await.is_ok());
    }

    #[tokio::test]
    async fn failed_bind_releases_the_session() {
        let mut session = MockDirectorySession::new();
        session
            .expect_simple_bind()
            .returning(|_, _| Err(Error::Authentication("invalid credentials".into())));
        session.expect_unbind().times(1).returning(|| Ok(()));

        let factory = SessionFactory::new(connector_with(session), None);
        let err = factory
            .open_as(&endpoint(), "CN=Jane,DC=corp", "wrong")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_passed_through() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(|endpoint| Err(Error::transient(endpoint, "connection refused")));

        let factory = SessionFactory::new(Arc::new(connector), None);
        let err = factory.open(&endpoint()).await.err().unwrap();
        assert!(err.is_transient());
    }
}
