use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::directory::{AuthError, PrincipalResolver};

/// Cleartext-password source backed by the principal directory.
/// The login name selects the account; its stored secret is the password.
pub struct DirectoryAuthSource {
    directory: Arc<dyn PrincipalResolver>,
}

impl DirectoryAuthSource {
    pub fn new(directory: Arc<dyn PrincipalResolver>) -> Self {
        Self { directory }
    }
}

impl std::fmt::Debug for DirectoryAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryAuthSource").finish_non_exhaustive()
    }
}

pub fn auth_err(e: AuthError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        e.code().into(),
        e.to_string(),
    )))
}

#[async_trait]
impl AuthSource for DirectoryAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.directory.secret_for(user).await {
            Ok(secret) => Ok(Password::new(None, secret.into_bytes())),
            Err(e) => {
                tracing::warn!("login refused: {e}");
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(auth_err(e))
            }
        }
    }
}
