use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{Principal, Role};

#[derive(Debug)]
pub enum AuthError {
    /// Unknown login.
    Unauthenticated(String),
    /// Known login whose account is deactivated.
    Inactive(String),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated(_) => "28P01",
            AuthError::Inactive(_) => "28000",
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Unauthenticated(login) => write!(f, "authentication failed for \"{login}\""),
            AuthError::Inactive(login) => write!(f, "account \"{login}\" is inactive"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Public account details joined into booking listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Ulid,
    pub login: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

/// Identity collaborator: turns login names into principals.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    /// The stored secret for `login`, checked by the wire handshake.
    /// Inactive accounts are refused here, before any password exchange.
    async fn secret_for(&self, login: &str) -> Result<String, AuthError>;

    /// The principal `login` acts as. Re-resolved on every statement so a
    /// deactivation takes effect immediately.
    async fn resolve(&self, login: &str) -> Result<Principal, AuthError>;

    async fn profile(&self, id: Ulid) -> Option<Profile>;
}

#[derive(Debug)]
pub enum DirectoryError {
    Io(io::Error),
    Parse(serde_json::Error),
    DuplicateLogin(String),
    DuplicateId(Ulid),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Io(e) => write!(f, "cannot read principals file: {e}"),
            DirectoryError::Parse(e) => write!(f, "invalid principals file: {e}"),
            DirectoryError::DuplicateLogin(login) => write!(f, "duplicate login: {login}"),
            DirectoryError::DuplicateId(id) => write!(f, "duplicate account id: {id}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<io::Error> for DirectoryError {
    fn from(e: io::Error) -> Self {
        DirectoryError::Io(e)
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(e: serde_json::Error) -> Self {
        DirectoryError::Parse(e)
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct Account {
    id: Ulid,
    login: String,
    password: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    role: Role,
    #[serde(default = "default_active")]
    active: bool,
}

impl Account {
    fn principal(&self) -> Principal {
        Principal {
            id: self.id,
            role: self.role,
            active: self.active,
        }
    }
}

/// Accounts loaded once from a JSON file.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    by_login: HashMap<String, Account>,
    login_by_id: HashMap<Ulid, String>,
}

impl StaticDirectory {
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        let dir = Self::from_json(&raw)?;
        tracing::info!("loaded {} principals from {}", dir.len(), path.display());
        Ok(dir)
    }

    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let accounts: Vec<Account> = serde_json::from_str(raw)?;
        let mut dir = Self::default();
        for account in accounts {
            if dir.login_by_id.contains_key(&account.id) {
                return Err(DirectoryError::DuplicateId(account.id));
            }
            if dir.by_login.contains_key(&account.login) {
                return Err(DirectoryError::DuplicateLogin(account.login));
            }
            dir.login_by_id.insert(account.id, account.login.clone());
            dir.by_login.insert(account.login.clone(), account);
        }
        Ok(dir)
    }

    pub fn len(&self) -> usize {
        self.by_login.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_login.is_empty()
    }

    fn account(&self, login: &str) -> Result<&Account, AuthError> {
        let account = self
            .by_login
            .get(login)
            .ok_or_else(|| AuthError::Unauthenticated(login.to_string()))?;
        if !account.active {
            return Err(AuthError::Inactive(login.to_string()));
        }
        Ok(account)
    }
}

#[async_trait]
impl PrincipalResolver for StaticDirectory {
    async fn secret_for(&self, login: &str) -> Result<String, AuthError> {
        self.account(login).map(|a| a.password.clone())
    }

    async fn resolve(&self, login: &str) -> Result<Principal, AuthError> {
        self.account(login).map(Account::principal)
    }

    async fn profile(&self, id: Ulid) -> Option<Profile> {
        let login = self.login_by_id.get(&id)?;
        let account = self.by_login.get(login)?;
        Some(Profile {
            id,
            login: account.login.clone(),
            display_name: account.display_name.clone(),
            email: account.email.clone(),
        })
    }
}
