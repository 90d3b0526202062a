use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::MAX_PRINCIPAL_LEN;
use crate::model::BookingSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Staff,
    Customer,
    System,
}

/// Who is acting. Supplies `created_by` / `updated_by` on every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    /// The principal the sweeper acts as.
    pub fn sweeper() -> Self {
        Self::new("system:sweeper", Role::System)
    }

    pub fn source(&self) -> BookingSource {
        match self.role {
            Role::Staff => BookingSource::Staff,
            Role::Customer => BookingSource::Customer,
            Role::System => BookingSource::System,
        }
    }

    /// Walk-ins, schedule actions and directory admin are staff-only.
    pub fn ensure_staff(&self, what: &'static str) -> Result<(), EngineError> {
        match self.role {
            Role::Staff | Role::System => Ok(()),
            Role::Customer => Err(EngineError::Forbidden(what)),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id, self.role)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    BadPassword,
    BadPrincipal(&'static str),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::BadPassword => f.write_str("password authentication failed"),
            AuthError::BadPrincipal(msg) => write!(f, "invalid principal: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Shared-password check for API connections. Identity beyond the claimed
/// principal is established upstream.
#[derive(Debug, Clone)]
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }

    pub fn authenticate(&self, password: &str, principal: Principal) -> Result<Principal, AuthError> {
        if !constant_time_eq(password.as_bytes(), self.password.as_bytes()) {
            return Err(AuthError::BadPassword);
        }
        if principal.id.trim().is_empty() {
            return Err(AuthError::BadPrincipal("id must not be empty"));
        }
        if principal.id.len() > MAX_PRINCIPAL_LEN {
            return Err(AuthError::BadPrincipal("id too long"));
        }
        if principal.role == Role::System {
            return Err(AuthError::BadPrincipal("system role is internal"));
        }
        Ok(principal)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_password() {
        let auth = PasswordAuth::new("secret".into());
        let p = auth.authenticate("secret", Principal::new("alice", Role::Staff)).unwrap();
        assert_eq!(p.source(), BookingSource::Staff);
    }

    #[test]
    fn rejects_wrong_password_and_bad_principals() {
        let auth = PasswordAuth::new("secret".into());
        assert_eq!(
            auth.authenticate("nope", Principal::new("alice", Role::Staff)),
            Err(AuthError::BadPassword)
        );
        assert!(matches!(
            auth.authenticate("secret", Principal::new("  ", Role::Customer)),
            Err(AuthError::BadPrincipal(_))
        ));
        assert!(matches!(
            auth.authenticate("secret", Principal::new("cron", Role::System)),
            Err(AuthError::BadPrincipal(_))
        ));
    }

    #[test]
    fn customers_cannot_act_as_staff() {
        assert!(Principal::new("bob", Role::Customer).ensure_staff("walk-ins").is_err());
        assert!(Principal::sweeper().ensure_staff("walk-ins").is_ok());
    }
}
