use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use tollgate_core::config::IdentityConfig;
use tollgate_core::domain::principal::Principal;

pub const EMAIL_COOKIE: &str = "tollgate_email";
pub const EMAIL_HEADER: &str = "x-user-email";
pub const ADMIN_GROUP: &str = "admin";

/// Raw request data a resolver can draw identity from. Header names are
/// stored lowercase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestContext {
    headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve(&self, request: &RequestContext) -> Result<Principal>;
}

/// Email from cookie or header, `admin` for configured admin emails and the
/// default group for everyone else.
#[derive(Clone, Debug)]
pub struct EmailGroupResolver {
    default_email: String,
    default_group: String,
    admin_emails: BTreeSet<String>,
}

impl EmailGroupResolver {
    pub fn new(
        default_email: impl Into<String>,
        default_group: impl Into<String>,
        admin_emails: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            default_email: default_email.into(),
            default_group: default_group.into(),
            admin_emails: admin_emails
                .into_iter()
                .map(|email| email.as_ref().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self::new(config.default_email.clone(), config.default_group.clone(), &config.admin_emails)
    }
}

#[async_trait]
impl PrincipalResolver for EmailGroupResolver {
    async fn resolve(&self, request: &RequestContext) -> Result<Principal> {
        let email = request
            .cookies
            .get(EMAIL_COOKIE)
            .map(String::as_str)
            .or_else(|| request.header(EMAIL_HEADER))
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .unwrap_or(&self.default_email)
            .to_ascii_lowercase();
        if !email.contains('@') {
            bail!("`{email}` is not an email address");
        }

        let group = if self.admin_emails.contains(&email) {
            ADMIN_GROUP
        } else {
            self.default_group.as_str()
        };
        let username = email.split('@').next().unwrap_or_default().to_string();

        let mut principal = Principal::new(email.clone())
            .with_email(email)
            .with_username(username)
            .with_groups([group]);
        for (key, value) in &request.metadata {
            principal = principal.with_attribute(key.clone(), value.clone());
        }
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EmailGroupResolver, PrincipalResolver, RequestContext};

    fn resolver() -> EmailGroupResolver {
        EmailGroupResolver::new("guest@example.com", "user", ["Admin@Example.com"])
    }

    #[tokio::test]
    async fn cookie_wins_over_header() {
        let request = RequestContext::new()
            .with_cookie("tollgate_email", "ana@example.com")
            .with_header("X-User-Email", "bo@example.com");

        let principal = resolver().resolve(&request).await.expect("principal");

        assert_eq!(principal.id, "ana@example.com");
        assert_eq!(principal.username.as_deref(), Some("ana"));
        assert!(principal.in_group("user"));
    }

    #[tokio::test]
    async fn header_is_case_insensitive_and_admins_are_recognized() {
        let request = RequestContext::new().with_header("X-USER-EMAIL", " admin@example.com ");

        let principal = resolver().resolve(&request).await.expect("principal");

        assert!(principal.in_group("admin"));
        assert!(!principal.in_group("user"));
    }

    #[tokio::test]
    async fn anonymous_requests_get_the_default_identity_and_keep_metadata() {
        let request = RequestContext::new().with_metadata("locale", json!("de-DE"));

        let principal = resolver().resolve(&request).await.expect("principal");

        assert_eq!(principal.email.as_deref(), Some("guest@example.com"));
        assert_eq!(principal.attributes.get("locale"), Some(&json!("de-DE")));
    }

    #[tokio::test]
    async fn malformed_email_is_rejected() {
        let request = RequestContext::new().with_cookie("tollgate_email", "not-an-email");
        assert!(resolver().resolve(&request).await.is_err());
    }
}
