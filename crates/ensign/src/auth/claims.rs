//! Claims carried by Ensign access tokens.

use ensign_api::{parse_ulid_str, IdError};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Permission strings granted to API keys and users.
pub mod permissions {
    pub const PUBLISHER: &str = "publisher";
    pub const SUBSCRIBER: &str = "subscriber";
    pub const READ_TOPICS: &str = "readtopics";
    pub const READ_METRICS: &str = "readmetrics";
    pub const CREATE_TOPICS: &str = "topics:create";
    pub const EDIT_TOPICS: &str = "topics:edit";
    pub const DESTROY_TOPICS: &str = "topics:destroy";

    /// Older tokens spell the read permissions with the resource prefix.
    pub(super) const ALIASES: &[(&str, &str)] = &[
        (READ_TOPICS, "topics:read"),
        (READ_METRICS, "metrics:read"),
    ];
}

/// Verified claims of a bearer token. The raw token never leaves the authenticator,
/// handlers only see these claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub picture: String,
    #[serde(default, rename = "org", skip_serializing_if = "String::is_empty")]
    pub org_id: String,
    #[serde(default, rename = "project", skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn has_permission(&self, permission: &str) -> bool {
        let alias = permissions::ALIASES
            .iter()
            .find_map(|(name, alias)| match permission {
                p if p == *name => Some(*alias),
                p if p == *alias => Some(*name),
                _ => None,
            });

        self.permissions
            .iter()
            .any(|granted| granted == permission || Some(granted.as_str()) == alias)
    }

    /// True only if every listed permission is granted; an empty list is never
    /// satisfied.
    pub fn has_all_permissions(&self, required: &[&str]) -> bool {
        !required.is_empty() && required.iter().all(|perm| self.has_permission(perm))
    }

    pub fn has_any_permission(&self, required: &[&str]) -> bool {
        required.iter().any(|perm| self.has_permission(perm))
    }

    pub fn parse_org_id(&self) -> Result<Ulid, IdError> {
        parse_ulid_str(&self.org_id)
    }

    pub fn parse_project_id(&self) -> Result<Ulid, IdError> {
        parse_ulid_str(&self.project_id)
    }

    /// True if the claims grant access to the specified project.
    pub fn validate_project(&self, project_id: Ulid) -> bool {
        !project_id.is_nil() && self.parse_project_id().is_ok_and(|id| id == project_id)
    }
}
