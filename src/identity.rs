use crate::{config::Credentials, Client, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    auth: TokenAuth<'a>,
}

#[derive(Debug, Serialize)]
struct TokenAuth<'a> {
    #[serde(rename = "tenantName")]
    tenant_name: &'a str,
    #[serde(rename = "passwordCredentials")]
    password_credentials: PasswordCredentials<'a>,
}

#[derive(Debug, Serialize)]
struct PasswordCredentials<'a> {
    username: &'a str,
    password: &'a str,
}

impl<'a> From<&'a Credentials> for TokenRequest<'a> {
    fn from(creds: &'a Credentials) -> Self {
        TokenRequest {
            auth: TokenAuth {
                tenant_name: &creds.tenant_name,
                password_credentials: PasswordCredentials {
                    username: &creds.username,
                    password: &creds.password,
                },
            },
        }
    }
}

/// Pulls `access.token.id` out of a token response body.
pub(crate) fn token_id(body: &serde_json::Value) -> Result<String> {
    body.pointer("/access/token/id")
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Authentication("response has no access.token.id".into()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGroup {
    pub id: String,
    #[serde(default)]
    pub filters: EndpointFilters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointFilters {
    #[serde(default)]
    pub region_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_cloud_project: bool,
    #[serde(default)]
    pub enabled: bool,
}

/// A user record. Only the tier markers matter here, their values are start dates that are
/// never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_started_at: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_started_at: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    #[serde(default)]
    pub user: Option<AssignedUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedUser {
    pub id: String,
}

#[derive(Deserialize)]
struct EndpointGroups {
    endpoint_groups: Vec<EndpointGroup>,
}

#[derive(Deserialize)]
struct Projects {
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: User,
}

#[derive(Deserialize)]
struct RoleAssignments {
    role_assignments: Vec<RoleAssignment>,
}

/// Read side of the identity service used by the census.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn endpoint_groups(&self) -> Result<Vec<EndpointGroup>>;

    async fn endpoint_group_projects(&self, group_id: &str) -> Result<Vec<Project>>;

    /// Looks a user up by name or by id, the service accepts both.
    async fn user(&self, name_or_id: &str) -> Result<User>;

    async fn role_assignments(&self, project_id: &str) -> Result<Vec<RoleAssignment>>;
}

impl Client {
    pub(crate) async fn issue_token(&self, credentials: &Credentials) -> Result<String> {
        let body: serde_json::Value = self
            .post_json(&["v2.0", "tokens"], &TokenRequest::from(credentials))
            .await?
            .json()
            .await?;
        token_id(&body)
    }
}

#[async_trait]
impl IdentityApi for Client {
    async fn endpoint_groups(&self) -> Result<Vec<EndpointGroup>> {
        let EndpointGroups { endpoint_groups } =
            self.get(&["v3", "OS-EP-FILTER", "endpoint_groups"]).await?;
        Ok(endpoint_groups)
    }

    async fn endpoint_group_projects(&self, group_id: &str) -> Result<Vec<Project>> {
        let Projects { projects } = self
            .get(&["v3", "OS-EP-FILTER", "endpoint_groups", group_id, "projects"])
            .await?;
        Ok(projects)
    }

    async fn user(&self, name_or_id: &str) -> Result<User> {
        let UserEnvelope { user } = self.get(&["v3", "users", name_or_id]).await?;
        Ok(user)
    }

    async fn role_assignments(&self, project_id: &str) -> Result<Vec<RoleAssignment>> {
        let RoleAssignments { role_assignments } = self
            .get_query(
                &["v3", "role_assignments"],
                &[("scope.project.id", project_id)],
            )
            .await?;
        Ok(role_assignments)
    }
}
