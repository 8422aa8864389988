use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::circuit_breaker::{create_dialer_circuit_breaker, guarded, DialerBreaker};
use crate::errors::AppError;

const CREATE_PLAYBOOK: &str = r#"
mutation CreatePlaybook($input: CreatePlaybookInput!) {
  createPlaybook(input: $input) { id name status }
}"#;

const GET_PLAYBOOK: &str = r#"
query GetPlaybook($id: ID!) {
  getPlaybook(id: $id) { id name status }
}"#;

const UPDATE_PLAYBOOK: &str = r#"
mutation UpdatePlaybook($id: ID!, $input: UpdatePlaybookInput!) {
  updatePlaybook(id: $id, input: $input) { id name status }
}"#;

const START_PLAYBOOK: &str = r#"
mutation StartPlaybook($id: ID!) {
  startPlaybook(id: $id) { id name status }
}"#;

const STOP_PLAYBOOK: &str = r#"
mutation StopPlaybook($id: ID!) {
  stopPlaybook(id: $id) { id name status }
}"#;

const CREATE_CONTACT: &str = r#"
mutation CreateContact($input: CreateContactInput!) {
  createContact(input: $input) { id }
}"#;

const DELETE_CONTACTS: &str = r#"
mutation DeleteContacts($playbookId: ID!, $contactIds: [ID!]!) {
  deleteContacts(playbookId: $playbookId, contactIds: $contactIds) { deletedCount }
}"#;

/// A campaign as the dialer reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPlaybook {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedContact {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedContacts {
    deleted_count: u64,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

/// Client for the dialer platform's GraphQL API.
///
/// Every call goes through one circuit breaker; once it opens, calls fail
/// fast with `ExternalApiError` until the backoff elapses.
#[derive(Clone)]
pub struct PlaybookClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    breaker: DialerBreaker,
}

impl PlaybookClient {
    /// Creates a new `PlaybookClient`.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Full URL of the GraphQL endpoint.
    /// * `api_key` - Static key sent in the `x-api-key` header.
    pub fn new(endpoint: String, api_key: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create dialer client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            breaker: create_dialer_circuit_breaker(),
        })
    }

    pub async fn create_playbook(&self, name: &str) -> Result<ExternalPlaybook, AppError> {
        tracing::info!("Creating dialer playbook '{}'", name);
        self.execute(CREATE_PLAYBOOK, json!({ "input": { "name": name } }), "createPlaybook")
            .await
    }

    pub async fn get_playbook(&self, id: &str) -> Result<ExternalPlaybook, AppError> {
        self.execute(GET_PLAYBOOK, json!({ "id": id }), "getPlaybook")
            .await
    }

    pub async fn update_playbook(&self, id: &str, name: &str) -> Result<ExternalPlaybook, AppError> {
        self.execute(
            UPDATE_PLAYBOOK,
            json!({ "id": id, "input": { "name": name } }),
            "updatePlaybook",
        )
        .await
    }

    pub async fn start_playbook(&self, id: &str) -> Result<ExternalPlaybook, AppError> {
        tracing::info!("Starting dialer playbook {}", id);
        self.execute(START_PLAYBOOK, json!({ "id": id }), "startPlaybook")
            .await
    }

    pub async fn stop_playbook(&self, id: &str) -> Result<ExternalPlaybook, AppError> {
        tracing::info!("Stopping dialer playbook {}", id);
        self.execute(STOP_PLAYBOOK, json!({ "id": id }), "stopPlaybook")
            .await
    }

    /// Adds one contact to a playbook and returns the dialer's contact id.
    ///
    /// # Arguments
    ///
    /// * `playbook_id` - External playbook id.
    /// * `name` - Contact display name.
    /// * `phone` - E.164 phone number.
    pub async fn create_contact(
        &self,
        playbook_id: &str,
        name: &str,
        phone: &str,
    ) -> Result<String, AppError> {
        let created: CreatedContact = self
            .execute(
                CREATE_CONTACT,
                json!({
                    "input": {
                        "playbookId": playbook_id,
                        "name": name,
                        "phoneNumber": phone
                    }
                }),
                "createContact",
            )
            .await?;

        tracing::debug!("Dialer contact {} created in playbook {}", created.id, playbook_id);
        Ok(created.id)
    }

    /// Removes contacts from a playbook; returns how many the dialer deleted.
    pub async fn delete_contacts(
        &self,
        playbook_id: &str,
        contact_ids: &[String],
    ) -> Result<u64, AppError> {
        if contact_ids.is_empty() {
            return Ok(0);
        }
        let deleted: DeletedContacts = self
            .execute(
                DELETE_CONTACTS,
                json!({ "playbookId": playbook_id, "contactIds": contact_ids }),
                "deleteContacts",
            )
            .await?;

        tracing::info!(
            "Deleted {} of {} dialer contact(s) from playbook {}",
            deleted.deleted_count,
            contact_ids.len(),
            playbook_id
        );
        Ok(deleted.deleted_count)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        field: &str,
    ) -> Result<T, AppError> {
        guarded(&self.breaker, self.send(query, variables, field)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        field: &str,
    ) -> Result<T, AppError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Dialer request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Dialer returned {}: {}",
                status, error_text
            )));
        }

        let body: GraphQlResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse dialer response: {}", e))
        })?;

        parse_field(body, field)
    }
}

fn parse_field<T: DeserializeOwned>(body: GraphQlResponse, field: &str) -> Result<T, AppError> {
    if !body.errors.is_empty() {
        let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
        return Err(AppError::ExternalApiError(format!(
            "Dialer {} failed: {}",
            field,
            messages.join("; ")
        )));
    }

    let value = body
        .data
        .and_then(|mut data| data.get_mut(field).map(Value::take))
        .filter(|v| !v.is_null())
        .ok_or_else(|| {
            AppError::ExternalApiError(format!("Dialer response missing '{}'", field))
        })?;

    serde_json::from_value(value).map_err(|e| {
        AppError::ExternalApiError(format!("Unexpected dialer {} payload: {}", field, e))
    })
}
