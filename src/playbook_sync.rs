use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::{ContactSyncStatus, Playbook, PlaybookContact, PlaybookStatus};
use crate::playbook_client::PlaybookClient;

const PLAYBOOK_COLUMNS: &str = "id, name, external_id, status, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, playbook_id, lead_id, name, phone, external_contact_id, \
                               sync_status, error_message, synced_at";

/// Normalizes a phone number to E.164, assuming Malaysia for local formats.
pub fn normalize_phone(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.len() < 7 {
        return Err(format!("Phone '{}' is too short", trimmed));
    }

    match phonenumber::parse(Some(CountryId::MY), trimmed) {
        Ok(number) if phonenumber::is_valid(&number) => {
            Ok(number.format().mode(Mode::E164).to_string())
        }
        Ok(_) => Err(format!("Phone '{}' is not a valid number", trimmed)),
        Err(e) => Err(format!("Phone '{}' could not be parsed: {:?}", trimmed, e)),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactSyncDetail {
    pub contact_id: Uuid,
    pub phone: String,
    pub status: ContactSyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_contact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of one sync run; a failed contact never stops the others.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub details: Vec<ContactSyncDetail>,
}

impl SyncResult {
    fn push(&mut self, detail: ContactSyncDetail) {
        self.total += 1;
        if detail.status == ContactSyncStatus::Created {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.details.push(detail);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookAction {
    Start,
    Stop,
}

/// Keeps local playbook rows in step with the dialer.
pub struct PlaybookSync {
    pool: PgPool,
    client: PlaybookClient,
}

impl PlaybookSync {
    pub fn new(pool: PgPool, client: PlaybookClient) -> Self {
        Self { pool, client }
    }

    pub async fn get(&self, id: Uuid) -> Result<Playbook, AppError> {
        sqlx::query_as::<_, Playbook>(&format!(
            "SELECT {} FROM playbooks WHERE id = $1",
            PLAYBOOK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Playbook {} not found", id)))
    }

    /// Pushes every `pending` contact of a playbook to the dialer, creating
    /// the remote playbook first when it does not exist yet.
    #[tracing::instrument(skip(self))]
    pub async fn sync_contacts(&self, playbook_id: Uuid) -> Result<SyncResult, AppError> {
        let playbook = self.get(playbook_id).await?;
        let external_id = self.ensure_external(&playbook).await?;

        let contacts = sqlx::query_as::<_, PlaybookContact>(&format!(
            "SELECT {} FROM playbook_contacts WHERE playbook_id = $1 AND sync_status = $2 ORDER BY created_at",
            CONTACT_COLUMNS
        ))
        .bind(playbook_id)
        .bind(ContactSyncStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .context("load pending contacts")?;

        let mut result = SyncResult::default();
        for contact in contacts {
            let detail = self.sync_one(&external_id, &contact).await;
            self.record(&detail).await?;
            result.push(detail);
        }

        tracing::info!(
            "Playbook {} sync: {} contact(s), {} created, {} failed",
            playbook_id,
            result.total,
            result.succeeded,
            result.failed
        );
        Ok(result)
    }

    /// Syncs every playbook that still has pending contacts.
    pub async fn sync_all(&self) -> Result<Vec<(Uuid, Result<SyncResult, String>)>, AppError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT playbook_id FROM playbook_contacts WHERE sync_status = $1",
        )
        .bind(ContactSyncStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .context("load playbooks with pending contacts")?;

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.sync_contacts(id).await.map_err(|e| {
                tracing::error!("Playbook {} sync failed: {}", id, e);
                e.public_message()
            });
            results.push((id, outcome));
        }
        Ok(results)
    }

    /// Deletes remote contacts, then the local playbook and its contacts.
    /// Local rows stay when the dialer call fails.
    #[tracing::instrument(skip(self))]
    pub async fn delete_playbook(&self, playbook_id: Uuid) -> Result<u64, AppError> {
        let playbook = self.get(playbook_id).await?;

        let mut remote_deleted = 0;
        if let Some(external_id) = playbook.external_id.as_deref() {
            let contact_ids = sqlx::query_scalar::<_, String>(
                "SELECT external_contact_id FROM playbook_contacts
                 WHERE playbook_id = $1 AND external_contact_id IS NOT NULL AND sync_status <> $2",
            )
            .bind(playbook_id)
            .bind(ContactSyncStatus::Removed.as_str())
            .fetch_all(&self.pool)
            .await
            .context("load synced contacts")?;

            remote_deleted = self.client.delete_contacts(external_id, &contact_ids).await?;
        }

        sqlx::query("DELETE FROM playbooks WHERE id = $1")
            .bind(playbook_id)
            .execute(&self.pool)
            .await
            .context("delete playbook")?;

        tracing::info!(
            "Playbook {} deleted ({} dialer contact(s) removed)",
            playbook_id,
            remote_deleted
        );
        Ok(remote_deleted)
    }

    pub async fn apply_action(
        &self,
        playbook_id: Uuid,
        action: PlaybookAction,
    ) -> Result<Playbook, AppError> {
        let playbook = self.get(playbook_id).await?;
        let external_id = playbook.external_id.as_deref().ok_or_else(|| {
            AppError::Conflict(format!(
                "Playbook '{}' has not been synced to the dialer yet",
                playbook.name
            ))
        })?;

        let status = match action {
            PlaybookAction::Start => {
                self.client.start_playbook(external_id).await?;
                PlaybookStatus::Running
            }
            PlaybookAction::Stop => {
                self.client.stop_playbook(external_id).await?;
                PlaybookStatus::Stopped
            }
        };

        let updated = sqlx::query_as::<_, Playbook>(&format!(
            "UPDATE playbooks SET status = $2, updated_at = now() WHERE id = $1 RETURNING {}",
            PLAYBOOK_COLUMNS
        ))
        .bind(playbook_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .context("update playbook status")?;

        tracing::info!("Playbook {} is now {}", playbook_id, status);
        Ok(updated)
    }

    async fn ensure_external(&self, playbook: &Playbook) -> Result<String, AppError> {
        if let Some(id) = &playbook.external_id {
            return Ok(id.clone());
        }

        let created = self.client.create_playbook(&playbook.name).await?;
        sqlx::query("UPDATE playbooks SET external_id = $2, updated_at = now() WHERE id = $1")
            .bind(playbook.id)
            .bind(&created.id)
            .execute(&self.pool)
            .await
            .context("store external playbook id")?;

        Ok(created.id)
    }

    async fn sync_one(&self, external_playbook_id: &str, contact: &PlaybookContact) -> ContactSyncDetail {
        let failed = |error: String| ContactSyncDetail {
            contact_id: contact.id,
            phone: contact.phone.clone(),
            status: ContactSyncStatus::Failed,
            external_contact_id: None,
            error: Some(error),
        };

        let phone = match normalize_phone(&contact.phone) {
            Ok(phone) => phone,
            Err(error) => return failed(error),
        };

        match self
            .client
            .create_contact(external_playbook_id, &contact.name, &phone)
            .await
        {
            Ok(external_id) => ContactSyncDetail {
                contact_id: contact.id,
                phone,
                status: ContactSyncStatus::Created,
                external_contact_id: Some(external_id),
                error: None,
            },
            Err(e) => {
                tracing::warn!("Contact {} not synced: {}", contact.id, e);
                failed(e.to_string())
            }
        }
    }

    async fn record(&self, detail: &ContactSyncDetail) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE playbook_contacts
            SET sync_status = $2, external_contact_id = $3, error_message = $4, phone = $5,
                synced_at = CASE WHEN $2 = 'created' THEN now() ELSE synced_at END
            WHERE id = $1
            "#,
        )
        .bind(detail.contact_id)
        .bind(detail.status.as_str())
        .bind(&detail.external_contact_id)
        .bind(&detail.error)
        .bind(&detail.phone)
        .execute(&self.pool)
        .await
        .context("record contact sync")?;

        Ok(())
    }
}
