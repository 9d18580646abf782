use async_trait::async_trait;
use chrono::{DateTime, Utc};

use golive_core::types::{
    AccountProfile, DeliveryClaim, DeliveryRecord, RenderedMessage, TenantConfig, TrackedAccount,
};
use golive_discord::DiscordClient;
use golive_storage::Database;

use crate::fanout::{ChatSender, ClaimStore, CollaboratorError, TenantDirectory};

#[async_trait]
impl TenantDirectory for Database {
    async fn resolve_account(
        &self,
        twitch_user_id: &str,
    ) -> Result<Option<TrackedAccount>, CollaboratorError> {
        Ok(self.accounts().find_by_twitch_id(twitch_user_id).await?)
    }

    async fn refresh_account(
        &self,
        account_id: &str,
        profile: &AccountProfile,
        now: DateTime<Utc>,
    ) -> Result<(), CollaboratorError> {
        Ok(self
            .accounts()
            .update_profile(account_id, profile, now)
            .await?)
    }

    async fn list_tracking_tenants(
        &self,
        account_id: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        Ok(self.tracking().list_tenants_tracking(account_id).await?)
    }

    async fn tenant_config(&self, tenant_id: &str) -> Result<TenantConfig, CollaboratorError> {
        Ok(self.tenants().fetch_config(tenant_id).await?)
    }

    async fn account_override(
        &self,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        Ok(self.tracking().fetch_override(tenant_id, account_id).await?)
    }
}

#[async_trait]
impl ClaimStore for Database {
    async fn try_claim(&self, claim: &DeliveryClaim) -> Result<bool, CollaboratorError> {
        Ok(self.claims().try_claim(claim).await?.is_claimed())
    }

    async fn log_delivery(&self, record: &DeliveryRecord) -> Result<(), CollaboratorError> {
        Ok(self.claims().log_delivery(record).await?)
    }
}

#[async_trait]
impl ChatSender for DiscordClient {
    async fn send(
        &self,
        channel_id: &str,
        message: &RenderedMessage,
    ) -> Result<Option<String>, CollaboratorError> {
        Ok(self.send_message(channel_id, message).await?)
    }
}
