//! Startup bootstrap of access-control records
//!
//! Ensures a default group and an `admin` user exist and puts every application without
//! a group into the default group. Only missing records are created, so it is safe to
//! call on every startup.

use crate::auth::{hash_password, AuthError};
use crate::core::Application;
use crate::persistence::{AccessStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_GROUP: &str = "default";
pub const ADMIN_USER: &str = "admin";
const ADMIN_PASSWORD: &str = "admin";

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("seed: {0}")]
    Store(#[from] StoreError),

    #[error("seed: {0}")]
    Auth(#[from] AuthError),
}

/// What a seeding pass created
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub default_group_id: i64,
    pub created_group: bool,
    pub created_admin: bool,
    /// Applications that were assigned to the default group
    pub assigned_apps: Vec<String>,
}

pub async fn run<S>(store: &S, apps: &[Application]) -> Result<SeedReport, SeedError>
where
    S: AccessStore + ?Sized,
{
    let mut report = SeedReport::default();

    let groups = store.list_groups().await?;
    report.default_group_id = match groups.iter().find(|g| g.name == DEFAULT_GROUP) {
        Some(group) => group.id,
        None => match groups.first() {
            Some(group) => group.id,
            None => {
                let id = store.create_group(DEFAULT_GROUP).await?;
                info!("Created group '{}' (id={})", DEFAULT_GROUP, id);
                report.created_group = true;
                id
            }
        },
    };

    if store.list_users().await?.is_empty() {
        let hash = hash_password(ADMIN_PASSWORD)?;
        let admin_id = store.create_user(ADMIN_USER, &hash).await?;
        store
            .set_user_groups(admin_id, &[report.default_group_id])
            .await?;
        info!("Created user '{}' with the default password", ADMIN_USER);
        report.created_admin = true;
    }

    for app in apps {
        if store.app_group_ids(&app.id).await?.is_empty() {
            store
                .set_app_groups(&app.id, &[report.default_group_id])
                .await?;
            debug!("Assigned {} to group {}", app.id, report.default_group_id);
            report.assigned_apps.push(app.id.clone());
        }
    }

    Ok(report)
}
