use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, warn};

use crate::config;
use crate::keycloak::IdentityProvider;
use crate::models::{Instance, Product, UserProfile};

/// Product-specific grant/revoke logic, invoked after allocation decisions.
/// Runs inside the caller's transaction so group mutations stay serialized
/// with the profile lock.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idp: &dyn IdentityProvider,
        profile: &UserProfile,
        product: &Product,
        instance: Option<&Instance>,
    ) -> Result<bool>;

    async fn deprovision(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idp: &dyn IdentityProvider,
        profile: &UserProfile,
        product: &Product,
        instance: Option<&Instance>,
    ) -> Result<bool>;
}

async fn instance_group_names(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: i32,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT group_name FROM instance_groups WHERE instance_id = $1 ORDER BY group_name",
    )
    .bind(instance_id)
    .fetch_all(&mut *tx)
    .await?;
    Ok(rows.into_iter().map(|row| row.get("group_name")).collect())
}

/// Mirror one local membership change into the identity provider. Missing
/// groups on the identity side are skipped, not fatal.
async fn mirror_group_change(
    idp: &dyn IdentityProvider,
    keycloak_id: &str,
    group_name: &str,
    add: bool,
) -> Result<()> {
    if keycloak_id.is_empty() {
        return Ok(());
    }
    let Some(group) = idp.get_group_by_name(group_name).await? else {
        warn!(%group_name, "group not found in identity provider; skipping mirror");
        return Ok(());
    };
    let Some(group_id) = group.get("id").and_then(|v| v.as_str()) else {
        warn!(%group_name, "identity provider group has no id; skipping mirror");
        return Ok(());
    };
    if add {
        idp.add_user_to_group(keycloak_id, group_id).await?;
        info!(%keycloak_id, %group_name, "added user to identity-provider group");
    } else {
        idp.remove_user_from_group(keycloak_id, group_id).await?;
        info!(%keycloak_id, %group_name, "removed user from identity-provider group");
    }
    Ok(())
}

/// Grants access by group membership: every group attached to the instance
/// is added locally and mirrored into the identity provider. Deprovision is
/// the exact inverse. Both directions are idempotent.
pub struct GroupBasedProvisioner;

#[async_trait]
impl Provisioner for GroupBasedProvisioner {
    async fn provision(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idp: &dyn IdentityProvider,
        profile: &UserProfile,
        product: &Product,
        instance: Option<&Instance>,
    ) -> Result<bool> {
        let Some(instance) = instance else {
            warn!(
                product = %product.slug,
                profile_id = profile.id,
                "group-based provision called without an instance"
            );
            return Ok(false);
        };

        for group_name in instance_group_names(tx, instance.id).await? {
            sqlx::query(
                "INSERT INTO profile_groups (profile_id, group_name) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(profile.id)
            .bind(&group_name)
            .execute(&mut *tx)
            .await?;
            mirror_group_change(idp, &profile.keycloak_id, &group_name, true).await?;
        }
        Ok(true)
    }

    async fn deprovision(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        idp: &dyn IdentityProvider,
        profile: &UserProfile,
        product: &Product,
        instance: Option<&Instance>,
    ) -> Result<bool> {
        let Some(instance) = instance else {
            warn!(
                product = %product.slug,
                profile_id = profile.id,
                "group-based deprovision called without an instance"
            );
            return Ok(false);
        };

        let mut changed = false;
        for group_name in instance_group_names(tx, instance.id).await? {
            let result = sqlx::query(
                "DELETE FROM profile_groups WHERE profile_id = $1 AND group_name = $2",
            )
            .bind(profile.id)
            .bind(&group_name)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                changed = true;
                mirror_group_change(idp, &profile.keycloak_id, &group_name, false).await?;
            }
        }
        Ok(changed)
    }
}

/// For products whose access control lives entirely in identity-provider
/// attributes. Both operations are no-op successes.
pub struct StandaloneProvisioner;

#[async_trait]
impl Provisioner for StandaloneProvisioner {
    async fn provision(
        &self,
        _tx: &mut Transaction<'_, Postgres>,
        _idp: &dyn IdentityProvider,
        profile: &UserProfile,
        product: &Product,
        _instance: Option<&Instance>,
    ) -> Result<bool> {
        info!(
            product = %product.slug,
            profile_id = profile.id,
            "standalone provisioner: no-op provision"
        );
        Ok(true)
    }

    async fn deprovision(
        &self,
        _tx: &mut Transaction<'_, Postgres>,
        _idp: &dyn IdentityProvider,
        profile: &UserProfile,
        product: &Product,
        _instance: Option<&Instance>,
    ) -> Result<bool> {
        info!(
            product = %product.slug,
            profile_id = profile.id,
            "standalone provisioner: no-op deprovision"
        );
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    GroupBased,
    Standalone,
}

impl ProvisionerKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "group_based" => Some(ProvisionerKind::GroupBased),
            "standalone" => Some(ProvisionerKind::Standalone),
            _ => None,
        }
    }
}

/// Closed set of provisioner variants keyed by the product's kind tag.
/// The single place that branches on product kind; the fallback variant is
/// decided once at startup.
pub struct ProvisionerRegistry {
    default_kind: ProvisionerKind,
    group_based: GroupBasedProvisioner,
    standalone: StandaloneProvisioner,
}

impl ProvisionerRegistry {
    pub fn new(default_kind: ProvisionerKind) -> Self {
        Self {
            default_kind,
            group_based: GroupBasedProvisioner,
            standalone: StandaloneProvisioner,
        }
    }

    pub fn from_env() -> Self {
        let tag = config::DEFAULT_PROVISIONER.as_str();
        let default_kind = ProvisionerKind::parse(tag).unwrap_or_else(|| {
            warn!(%tag, "unknown DEFAULT_PROVISIONER; falling back to standalone");
            ProvisionerKind::Standalone
        });
        Self::new(default_kind)
    }

    pub fn kind_for(&self, product: &Product) -> ProvisionerKind {
        if let Some(kind) = product.provisioner.as_deref().and_then(ProvisionerKind::parse) {
            return kind;
        }
        // Instance access is tracked through group membership, so untagged
        // instance products always take the group-based variant.
        if product.requires_instance {
            return ProvisionerKind::GroupBased;
        }
        self.default_kind
    }

    pub fn resolve(&self, product: &Product) -> &dyn Provisioner {
        match self.kind_for(product) {
            ProvisionerKind::GroupBased => &self.group_based,
            ProvisionerKind::Standalone => &self.standalone,
        }
    }
}
