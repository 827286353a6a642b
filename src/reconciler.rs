use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use crate::allocator;
use crate::keycloak::IdentityProvider;
use crate::models::{Instance, Product, UserProfile};
use crate::provisioner::ProvisionerRegistry;
use crate::store::EntitlementStore;

/// key: entitlement-reconciler -> close the desired/actual access gap
///
/// Operates purely on the store's cached view; never talks to the billing
/// provider.
#[derive(Clone)]
pub struct EntitlementReconciler {
    store: EntitlementStore,
    idp: Arc<dyn IdentityProvider>,
    registry: Arc<ProvisionerRegistry>,
}

impl EntitlementReconciler {
    pub fn new(
        store: EntitlementStore,
        idp: Arc<dyn IdentityProvider>,
        registry: Arc<ProvisionerRegistry>,
    ) -> Self {
        Self {
            store,
            idp,
            registry,
        }
    }

    /// Compute subscribed vs currently-provisioned products and drive the
    /// allocator and provisioners to close the delta, then refresh
    /// identity-provider attributes. Idempotent: a second run with no state
    /// change performs no further side effects.
    pub async fn sync_entitlements(&self, profile_id: i32) -> Result<()> {
        let Some(profile) = self.store.profile_by_id(profile_id).await? else {
            warn!(%profile_id, "sync requested for unknown profile");
            return Ok(());
        };

        let subscribed = self.store.subscribed_products(&profile).await?;
        for product in &subscribed {
            self.ensure_provisioned(&profile, product).await?;
        }

        let subscribed_ids: HashSet<i32> = subscribed.iter().map(|p| p.id).collect();
        let provisioned = self.store.provisioned_instance_products(profile.id).await?;
        for product in provisioned
            .iter()
            .filter(|p| !subscribed_ids.contains(&p.id))
        {
            self.revoke_provisioned(&profile, product).await?;
        }

        self.sync_identity_attributes(&profile, &subscribed).await?;
        Ok(())
    }

    /// Grant access to one product. For instance-bound products the whole
    /// check-allocate-provision sequence runs under the profile row lock so
    /// two concurrent reconciliations for the same user cannot both pass
    /// the "already assigned" check.
    ///
    /// Returns false when nothing changed: already assigned, or no
    /// capacity. Absence of capacity is an expected operational condition,
    /// not an error.
    pub async fn ensure_provisioned(
        &self,
        profile: &UserProfile,
        product: &Product,
    ) -> Result<bool> {
        let provisioner = self.registry.resolve(product);

        if !product.requires_instance {
            let mut tx = self.store.pool().begin().await?;
            let granted = provisioner
                .provision(&mut tx, self.idp.as_ref(), profile, product, None)
                .await?;
            tx.commit().await?;
            return Ok(granted);
        }

        let mut tx = self.store.pool().begin().await?;
        lock_profile(&mut tx, profile.id).await?;

        if let Some(existing) = accessible_instance(&mut tx, profile.id, product.id, true).await? {
            info!(
                profile_id = profile.id,
                product = %product.slug,
                instance = %existing.name,
                "already assigned to an instance; nothing to do"
            );
            tx.commit().await?;
            return Ok(false);
        }

        let Some(instance) = allocator::try_allocate_seat(&mut tx, product.id).await? else {
            // Reported, not escalated; the next reconciliation retries.
            tx.commit().await?;
            return Ok(false);
        };

        let granted = provisioner
            .provision(&mut tx, self.idp.as_ref(), profile, product, Some(&instance))
            .await?;
        // A provisioner that records no instance access would hold the seat
        // forever and take another one on the next run. Give it back.
        if accessible_instance(&mut tx, profile.id, product.id, true)
            .await?
            .is_none()
        {
            allocator::release_seat(&mut tx, instance.id).await?;
            tx.commit().await?;
            warn!(
                profile_id = profile.id,
                product = %product.slug,
                instance = %instance.name,
                "provisioner recorded no instance access; seat released"
            );
            return Ok(false);
        }
        tx.commit().await?;
        info!(
            profile_id = profile.id,
            product = %product.slug,
            instance = %instance.name,
            seats = instance.allocated_seats,
            "allocated seat and provisioned access"
        );
        Ok(granted)
    }

    /// Undo access to one product. Instance-bound products release one seat
    /// per successfully deprovisioned instance. Returns true if any
    /// instance was affected.
    pub async fn revoke_provisioned(
        &self,
        profile: &UserProfile,
        product: &Product,
    ) -> Result<bool> {
        let provisioner = self.registry.resolve(product);

        if !product.requires_instance {
            let mut tx = self.store.pool().begin().await?;
            let revoked = provisioner
                .deprovision(&mut tx, self.idp.as_ref(), profile, product, None)
                .await?;
            tx.commit().await?;
            return Ok(revoked);
        }

        let mut tx = self.store.pool().begin().await?;
        lock_profile(&mut tx, profile.id).await?;

        // Inactive instances are still revoked; access removal must not
        // depend on the instance being in service.
        let instances = accessible_instances(&mut tx, profile.id, product.id).await?;
        let mut changed = false;
        for instance in &instances {
            let revoked = provisioner
                .deprovision(&mut tx, self.idp.as_ref(), profile, product, Some(instance))
                .await?;
            if revoked {
                allocator::release_seat(&mut tx, instance.id).await?;
                changed = true;
                info!(
                    profile_id = profile.id,
                    product = %product.slug,
                    instance = %instance.name,
                    "deprovisioned access and released seat"
                );
            }
        }
        tx.commit().await?;
        Ok(changed)
    }

    /// Mirror the subscribed-product set into identity-provider attributes:
    /// `has_<slug>` flags plus `<slug>_instance` base URLs for
    /// instance-bound products. The identity provider merges attribute
    /// updates, so every active product appears in the payload and
    /// non-subscribed slugs carry empty values, which the merge removes.
    pub async fn sync_identity_attributes(
        &self,
        profile: &UserProfile,
        subscribed: &[Product],
    ) -> Result<bool> {
        if profile.keycloak_id.is_empty() {
            warn!(
                profile_id = profile.id,
                "no identity-provider id on profile; cannot sync attributes"
            );
            return Ok(false);
        }

        let subscribed_ids: HashSet<i32> = subscribed.iter().map(|p| p.id).collect();
        let mut attributes = HashMap::new();
        for product in self.store.active_products().await? {
            if !subscribed_ids.contains(&product.id) {
                attributes.insert(format!("has_{}", product.slug), String::new());
                attributes.insert(format!("{}_instance", product.slug), String::new());
                continue;
            }
            attributes.insert(format!("has_{}", product.slug), "true".to_string());
            if product.requires_instance {
                let instances = self
                    .store
                    .accessible_instances(profile.id, product.id)
                    .await?;
                attributes.insert(
                    format!("{}_instance", product.slug),
                    instances
                        .first()
                        .map(|instance| instance.base_url.clone())
                        .unwrap_or_default(),
                );
            } else {
                attributes.insert(
                    format!("{}_instance", product.slug),
                    product.standalone_url.clone(),
                );
            }
        }

        let synced = self
            .idp
            .update_user_attributes(&profile.keycloak_id, &attributes)
            .await?;
        if synced {
            info!(profile_id = profile.id, "synced product attributes to identity provider");
        } else {
            warn!(profile_id = profile.id, "identity-provider attribute sync reported failure");
        }
        Ok(synced)
    }
}

async fn lock_profile(tx: &mut Transaction<'_, Postgres>, profile_id: i32) -> Result<()> {
    sqlx::query("SELECT id FROM user_profiles WHERE id = $1 FOR UPDATE")
        .bind(profile_id)
        .execute(&mut *tx)
        .await?;
    Ok(())
}

async fn accessible_instance(
    tx: &mut Transaction<'_, Postgres>,
    profile_id: i32,
    product_id: i32,
    active_only: bool,
) -> Result<Option<Instance>> {
    let instance = sqlx::query_as::<_, Instance>(
        r#"
        SELECT DISTINCT i.*
        FROM instances i
        JOIN instance_groups ig ON ig.instance_id = i.id
        JOIN profile_groups pg
            ON pg.group_name = ig.group_name AND pg.profile_id = $1
        WHERE i.product_id = $2 AND (i.is_active = TRUE OR $3 = FALSE)
        ORDER BY i.name
        LIMIT 1
        "#,
    )
    .bind(profile_id)
    .bind(product_id)
    .bind(active_only)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(instance)
}

async fn accessible_instances(
    tx: &mut Transaction<'_, Postgres>,
    profile_id: i32,
    product_id: i32,
) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(
        r#"
        SELECT DISTINCT i.*
        FROM instances i
        JOIN instance_groups ig ON ig.instance_id = i.id
        JOIN profile_groups pg
            ON pg.group_name = ig.group_name AND pg.profile_id = $1
        WHERE i.product_id = $2
        ORDER BY i.name
        "#,
    )
    .bind(profile_id)
    .bind(product_id)
    .fetch_all(&mut *tx)
    .await?;
    Ok(instances)
}
