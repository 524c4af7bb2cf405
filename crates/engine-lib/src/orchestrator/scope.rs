//! Expansion of requested resources into the scope a detector analyzes

use super::OrchestratorError;
use crate::models::{DetectorManifest, ResourceIdentifier, ResourceType};
use crate::storage::{ResourceInventory, StoreError};
use std::collections::HashSet;
use tracing::debug;

fn inventory_error(e: StoreError) -> OrchestratorError {
    OrchestratorError::Repository {
        message: format!("resource inventory: {}", e),
    }
}

/// Resolve `requested` against what the manifest supports.
///
/// Each id is kept if its type is supported; subscriptions expand into
/// resource groups (when supported) or leaf resources; resource groups
/// expand into leaf resources. The result keeps first-seen order and holds
/// each identifier once.
pub async fn resolve_scope(
    manifest: &DetectorManifest,
    requested: &[ResourceIdentifier],
    inventory: &dyn ResourceInventory,
) -> Result<Vec<ResourceIdentifier>, OrchestratorError> {
    let leaf_types: Vec<ResourceType> = manifest
        .supported_resource_types
        .iter()
        .copied()
        .filter(|t| !t.is_container())
        .collect();

    let mut seen = HashSet::new();
    let mut scope = Vec::new();

    for id in requested {
        let resource_type = id.resource_type();
        let expanded = if manifest.supports(resource_type) {
            vec![id.clone()]
        } else if resource_type == ResourceType::Subscription
            && manifest.supports(ResourceType::ResourceGroup)
        {
            inventory
                .resource_groups(id.subscription_id())
                .await
                .map_err(inventory_error)?
        } else if resource_type == ResourceType::Subscription && !leaf_types.is_empty() {
            inventory
                .resources(id.subscription_id(), None, &leaf_types)
                .await
                .map_err(inventory_error)?
        } else if resource_type == ResourceType::ResourceGroup && !leaf_types.is_empty() {
            inventory
                .resources(
                    id.subscription_id(),
                    Some(id.resource_group_name()),
                    &leaf_types,
                )
                .await
                .map_err(inventory_error)?
        } else {
            return Err(OrchestratorError::IncompatibleResourceTypes {
                resource_id: id.to_string(),
                requested: resource_type,
                supported: manifest.supported_resource_types.iter().copied().collect(),
            });
        };

        debug!(
            detector_id = %manifest.id,
            requested = %id,
            expanded = expanded.len(),
            "Resolved requested resource"
        );
        for resource in expanded {
            if seen.insert(resource.clone()) {
                scope.push(resource);
            }
        }
    }

    Ok(scope)
}
