//! Osc Provider
//!
//! Outscale implementation of the osc reconciliation core: one [`ResourceHandler`]
//! per resource kind, an API seam that classifies cloud errors per call site, and
//! [`OscProvider`], which routes operations to the right reconciler.
//!
//! [`ResourceHandler`]: osc_core::reconcile::ResourceHandler

pub mod api;
pub mod config;
pub mod errors;
pub mod resources;
pub mod utils;

#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use osc_core::effect::Effect;
use osc_core::lock::ResourceLocks;
use osc_core::provider::{BoxFuture, Provider, ProviderError, ProviderResult};
use osc_core::reconcile::{EffectOutcome, Reconciler, UpdateError, UpdateOutcome};
use osc_core::resource::{Resource, ResourceId, State, Value};

use crate::api::{ApiClient, CloudApi, Service};
use crate::config::{ConfigError, ProviderConfig};

/// Outscale provider
///
/// Every reconciler shares one lock registry, so two operations on the same cloud
/// resource never overlap even when they come from different resource kinds.
pub struct OscProvider {
    config: ProviderConfig,
    reconcilers: HashMap<&'static str, Reconciler>,
}

impl OscProvider {
    pub fn new(config: ProviderConfig, api: Arc<dyn CloudApi>) -> Self {
        let api = ApiClient::new(api);
        let locks = ResourceLocks::new();
        let reconcilers = resources::all(&api)
            .into_iter()
            .map(|handler| {
                let reconciler = Reconciler::new(handler, locks.clone());
                (reconciler.kind(), reconciler)
            })
            .collect();
        for service in Service::ALL {
            debug!("{} endpoint: {}", service, config.endpoint_for(service));
        }
        info!("outscale provider ready for region {}", config.region);
        Self {
            config,
            reconcilers,
        }
    }

    /// Build from the provider block, falling back to the environment for credentials
    pub fn from_attributes(
        attributes: &HashMap<String, Value>,
        api: Arc<dyn CloudApi>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(ProviderConfig::from_attributes(attributes)?, api))
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn reconciler(&self, kind: &str) -> ProviderResult<&Reconciler> {
        self.reconcilers
            .get(kind)
            .ok_or_else(|| ProviderError::validation(format!("Unknown resource kind: {}", kind)))
    }

    /// Adopt an existing cloud resource under `name`
    pub async fn import(&self, kind: &str, name: &str, identifier: &str) -> ProviderResult<State> {
        let id = ResourceId::new(kind, name);
        let state = self.reconciler(kind)?.read(&id, Some(identifier)).await?;
        if !state.exists {
            return Err(
                ProviderError::not_found(format!("{} {} does not exist", kind, identifier))
                    .for_resource(id),
            );
        }
        Ok(state)
    }

    pub async fn apply(&self, effect: &Effect) -> ProviderResult<EffectOutcome> {
        let id = effect.resource_id();
        self.reconciler(&id.kind)
            .map_err(|e| e.for_resource(id.clone()))?
            .apply(effect)
            .await
    }
}

impl Provider for OscProvider {
    fn name(&self) -> &'static str {
        "outscale"
    }

    fn resource_kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.reconcilers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(String::from);
        Box::pin(async move {
            self.reconciler(&id.kind)
                .map_err(|e| e.for_resource(id.clone()))?
                .read(&id, identifier.as_deref())
                .await
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            self.reconciler(&resource.id.kind)
                .map_err(|e| e.for_resource(resource.id.clone()))?
                .create(&resource)
                .await
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, Result<UpdateOutcome, UpdateError>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move {
            let reconciler = self.reconciler(&id.kind).map_err(|e| UpdateError {
                applied: Default::default(),
                error: e.for_resource(id.clone()),
            })?;
            reconciler.update(&id, &identifier, &from, &to).await
        })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            self.reconciler(&id.kind)
                .map_err(|e| e.for_resource(id.clone()))?
                .delete(&id, &identifier)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use osc_core::provider::ErrorClass;
    use serde_json::json;

    fn provider(cloud: &Arc<FakeCloud>) -> OscProvider {
        let config = ProviderConfig {
            access_key_id: "AK".to_string(),
            secret_key_id: "SK".to_string(),
            region: "eu-west-2".to_string(),
            endpoint: None,
        };
        OscProvider::new(config, cloud.clone())
    }

    fn volume_json(state: &str) -> serde_json::Value {
        json!({"Volumes": [{
            "VolumeId": "vol-1",
            "State": state,
            "SubregionName": "eu-west-2a",
            "Size": 10,
            "VolumeType": "gp2",
            "Tags": []
        }]})
    }

    #[test]
    fn every_kind_is_registered() {
        let cloud = FakeCloud::new();
        assert_eq!(
            provider(&cloud).resource_kinds(),
            vec![
                "load_balancer",
                "load_balancer_attributes",
                "nic",
                "public_ip",
                "public_ip_link",
                "route_table_link",
                "security_group",
                "user",
                "vm",
                "volume"
            ]
        );
    }

    #[test]
    fn provider_block_attributes_configure_the_provider() {
        let cloud = FakeCloud::new();
        let attributes: HashMap<String, Value> = [
            ("access_key_id", "AK"),
            ("secret_key_id", "SK"),
            ("region", "cloudgouv-eu-west-1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::from(v)))
        .collect();

        let provider = OscProvider::from_attributes(&attributes, cloud.clone()).unwrap();

        assert_eq!(provider.config().region, "cloudgouv-eu-west-1");
        assert_eq!(
            provider.config().endpoint_for(Service::Eim),
            "https://eim.cloudgouv-eu-west-1.outscale.com"
        );
    }

    #[test]
    fn invalid_provider_block_is_rejected() {
        let cloud = FakeCloud::new();
        let mut attributes = HashMap::new();
        attributes.insert("access_key_id".to_string(), Value::from("AK"));
        attributes.insert("secret_key_id".to_string(), Value::from("SK"));
        attributes.insert("region".to_string(), Value::from("eu-west-2"));
        attributes.insert("endpoint".to_string(), Value::from("ftp://osc.local"));

        let err = OscProvider::from_attributes(&attributes, cloud.clone())
            .err()
            .unwrap();

        assert_eq!(err, ConfigError::InvalidEndpoint("ftp://osc.local".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kind_is_a_validation_error() {
        let cloud = FakeCloud::new();
        let err = provider(&cloud)
            .create(&Resource::new("bucket", "logs"))
            .await
            .unwrap_err();

        assert_eq!(err.class, ErrorClass::Validation);
        assert_eq!(err.resource_id, Some(ResourceId::new("bucket", "logs")));
        assert!(cloud.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn import_reads_the_existing_resource() {
        let cloud = FakeCloud::new();
        cloud.reply("ReadVolumes", volume_json("available"));

        let state = provider(&cloud)
            .import("volume", "data", "vol-1")
            .await
            .unwrap();

        assert_eq!(state.id, ResourceId::new("volume", "data"));
        assert_eq!(state.identifier.as_deref(), Some("vol-1"));
        assert_eq!(state.get_str("subregion_name"), Some("eu-west-2a"));
    }

    #[tokio::test(start_paused = true)]
    async fn import_of_missing_resource_fails() {
        let cloud = FakeCloud::new();
        cloud.fail("ReadVolumes", "InvalidVolume.NotFound", "vol-9");

        let err = provider(&cloud)
            .import("volume", "data", "vol-9")
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_effect_is_routed_by_kind() {
        let cloud = FakeCloud::new();
        cloud
            .reply("ReadVolumes", volume_json("available"))
            .fail("ReadVolumes", "InvalidVolume.NotFound", "vol-1");

        let outcome = provider(&cloud)
            .apply(&Effect::Delete(
                State::existing(ResourceId::new("volume", "data"), HashMap::new())
                    .with_identifier("vol-1"),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EffectOutcome::Deleted);
        assert_eq!(cloud.mutations(), vec!["DeleteVolume"]);
    }
}
