//! Load balancer attributes (LBU access logs)
//!
//! The attributes belong to the load balancer itself, so the load balancer name is
//! the identifier and deleting the resource only stops managing them.

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use osc_core::provider::{BoxFuture, Operation, ProviderError, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State};
use osc_core::retry::{RetryPolicy, retry};
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use osc_core::waiter::Observation;
use serde_json::{Value as JsonValue, json};

use crate::api::{ApiClient, Service, malformed};
use crate::utils::{copy_field, put_field};

const GROUPS: [UpdateGroup; 1] = [UpdateGroup::new(
    "access_log",
    &[
        "access_log_enabled",
        "access_log_emit_interval",
        "access_log_s3_bucket_name",
        "access_log_s3_bucket_prefix",
    ],
)];

/// LBU throttles attribute changes aggressively
const MODIFY_BUDGET: Duration = Duration::from_secs(5 * 60);

fn access_log(resource: &Resource) -> JsonValue {
    let mut access_log = json!({
        "Enabled": resource.get_bool("access_log_enabled").unwrap_or(false),
    });
    put_field(
        &mut access_log,
        "EmitInterval",
        resource.get("access_log_emit_interval"),
    );
    put_field(
        &mut access_log,
        "S3BucketName",
        resource.get("access_log_s3_bucket_name"),
    );
    put_field(
        &mut access_log,
        "S3BucketPrefix",
        resource.get("access_log_s3_bucket_prefix"),
    );
    access_log
}

pub struct LoadBalancerAttributesHandler {
    api: ApiClient,
}

impl LoadBalancerAttributesHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn modify(&self, name: &str, resource: &Resource) -> ProviderResult<()> {
        let request = json!({
            "LoadBalancerName": name,
            "LoadBalancerAttributes": {"AccessLog": access_log(resource)},
        });
        retry(&RetryPolicy::new(MODIFY_BUDGET), || {
            self.api
                .call(Service::Lbu, "ModifyLoadBalancerAttributes", request.clone())
        })
        .await?;
        Ok(())
    }

    async fn apply(&self, resource: &Resource) -> ProviderResult<String> {
        let name = resource
            .get_str("load_balancer_name")
            .ok_or_else(|| ProviderError::validation("load_balancer_name is required"))?;
        self.modify(name, resource).await?;
        Ok(name.to_string())
    }

    async fn read_attributes(&self, name: &str) -> ProviderResult<Option<Observation>> {
        let Some(response) = self
            .api
            .describe(
                Service::Lbu,
                "DescribeLoadBalancerAttributes",
                json!({"LoadBalancerName": name}),
            )
            .await?
        else {
            return Ok(None);
        };
        let access_log = response
            .get("LoadBalancerAttributes")
            .and_then(|attributes| attributes.get("AccessLog"))
            .ok_or_else(|| malformed("DescribeLoadBalancerAttributes", "missing AccessLog"))?;

        let mut attributes = HashMap::new();
        attributes.insert("load_balancer_name".to_string(), name.into());
        copy_field(&mut attributes, "access_log_enabled", access_log, "Enabled");
        copy_field(
            &mut attributes,
            "access_log_emit_interval",
            access_log,
            "EmitInterval",
        );
        copy_field(
            &mut attributes,
            "access_log_s3_bucket_name",
            access_log,
            "S3BucketName",
        );
        copy_field(
            &mut attributes,
            "access_log_s3_bucket_prefix",
            access_log,
            "S3BucketPrefix",
        );
        Ok(Some(Observation::new("configured").with_attributes(attributes)))
    }
}

impl ResourceHandler for LoadBalancerAttributesHandler {
    fn kind(&self) -> &'static str {
        "load_balancer_attributes"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("load_balancer_attributes")
            .attribute(
                AttributeSchema::new("load_balancer_name", AttributeType::String)
                    .required()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("access_log_enabled", AttributeType::Bool).required())
            .attribute(
                AttributeSchema::new("access_log_emit_interval", AttributeType::Int)
                    .with_description("Minutes between log publications (5 or 60)"),
            )
            .attribute(AttributeSchema::new(
                "access_log_s3_bucket_name",
                AttributeType::String,
            ))
            .attribute(AttributeSchema::new(
                "access_log_s3_bucket_prefix",
                AttributeType::String,
            ))
    }

    fn policy(&self, _operation: Operation) -> RetryPolicy {
        RetryPolicy::new(MODIFY_BUDGET)
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.apply(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_attributes(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            info!("attributes of {} are left as they are", identifier);
            Ok(())
        })
    }

    fn update_groups(&self) -> Vec<UpdateGroup> {
        GROUPS.to_vec()
    }

    fn apply_group<'a>(
        &'a self,
        _group: &'a str,
        identifier: &'a str,
        _from: &'a State,
        to: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<GroupOutcome>> {
        Box::pin(async move {
            self.modify(identifier, to).await?;
            Ok(GroupOutcome::Applied)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use osc_core::lock::ResourceLocks;
    use osc_core::reconcile::Reconciler;
    use osc_core::resource::{ResourceId, Value};
    use std::sync::Arc;

    fn attributes(enabled: bool, interval: i64) -> JsonValue {
        json!({"LoadBalancerAttributes": {"AccessLog": {
            "Enabled": enabled,
            "EmitInterval": interval,
            "S3BucketName": "logs",
            "S3BucketPrefix": "web"
        }}})
    }

    fn reconciler(cloud: &Arc<FakeCloud>) -> Reconciler<LoadBalancerAttributesHandler> {
        Reconciler::new(
            Arc::new(LoadBalancerAttributesHandler::new(cloud.client())),
            ResourceLocks::new(),
        )
    }

    fn id() -> ResourceId {
        ResourceId::new("load_balancer_attributes", "web")
    }

    fn access_logs(interval: i64) -> Resource {
        Resource::new("load_balancer_attributes", "web")
            .with_attribute("load_balancer_name", "web-lb")
            .with_attribute("access_log_enabled", true)
            .with_attribute("access_log_emit_interval", interval)
            .with_attribute("access_log_s3_bucket_name", "logs")
            .with_attribute("access_log_s3_bucket_prefix", "web")
    }

    #[tokio::test(start_paused = true)]
    async fn create_enables_access_logs_through_lbu() {
        let cloud = FakeCloud::new();
        cloud
            .fail("ModifyLoadBalancerAttributes", "Throttling", "Rate exceeded")
            .reply("ModifyLoadBalancerAttributes", json!({}))
            .reply("DescribeLoadBalancerAttributes", attributes(true, 5));

        let state = reconciler(&cloud).create(&access_logs(5)).await.unwrap();

        assert_eq!(state.identifier.as_deref(), Some("web-lb"));
        assert_eq!(state.get("access_log_enabled"), Some(&Value::Bool(true)));
        assert_eq!(state.get("access_log_emit_interval"), Some(&Value::Int(5)));
        assert_eq!(cloud.count("ModifyLoadBalancerAttributes"), 2);
        assert_eq!(
            cloud.requests("ModifyLoadBalancerAttributes")[1],
            json!({
                "LoadBalancerName": "web-lb",
                "LoadBalancerAttributes": {"AccessLog": {
                    "Enabled": true,
                    "EmitInterval": 5,
                    "S3BucketName": "logs",
                    "S3BucketPrefix": "web"
                }}
            })
        );
        assert!(cloud.services().iter().all(|s| *s == Service::Lbu));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_load_balancer_reads_as_absent() {
        let cloud = FakeCloud::new();
        cloud.fail(
            "DescribeLoadBalancerAttributes",
            "LoadBalancerNotFound",
            "There is no ACTIVE Load Balancer named 'web-lb'",
        );

        let state = reconciler(&cloud).read(&id(), Some("web-lb")).await.unwrap();

        assert!(!state.exists);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_interval_reissues_the_access_log() {
        let cloud = FakeCloud::new();
        cloud
            .reply("DescribeLoadBalancerAttributes", attributes(true, 5))
            .reply("DescribeLoadBalancerAttributes", attributes(true, 60));
        let r = reconciler(&cloud);
        let from = r.read(&id(), Some("web-lb")).await.unwrap();

        let outcome = r
            .update(&id(), "web-lb", &from, &access_logs(60))
            .await
            .unwrap();

        assert_eq!(
            outcome.state.get("access_log_emit_interval"),
            Some(&Value::Int(60))
        );
        assert!(outcome.applied.contains("access_log_emit_interval"));
        assert_eq!(cloud.mutations(), vec!["ModifyLoadBalancerAttributes"]);
        assert_eq!(
            cloud.requests("ModifyLoadBalancerAttributes")[0]["LoadBalancerAttributes"]
                ["AccessLog"]["EmitInterval"],
            json!(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delete_leaves_the_load_balancer_untouched() {
        let cloud = FakeCloud::new();
        cloud.reply("DescribeLoadBalancerAttributes", attributes(true, 5));

        reconciler(&cloud).delete(&id(), "web-lb").await.unwrap();

        assert!(cloud.mutations().is_empty());
    }
}
