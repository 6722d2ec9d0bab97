//! Block storage volumes (OAPI)

use std::collections::HashMap;
use std::time::Duration;

use osc_core::provider::{BoxFuture, ErrorClass, Operation, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State};
use osc_core::retry::RetryPolicy;
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use osc_core::timeouts::Timeouts;
use osc_core::waiter::{Observation, WaitSpec};
use serde_json::json;

use super::first;
use super::tags::{TAGS_ATTRIBUTE, sync_tags, tags_attribute};
use crate::api::{ApiClient, Service, malformed};
use crate::errors::CallSite;
use crate::utils::{copy_field, put_field, str_field, tags_from_json};

const GROUPS: [UpdateGroup; 1] = [UpdateGroup::new("tags", &[TAGS_ATTRIBUTE])];

pub struct VolumeHandler {
    api: ApiClient,
}

impl VolumeHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn create_volume(&self, resource: &Resource) -> ProviderResult<String> {
        let mut request = json!({});
        put_field(&mut request, "SubregionName", resource.get("subregion_name"));
        put_field(&mut request, "Size", resource.get("size"));
        put_field(&mut request, "SnapshotId", resource.get("snapshot_id"));
        put_field(&mut request, "VolumeType", resource.get("volume_type"));
        // Iops is rejected for every type but io1
        if resource.get_str("volume_type") == Some("io1") {
            put_field(&mut request, "Iops", resource.get("iops"));
        }

        let response = self
            .api
            .call(Service::Oapi, "CreateVolume", request)
            .await?;
        response
            .pointer("/Volume/VolumeId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| malformed("CreateVolume", "missing Volume.VolumeId"))
    }

    async fn read_volume(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let request = json!({"Filters": {"VolumeIds": [identifier]}});
        let Some(response) = self
            .api
            .describe(Service::Oapi, "ReadVolumes", request)
            .await?
        else {
            return Ok(None);
        };
        let Some(volume) = first(&response, "Volumes") else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "volume_id", volume, "VolumeId");
        copy_field(&mut attributes, "subregion_name", volume, "SubregionName");
        copy_field(&mut attributes, "size", volume, "Size");
        copy_field(&mut attributes, "snapshot_id", volume, "SnapshotId");
        copy_field(&mut attributes, "volume_type", volume, "VolumeType");
        copy_field(&mut attributes, "iops", volume, "Iops");
        copy_field(&mut attributes, "state", volume, "State");
        attributes.insert(TAGS_ATTRIBUTE.to_string(), tags_from_json(volume));

        let state = str_field(volume, "State").unwrap_or_default();
        Ok(Some(Observation::new(state).with_attributes(attributes)))
    }
}

impl ResourceHandler for VolumeHandler {
    fn kind(&self) -> &'static str {
        "volume"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("volume")
            .attribute(
                AttributeSchema::new("subregion_name", AttributeType::String)
                    .required()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("size", types::positive_int()).force_new())
            .attribute(AttributeSchema::new("snapshot_id", AttributeType::String).force_new())
            .attribute(
                AttributeSchema::new(
                    "volume_type",
                    AttributeType::Enum(vec![
                        "standard".to_string(),
                        "gp2".to_string(),
                        "io1".to_string(),
                    ]),
                )
                .force_new(),
            )
            .attribute(
                AttributeSchema::new("iops", types::positive_int())
                    .force_new()
                    .with_description("Provisioned IOPS, io1 volumes only"),
            )
            .attribute(tags_attribute())
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::uniform(Duration::from_secs(5 * 60))
    }

    fn policy(&self, operation: Operation) -> RetryPolicy {
        match operation {
            Operation::Read => RetryPolicy::new(Duration::from_secs(30)),
            Operation::Delete => {
                RetryPolicy::new(Duration::from_secs(5 * 60)).retrying(ErrorClass::Conflict)
            }
            _ => RetryPolicy::new(Duration::from_secs(60)),
        }
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.create_volume(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_volume(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.api
                .call_at(
                    CallSite::VolumeDelete,
                    Service::Oapi,
                    "DeleteVolume",
                    json!({"VolumeId": identifier}),
                )
                .await
                .map(|_| ())
        })
    }

    fn finish_create<'a>(
        &'a self,
        identifier: &'a str,
        resource: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(sync_tags(
            &self.api,
            Service::Oapi,
            identifier,
            None,
            resource.get(TAGS_ATTRIBUTE),
        ))
    }

    fn create_wait(&self, _resource: &Resource, timeout: Duration) -> Option<WaitSpec> {
        Some(
            WaitSpec::new(&["creating"], &["available"], timeout)
                .with_delay(Duration::from_secs(10)),
        )
    }

    fn delete_wait(&self, timeout: Duration) -> Option<WaitSpec> {
        Some(WaitSpec::deletion(
            &["available", "in-use", "deleting"],
            &["deleted"],
            timeout,
        ))
    }

    fn update_groups(&self) -> Vec<UpdateGroup> {
        GROUPS.to_vec()
    }

    fn apply_group<'a>(
        &'a self,
        _group: &'a str,
        identifier: &'a str,
        from: &'a State,
        to: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<GroupOutcome>> {
        Box::pin(async move {
            sync_tags(
                &self.api,
                Service::Oapi,
                identifier,
                from.get(TAGS_ATTRIBUTE),
                to.get(TAGS_ATTRIBUTE),
            )
            .await?;
            Ok(GroupOutcome::Applied)
        })
    }
}
