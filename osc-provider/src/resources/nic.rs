//! Network interfaces (FCU)

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use osc_core::differ::{ApplyOrder, DiffPolicy, DiffSet, apply_diff};
use osc_core::provider::{BoxFuture, Operation, ProviderError, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State, Value};
use osc_core::retry::RetryPolicy;
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use osc_core::waiter::{Observation, WaitSpec, wait_for_state};
use serde_json::{Value as JsonValue, json};

use super::first;
use super::tags::{TAGS_ATTRIBUTE, sync_tags, tags_attribute};
use crate::api::{ApiClient, Service, malformed};
use crate::utils::{
    copy_field, pluck_strings, str_field, string_list, strings_to_value, tags_from_json,
};

const GROUPS: [UpdateGroup; 6] = [
    UpdateGroup::new("attachment", &["instance_id", "device_index"]),
    UpdateGroup::new("private_ips", &["private_ips"]),
    UpdateGroup::new("source_dest_check", &["source_dest_check"]),
    UpdateGroup::new("security_groups", &["security_group_ids"]),
    UpdateGroup::new("description", &["description"]),
    UpdateGroup::new("tags", &[TAGS_ATTRIBUTE]),
];

const DETACH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Secondary interfaces default to the second slot
const DEFAULT_DEVICE_INDEX: i64 = 1;

pub struct NicHandler {
    api: ApiClient,
}

impl NicHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn describe_nic(&self, identifier: &str) -> ProviderResult<Option<JsonValue>> {
        let request = json!({"NetworkInterfaceIds": [identifier]});
        let response = self
            .api
            .describe(Service::Fcu, "DescribeNetworkInterfaces", request)
            .await?;
        Ok(response.and_then(|r| first(&r, "NetworkInterfaces").cloned()))
    }

    async fn create_nic(&self, resource: &Resource) -> ProviderResult<String> {
        let private_ips: Vec<JsonValue> = string_list(resource.get("private_ips"))
            .iter()
            .enumerate()
            .map(|(i, ip)| json!({"PrivateIpAddress": ip, "Primary": i == 0}))
            .collect();
        let mut request = json!({
            "SubnetId": resource.get_str("subnet_id"),
            "SecurityGroupIds": string_list(resource.get("security_group_ids")),
        });
        if let Some(object) = request.as_object_mut() {
            if !private_ips.is_empty() {
                object.insert("PrivateIpAddresses".to_string(), json!(private_ips));
            }
            if let Some(description) = resource.get_str("description") {
                object.insert("Description".to_string(), json!(description));
            }
        }

        let response = self
            .api
            .call(Service::Fcu, "CreateNetworkInterface", request)
            .await?;
        response
            .pointer("/NetworkInterface/NetworkInterfaceId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| malformed("CreateNetworkInterface", "missing NetworkInterfaceId"))
    }

    async fn read_nic(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let Some(nic) = self.describe_nic(identifier).await? else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "nic_id", &nic, "NetworkInterfaceId");
        copy_field(&mut attributes, "subnet_id", &nic, "SubnetId");
        copy_field(&mut attributes, "description", &nic, "Description");
        copy_field(&mut attributes, "source_dest_check", &nic, "SourceDestCheck");
        copy_field(&mut attributes, "state", &nic, "Status");
        attributes.insert(
            "security_group_ids".to_string(),
            strings_to_value(pluck_strings(&nic, "Groups", "GroupId")),
        );
        attributes.insert(
            "private_ips".to_string(),
            strings_to_value(pluck_strings(&nic, "PrivateIpAddresses", "PrivateIpAddress")),
        );
        if let Some(attachment) = nic.get("Attachment") {
            copy_field(&mut attributes, "attachment_id", attachment, "AttachmentId");
            copy_field(&mut attributes, "instance_id", attachment, "InstanceId");
            copy_field(&mut attributes, "device_index", attachment, "DeviceIndex");
        }
        attributes.insert(TAGS_ATTRIBUTE.to_string(), tags_from_json(&nic));

        let state = str_field(&nic, "Status").unwrap_or_default();
        Ok(Some(Observation::new(state).with_attributes(attributes)))
    }

    /// State "true" while an attachment exists, "false" once it is gone
    async fn attachment_state(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let nic = self.describe_nic(identifier).await?;
        Ok(nic.map(|nic| {
            let attached = nic
                .get("Attachment")
                .and_then(|a| str_field(a, "AttachmentId"))
                .is_some();
            Observation::new(attached.to_string())
        }))
    }

    async fn detach(&self, identifier: &str, attachment_id: &str) -> ProviderResult<()> {
        info!("detaching {} ({})", identifier, attachment_id);
        self.api
            .call(
                Service::Fcu,
                "DetachNetworkInterface",
                json!({"AttachmentId": attachment_id, "Force": true}),
            )
            .await?;
        let spec = WaitSpec::new(&["true"], &["false"], DETACH_TIMEOUT);
        wait_for_state(&spec, || self.attachment_state(identifier)).await?;
        Ok(())
    }

    async fn attach(&self, identifier: &str, source: &HashMap<String, Value>) -> ProviderResult<()> {
        let Some(instance_id) = source.get("instance_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let device_index = source
            .get("device_index")
            .and_then(Value::as_int)
            .unwrap_or(DEFAULT_DEVICE_INDEX);
        let request = json!({
            "DeviceIndex": device_index,
            "InstanceId": instance_id,
            "NetworkInterfaceId": identifier,
        });
        self.api
            .call(Service::Fcu, "AttachNetworkInterface", request)
            .await
            .map(|_| ())
    }

    async fn modify(&self, identifier: &str, field: &str, value: JsonValue) -> ProviderResult<()> {
        let mut request = json!({"NetworkInterfaceId": identifier});
        if let Some(object) = request.as_object_mut() {
            object.insert(field.to_string(), value);
        }
        self.api
            .call(Service::Fcu, "ModifyNetworkInterfaceAttribute", request)
            .await
            .map(|_| ())
    }

    async fn sync_private_ips(
        &self,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<()> {
        let diff = DiffSet::of_strings(
            &string_list(from.get("private_ips")),
            &string_list(to.get("private_ips")),
        );
        let policy = DiffPolicy::new(
            ApplyOrder::RemoveFirst,
            RetryPolicy::new(Duration::from_secs(60)),
        );
        let api = &self.api;
        let call = |action: &'static str, ips: Vec<String>| async move {
            let request = json!({"NetworkInterfaceId": identifier, "PrivateIpAddresses": ips});
            api.call(Service::Fcu, action, request).await.map(|_| ())
        };

        apply_diff(
            &diff,
            &policy,
            |ips| call("AssignPrivateIpAddresses", ips),
            |ips| call("UnassignPrivateIpAddresses", ips),
        )
        .await?;
        Ok(())
    }

    async fn update_group(
        &self,
        group: &str,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<GroupOutcome> {
        match group {
            "attachment" => {
                if let Some(attachment_id) = from.get_str("attachment_id") {
                    self.detach(identifier, attachment_id).await?;
                }
                self.attach(identifier, &to.attributes).await?;
            }
            "private_ips" => self.sync_private_ips(identifier, from, to).await?,
            "source_dest_check" => {
                let check = to.get_bool("source_dest_check").unwrap_or(true);
                self.modify(identifier, "SourceDestCheck", json!({"Value": check}))
                    .await?
            }
            "security_groups" => {
                let groups = string_list(to.get("security_group_ids"));
                self.modify(identifier, "Groups", json!(groups)).await?
            }
            "description" => {
                let description = to.get_str("description").unwrap_or_default();
                self.modify(identifier, "Description", json!({"Value": description}))
                    .await?
            }
            "tags" => {
                sync_tags(
                    &self.api,
                    Service::Fcu,
                    identifier,
                    from.get(TAGS_ATTRIBUTE),
                    to.get(TAGS_ATTRIBUTE),
                )
                .await?
            }
            other => {
                return Err(ProviderError::validation(format!(
                    "nic has no update group '{}'",
                    other
                )));
            }
        }
        Ok(GroupOutcome::Applied)
    }

    async fn finish(&self, identifier: &str, resource: &Resource) -> ProviderResult<()> {
        self.attach(identifier, &resource.attributes).await?;
        if resource.get_bool("source_dest_check") == Some(false) {
            self.modify(identifier, "SourceDestCheck", json!({"Value": false}))
                .await?;
        }
        sync_tags(
            &self.api,
            Service::Fcu,
            identifier,
            None,
            resource.get(TAGS_ATTRIBUTE),
        )
        .await
    }

    async fn delete_nic(&self, identifier: &str) -> ProviderResult<()> {
        let attachment_id = self.describe_nic(identifier).await?.and_then(|nic| {
            nic.get("Attachment")
                .and_then(|a| str_field(a, "AttachmentId"))
                .map(String::from)
        });
        if let Some(attachment_id) = attachment_id {
            self.detach(identifier, &attachment_id).await?;
        }
        self.api
            .call(
                Service::Fcu,
                "DeleteNetworkInterface",
                json!({"NetworkInterfaceId": identifier}),
            )
            .await
            .map(|_| ())
    }
}

impl ResourceHandler for NicHandler {
    fn kind(&self) -> &'static str {
        "nic"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("nic")
            .attribute(
                AttributeSchema::new("subnet_id", AttributeType::String)
                    .required()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("private_ips", types::string_list()).unordered())
            .attribute(
                AttributeSchema::new("security_group_ids", types::string_list()).unordered(),
            )
            .attribute(AttributeSchema::new("description", AttributeType::String))
            .attribute(AttributeSchema::new("source_dest_check", AttributeType::Bool))
            .attribute(
                AttributeSchema::new("instance_id", AttributeType::String)
                    .removable()
                    .with_description("VM the interface is attached to; unset detaches it"),
            )
            .attribute(AttributeSchema::new("device_index", AttributeType::Int))
            .attribute(tags_attribute())
    }

    fn policy(&self, _operation: Operation) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(60))
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.create_nic(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_nic(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.delete_nic(identifier))
    }

    fn finish_create<'a>(
        &'a self,
        identifier: &'a str,
        resource: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.finish(identifier, resource))
    }

    fn update_groups(&self) -> Vec<UpdateGroup> {
        GROUPS.to_vec()
    }

    fn apply_group<'a>(
        &'a self,
        group: &'a str,
        identifier: &'a str,
        from: &'a State,
        to: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<GroupOutcome>> {
        Box::pin(self.update_group(group, identifier, from, to))
    }
}
