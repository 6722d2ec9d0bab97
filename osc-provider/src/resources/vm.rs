//! Virtual machines (FCU)
//!
//! Some attributes can only change while the VM is stopped; updating them runs
//! stop, wait for `stopped`, modify, start, wait for `running`.

use std::collections::HashMap;
use std::time::Duration;

use log::info;
use osc_core::provider::{BoxFuture, ErrorClass, Operation, ProviderError, ProviderResult};
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
    copy_field, pluck_strings, put_field, str_field, strings_to_value, tags_from_json,
    value_to_json,
};

/// Attributes that need a stopped VM, with their ModifyInstanceAttribute field
const STOPPED_ATTRIBUTES: [(&str, &str); 3] = [
    ("instance_type", "InstanceType"),
    ("user_data", "UserData"),
    ("ebs_optimized", "EbsOptimized"),
];

const GROUPS: [UpdateGroup; 6] = [
    UpdateGroup::new("stopped", &["instance_type", "user_data", "ebs_optimized"]),
    UpdateGroup::new("key_name", &["key_name"]),
    UpdateGroup::new("disable_api_termination", &["disable_api_termination"]),
    UpdateGroup::new("security_groups", &["security_group_ids"]),
    UpdateGroup::new("source_dest_check", &["source_dest_check"]),
    UpdateGroup::new("tags", &[TAGS_ATTRIBUTE]),
];

const LIVE_STATES: [&str; 5] = ["pending", "running", "shutting-down", "stopped", "stopping"];

const RESTART_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct VmHandler {
    api: ApiClient,
}

impl VmHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn run_instance(&self, resource: &Resource) -> ProviderResult<String> {
        let mut request = json!({"MinCount": 1, "MaxCount": 1});
        put_field(&mut request, "ImageId", resource.get("image_id"));
        put_field(&mut request, "InstanceType", resource.get("instance_type"));
        put_field(&mut request, "KeyName", resource.get("key_name"));
        put_field(&mut request, "SubnetId", resource.get("subnet_id"));
        put_field(&mut request, "PrivateIpAddress", resource.get("private_ip"));
        put_field(&mut request, "SecurityGroupIds", resource.get("security_group_ids"));
        put_field(&mut request, "UserData", resource.get("user_data"));
        put_field(&mut request, "EbsOptimized", resource.get("ebs_optimized"));
        put_field(
            &mut request,
            "DisableApiTermination",
            resource.get("disable_api_termination"),
        );

        let response = self
            .api
            .call(Service::Fcu, "RunInstances", request)
            .await?;
        first(&response, "Instances")
            .and_then(|instance| str_field(instance, "InstanceId"))
            .map(String::from)
            .ok_or_else(|| malformed("RunInstances", "no instance returned"))
    }

    /// Instance description without the attributes that need extra calls
    async fn describe_instance(&self, identifier: &str) -> ProviderResult<Option<JsonValue>> {
        let request = json!({"InstanceIds": [identifier]});
        let response = self
            .api
            .describe(Service::Fcu, "DescribeInstances", request)
            .await?;
        Ok(response.and_then(|r| {
            first(&r, "Reservations")
                .and_then(|reservation| first(reservation, "Instances"))
                .cloned()
        }))
    }

    async fn probe(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        Ok(self
            .describe_instance(identifier)
            .await?
            .map(|instance| observation(&instance)))
    }

    async fn read_instance(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let Some(instance) = self.describe_instance(identifier).await? else {
            return Ok(None);
        };
        let mut observed = observation(&instance);
        if observed.state == "terminated" {
            return Ok(Some(observed));
        }

        for (name, attribute, field) in [
            ("user_data", "userData", "UserData"),
            (
                "disable_api_termination",
                "disableApiTermination",
                "DisableApiTermination",
            ),
        ] {
            let request = json!({"InstanceId": identifier, "Attribute": attribute});
            let Some(response) = self
                .api
                .describe(Service::Fcu, "DescribeInstanceAttribute", request)
                .await?
            else {
                return Ok(None);
            };
            if let Some(value) = response.get(field) {
                copy_field(&mut observed.attributes, name, value, "Value");
            }
        }
        Ok(Some(observed))
    }

    async fn modify(&self, identifier: &str, field: &str, value: JsonValue) -> ProviderResult<()> {
        let mut request = json!({"InstanceId": identifier});
        if let Some(object) = request.as_object_mut() {
            object.insert(field.to_string(), value);
        }
        self.api
            .call(Service::Fcu, "ModifyInstanceAttribute", request)
            .await
            .map(|_| ())
    }

    async fn wait(&self, identifier: &str, spec: WaitSpec) -> ProviderResult<Observation> {
        wait_for_state(&spec, || self.probe(identifier)).await
    }

    async fn modify_stopped(
        &self,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<()> {
        info!("stopping {} to change its attributes", identifier);
        self.api
            .call(
                Service::Fcu,
                "StopInstances",
                json!({"InstanceIds": [identifier]}),
            )
            .await?;
        self.wait(
            identifier,
            WaitSpec::new(&LIVE_STATES, &["stopped"], RESTART_TIMEOUT)
                .with_delay(Duration::from_secs(10)),
        )
        .await?;

        for (name, field) in STOPPED_ATTRIBUTES {
            if let Some(value) = to.get(name)
                && from.get(name) != Some(value)
            {
                self.modify(identifier, field, json!({"Value": value_to_json(value)}))
                    .await?;
            }
        }

        self.api
            .call(
                Service::Fcu,
                "StartInstances",
                json!({"InstanceIds": [identifier]}),
            )
            .await?;
        self.wait(
            identifier,
            WaitSpec::new(&["pending", "stopped"], &["running"], RESTART_TIMEOUT)
                .with_delay(Duration::from_secs(10)),
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
        let boolean = |name: &str| json!({"Value": to.get_bool(name).unwrap_or_default()});
        match group {
            "stopped" => self.modify_stopped(identifier, from, to).await?,
            "key_name" => {
                let request = json!({"InstanceId": identifier, "KeyName": to.get_str("key_name")});
                self.api
                    .call(Service::Fcu, "ModifyInstanceKeyPair", request)
                    .await?;
            }
            "disable_api_termination" => {
                self.modify(
                    identifier,
                    "DisableApiTermination",
                    boolean("disable_api_termination"),
                )
                .await?
            }
            "security_groups" => {
                let groups = to.get("security_group_ids").map(Value::string_list);
                self.modify(identifier, "Groups", json!(groups.unwrap_or_default()))
                    .await?
            }
            "source_dest_check" => {
                self.modify(identifier, "SourceDestCheck", boolean("source_dest_check"))
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
                    "vm has no update group '{}'",
                    other
                )));
            }
        }
        Ok(GroupOutcome::Applied)
    }

    async fn finish(&self, identifier: &str, resource: &Resource) -> ProviderResult<()> {
        // Not accepted by RunInstances
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
}

fn observation(instance: &JsonValue) -> Observation {
    let mut attributes = HashMap::new();
    copy_field(&mut attributes, "instance_id", instance, "InstanceId");
    copy_field(&mut attributes, "image_id", instance, "ImageId");
    copy_field(&mut attributes, "instance_type", instance, "InstanceType");
    copy_field(&mut attributes, "key_name", instance, "KeyName");
    copy_field(&mut attributes, "subnet_id", instance, "SubnetId");
    copy_field(&mut attributes, "private_ip", instance, "PrivateIpAddress");
    copy_field(&mut attributes, "public_ip", instance, "IpAddress");
    copy_field(&mut attributes, "ebs_optimized", instance, "EbsOptimized");
    copy_field(&mut attributes, "source_dest_check", instance, "SourceDestCheck");
    attributes.insert(
        "security_group_ids".to_string(),
        strings_to_value(pluck_strings(instance, "GroupSet", "GroupId")),
    );
    attributes.insert(TAGS_ATTRIBUTE.to_string(), tags_from_json(instance));

    let state = instance
        .pointer("/InstanceState/Name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    attributes.insert("state".to_string(), Value::from(state));

    let observed = Observation::new(state).with_attributes(attributes);
    match instance.pointer("/StateReason/Message").and_then(|v| v.as_str()) {
        Some(reason) => observed.with_reason(reason),
        None => observed,
    }
}

impl ResourceHandler for VmHandler {
    fn kind(&self) -> &'static str {
        "vm"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("vm")
            .attribute(
                AttributeSchema::new("image_id", AttributeType::String)
                    .required()
                    .force_new(),
            )
            .attribute(AttributeSchema::new("instance_type", AttributeType::String))
            .attribute(AttributeSchema::new("key_name", AttributeType::String))
            .attribute(AttributeSchema::new("subnet_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("private_ip", AttributeType::String).force_new())
            .attribute(
                AttributeSchema::new("security_group_ids", types::string_list()).unordered(),
            )
            .attribute(AttributeSchema::new("user_data", AttributeType::String))
            .attribute(AttributeSchema::new("ebs_optimized", AttributeType::Bool))
            .attribute(AttributeSchema::new(
                "disable_api_termination",
                AttributeType::Bool,
            ))
            .attribute(AttributeSchema::new("source_dest_check", AttributeType::Bool))
            .attribute(tags_attribute())
    }

    fn policy(&self, operation: Operation) -> RetryPolicy {
        match operation {
            Operation::Create => RetryPolicy::any(Duration::from_secs(60)),
            Operation::Read => RetryPolicy::any(Duration::from_secs(30)),
            Operation::Update => RetryPolicy::new(Duration::from_secs(60)),
            Operation::Delete => RetryPolicy::new(Duration::from_secs(3 * 60))
                .retrying(ErrorClass::Conflict)
                .retrying(ErrorClass::Api),
        }
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.run_instance(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_instance(identifier))
    }

    fn is_gone(&self, observation: &Observation) -> bool {
        observation.state == "terminated"
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.api
                .call(
                    Service::Fcu,
                    "TerminateInstances",
                    json!({"InstanceIds": [identifier]}),
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
        Box::pin(self.finish(identifier, resource))
    }

    fn create_wait(&self, _resource: &Resource, timeout: Duration) -> Option<WaitSpec> {
        Some(
            WaitSpec::new(&["pending"], &["running"], timeout)
                .with_failure(&["terminated"])
                .with_delay(Duration::from_secs(10)),
        )
    }

    fn delete_wait(&self, timeout: Duration) -> Option<WaitSpec> {
        Some(
            WaitSpec::deletion(&LIVE_STATES, &["terminated"], timeout)
                .with_delay(Duration::from_secs(10)),
        )
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
