//! Security groups and their rules (FCU)

use std::collections::HashMap;
use std::time::Duration;

use osc_core::differ::{ApplyOrder, DiffPolicy, DiffSet, apply_diff};
use osc_core::provider::{BoxFuture, ErrorClass, Operation, ProviderError, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State, Value};
use osc_core::retry::RetryPolicy;
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use osc_core::timeouts::Timeouts;
use osc_core::waiter::{Observation, WaitSpec};
use serde_json::{Value as JsonValue, json};

use super::first;
use super::tags::{TAGS_ATTRIBUTE, sync_tags, tags_attribute};
use crate::api::{ApiClient, Service, malformed};
use crate::errors::CallSite;
use crate::utils::{copy_field, str_field, tags_from_json};

const DEFAULT_DESCRIPTION: &str = "Managed by osc";

const GROUPS: [UpdateGroup; 3] = [
    UpdateGroup::new("ingress", &["ingress"]),
    UpdateGroup::new("egress", &["egress"]),
    UpdateGroup::new("tags", &[TAGS_ATTRIBUTE]),
];

/// One permission for one CIDR, normalised for comparison
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub protocol: String,
    pub from_port: i64,
    pub to_port: i64,
    pub ip_range: String,
}

impl Rule {
    pub fn new(protocol: &str, from_port: i64, to_port: i64, ip_range: &str) -> Self {
        Self {
            protocol: normalize_protocol(protocol),
            from_port,
            to_port,
            ip_range: ip_range.to_string(),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let port = |key: &str| map.get(key).and_then(Value::as_int).unwrap_or(0);
        Some(Self::new(
            map.get("protocol")?.as_str()?,
            port("from_port"),
            port("to_port"),
            map.get("ip_range")?.as_str()?,
        ))
    }

    fn to_value(&self) -> Value {
        Value::Map(HashMap::from([
            ("protocol".to_string(), Value::from(self.protocol.as_str())),
            ("from_port".to_string(), Value::Int(self.from_port)),
            ("to_port".to_string(), Value::Int(self.to_port)),
            ("ip_range".to_string(), Value::from(self.ip_range.as_str())),
        ]))
    }

    fn to_permission(&self) -> JsonValue {
        json!({
            "IpProtocol": self.protocol,
            "FromPort": self.from_port,
            "ToPort": self.to_port,
            "IpRanges": [{"CidrIp": self.ip_range}],
        })
    }

    /// The allow-all egress rule the cloud adds to every new VPC group
    fn allow_all() -> Self {
        Self::new("-1", 0, 0, "0.0.0.0/0")
    }
}

/// `all` and `-1` mean every protocol; protocol numbers map to their names
pub fn normalize_protocol(protocol: &str) -> String {
    match protocol.to_ascii_lowercase().as_str() {
        "all" | "-1" => "-1",
        "6" => "tcp",
        "17" => "udp",
        "1" => "icmp",
        other => other,
    }
    .to_string()
}

fn validate_rule(value: &Value) -> Result<(), String> {
    let map = value.as_map().ok_or("rule must be a map")?;
    if map.get("protocol").and_then(Value::as_str).is_none() {
        return Err("rule needs a 'protocol'".to_string());
    }
    match map.get("ip_range").and_then(Value::as_str) {
        Some(cidr) => osc_core::schema::validate_cidr(cidr),
        None => Err("rule needs an 'ip_range'".to_string()),
    }
}

fn rule_list() -> AttributeType {
    AttributeType::List(Box::new(AttributeType::Custom {
        name: "Rule".to_string(),
        validate: validate_rule,
    }))
}

/// Rule lists compare as sets of normalised rules
fn rule_attribute(name: &str) -> AttributeSchema {
    AttributeSchema::new(name, rule_list())
        .unordered()
        .removable()
        .with_normalizer(|value| {
            Value::List(rules_of(Some(value)).iter().map(Rule::to_value).collect())
        })
}

fn rules_of(value: Option<&Value>) -> Vec<Rule> {
    value
        .and_then(Value::as_list)
        .map(|items| items.iter().filter_map(Rule::from_value).collect())
        .unwrap_or_default()
}

/// One rule per (permission, CIDR) pair
fn rules_from_json(group: &JsonValue, field: &str) -> Vec<Rule> {
    let Some(permissions) = group.get(field).and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut rules = Vec::new();
    for permission in permissions {
        let protocol = str_field(permission, "IpProtocol").unwrap_or("-1");
        let port = |key: &str| permission.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        let ranges = permission
            .get("IpRanges")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten();
        for range in ranges {
            if let Some(cidr) = str_field(range, "CidrIp") {
                rules.push(Rule::new(protocol, port("FromPort"), port("ToPort"), cidr));
            }
        }
    }
    rules
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn actions(self) -> (&'static str, &'static str) {
        match self {
            Direction::Ingress => (
                "AuthorizeSecurityGroupIngress",
                "RevokeSecurityGroupIngress",
            ),
            Direction::Egress => ("AuthorizeSecurityGroupEgress", "RevokeSecurityGroupEgress"),
        }
    }
}

pub struct SecurityGroupHandler {
    api: ApiClient,
}

impl SecurityGroupHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn create_group(&self, resource: &Resource) -> ProviderResult<String> {
        let name = resource.get_str("name").unwrap_or(&resource.id.name);
        let mut request = json!({
            "GroupName": name,
            "GroupDescription": resource.get_str("description").unwrap_or(DEFAULT_DESCRIPTION),
        });
        if let (Some(vpc), Some(object)) = (resource.get_str("vpc_id"), request.as_object_mut()) {
            object.insert("VpcId".to_string(), json!(vpc));
        }

        let response = self
            .api
            .call(Service::Fcu, "CreateSecurityGroup", request)
            .await?;
        str_field(&response, "GroupId")
            .map(String::from)
            .ok_or_else(|| malformed("CreateSecurityGroup", "missing GroupId"))
    }

    async fn read_group(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let request = json!({"GroupIds": [identifier]});
        let Some(response) = self
            .api
            .describe(Service::Fcu, "DescribeSecurityGroups", request)
            .await?
        else {
            return Ok(None);
        };
        let Some(group) = first(&response, "SecurityGroups") else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "group_id", group, "GroupId");
        copy_field(&mut attributes, "name", group, "GroupName");
        copy_field(&mut attributes, "description", group, "Description");
        copy_field(&mut attributes, "vpc_id", group, "VpcId");
        for (name, field) in [("ingress", "IpPermissions"), ("egress", "IpPermissionsEgress")] {
            let rules = rules_from_json(group, field);
            attributes.insert(
                name.to_string(),
                Value::List(rules.iter().map(Rule::to_value).collect()),
            );
        }
        attributes.insert(TAGS_ATTRIBUTE.to_string(), tags_from_json(group));

        Ok(Some(Observation::new("exists").with_attributes(attributes)))
    }

    async fn sync_rules(
        &self,
        identifier: &str,
        direction: Direction,
        old: &[Rule],
        new: &[Rule],
    ) -> ProviderResult<()> {
        let (authorize, revoke) = direction.actions();
        let diff = DiffSet::compute(old, new, Rule::clone);
        let policy = DiffPolicy::new(
            ApplyOrder::RemoveFirst,
            RetryPolicy::new(Duration::from_secs(5 * 60)),
        );
        let api = &self.api;
        let call = |action: &'static str, rules: Vec<Rule>| async move {
            let permissions: Vec<JsonValue> = rules.iter().map(Rule::to_permission).collect();
            let request = json!({"GroupId": identifier, "IpPermissions": permissions});
            api.call(Service::Fcu, action, request).await.map(|_| ())
        };

        apply_diff(
            &diff,
            &policy,
            |rules| call(authorize, rules),
            |rules| call(revoke, rules),
        )
        .await?;
        Ok(())
    }

    async fn finish(&self, identifier: &str, resource: &Resource) -> ProviderResult<()> {
        let defaults = if resource.get_str("vpc_id").is_some() {
            vec![Rule::allow_all()]
        } else {
            Vec::new()
        };
        self.sync_rules(
            identifier,
            Direction::Egress,
            &defaults,
            &rules_of(resource.get("egress")),
        )
        .await?;
        self.sync_rules(
            identifier,
            Direction::Ingress,
            &[],
            &rules_of(resource.get("ingress")),
        )
        .await?;
        sync_tags(
            &self.api,
            Service::Fcu,
            identifier,
            None,
            resource.get(TAGS_ATTRIBUTE),
        )
        .await
    }

    async fn update_group(
        &self,
        group: &str,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<GroupOutcome> {
        match group {
            "ingress" | "egress" => {
                let direction = if group == "ingress" {
                    Direction::Ingress
                } else {
                    Direction::Egress
                };
                self.sync_rules(
                    identifier,
                    direction,
                    &rules_of(from.get(group)),
                    &rules_of(to.get(group)),
                )
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
                    "security_group has no update group '{}'",
                    other
                )));
            }
        }
        Ok(GroupOutcome::Applied)
    }
}

impl ResourceHandler for SecurityGroupHandler {
    fn kind(&self) -> &'static str {
        "security_group"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("security_group")
            .attribute(
                AttributeSchema::new("name", AttributeType::String)
                    .force_new()
                    .with_description("Defaults to the resource name"),
            )
            .attribute(AttributeSchema::new("description", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("vpc_id", AttributeType::String).force_new())
            .attribute(rule_attribute("ingress"))
            .attribute(rule_attribute("egress"))
            .attribute(tags_attribute())
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            Duration::from_secs(3 * 60),
            Duration::from_secs(10 * 60),
            Duration::from_secs(10 * 60),
        )
    }

    fn policy(&self, operation: Operation) -> RetryPolicy {
        match operation {
            Operation::Delete => {
                RetryPolicy::new(Duration::from_secs(5 * 60)).retrying(ErrorClass::Conflict)
            }
            _ => RetryPolicy::new(Duration::from_secs(60)),
        }
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.create_group(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_group(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.api
                .call_at(
                    CallSite::SecurityGroupDelete,
                    Service::Fcu,
                    "DeleteSecurityGroup",
                    json!({"GroupId": identifier}),
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
        Some(WaitSpec::new(&[], &["exists"], timeout))
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
