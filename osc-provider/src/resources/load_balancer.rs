//! Load balancers (LBU)
//!
//! The load balancer name is the identifier. Composite attributes are reconciled
//! as set diffs, each with its own ordering:
//!
//! - listeners: removed before added, so a port can be reused with new settings
//! - instances and availability zones: added before removed, keeping capacity
//! - subnets: detached before attached, one subnet per zone at a time

use std::collections::HashMap;
use std::time::Duration;

use osc_core::differ::{ApplyOrder, DiffPolicy, DiffSet, apply_diff};
use osc_core::provider::{BoxFuture, ErrorClass, Operation, ProviderError, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State, Value};
use osc_core::retry::{RetryPolicy, retry};
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema, types};
use osc_core::waiter::Observation;
use serde_json::{Value as JsonValue, json};

use super::first;
use super::tags::{TAGS_ATTRIBUTE, sync_tags, tags_attribute};
use crate::api::{ApiClient, Service};
use crate::errors::CallSite;
use crate::utils::{
    copy_field, json_strings, pluck_strings, str_field, string_list, string_map,
    strings_to_value, tags_from_json, tags_to_json,
};

const GROUPS: [UpdateGroup; 7] = [
    UpdateGroup::new("listeners", &["listeners"]),
    UpdateGroup::new("instances", &["instances"]),
    UpdateGroup::new("health_check", &["health_check"]),
    UpdateGroup::new("security_groups", &["security_groups"]),
    UpdateGroup::new("availability_zones", &["availability_zones"]),
    UpdateGroup::new("subnets", &["subnets"]),
    UpdateGroup::new("tags", &[TAGS_ATTRIBUTE]),
];

/// LBU throttles aggressively; every call is retried this long
const THROTTLE_BUDGET: Duration = Duration::from_secs(5 * 60);

const SECURE_PROTOCOLS: [&str; 2] = ["HTTPS", "SSL"];

/// A listener; two listeners are the same only if every field matches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Listener {
    pub lb_port: i64,
    pub lb_protocol: String,
    pub instance_port: i64,
    pub instance_protocol: String,
    pub ssl_certificate_id: Option<String>,
}

impl Listener {
    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let lb_protocol = map.get("lb_protocol")?.as_str()?.to_ascii_uppercase();
        Some(Self {
            lb_port: map.get("lb_port")?.as_int()?,
            instance_port: map.get("instance_port")?.as_int()?,
            instance_protocol: map
                .get("instance_protocol")
                .and_then(Value::as_str)
                .map(str::to_ascii_uppercase)
                .unwrap_or_else(|| lb_protocol.clone()),
            lb_protocol,
            ssl_certificate_id: map
                .get("ssl_certificate_id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }

    fn from_json(listener: &JsonValue) -> Option<Self> {
        let lb_protocol = str_field(listener, "Protocol")?.to_ascii_uppercase();
        Some(Self {
            lb_port: listener.get("LoadBalancerPort")?.as_i64()?,
            instance_port: listener.get("InstancePort")?.as_i64()?,
            instance_protocol: str_field(listener, "InstanceProtocol")
                .map(str::to_ascii_uppercase)
                .unwrap_or_else(|| lb_protocol.clone()),
            lb_protocol,
            ssl_certificate_id: str_field(listener, "SSLCertificateId")
                .filter(|s| !s.is_empty())
                .map(String::from),
        })
    }

    fn to_value(&self) -> Value {
        let mut map = HashMap::from([
            ("lb_port".to_string(), Value::Int(self.lb_port)),
            ("lb_protocol".to_string(), Value::from(self.lb_protocol.as_str())),
            ("instance_port".to_string(), Value::Int(self.instance_port)),
            (
                "instance_protocol".to_string(),
                Value::from(self.instance_protocol.as_str()),
            ),
        ]);
        if let Some(certificate) = &self.ssl_certificate_id {
            map.insert(
                "ssl_certificate_id".to_string(),
                Value::from(certificate.as_str()),
            );
        }
        Value::Map(map)
    }

    fn to_json(&self) -> JsonValue {
        let mut listener = json!({
            "LoadBalancerPort": self.lb_port,
            "Protocol": self.lb_protocol,
            "InstancePort": self.instance_port,
            "InstanceProtocol": self.instance_protocol,
        });
        if let (Some(certificate), Some(object)) =
            (&self.ssl_certificate_id, listener.as_object_mut())
        {
            object.insert("SSLCertificateId".to_string(), json!(certificate));
        }
        listener
    }
}

fn validate_listener(value: &Value) -> Result<(), String> {
    let map = value.as_map().ok_or("listener must be a map")?;
    for port in ["lb_port", "instance_port"] {
        match map.get(port).and_then(Value::as_int) {
            Some(p) if (1..=65535).contains(&p) => {}
            Some(p) => return Err(format!("{} {} out of range", port, p)),
            None => return Err(format!("listener needs '{}'", port)),
        }
    }
    let listener = Listener::from_value(value).ok_or("listener needs 'lb_protocol'")?;
    let secure = SECURE_PROTOCOLS.contains(&listener.lb_protocol.as_str())
        || SECURE_PROTOCOLS.contains(&listener.instance_protocol.as_str());
    if listener.ssl_certificate_id.is_some() && !secure {
        return Err(format!(
            "ssl_certificate_id may only be set for HTTPS or SSL listeners (port {})",
            listener.lb_port
        ));
    }
    Ok(())
}

fn validate_health_check(value: &Value) -> Result<(), String> {
    let map = value.as_map().ok_or("health_check must be a map")?;
    if map.get("target").and_then(Value::as_str).is_none() {
        return Err("health_check needs a 'target'".to_string());
    }
    for field in ["healthy_threshold", "unhealthy_threshold", "interval", "timeout"] {
        if map.get(field).and_then(Value::as_int).is_none() {
            return Err(format!("health_check needs an integer '{}'", field));
        }
    }
    Ok(())
}

fn listeners_of(value: Option<&Value>) -> Vec<Listener> {
    value
        .and_then(Value::as_list)
        .map(|items| items.iter().filter_map(Listener::from_value).collect())
        .unwrap_or_default()
}

/// Canonical listener list: upper-cased protocols, defaulted instance protocol
fn normalize_listeners(value: &Value) -> Value {
    Value::List(listeners_of(Some(value)).iter().map(Listener::to_value).collect())
}

fn health_check_json(value: &Value) -> JsonValue {
    let int = |key: &str| value.as_map().and_then(|m| m.get(key)).and_then(Value::as_int);
    json!({
        "Target": value.as_map().and_then(|m| m.get("target")).and_then(Value::as_str),
        "HealthyThreshold": int("healthy_threshold"),
        "UnhealthyThreshold": int("unhealthy_threshold"),
        "Interval": int("interval"),
        "Timeout": int("timeout"),
    })
}

fn retrying(class: Option<ErrorClass>) -> RetryPolicy {
    let policy = RetryPolicy::new(THROTTLE_BUDGET);
    match class {
        Some(class) => policy.retrying(class),
        None => policy,
    }
}

/// How one string set attribute maps onto its add and remove calls
struct SetCalls {
    field: &'static str,
    order: ApplyOrder,
    add: (CallSite, &'static str),
    remove: &'static str,
    retry_add: Option<ErrorClass>,
    wrap: fn(Vec<String>) -> JsonValue,
}

const INSTANCES: SetCalls = SetCalls {
    field: "Instances",
    order: ApplyOrder::AddFirst,
    add: (CallSite::Default, "RegisterInstancesWithLoadBalancer"),
    remove: "DeregisterInstancesFromLoadBalancer",
    retry_add: None,
    wrap: instance_list,
};

const AVAILABILITY_ZONES: SetCalls = SetCalls {
    field: "AvailabilityZones",
    order: ApplyOrder::AddFirst,
    add: (CallSite::Default, "EnableAvailabilityZonesForLoadBalancer"),
    remove: "DisableAvailabilityZonesForLoadBalancer",
    retry_add: None,
    wrap: plain_list,
};

/// A zone holds one subnet, so the old one is detached first and the attach
/// retried while the detach settles
const SUBNETS: SetCalls = SetCalls {
    field: "Subnets",
    order: ApplyOrder::RemoveFirst,
    add: (CallSite::SubnetAttach, "AttachLoadBalancerToSubnets"),
    remove: "DetachLoadBalancerFromSubnets",
    retry_add: Some(ErrorClass::Conflict),
    wrap: plain_list,
};

pub struct LoadBalancerHandler {
    api: ApiClient,
}

impl LoadBalancerHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn create_load_balancer(&self, resource: &Resource) -> ProviderResult<String> {
        let name = resource
            .get_str("name")
            .unwrap_or(resource.id.name.as_str());
        let listeners: Vec<JsonValue> = listeners_of(resource.get("listeners"))
            .iter()
            .map(Listener::to_json)
            .collect();
        let tags: Vec<(String, String)> = string_map(resource.get(TAGS_ATTRIBUTE))
            .into_iter()
            .collect();
        let mut request = json!({
            "LoadBalancerName": name,
            "Listeners": listeners,
            "AvailabilityZones": string_list(resource.get("availability_zones")),
            "Subnets": string_list(resource.get("subnets")),
            "SecurityGroups": string_list(resource.get("security_groups")),
            "Tags": tags_to_json(&tags),
        });
        if resource.get_bool("internal") == Some(true)
            && let Some(object) = request.as_object_mut()
        {
            object.insert("Scheme".to_string(), json!("internal"));
        }

        self.api
            .call_at(
                CallSite::LoadBalancerCreate,
                Service::Lbu,
                "CreateLoadBalancer",
                request,
            )
            .await?;
        Ok(name.to_string())
    }

    async fn read_load_balancer(&self, name: &str) -> ProviderResult<Option<Observation>> {
        let request = json!({"LoadBalancerNames": [name]});
        let Some(response) = self
            .api
            .describe(Service::Lbu, "DescribeLoadBalancers", request)
            .await?
        else {
            return Ok(None);
        };
        let Some(lb) = first(&response, "LoadBalancerDescriptions") else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "name", lb, "LoadBalancerName");
        copy_field(&mut attributes, "dns_name", lb, "DNSName");
        attributes.insert(
            "internal".to_string(),
            Value::Bool(str_field(lb, "Scheme") == Some("internal")),
        );

        let listeners: Vec<Value> = lb
            .get("ListenerDescriptions")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|d| d.get("Listener").and_then(Listener::from_json))
            .map(|l| l.to_value())
            .collect();
        attributes.insert("listeners".to_string(), Value::List(listeners));

        for (attribute, field) in [
            ("availability_zones", "AvailabilityZones"),
            ("subnets", "Subnets"),
            ("security_groups", "SecurityGroups"),
        ] {
            attributes.insert(
                attribute.to_string(),
                strings_to_value(json_strings(lb, field)),
            );
        }
        attributes.insert(
            "instances".to_string(),
            strings_to_value(pluck_strings(lb, "Instances", "InstanceId")),
        );

        if let Some(check) = lb.get("HealthCheck") {
            let mut health = HashMap::new();
            copy_field(&mut health, "target", check, "Target");
            copy_field(&mut health, "healthy_threshold", check, "HealthyThreshold");
            copy_field(&mut health, "unhealthy_threshold", check, "UnhealthyThreshold");
            copy_field(&mut health, "interval", check, "Interval");
            copy_field(&mut health, "timeout", check, "Timeout");
            attributes.insert("health_check".to_string(), Value::Map(health));
        }

        let tags = self
            .api
            .describe(Service::Lbu, "DescribeTags", json!({"LoadBalancerNames": [name]}))
            .await?;
        let tags = tags
            .as_ref()
            .and_then(|t| first(t, "TagDescriptions"))
            .map(tags_from_json)
            .unwrap_or_else(|| Value::Map(HashMap::new()));
        attributes.insert(TAGS_ATTRIBUTE.to_string(), tags);

        Ok(Some(Observation::new("active").with_attributes(attributes)))
    }

    async fn call(
        &self,
        site: CallSite,
        action: &str,
        name: &str,
        field: &str,
        value: JsonValue,
    ) -> ProviderResult<()> {
        let mut request = json!({"LoadBalancerName": name});
        if let Some(object) = request.as_object_mut() {
            object.insert(field.to_string(), value);
        }
        self.api
            .call_at(site, Service::Lbu, action, request)
            .await
            .map(|_| ())
    }

    async fn sync_listeners(
        &self,
        name: &str,
        old: &[Listener],
        new: &[Listener],
    ) -> ProviderResult<()> {
        let diff = DiffSet::compute(old, new, Listener::clone);
        let policy = DiffPolicy::new(ApplyOrder::RemoveFirst, retrying(None))
            .with_add_policy(retrying(Some(ErrorClass::Conflict)));

        apply_diff(
            &diff,
            &policy,
            |listeners| async move {
                let listeners: Vec<JsonValue> = listeners.iter().map(Listener::to_json).collect();
                self.call(
                    CallSite::ListenerCreate,
                    "CreateLoadBalancerListeners",
                    name,
                    "Listeners",
                    json!(listeners),
                )
                .await
            },
            |listeners| async move {
                let ports: Vec<i64> = listeners.iter().map(|l| l.lb_port).collect();
                self.call(
                    CallSite::Default,
                    "DeleteLoadBalancerListeners",
                    name,
                    "LoadBalancerPorts",
                    json!(ports),
                )
                .await
            },
        )
        .await?;
        Ok(())
    }

    async fn sync_set(
        &self,
        name: &str,
        set: &SetCalls,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> ProviderResult<()> {
        let diff = DiffSet::of_strings(&string_list(old), &string_list(new));
        let mut policy = DiffPolicy::new(set.order, retrying(None));
        if set.retry_add.is_some() {
            policy = policy.with_add_policy(retrying(set.retry_add));
        }
        let (add_site, add_action) = set.add;
        apply_diff(
            &diff,
            &policy,
            |items| self.call(add_site, add_action, name, set.field, (set.wrap)(items)),
            |items| {
                let items = (set.wrap)(items);
                self.call(CallSite::Default, set.remove, name, set.field, items)
            },
        )
        .await?;
        Ok(())
    }

    async fn update_group(
        &self,
        group: &str,
        name: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<GroupOutcome> {
        match group {
            "listeners" => {
                self.sync_listeners(
                    name,
                    &listeners_of(from.get("listeners")),
                    &listeners_of(to.get("listeners")),
                )
                .await?
            }
            "instances" => {
                self.sync_set(name, &INSTANCES, from.get("instances"), to.get("instances"))
                    .await?
            }
            "health_check" => {
                if let Some(check) = to.get("health_check") {
                    self.configure_health_check(name, check).await?;
                }
            }
            "security_groups" => {
                let groups = json!(string_list(to.get("security_groups")));
                retry(&retrying(None), || {
                    self.call(
                        CallSite::Default,
                        "ApplySecurityGroupsToLoadBalancer",
                        name,
                        "SecurityGroups",
                        groups.clone(),
                    )
                })
                .await?
            }
            "availability_zones" => {
                self.sync_set(
                    name,
                    &AVAILABILITY_ZONES,
                    from.get("availability_zones"),
                    to.get("availability_zones"),
                )
                .await?
            }
            "subnets" => {
                self.sync_set(name, &SUBNETS, from.get("subnets"), to.get("subnets"))
                    .await?
            }
            "tags" => {
                sync_tags(
                    &self.api,
                    Service::Lbu,
                    name,
                    from.get(TAGS_ATTRIBUTE),
                    to.get(TAGS_ATTRIBUTE),
                )
                .await?
            }
            other => {
                return Err(ProviderError::validation(format!(
                    "load_balancer has no update group '{}'",
                    other
                )));
            }
        }
        Ok(GroupOutcome::Applied)
    }

    async fn configure_health_check(&self, name: &str, check: &Value) -> ProviderResult<()> {
        retry(&retrying(None), || {
            self.call(
                CallSite::Default,
                "ConfigureHealthCheck",
                name,
                "HealthCheck",
                health_check_json(check),
            )
        })
        .await
    }

    async fn finish(&self, name: &str, resource: &Resource) -> ProviderResult<()> {
        self.sync_set(name, &INSTANCES, None, resource.get("instances"))
            .await?;
        if let Some(check) = resource.get("health_check") {
            self.configure_health_check(name, check).await?;
        }
        Ok(())
    }
}

fn plain_list(items: Vec<String>) -> JsonValue {
    json!(items)
}

fn instance_list(items: Vec<String>) -> JsonValue {
    JsonValue::Array(
        items
            .into_iter()
            .map(|id| json!({"InstanceId": id}))
            .collect(),
    )
}

impl ResourceHandler for LoadBalancerHandler {
    fn kind(&self) -> &'static str {
        "load_balancer"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("load_balancer")
            .attribute(
                AttributeSchema::new("name", AttributeType::String)
                    .force_new()
                    .with_description("Defaults to the resource name"),
            )
            .attribute(
                AttributeSchema::new(
                    "listeners",
                    AttributeType::List(Box::new(AttributeType::Custom {
                        name: "Listener".to_string(),
                        validate: validate_listener,
                    })),
                )
                .required()
                .unordered()
                .with_normalizer(normalize_listeners),
            )
            .attribute(AttributeSchema::new("internal", AttributeType::Bool).force_new())
            .attribute(
                AttributeSchema::new("availability_zones", types::string_list()).unordered(),
            )
            .attribute(AttributeSchema::new("subnets", types::string_list()).unordered())
            .attribute(
                AttributeSchema::new("security_groups", types::string_list()).unordered(),
            )
            .attribute(
                AttributeSchema::new("instances", types::string_list())
                    .unordered()
                    .removable(),
            )
            .attribute(AttributeSchema::new(
                "health_check",
                AttributeType::Custom {
                    name: "HealthCheck".to_string(),
                    validate: validate_health_check,
                },
            ))
            .attribute(tags_attribute())
    }

    fn policy(&self, _operation: Operation) -> RetryPolicy {
        retrying(None)
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.create_load_balancer(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_load_balancer(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.api
                .call(
                    Service::Lbu,
                    "DeleteLoadBalancer",
                    json!({"LoadBalancerName": identifier}),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use osc_core::lock::ResourceLocks;
    use osc_core::reconcile::Reconciler;
    use osc_core::resource::ResourceId;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn listener(lb_port: i64, protocol: &str, instance_port: i64) -> Listener {
        Listener {
            lb_port,
            lb_protocol: protocol.to_string(),
            instance_port,
            instance_protocol: protocol.to_string(),
            ssl_certificate_id: None,
        }
    }

    fn listeners(items: &[Listener]) -> Value {
        Value::List(items.iter().map(Listener::to_value).collect())
    }

    fn strings(items: &[&str]) -> Value {
        Value::List(items.iter().map(|s| Value::from(*s)).collect())
    }

    fn reconciler(cloud: &Arc<FakeCloud>) -> Reconciler<LoadBalancerHandler> {
        Reconciler::new(
            Arc::new(LoadBalancerHandler::new(cloud.client())),
            ResourceLocks::new(),
        )
    }

    fn id() -> ResourceId {
        ResourceId::new("load_balancer", "web")
    }

    fn described() -> JsonValue {
        json!({"LoadBalancerDescriptions": [{
            "LoadBalancerName": "web",
            "DNSName": "web.lbu.outscale.com",
            "ListenerDescriptions": [{"Listener": {
                "LoadBalancerPort": 80,
                "Protocol": "HTTP",
                "InstancePort": 8080,
                "InstanceProtocol": "HTTP"
            }}],
            "AvailabilityZones": ["eu-west-2a"],
            "Subnets": ["subnet-a"],
            "Instances": [{"InstanceId": "i-1"}]
        }]})
    }

    fn current(attributes: &[(&str, Value)]) -> State {
        let attrs = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        State::existing(id(), attrs).with_identifier("web")
    }

    fn desired(items: &[Listener]) -> Resource {
        Resource::new("load_balancer", "web").with_attribute("listeners", listeners(items))
    }

    #[test]
    fn certificate_requires_a_secure_protocol() {
        let mut plain = listener(80, "HTTP", 8080);
        plain.ssl_certificate_id = Some("arn:cert".to_string());
        assert!(validate_listener(&plain.to_value()).is_err());

        let mut secure = listener(443, "HTTP", 8080);
        secure.lb_protocol = "HTTPS".to_string();
        secure.ssl_certificate_id = Some("arn:cert".to_string());
        assert!(validate_listener(&secure.to_value()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn create_retries_missing_certificate_then_registers_instances() {
        let cloud = FakeCloud::new();
        cloud
            .fail("CreateLoadBalancer", "CertificateNotFound", "not propagated yet")
            .reply("CreateLoadBalancer", json!({"DNSName": "web.lbu.outscale.com"}))
            .reply("DescribeLoadBalancers", described());
        let resource = desired(&[listener(80, "HTTP", 8080)])
            .with_attribute("instances", strings(&["i-1"]))
            .with_attribute(
                "health_check",
                Value::Map(HashMap::from([
                    ("target".to_string(), Value::from("HTTP:8080/health")),
                    ("healthy_threshold".to_string(), Value::Int(2)),
                    ("unhealthy_threshold".to_string(), Value::Int(3)),
                    ("interval".to_string(), Value::Int(30)),
                    ("timeout".to_string(), Value::Int(5)),
                ])),
            );

        let state = reconciler(&cloud).create(&resource).await.unwrap();

        assert_eq!(state.identifier.as_deref(), Some("web"));
        assert_eq!(
            cloud.mutations(),
            vec![
                "CreateLoadBalancer",
                "CreateLoadBalancer",
                "RegisterInstancesWithLoadBalancer",
                "ConfigureHealthCheck"
            ]
        );
        assert_eq!(
            cloud.requests("RegisterInstancesWithLoadBalancer")[0],
            json!({"LoadBalancerName": "web", "Instances": [{"InstanceId": "i-1"}]})
        );
        assert_eq!(
            cloud.requests("ConfigureHealthCheck")[0]["HealthCheck"]["Target"],
            json!("HTTP:8080/health")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listener_changed_on_same_port_is_removed_then_added() {
        let cloud = FakeCloud::new();
        cloud.reply("DescribeLoadBalancers", described());
        let r = reconciler(&cloud);
        let from = r.read(&id(), Some("web")).await.unwrap();

        let to =
            desired(&[listener(80, "HTTP", 8081)]).with_attribute("instances", strings(&["i-1"]));
        r.update(&id(), "web", &from, &to).await.unwrap();

        assert_eq!(
            cloud.mutations(),
            vec!["DeleteLoadBalancerListeners", "CreateLoadBalancerListeners"]
        );
        assert_eq!(
            cloud.requests("DeleteLoadBalancerListeners")[0],
            json!({"LoadBalancerName": "web", "LoadBalancerPorts": [80]})
        );
        assert_eq!(
            cloud.requests("CreateLoadBalancerListeners")[0]["Listeners"][0]["InstancePort"],
            json!(8081)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_listener_is_retried() {
        let cloud = FakeCloud::new();
        cloud
            .fail("CreateLoadBalancerListeners", "DuplicateListener", "port 443")
            .reply("CreateLoadBalancerListeners", json!({}))
            .reply("DescribeLoadBalancers", described());
        let from = current(&[("listeners", listeners(&[listener(80, "HTTP", 8080)]))]);

        reconciler(&cloud)
            .update(
                &id(),
                "web",
                &from,
                &desired(&[listener(80, "HTTP", 8080), listener(8443, "TCP", 8443)]),
            )
            .await
            .unwrap();

        assert_eq!(cloud.count("CreateLoadBalancerListeners"), 2);
        assert_eq!(cloud.count("DeleteLoadBalancerListeners"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_listener_is_rejected_before_any_call() {
        let cloud = FakeCloud::new();
        let mut plain = listener(80, "HTTP", 8080);
        plain.ssl_certificate_id = Some("arn:cert".to_string());

        let err = reconciler(&cloud)
            .create(&desired(&[plain]))
            .await
            .unwrap_err();

        assert_eq!(err.class, ErrorClass::Validation);
        assert!(cloud.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn instances_are_registered_before_deregistering() {
        let cloud = FakeCloud::new();
        cloud.reply("DescribeLoadBalancers", described());
        let from = current(&[
            ("listeners", listeners(&[listener(80, "HTTP", 8080)])),
            ("instances", strings(&["i-1"])),
        ]);
        let to = desired(&[listener(80, "HTTP", 8080)])
            .with_attribute("instances", strings(&["i-2"]));

        reconciler(&cloud)
            .update(&id(), "web", &from, &to)
            .await
            .unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                "RegisterInstancesWithLoadBalancer",
                "DeregisterInstancesFromLoadBalancer"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subnet_swap_in_one_zone_detaches_first_and_retries_attach() {
        let cloud = FakeCloud::new();
        cloud
            .fail(
                "AttachLoadBalancerToSubnets",
                "InvalidConfigurationRequest",
                "LoadBalancer cannot be attached to multiple subnets in the same AZ.",
            )
            .reply("AttachLoadBalancerToSubnets", json!({}))
            .reply("DescribeLoadBalancers", described());
        let from = current(&[
            ("listeners", listeners(&[listener(80, "HTTP", 8080)])),
            ("subnets", strings(&["subnet-a"])),
        ]);
        let to = desired(&[listener(80, "HTTP", 8080)])
            .with_attribute("subnets", strings(&["subnet-b"]));

        reconciler(&cloud)
            .update(&id(), "web", &from, &to)
            .await
            .unwrap();

        assert_eq!(
            cloud.mutations(),
            vec![
                "DetachLoadBalancerFromSubnets",
                "AttachLoadBalancerToSubnets",
                "AttachLoadBalancerToSubnets"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_listeners_reports_them_as_applied() {
        let cloud = FakeCloud::new();
        cloud.fail(
            "RegisterInstancesWithLoadBalancer",
            "InvalidInstance",
            "i-9 is not running",
        );
        let from = current(&[
            ("listeners", listeners(&[listener(80, "HTTP", 8080)])),
            ("instances", strings(&["i-1"])),
        ]);
        let to = desired(&[listener(443, "TCP", 8443)])
            .with_attribute("instances", strings(&["i-9"]));

        let err = reconciler(&cloud)
            .update(&id(), "web", &from, &to)
            .await
            .unwrap_err();

        assert_eq!(err.applied, BTreeSet::from(["listeners".to_string()]));
        assert_eq!(err.error.class, ErrorClass::Api);
        assert_eq!(cloud.count("DeregisterInstancesFromLoadBalancer"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_load_balancer_reads_as_absent() {
        let cloud = FakeCloud::new();
        cloud.fail("DescribeLoadBalancers", "LoadBalancerNotFound", "web");

        let state = reconciler(&cloud).read(&id(), Some("web")).await.unwrap();

        assert!(!state.exists);
    }

    #[tokio::test(start_paused = true)]
    async fn reordered_instances_and_lowercase_protocols_plan_nothing() {
        let cloud = FakeCloud::new();
        let mut described = described();
        described["LoadBalancerDescriptions"][0]["Instances"] =
            json!([{"InstanceId": "i-1"}, {"InstanceId": "i-2"}]);
        cloud.reply("DescribeLoadBalancers", described);
        let r = reconciler(&cloud);
        let from = r.read(&id(), Some("web")).await.unwrap();

        let lowercase = Value::Map(HashMap::from([
            ("lb_port".to_string(), Value::Int(80)),
            ("lb_protocol".to_string(), Value::from("http")),
            ("instance_port".to_string(), Value::Int(8080)),
        ]));
        let to = Resource::new("load_balancer", "web")
            .with_attribute("listeners", Value::List(vec![lowercase]))
            .with_attribute("instances", strings(&["i-2", "i-1"]))
            .with_attribute("subnets", strings(&["subnet-a"]));

        assert!(r.plan(&to, &from).is_none());

        let outcome = r.update(&id(), "web", &from, &to).await.unwrap();
        assert!(outcome.applied.is_empty());
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn instances_dropped_from_config_are_deregistered() {
        let cloud = FakeCloud::new();
        cloud.reply("DescribeLoadBalancers", described());
        let r = reconciler(&cloud);
        let from = r.read(&id(), Some("web")).await.unwrap();

        let outcome = r
            .reconcile(&desired(&[listener(80, "HTTP", 8080)]), &from)
            .await
            .unwrap();

        assert!(outcome.is_some());
        assert_eq!(cloud.mutations(), vec!["DeregisterInstancesFromLoadBalancer"]);
        assert_eq!(
            cloud.requests("DeregisterInstancesFromLoadBalancer")[0],
            json!({"LoadBalancerName": "web", "Instances": [{"InstanceId": "i-1"}]})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_update_group_is_rejected() {
        let cloud = FakeCloud::new();

        let err = LoadBalancerHandler::new(cloud.client())
            .apply_group("policies", "web", &current(&[]), &desired(&[]))
            .await
            .unwrap_err();

        assert_eq!(err.class, ErrorClass::Validation);
        assert!(cloud.actions().is_empty());
    }
}
