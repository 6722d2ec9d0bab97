//! Links between a public IP and a VM or NIC (OAPI)
//!
//! The link ID (`eipassoc-...`) is the identifier. Addresses linked without one
//! fall back to the public IP itself.

use std::collections::HashMap;
use std::time::Duration;

use osc_core::provider::{BoxFuture, Operation, ProviderError, ProviderResult};
use osc_core::reconcile::ResourceHandler;
use osc_core::resource::Resource;
use osc_core::retry::RetryPolicy;
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use osc_core::waiter::Observation;
use serde_json::{Value as JsonValue, json};

use super::first;
use crate::api::{ApiClient, Service, malformed};
use crate::utils::{copy_field, put_field, str_field};

fn is_link_id(identifier: &str) -> bool {
    identifier.contains("eipassoc")
}

fn is_linked(address: &JsonValue) -> bool {
    ["LinkPublicIpId", "VmId", "NicId"]
        .iter()
        .any(|field| str_field(address, field).is_some_and(|v| !v.is_empty()))
}

pub struct PublicIpLinkHandler {
    api: ApiClient,
}

impl PublicIpLinkHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn link(&self, resource: &Resource) -> ProviderResult<String> {
        if resource.get("public_ip_id").is_none() && resource.get("public_ip").is_none() {
            return Err(ProviderError::validation(
                "one of public_ip_id or public_ip is required",
            ));
        }
        if resource.get("vm_id").is_none() && resource.get("nic_id").is_none() {
            return Err(ProviderError::validation("one of vm_id or nic_id is required"));
        }

        let mut request = json!({});
        put_field(&mut request, "PublicIpId", resource.get("public_ip_id"));
        put_field(&mut request, "PublicIp", resource.get("public_ip"));
        put_field(&mut request, "VmId", resource.get("vm_id"));
        put_field(&mut request, "NicId", resource.get("nic_id"));
        put_field(&mut request, "PrivateIp", resource.get("private_ip"));

        let response = self
            .api
            .call(Service::Oapi, "LinkPublicIp", request)
            .await?;
        str_field(&response, "LinkPublicIpId")
            .filter(|id| !id.is_empty())
            .or_else(|| resource.get_str("public_ip"))
            .map(String::from)
            .ok_or_else(|| malformed("LinkPublicIp", "missing LinkPublicIpId"))
    }

    async fn describe_link(&self, identifier: &str) -> ProviderResult<Option<JsonValue>> {
        let request = if is_link_id(identifier) {
            json!({"Filters": {"LinkPublicIpIds": [identifier]}})
        } else {
            json!({"Filters": {"PublicIps": [identifier]}})
        };
        let response = self
            .api
            .describe(Service::Oapi, "ReadPublicIps", request)
            .await?;
        Ok(response
            .and_then(|r| first(&r, "PublicIps").cloned())
            .filter(is_linked))
    }

    async fn read_link(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let Some(address) = self.describe_link(identifier).await? else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "public_ip_id", &address, "PublicIpId");
        copy_field(&mut attributes, "public_ip", &address, "PublicIp");
        copy_field(&mut attributes, "link_public_ip_id", &address, "LinkPublicIpId");
        copy_field(&mut attributes, "vm_id", &address, "VmId");
        copy_field(&mut attributes, "nic_id", &address, "NicId");
        copy_field(&mut attributes, "nic_account_id", &address, "NicAccountId");
        copy_field(&mut attributes, "private_ip", &address, "PrivateIp");
        Ok(Some(Observation::new("linked").with_attributes(attributes)))
    }

    async fn unlink(&self, identifier: &str) -> ProviderResult<()> {
        let request = if is_link_id(identifier) {
            json!({"LinkPublicIpId": identifier})
        } else {
            let link_id = self
                .describe_link(identifier)
                .await?
                .and_then(|address| {
                    str_field(&address, "LinkPublicIpId")
                        .filter(|id| !id.is_empty())
                        .map(String::from)
                });
            match link_id {
                Some(link_id) => json!({"LinkPublicIpId": link_id}),
                None => json!({"PublicIp": identifier}),
            }
        };
        self.api
            .call(Service::Oapi, "UnlinkPublicIp", request)
            .await
            .map(|_| ())
    }
}

impl ResourceHandler for PublicIpLinkHandler {
    fn kind(&self) -> &'static str {
        "public_ip_link"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("public_ip_link")
            .attribute(AttributeSchema::new("public_ip_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("public_ip", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("vm_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("nic_id", AttributeType::String).force_new())
            .attribute(AttributeSchema::new("private_ip", AttributeType::String).force_new())
    }

    fn policy(&self, _operation: Operation) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(60))
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.link(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_link(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.unlink(identifier))
    }
}
