//! Public IPs (FCU addresses)
//!
//! VPC addresses are identified by their allocation ID and associated through
//! association IDs; standard addresses only have the IP itself.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;
use osc_core::provider::{BoxFuture, ErrorClass, Operation, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State};
use osc_core::retry::{RetryPolicy, retry};
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use osc_core::timeouts::Timeouts;
use osc_core::waiter::Observation;
use serde_json::{Value as JsonValue, json};

use super::first;
use crate::api::{ApiClient, Service, malformed};
use crate::errors::CallSite;
use crate::utils::{copy_field, put_field, str_field};

const GROUPS: [UpdateGroup; 1] = [UpdateGroup::new(
    "association",
    &["instance_id", "network_interface_id", "private_ip"],
)];

/// A fresh allocation may take this long to become associable
const ASSOCIATE_BUDGET: Duration = Duration::from_secs(120);

fn is_vpc(identifier: &str) -> bool {
    identifier.contains("eipalloc")
}

/// Request addressing the allocation (VPC) or the IP (standard)
fn address_request(identifier: &str) -> JsonValue {
    if is_vpc(identifier) {
        json!({"AllocationId": identifier})
    } else {
        json!({"PublicIp": identifier})
    }
}

fn is_associated(address: &JsonValue) -> bool {
    ["AssociationId", "InstanceId", "NetworkInterfaceId"]
        .iter()
        .any(|field| str_field(address, field).is_some_and(|v| !v.is_empty()))
}

pub struct PublicIpHandler {
    api: ApiClient,
}

impl PublicIpHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn allocate(&self, resource: &Resource) -> ProviderResult<String> {
        let domain = resource.get_str("domain").unwrap_or("standard");
        let response = self
            .api
            .call(Service::Fcu, "AllocateAddress", json!({"Domain": domain}))
            .await?;
        let field = if domain == "vpc" {
            "AllocationId"
        } else {
            "PublicIp"
        };
        str_field(&response, field)
            .map(String::from)
            .ok_or_else(|| malformed("AllocateAddress", &format!("missing {}", field)))
    }

    async fn describe_address(&self, identifier: &str) -> ProviderResult<Option<JsonValue>> {
        let request = if is_vpc(identifier) {
            json!({"AllocationIds": [identifier]})
        } else {
            json!({"PublicIps": [identifier]})
        };
        let response = self
            .api
            .describe(Service::Fcu, "DescribeAddresses", request)
            .await?;
        Ok(response.and_then(|r| first(&r, "Addresses").cloned()))
    }

    async fn read_address(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let Some(address) = self.describe_address(identifier).await? else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "public_ip", &address, "PublicIp");
        copy_field(&mut attributes, "allocation_id", &address, "AllocationId");
        copy_field(&mut attributes, "association_id", &address, "AssociationId");
        copy_field(&mut attributes, "domain", &address, "Domain");
        copy_field(&mut attributes, "instance_id", &address, "InstanceId");
        copy_field(&mut attributes, "network_interface_id", &address, "NetworkInterfaceId");
        copy_field(&mut attributes, "private_ip", &address, "PrivateIpAddress");

        let state = if is_associated(&address) {
            "associated"
        } else {
            "allocated"
        };
        Ok(Some(Observation::new(state).with_attributes(attributes)))
    }

    async fn associate(&self, identifier: &str, resource: &Resource) -> ProviderResult<()> {
        if resource.get("instance_id").is_none()
            && resource.get("network_interface_id").is_none()
        {
            return Ok(());
        }

        let mut request = address_request(identifier);
        put_field(&mut request, "InstanceId", resource.get("instance_id"));
        if is_vpc(identifier) {
            put_field(
                &mut request,
                "NetworkInterfaceId",
                resource.get("network_interface_id"),
            );
            put_field(&mut request, "PrivateIpAddress", resource.get("private_ip"));
        }

        let policy = RetryPolicy::new(ASSOCIATE_BUDGET);
        retry(&policy, || {
            self.api.call_at(
                CallSite::AddressAssociate,
                Service::Fcu,
                "AssociateAddress",
                request.clone(),
            )
        })
        .await?;
        Ok(())
    }

    /// Drop the current association; one that is already gone is fine
    async fn disassociate(&self, identifier: &str, address: &JsonValue) -> ProviderResult<()> {
        if !is_associated(address) {
            return Ok(());
        }
        let request = match str_field(address, "AssociationId") {
            Some(association_id) if is_vpc(identifier) => json!({"AssociationId": association_id}),
            _ => json!({"PublicIp": str_field(address, "PublicIp").unwrap_or(identifier)}),
        };
        match self
            .api
            .call(Service::Fcu, "DisassociateAddress", request)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!("association of {} already gone: {}", identifier, e.message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_association(
        &self,
        identifier: &str,
        to: &Resource,
    ) -> ProviderResult<GroupOutcome> {
        if let Some(address) = self.describe_address(identifier).await? {
            self.disassociate(identifier, &address).await?;
        }
        self.associate(identifier, to).await?;
        Ok(GroupOutcome::Applied)
    }

    async fn release(&self, identifier: &str) -> ProviderResult<()> {
        if let Some(address) = self.describe_address(identifier).await? {
            self.disassociate(identifier, &address).await?;
        }
        self.api
            .call(Service::Fcu, "ReleaseAddress", address_request(identifier))
            .await
            .map(|_| ())
    }
}

impl ResourceHandler for PublicIpHandler {
    fn kind(&self) -> &'static str {
        "public_ip"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("public_ip")
            .attribute(
                AttributeSchema::new(
                    "domain",
                    AttributeType::Enum(vec!["standard".to_string(), "vpc".to_string()]),
                )
                .force_new(),
            )
            .attribute(
                AttributeSchema::new("instance_id", AttributeType::String)
                    .removable()
                    .implied_by(&["network_interface_id"]),
            )
            .attribute(
                AttributeSchema::new("network_interface_id", AttributeType::String)
                    .removable()
                    .implied_by(&["instance_id"]),
            )
            .attribute(
                AttributeSchema::new("private_ip", AttributeType::String)
                    .removable()
                    .implied_by(&["instance_id", "network_interface_id"]),
            )
    }

    fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            Duration::from_secs(30 * 60),
            Duration::from_secs(10 * 60),
            Duration::from_secs(30 * 60),
        )
    }

    fn policy(&self, operation: Operation) -> RetryPolicy {
        match operation {
            // Releasing right after disassociating fails for a while
            Operation::Delete => {
                RetryPolicy::new(Duration::from_secs(3 * 60)).retrying(ErrorClass::Api)
            }
            _ => RetryPolicy::new(Duration::from_secs(60)),
        }
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.allocate(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_address(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.release(identifier))
    }

    fn finish_create<'a>(
        &'a self,
        identifier: &'a str,
        resource: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(self.associate(identifier, resource))
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
        Box::pin(self.update_association(identifier, to))
    }
}
