//! Route table to subnet links
//!
//! The link ID is the identifier. Moving a subnet to another route table replaces
//! the association and yields a new link ID.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;
use osc_core::provider::{BoxFuture, Operation, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State};
use osc_core::retry::{RetryPolicy, retry};
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use osc_core::waiter::Observation;
use serde_json::{Value as JsonValue, json};

use crate::api::{ApiClient, Service, malformed};
use crate::errors::CallSite;
use crate::utils::{copy_field, str_field};

const GROUPS: [UpdateGroup; 1] = [UpdateGroup::new("route_table", &["route_table_id"])];

/// A route table created moments ago may not be linkable yet
const LINK_BUDGET: Duration = Duration::from_secs(5 * 60);

pub struct RouteTableLinkHandler {
    api: ApiClient,
}

impl RouteTableLinkHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn link(&self, resource: &Resource) -> ProviderResult<String> {
        let request = json!({
            "RouteTableId": resource.get_str("route_table_id"),
            "SubnetId": resource.get_str("subnet_id"),
        });
        let response = self
            .api
            .call_at(
                CallSite::RouteTableLink,
                Service::Oapi,
                "LinkRouteTable",
                request,
            )
            .await?;
        str_field(&response, "LinkRouteTableId")
            .map(String::from)
            .ok_or_else(|| malformed("LinkRouteTable", "missing LinkRouteTableId"))
    }

    async fn read_link(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let request = json!({"Filters": {"LinkRouteTableIds": [identifier]}});
        let Some(response) = self
            .api
            .describe(Service::Oapi, "ReadRouteTables", request)
            .await?
        else {
            return Ok(None);
        };

        let link = response
            .get("RouteTables")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .flat_map(|table| {
                table
                    .get("LinkRouteTables")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
            })
            .find(|link| str_field(link, "LinkRouteTableId") == Some(identifier));
        let Some(link) = link else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "link_route_table_id", link, "LinkRouteTableId");
        copy_field(&mut attributes, "route_table_id", link, "RouteTableId");
        copy_field(&mut attributes, "subnet_id", link, "SubnetId");
        Ok(Some(Observation::new("linked").with_attributes(attributes)))
    }

    async fn replace(&self, identifier: &str, to: &Resource) -> ProviderResult<GroupOutcome> {
        let request = json!({
            "AssociationId": identifier,
            "RouteTableId": to.get_str("route_table_id"),
        });
        match self
            .api
            .call(Service::Fcu, "ReplaceRouteTableAssociation", request)
            .await
        {
            Ok(response) => {
                let new = str_field(&response, "NewAssociationId").ok_or_else(|| {
                    malformed("ReplaceRouteTableAssociation", "missing NewAssociationId")
                })?;
                Ok(GroupOutcome::Replaced {
                    identifier: new.to_string(),
                })
            }
            Err(e) if e.is_not_found() => {
                warn!("link {} is gone, linking again: {}", identifier, e.message);
                let identifier = retry(&RetryPolicy::new(LINK_BUDGET), || self.link(to)).await?;
                Ok(GroupOutcome::Replaced { identifier })
            }
            Err(e) => Err(e),
        }
    }
}

impl ResourceHandler for RouteTableLinkHandler {
    fn kind(&self) -> &'static str {
        "route_table_link"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("route_table_link")
            .attribute(AttributeSchema::new("route_table_id", AttributeType::String).required())
            .attribute(
                AttributeSchema::new("subnet_id", AttributeType::String)
                    .required()
                    .force_new(),
            )
    }

    fn policy(&self, operation: Operation) -> RetryPolicy {
        match operation {
            Operation::Create => RetryPolicy::new(LINK_BUDGET),
            _ => RetryPolicy::new(Duration::from_secs(60)),
        }
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
        Box::pin(async move {
            let request: JsonValue = json!({"LinkRouteTableId": identifier});
            self.api
                .call(Service::Oapi, "UnlinkRouteTable", request)
                .await
                .map(|_| ())
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
        Box::pin(self.replace(identifier, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use osc_core::lock::ResourceLocks;
    use osc_core::reconcile::Reconciler;
    use osc_core::resource::ResourceId;
    use std::sync::Arc;

    fn tables(link_id: &str, route_table_id: &str) -> JsonValue {
        json!({"RouteTables": [
            {"RouteTableId": "rtb-main", "LinkRouteTables": []},
            {"RouteTableId": route_table_id, "LinkRouteTables": [{
                "LinkRouteTableId": link_id,
                "RouteTableId": route_table_id,
                "SubnetId": "subnet-1"
            }]}
        ]})
    }

    fn reconciler(cloud: &Arc<FakeCloud>) -> Reconciler<RouteTableLinkHandler> {
        Reconciler::new(
            Arc::new(RouteTableLinkHandler::new(cloud.client())),
            ResourceLocks::new(),
        )
    }

    fn id() -> ResourceId {
        ResourceId::new("route_table_link", "private")
    }

    fn desired(route_table_id: &str) -> Resource {
        Resource::new("route_table_link", "private")
            .with_attribute("route_table_id", route_table_id)
            .with_attribute("subnet_id", "subnet-1")
    }

    fn current(link_id: &str, route_table_id: &str) -> State {
        let attributes = desired(route_table_id).attributes;
        State::existing(id(), attributes).with_identifier(link_id)
    }

    #[tokio::test(start_paused = true)]
    async fn link_waits_for_the_route_table_to_appear() {
        let cloud = FakeCloud::new();
        cloud
            .fail("LinkRouteTable", "InvalidRouteTableID.NotFound", "rtb-1")
            .fail("LinkRouteTable", "InvalidRouteTableID.NotFound", "rtb-1")
            .reply("LinkRouteTable", json!({"LinkRouteTableId": "rtbassoc-1"}))
            .reply("ReadRouteTables", tables("rtbassoc-1", "rtb-1"));

        let state = reconciler(&cloud).create(&desired("rtb-1")).await.unwrap();

        assert_eq!(state.identifier.as_deref(), Some("rtbassoc-1"));
        assert_eq!(state.get_str("route_table_id"), Some("rtb-1"));
        assert_eq!(cloud.count("LinkRouteTable"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn moving_the_subnet_yields_a_new_link() {
        let cloud = FakeCloud::new();
        cloud
            .reply(
                "ReplaceRouteTableAssociation",
                json!({"NewAssociationId": "rtbassoc-2"}),
            )
            .reply("ReadRouteTables", tables("rtbassoc-2", "rtb-2"));

        let outcome = reconciler(&cloud)
            .update(&id(), "rtbassoc-1", &current("rtbassoc-1", "rtb-1"), &desired("rtb-2"))
            .await
            .unwrap();

        assert_eq!(outcome.state.identifier.as_deref(), Some("rtbassoc-2"));
        assert_eq!(
            cloud.requests("ReplaceRouteTableAssociation")[0],
            json!({"AssociationId": "rtbassoc-1", "RouteTableId": "rtb-2"})
        );
        assert_eq!(
            cloud.requests("ReadRouteTables")[0],
            json!({"Filters": {"LinkRouteTableIds": ["rtbassoc-2"]}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_link_is_recreated_on_update() {
        let cloud = FakeCloud::new();
        cloud
            .fail(
                "ReplaceRouteTableAssociation",
                "InvalidAssociationID.NotFound",
                "rtbassoc-1",
            )
            .reply("LinkRouteTable", json!({"LinkRouteTableId": "rtbassoc-3"}))
            .reply("ReadRouteTables", tables("rtbassoc-3", "rtb-2"));

        let outcome = reconciler(&cloud)
            .update(&id(), "rtbassoc-1", &current("rtbassoc-1", "rtb-1"), &desired("rtb-2"))
            .await
            .unwrap();

        assert_eq!(outcome.state.identifier.as_deref(), Some("rtbassoc-3"));
        assert_eq!(
            cloud.mutations(),
            vec!["ReplaceRouteTableAssociation", "LinkRouteTable"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_route_table_on_read_means_gone() {
        let cloud = FakeCloud::new();
        cloud.fail("ReadRouteTables", "InvalidRouteTableID.NotFound", "rtb-1");

        let state = reconciler(&cloud)
            .read(&id(), Some("rtbassoc-1"))
            .await
            .unwrap();

        assert!(!state.exists);
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_of_missing_link_succeeds() {
        let cloud = FakeCloud::new();
        cloud
            .reply("ReadRouteTables", tables("rtbassoc-1", "rtb-1"))
            .fail("UnlinkRouteTable", "InvalidAssociationID.NotFound", "rtbassoc-1");

        reconciler(&cloud).delete(&id(), "rtbassoc-1").await.unwrap();

        assert_eq!(cloud.count("UnlinkRouteTable"), 1);
    }
}
