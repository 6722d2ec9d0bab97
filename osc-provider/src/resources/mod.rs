//! Resource handlers, one per Outscale resource kind

use std::sync::Arc;

use osc_core::reconcile::ResourceHandler;
use serde_json::Value as JsonValue;

use crate::api::ApiClient;

pub mod load_balancer;
pub mod load_balancer_attributes;
pub mod nic;
pub mod public_ip;
pub mod public_ip_link;
pub mod route_table_link;
pub mod security_group;
pub mod tags;
pub mod user;
pub mod vm;
pub mod volume;

pub use load_balancer::LoadBalancerHandler;
pub use load_balancer_attributes::LoadBalancerAttributesHandler;
pub use nic::NicHandler;
pub use public_ip::PublicIpHandler;
pub use public_ip_link::PublicIpLinkHandler;
pub use route_table_link::RouteTableLinkHandler;
pub use security_group::SecurityGroupHandler;
pub use user::UserHandler;
pub use vm::VmHandler;
pub use volume::VolumeHandler;

/// Every handler, sharing one API client
pub fn all(api: &ApiClient) -> Vec<Arc<dyn ResourceHandler>> {
    vec![
        Arc::new(VmHandler::new(api.clone())),
        Arc::new(VolumeHandler::new(api.clone())),
        Arc::new(SecurityGroupHandler::new(api.clone())),
        Arc::new(NicHandler::new(api.clone())),
        Arc::new(PublicIpHandler::new(api.clone())),
        Arc::new(PublicIpLinkHandler::new(api.clone())),
        Arc::new(RouteTableLinkHandler::new(api.clone())),
        Arc::new(LoadBalancerHandler::new(api.clone())),
        Arc::new(LoadBalancerAttributesHandler::new(api.clone())),
        Arc::new(UserHandler::new(api.clone())),
    ]
}

/// First element of `response[list]`; describe calls filtered by ID return at most one
fn first<'a>(response: &'a JsonValue, list: &str) -> Option<&'a JsonValue> {
    response
        .get(list)
        .and_then(|v| v.as_array())
        .and_then(|items| items.first())
}
