//! Tag synchronisation shared by every taggable kind

use std::time::Duration;

use osc_core::differ::{ApplyOrder, DiffPolicy, DiffSet, apply_diff};
use osc_core::provider::{ErrorClass, ProviderResult};
use osc_core::resource::Value;
use osc_core::retry::RetryPolicy;
use osc_core::schema::{AttributeSchema, types};
use serde_json::{Value as JsonValue, json};

use crate::api::{ApiClient, Service};
use crate::utils::{string_map, tags_to_json};

pub const TAGS_ATTRIBUTE: &str = "tags";

/// Tags on a resource that was just created may not be visible for a while
const TAG_BUDGET: Duration = Duration::from_secs(60);

/// Tags left out of the configuration are removed from the resource
pub fn tags_attribute() -> AttributeSchema {
    AttributeSchema::new(TAGS_ATTRIBUTE, types::string_map()).removable()
}

/// Replace the tags of `identifier` from `old` to `new`
///
/// Keys whose value changed are deleted before the new value is written.
pub async fn sync_tags(
    api: &ApiClient,
    service: Service,
    identifier: &str,
    old: Option<&Value>,
    new: Option<&Value>,
) -> ProviderResult<()> {
    let diff = DiffSet::compute_map(&string_map(old), &string_map(new));
    let policy = DiffPolicy::new(
        ApplyOrder::RemoveFirst,
        RetryPolicy::new(TAG_BUDGET).retrying(ErrorClass::NotFound),
    );

    apply_diff(
        &diff,
        &policy,
        |pairs| async move {
            let (action, request) = tag_request(service, identifier, &pairs, true);
            api.call(service, action, request).await.map(|_| ())
        },
        |pairs| async move {
            let (action, request) = tag_request(service, identifier, &pairs, false);
            api.call(service, action, request).await.map(|_| ())
        },
    )
    .await?;
    Ok(())
}

fn tag_request(
    service: Service,
    identifier: &str,
    pairs: &[(String, String)],
    add: bool,
) -> (&'static str, JsonValue) {
    match (service, add) {
        (Service::Lbu, true) => (
            "AddTags",
            json!({"LoadBalancerNames": [identifier], "Tags": tags_to_json(pairs)}),
        ),
        (Service::Lbu, false) => {
            let keys: Vec<JsonValue> = pairs.iter().map(|(k, _)| json!({"Key": k})).collect();
            (
                "RemoveTags",
                json!({"LoadBalancerNames": [identifier], "Tags": keys}),
            )
        }
        (_, true) => (
            "CreateTags",
            json!({"ResourceIds": [identifier], "Tags": tags_to_json(pairs)}),
        ),
        (_, false) => (
            "DeleteTags",
            json!({"ResourceIds": [identifier], "Tags": tags_to_json(pairs)}),
        ),
    }
}
