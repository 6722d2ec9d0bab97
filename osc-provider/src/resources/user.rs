//! Account users (EIM)
//!
//! Users are addressed by name; the path is the only attribute updated in place.

use std::collections::HashMap;
use std::time::Duration;

use osc_core::provider::{BoxFuture, Operation, ProviderResult};
use osc_core::reconcile::{GroupOutcome, ResourceHandler, UpdateGroup};
use osc_core::resource::{Resource, State, Value};
use osc_core::retry::{RetryPolicy, retry};
use osc_core::schema::{AttributeSchema, AttributeType, ResourceSchema};
use osc_core::waiter::Observation;
use serde_json::json;

use crate::api::{ApiClient, Service, malformed};
use crate::utils::{copy_field, str_field};

const GROUPS: [UpdateGroup; 1] = [UpdateGroup::new("path", &["path"])];

/// EIM throttles bursts of identity calls
const THROTTLE_BUDGET: Duration = Duration::from_secs(5 * 60);

const DEFAULT_PATH: &str = "/";

fn user_name_type() -> AttributeType {
    AttributeType::Custom {
        name: "UserName".to_string(),
        validate: |value| match value {
            Value::String(name) if name.is_empty() || name.len() > 64 => {
                Err(format!("User name '{}' must be 1 to 64 characters", name))
            }
            Value::String(name) => match name
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && !"+=,.@-_".contains(*c))
            {
                Some(c) => Err(format!("User name '{}' contains '{}'", name, c)),
                None => Ok(()),
            },
            _ => Err("Expected string".to_string()),
        },
    }
}

pub struct UserHandler {
    api: ApiClient,
}

impl UserHandler {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    async fn create_user(&self, resource: &Resource) -> ProviderResult<String> {
        let request = json!({
            "UserName": resource.get_str("user_name"),
            "Path": resource.get_str("path").unwrap_or(DEFAULT_PATH),
        });
        let response = self.api.call(Service::Eim, "CreateUser", request).await?;
        response
            .get("CreateUserResult")
            .and_then(|result| result.get("User"))
            .and_then(|user| str_field(user, "UserName"))
            .map(String::from)
            .ok_or_else(|| malformed("CreateUser", "missing User"))
    }

    async fn read_user(&self, name: &str) -> ProviderResult<Option<Observation>> {
        let Some(response) = self
            .api
            .describe(Service::Eim, "GetUser", json!({"UserName": name}))
            .await?
        else {
            return Ok(None);
        };
        let Some(user) = response
            .get("GetUserResult")
            .and_then(|result| result.get("User"))
        else {
            return Ok(None);
        };

        let mut attributes = HashMap::new();
        copy_field(&mut attributes, "user_name", user, "UserName");
        copy_field(&mut attributes, "path", user, "Path");
        copy_field(&mut attributes, "arn", user, "Arn");
        copy_field(&mut attributes, "user_id", user, "UserId");
        Ok(Some(Observation::new("active").with_attributes(attributes)))
    }

    async fn move_user(&self, name: &str, to: &Resource) -> ProviderResult<GroupOutcome> {
        let request = json!({
            "UserName": name,
            "NewPath": to.get_str("path").unwrap_or(DEFAULT_PATH),
        });
        retry(&RetryPolicy::new(THROTTLE_BUDGET), || {
            self.api.call(Service::Eim, "UpdateUser", request.clone())
        })
        .await?;
        Ok(GroupOutcome::Applied)
    }
}

impl ResourceHandler for UserHandler {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn schema(&self) -> ResourceSchema {
        ResourceSchema::new("user")
            .attribute(
                AttributeSchema::new("user_name", user_name_type())
                    .required()
                    .force_new(),
            )
            .attribute(
                AttributeSchema::new("path", AttributeType::String)
                    .with_description("Defaults to /"),
            )
    }

    fn policy(&self, _operation: Operation) -> RetryPolicy {
        RetryPolicy::new(THROTTLE_BUDGET)
    }

    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(self.create_user(resource))
    }

    fn observe<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
        Box::pin(self.read_user(identifier))
    }

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            self.api
                .call(Service::Eim, "DeleteUser", json!({"UserName": identifier}))
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
        Box::pin(self.move_user(identifier, to))
    }
}
