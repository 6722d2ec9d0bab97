//! Reconcile - Drive one resource from its observed state to its desired configuration
//!
//! A [`Reconciler`] owns the generic create/read/update/delete sequencing:
//! validation, retries, waits for eventual consistency, per-resource locking and
//! partial-update bookkeeping. Everything kind-specific (which API calls to make,
//! which states to wait for, which errors to retry) comes from a [`ResourceHandler`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::differ::{Diff, changed_attributes, diff};
use crate::effect::Effect;
use crate::lock::ResourceLocks;
use crate::provider::{BoxFuture, Operation, ProviderError, ProviderResult};
use crate::resource::{Resource, ResourceId, State};
use crate::retry::{RetryPolicy, retry};
use crate::schema::ResourceSchema;
use crate::timeouts::{TIMEOUTS_ATTRIBUTE, Timeouts};
use crate::waiter::{Observation, PendingOperation, WaitSpec};

/// Attributes updated together by one call sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateGroup {
    pub name: &'static str,
    pub attributes: &'static [&'static str],
}

impl UpdateGroup {
    pub const fn new(name: &'static str, attributes: &'static [&'static str]) -> Self {
        Self { name, attributes }
    }
}

/// What applying one update group did to the resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Applied,
    /// The change produced a new cloud identifier (e.g. a replaced association)
    Replaced { identifier: String },
}

/// Kind-specific half of the reconcile loop
///
/// Implementations issue API calls only; retries of whole operations, waits,
/// locking and error context are added by the [`Reconciler`].
pub trait ResourceHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    fn schema(&self) -> ResourceSchema;

    /// Default timeouts, overridable per resource
    fn timeouts(&self) -> Timeouts {
        Timeouts::default()
    }

    /// Which errors to retry around each whole operation
    fn policy(&self, operation: Operation) -> RetryPolicy;

    /// Issue the create call(s), returning the new cloud identifier
    fn create<'a>(&'a self, resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>>;

    /// Look the resource up by cloud identifier; `None` when it does not exist
    fn observe<'a>(&'a self, identifier: &'a str)
    -> BoxFuture<'a, ProviderResult<Option<Observation>>>;

    fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>>;

    /// Observed states that count as absent on reads, though waits still see them
    /// (terminated VMs stay visible for a while)
    fn is_gone(&self, _observation: &Observation) -> bool {
        false
    }

    /// Follow-up calls once the created resource is usable (tags, attachments)
    fn finish_create<'a>(
        &'a self,
        _identifier: &'a str,
        _resource: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn create_wait(&self, _resource: &Resource, _timeout: Duration) -> Option<WaitSpec> {
        None
    }

    fn update_wait(&self, _resource: &Resource, _timeout: Duration) -> Option<WaitSpec> {
        None
    }

    fn delete_wait(&self, _timeout: Duration) -> Option<WaitSpec> {
        None
    }

    /// Updatable attribute groups, in the order they must be applied
    fn update_groups(&self) -> Vec<UpdateGroup> {
        Vec::new()
    }

    /// Apply the changes of one group
    fn apply_group<'a>(
        &'a self,
        group: &'a str,
        identifier: &'a str,
        _from: &'a State,
        _to: &'a Resource,
    ) -> BoxFuture<'a, ProviderResult<GroupOutcome>> {
        let kind = self.kind();
        Box::pin(async move {
            Err(ProviderError::validation(format!(
                "{} has no in-place update for '{}' on {}",
                kind, group, identifier
            )))
        })
    }
}

/// Successful update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub state: State,
    /// Attributes whose changes were applied
    pub applied: BTreeSet<String>,
}

/// Failed update; changes listed in `applied` went through before the failure
#[derive(Debug)]
pub struct UpdateError {
    pub applied: BTreeSet<String>,
    pub error: ProviderError,
}

impl UpdateError {
    fn before_any_change(error: ProviderError) -> Self {
        Self {
            applied: BTreeSet::new(),
            error,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.applied.is_empty()
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if self.is_partial() {
            let applied: Vec<&str> = self.applied.iter().map(String::as_str).collect();
            write!(f, " (already applied: {})", applied.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<UpdateError> for ProviderError {
    fn from(err: UpdateError) -> Self {
        if !err.is_partial() {
            return err.error;
        }
        let message = err.to_string();
        let UpdateError { error, .. } = err;
        let mut converted = ProviderError::new(error.class, message);
        converted.resource_id = error.resource_id.clone();
        converted.operation = error.operation;
        converted.with_cause(error)
    }
}

/// Result of applying one [`Effect`]
#[derive(Debug, Clone, PartialEq)]
pub enum EffectOutcome {
    Read { state: State },
    Created { state: State },
    Updated { state: State, applied: BTreeSet<String> },
    Deleted,
}

/// Generic reconcile loop for one resource kind
pub struct Reconciler<H: ResourceHandler + ?Sized = dyn ResourceHandler> {
    handler: Arc<H>,
    locks: ResourceLocks,
}

impl<H: ResourceHandler + ?Sized> Clone for Reconciler<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<H: ResourceHandler + ?Sized> Reconciler<H> {
    /// `locks` should be shared by every reconciler of one provider
    pub fn new(handler: Arc<H>, locks: ResourceLocks) -> Self {
        Self { handler, locks }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn kind(&self) -> &'static str {
        self.handler.kind()
    }

    /// Work out which effect brings `current` to `desired`, if any
    pub fn plan(&self, desired: &Resource, current: &State) -> Option<Effect> {
        match diff(&self.handler.schema(), desired, current) {
            Diff::Create(resource) => Some(Effect::Create(resource)),
            Diff::Update { id, from, to, .. } => {
                let identifier = from.identifier.clone()?;
                Some(Effect::Update {
                    id,
                    identifier,
                    from,
                    to,
                })
            }
            Diff::NoChange(_) => None,
        }
    }

    /// Plan and apply in one step
    pub async fn reconcile(
        &self,
        desired: &Resource,
        current: &State,
    ) -> ProviderResult<Option<EffectOutcome>> {
        match self.plan(desired, current) {
            Some(effect) => self.apply(&effect).await.map(Some),
            None => {
                debug!("{} is up to date", desired.id);
                Ok(None)
            }
        }
    }

    pub async fn apply(&self, effect: &Effect) -> ProviderResult<EffectOutcome> {
        if effect.is_mutating() {
            info!("applying {} of {}", effect.kind(), effect.resource_id());
        } else {
            debug!("applying {} of {}", effect.kind(), effect.resource_id());
        }

        match effect {
            Effect::Read { id, identifier } => {
                let state = self.read(id, identifier.as_deref()).await?;
                Ok(EffectOutcome::Read { state })
            }
            Effect::Create(resource) => {
                let state = self.create(resource).await?;
                Ok(EffectOutcome::Created { state })
            }
            Effect::Update {
                id,
                identifier,
                from,
                to,
            } => {
                let outcome = self.update(id, identifier, from, to).await?;
                Ok(EffectOutcome::Updated {
                    state: outcome.state,
                    applied: outcome.applied,
                })
            }
            Effect::Delete(state) => {
                self.destroy(state).await?;
                Ok(EffectOutcome::Deleted)
            }
        }
    }

    fn validate(&self, resource: &Resource) -> ProviderResult<()> {
        self.handler
            .schema()
            .validate(&resource.attributes)
            .map_err(|errors| {
                let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                ProviderError::validation(messages.join("; "))
            })
    }

    fn timeouts_for(&self, resource: &Resource) -> ProviderResult<Timeouts> {
        self.handler.timeouts().with_overrides(&resource.attributes)
    }

    async fn observe(&self, identifier: &str) -> ProviderResult<Option<Observation>> {
        let policy = self.handler.policy(Operation::Read);
        match retry(&policy, || self.handler.observe(identifier)).await {
            Ok(Some(observation)) if self.handler.is_gone(&observation) => {
                debug!("{} is {}, treating as gone", identifier, observation.state);
                Ok(None)
            }
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }

    async fn settle(
        &self,
        identifier: &str,
        operation: Operation,
        wait: WaitSpec,
    ) -> ProviderResult<Observation> {
        PendingOperation::new(identifier, operation, wait)
            .settle(|| self.handler.observe(identifier))
            .await
    }

    fn to_state(id: &ResourceId, identifier: &str, observation: Observation) -> State {
        State::existing(id.clone(), observation.attributes).with_identifier(identifier)
    }

    /// Keep the configured timeouts in state so a later delete can honour them
    fn with_configured_timeouts(mut state: State, resource: &Resource) -> State {
        if let Some(timeouts) = resource.attributes.get(TIMEOUTS_ATTRIBUTE) {
            state
                .attributes
                .insert(TIMEOUTS_ATTRIBUTE.to_string(), timeouts.clone());
        }
        state
    }

    /// Create the resource and wait until it is usable
    pub async fn create(&self, resource: &Resource) -> ProviderResult<State> {
        let id = &resource.id;
        self.create_inner(resource)
            .await
            .map_err(|e| e.for_resource(id.clone()).during(Operation::Create))
    }

    async fn create_inner(&self, resource: &Resource) -> ProviderResult<State> {
        self.validate(resource)?;
        let timeouts = self.timeouts_for(resource)?;

        let policy = self.handler.policy(Operation::Create);
        let identifier = retry(&policy, || self.handler.create(resource)).await?;
        info!("created {} as {}", resource.id, identifier);

        let _guard = self.locks.lock(&identifier).await;
        self.settle_created(resource, &identifier, timeouts.create)
            .await
            .map_err(|e| e.with_identifier(identifier.as_str()))
    }

    async fn settle_created(
        &self,
        resource: &Resource,
        identifier: &str,
        timeout: Duration,
    ) -> ProviderResult<State> {
        if let Some(wait) = self.handler.create_wait(resource, timeout) {
            self.settle(identifier, Operation::Create, wait).await?;
        }

        self.handler.finish_create(identifier, resource).await?;

        match self.observe(identifier).await? {
            Some(observation) => Ok(Self::with_configured_timeouts(
                Self::to_state(&resource.id, identifier, observation),
                resource,
            )),
            None => Err(ProviderError::unexpected_state(format!(
                "{} disappeared before it could be read",
                identifier
            ))),
        }
    }

    /// Observed state, or `State::not_found` when the resource is gone
    pub async fn read(&self, id: &ResourceId, identifier: Option<&str>) -> ProviderResult<State> {
        let Some(identifier) = identifier else {
            return Ok(State::not_found(id.clone()));
        };

        let observed = self
            .observe(identifier)
            .await
            .map_err(|e| e.for_resource(id.clone()).during(Operation::Read))?;

        match observed {
            Some(observation) => Ok(Self::to_state(id, identifier, observation)),
            None => {
                warn!("{} ({}) no longer exists", id, identifier);
                Ok(State::not_found(id.clone()))
            }
        }
    }

    /// Apply changed attribute groups in order, then re-read
    pub async fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.update_inner(id, identifier, from, to)
            .await
            .map_err(|mut err| {
                err.error = err.error.for_resource(id.clone()).during(Operation::Update);
                err
            })
    }

    async fn update_inner(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.validate(to).map_err(UpdateError::before_any_change)?;
        let timeouts = self.timeouts_for(to).map_err(UpdateError::before_any_change)?;

        let schema = self.handler.schema();
        let changed = changed_attributes(&schema, &to.attributes, &from.attributes);
        let creation_only = schema.creation_only(&changed);
        if !creation_only.is_empty() {
            return Err(UpdateError::before_any_change(ProviderError::validation(
                format!(
                    "changing {} requires replacing the resource",
                    creation_only.join(", ")
                ),
            )));
        }

        let _guard = self.locks.lock(identifier).await;
        let mut identifier = identifier.to_string();

        let groups = self.handler.update_groups();
        for name in &changed {
            if !groups.iter().any(|g| g.attributes.contains(&name.as_str())) {
                warn!("{}: '{}' cannot be updated in place, ignoring", id, name);
            }
        }

        let mut applied = BTreeSet::new();
        for group in &groups {
            let touched: Vec<&str> = group
                .attributes
                .iter()
                .copied()
                .filter(|attr| changed.iter().any(|c| c == attr))
                .collect();
            if touched.is_empty() {
                continue;
            }

            info!("updating {} of {} ({})", group.name, id, identifier);
            match self
                .handler
                .apply_group(group.name, &identifier, from, to)
                .await
            {
                Ok(GroupOutcome::Applied) => {}
                Ok(GroupOutcome::Replaced { identifier: new }) => {
                    info!("{} is now {}", id, new);
                    identifier = new;
                }
                Err(error) => return Err(UpdateError { applied, error }),
            }
            applied.extend(touched.into_iter().map(String::from));
        }

        if !applied.is_empty()
            && let Some(wait) = self.handler.update_wait(to, timeouts.update)
        {
            if let Err(error) = self.settle(&identifier, Operation::Update, wait).await {
                return Err(UpdateError { applied, error });
            }
        }

        match self.observe(&identifier).await {
            Ok(Some(observation)) => Ok(UpdateOutcome {
                state: Self::with_configured_timeouts(
                    Self::to_state(id, &identifier, observation),
                    to,
                ),
                applied,
            }),
            Ok(None) => Err(UpdateError {
                applied,
                error: ProviderError::unexpected_state(format!(
                    "{} disappeared during update",
                    identifier
                )),
            }),
            Err(error) => Err(UpdateError { applied, error }),
        }
    }

    /// Delete the resource with the kind's default timeouts; a resource that is
    /// already gone counts as deleted
    pub async fn delete(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        self.delete_inner(id, identifier, self.handler.timeouts())
            .await
            .map_err(|e| e.for_resource(id.clone()).during(Operation::Delete))
    }

    /// Delete the resource `state` describes, honouring its `timeouts` attribute
    pub async fn destroy(&self, state: &State) -> ProviderResult<()> {
        let id = &state.id;
        let Some(identifier) = state.identifier.as_deref() else {
            debug!("{} was never created, nothing to delete", id);
            return Ok(());
        };

        async {
            let timeouts = self.handler.timeouts().with_overrides(&state.attributes)?;
            self.delete_inner(id, identifier, timeouts).await
        }
        .await
        .map_err(|e| e.for_resource(id.clone()).during(Operation::Delete))
    }

    async fn delete_inner(
        &self,
        id: &ResourceId,
        identifier: &str,
        timeouts: Timeouts,
    ) -> ProviderResult<()> {
        self.delete_locked(id, identifier, timeouts).await?;
        // The guard is released; drop registry entries nobody holds
        self.locks.prune();
        Ok(())
    }

    async fn delete_locked(
        &self,
        id: &ResourceId,
        identifier: &str,
        timeouts: Timeouts,
    ) -> ProviderResult<()> {
        let _guard = self.locks.lock(identifier).await;

        if self.observe(identifier).await?.is_none() {
            warn!("{} ({}) already gone, nothing to delete", id, identifier);
            return Ok(());
        }

        let policy = self.handler.policy(Operation::Delete);
        match retry(&policy, || self.handler.delete(identifier)).await {
            Ok(()) => info!("deleted {} ({})", id, identifier),
            Err(e) if e.is_not_found() => {
                warn!("{} ({}) vanished while deleting", id, identifier);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if let Some(wait) = self.handler.delete_wait(timeouts.delete) {
            self.settle(identifier, Operation::Delete, wait).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ErrorClass;
    use crate::resource::Value;
    use crate::schema::{AttributeSchema, AttributeType, types};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    const GROUPS: [UpdateGroup; 3] = [
        UpdateGroup::new("description", &["description"]),
        UpdateGroup::new("tags", &["tags"]),
        UpdateGroup::new("size", &["size", "iops"]),
    ];

    #[derive(Default)]
    struct FakeHandler {
        calls: Mutex<Vec<String>>,
        observations: Mutex<VecDeque<Option<Observation>>>,
        delete_errors: Mutex<VecDeque<ProviderError>>,
        failing_group: Option<&'static str>,
        wait_on_create: bool,
        wait_on_delete: bool,
    }

    impl FakeHandler {
        fn observing(states: Vec<Option<&str>>) -> Self {
            let observations = states
                .into_iter()
                .map(|s| {
                    s.map(|state| {
                        let mut attrs = HashMap::new();
                        attrs.insert("state".to_string(), Value::String(state.to_string()));
                        Observation::new(state).with_attributes(attrs)
                    })
                })
                .collect();
            Self {
                observations: Mutex::new(observations),
                ..Self::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn next_observation(&self) -> Option<Observation> {
            let mut queue = self.observations.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front().flatten()
            } else {
                queue.front().cloned().flatten()
            }
        }
    }

    impl ResourceHandler for FakeHandler {
        fn kind(&self) -> &'static str {
            "volume"
        }

        fn schema(&self) -> ResourceSchema {
            ResourceSchema::new("volume")
                .attribute(
                    AttributeSchema::new("subregion_name", AttributeType::String)
                        .required()
                        .force_new(),
                )
                .attribute(AttributeSchema::new("size", types::positive_int()))
                .attribute(AttributeSchema::new("description", AttributeType::String))
                .attribute(AttributeSchema::new("tags", types::string_map()).removable())
        }

        fn policy(&self, operation: Operation) -> RetryPolicy {
            match operation {
                Operation::Delete => {
                    RetryPolicy::new(Duration::from_secs(60)).retrying(ErrorClass::Conflict)
                }
                _ => RetryPolicy::new(Duration::from_secs(60)),
            }
        }

        fn create<'a>(&'a self, _resource: &'a Resource) -> BoxFuture<'a, ProviderResult<String>> {
            self.record("create");
            Box::pin(async { Ok("vol-1".to_string()) })
        }

        fn observe<'a>(
            &'a self,
            identifier: &'a str,
        ) -> BoxFuture<'a, ProviderResult<Option<Observation>>> {
            self.record(format!("observe {}", identifier));
            let observation = self.next_observation();
            Box::pin(async move { Ok(observation) })
        }

        fn delete<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, ProviderResult<()>> {
            self.record(format!("delete {}", identifier));
            let result = match self.delete_errors.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            Box::pin(async move { result })
        }

        fn create_wait(&self, _resource: &Resource, timeout: Duration) -> Option<WaitSpec> {
            self.wait_on_create.then(|| {
                WaitSpec::new(&["creating"], &["available"], timeout)
                    .with_delay(Duration::from_secs(10))
            })
        }

        fn delete_wait(&self, timeout: Duration) -> Option<WaitSpec> {
            self.wait_on_delete
                .then(|| WaitSpec::deletion(&["deleting"], &["deleted"], timeout))
        }

        fn update_groups(&self) -> Vec<UpdateGroup> {
            GROUPS.to_vec()
        }

        fn apply_group<'a>(
            &'a self,
            group: &'a str,
            _identifier: &'a str,
            _from: &'a State,
            _to: &'a Resource,
        ) -> BoxFuture<'a, ProviderResult<GroupOutcome>> {
            self.record(format!("apply {}", group));
            let result = if self.failing_group == Some(group) {
                Err(ProviderError::api(format!("{} rejected", group)))
            } else {
                Ok(GroupOutcome::Applied)
            };
            Box::pin(async move { result })
        }
    }

    fn reconciler(handler: FakeHandler) -> Reconciler<FakeHandler> {
        Reconciler::new(Arc::new(handler), ResourceLocks::new())
    }

    fn desired() -> Resource {
        Resource::new("volume", "data")
            .with_attribute("subregion_name", "eu-west-2a")
            .with_attribute("size", 10i64)
    }

    fn current(attributes: &[(&str, Value)]) -> State {
        let attrs = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        State::existing(ResourceId::new("volume", "data"), attrs).with_identifier("vol-1")
    }

    #[tokio::test(start_paused = true)]
    async fn create_rejects_invalid_config_before_any_call() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));
        let resource = Resource::new("volume", "data").with_attribute("size", 10i64);

        let err = r.create(&resource).await.unwrap_err();

        assert_eq!(err.class, ErrorClass::Validation);
        assert_eq!(err.operation, Some(Operation::Create));
        assert!(r.handler().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_then_reads_back() {
        let handler = FakeHandler {
            wait_on_create: true,
            ..FakeHandler::observing(vec![Some("creating"), Some("available")])
        };
        let r = reconciler(handler);

        let state = r.create(&desired()).await.unwrap();

        assert!(state.exists);
        assert_eq!(state.identifier.as_deref(), Some("vol-1"));
        assert_eq!(state.get_str("state"), Some("available"));
        assert_eq!(
            r.handler().calls(),
            vec!["create", "observe vol-1", "observe vol-1", "observe vol-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_fails_when_resource_vanishes_before_read() {
        let r = reconciler(FakeHandler::observing(vec![None]));

        let err = r.create(&desired()).await.unwrap_err();

        assert_eq!(err.class, ErrorClass::UnexpectedState);
        assert_eq!(err.resource_id, Some(ResourceId::new("volume", "data")));
        assert_eq!(err.identifier.as_deref(), Some("vol-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_of_missing_resource_clears_state() {
        let r = reconciler(FakeHandler::observing(vec![None]));
        let id = ResourceId::new("volume", "data");

        let state = r.read(&id, Some("vol-1")).await.unwrap();
        assert!(!state.exists);

        let state = r.read(&id, None).await.unwrap();
        assert!(!state.exists);
        assert_eq!(r.handler().calls(), vec!["observe vol-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_of_absent_resource_skips_delete_call() {
        let r = reconciler(FakeHandler::observing(vec![None]));

        r.delete(&ResourceId::new("volume", "data"), "vol-1")
            .await
            .unwrap();

        assert_eq!(r.handler().calls(), vec!["observe vol-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_treats_not_found_as_success() {
        let handler = FakeHandler::observing(vec![Some("available")]);
        handler
            .delete_errors
            .lock()
            .unwrap()
            .push_back(ProviderError::not_found("InvalidVolume.NotFound"));
        let r = reconciler(handler);

        r.delete(&ResourceId::new("volume", "data"), "vol-1")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delete_retries_conflicts() {
        let handler = FakeHandler::observing(vec![Some("in-use")]);
        {
            let mut errors = handler.delete_errors.lock().unwrap();
            errors.push_back(ProviderError::conflict("VolumeInUse"));
            errors.push_back(ProviderError::conflict("VolumeInUse"));
        }
        let r = reconciler(handler);

        r.delete(&ResourceId::new("volume", "data"), "vol-1")
            .await
            .unwrap();

        let deletes = r
            .handler()
            .calls()
            .iter()
            .filter(|c| c.starts_with("delete"))
            .count();
        assert_eq!(deletes, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn update_stops_at_first_failing_group() {
        let handler = FakeHandler {
            failing_group: Some("tags"),
            ..FakeHandler::observing(vec![Some("available")])
        };
        let r = reconciler(handler);
        let from = current(&[
            ("subregion_name", Value::from("eu-west-2a")),
            ("size", Value::Int(5)),
            ("description", Value::from("old")),
        ]);
        let to = desired()
            .with_attribute("description", "new")
            .with_attribute("tags", Value::Map(HashMap::new()))
            .with_attribute("size", 20i64);

        let err = r
            .update(&ResourceId::new("volume", "data"), "vol-1", &from, &to)
            .await
            .unwrap_err();

        assert!(err.is_partial());
        assert_eq!(err.applied, BTreeSet::from(["description".to_string()]));
        assert_eq!(err.error.operation, Some(Operation::Update));
        assert_eq!(r.handler().calls(), vec!["apply description", "apply tags"]);

        let converted: ProviderError = err.into();
        assert!(converted.message.contains("already applied: description"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_applies_changed_groups_and_rereads() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));
        let from = current(&[
            ("subregion_name", Value::from("eu-west-2a")),
            ("size", Value::Int(5)),
        ]);

        let outcome = r
            .update(&ResourceId::new("volume", "data"), "vol-1", &from, &desired())
            .await
            .unwrap();

        assert_eq!(outcome.applied, BTreeSet::from(["size".to_string()]));
        assert_eq!(outcome.state.identifier.as_deref(), Some("vol-1"));
        assert_eq!(r.handler().calls(), vec!["apply size", "observe vol-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn update_of_creation_only_attribute_requires_replacement() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));
        let from = current(&[
            ("subregion_name", Value::from("eu-west-2b")),
            ("size", Value::Int(10)),
        ]);

        let err = r
            .update(&ResourceId::new("volume", "data"), "vol-1", &from, &desired())
            .await
            .unwrap_err();

        assert_eq!(err.error.class, ErrorClass::Validation);
        assert!(err.error.message.contains("subregion_name"));
        assert!(!err.is_partial());
        assert!(r.handler().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn plan_and_apply() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));
        let missing = State::not_found(ResourceId::new("volume", "data"));

        let effect = r.plan(&desired(), &missing).unwrap();
        assert!(matches!(effect, Effect::Create(_)));

        let up_to_date = current(&[
            ("subregion_name", Value::from("eu-west-2a")),
            ("size", Value::Int(10)),
        ]);
        assert!(r.plan(&desired(), &up_to_date).is_none());
        assert!(r.reconcile(&desired(), &up_to_date).await.unwrap().is_none());

        let outcome = r.apply(&Effect::Delete(up_to_date)).await.unwrap();
        assert_eq!(outcome, EffectOutcome::Deleted);
    }

    fn timeouts_value(entries: &[(&str, &str)]) -> Value {
        Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(*v)))
                .collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn plan_clears_tags_dropped_from_config() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));
        let mut tags = HashMap::new();
        tags.insert("env".to_string(), Value::from("prod"));
        let tagged = current(&[
            ("subregion_name", Value::from("eu-west-2a")),
            ("size", Value::Int(10)),
            ("tags", Value::Map(tags)),
        ]);

        match r.plan(&desired(), &tagged) {
            Some(Effect::Update { identifier, .. }) => assert_eq!(identifier, "vol-1"),
            other => panic!("Expected Update, got {:?}", other),
        }

        let outcome = r
            .update(&ResourceId::new("volume", "data"), "vol-1", &tagged, &desired())
            .await
            .unwrap();
        assert_eq!(outcome.applied, BTreeSet::from(["tags".to_string()]));
        assert_eq!(r.handler().calls(), vec!["apply tags", "observe vol-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_honours_delete_timeout_recorded_in_state() {
        let handler = FakeHandler {
            wait_on_delete: true,
            ..FakeHandler::observing(vec![Some("available"), Some("deleting")])
        };
        let r = reconciler(handler);
        let state = current(&[
            ("subregion_name", Value::from("eu-west-2a")),
            ("timeouts", timeouts_value(&[("delete", "30s")])),
        ]);

        let started = tokio::time::Instant::now();
        let err = r.destroy(&state).await.unwrap_err();

        assert_eq!(err.class, ErrorClass::Timeout);
        assert_eq!(err.operation, Some(Operation::Delete));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_without_identifier_is_a_no_op() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));

        r.destroy(&State::not_found(ResourceId::new("volume", "data")))
            .await
            .unwrap();

        assert!(r.handler().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn created_state_keeps_configured_timeouts() {
        let r = reconciler(FakeHandler::observing(vec![Some("available")]));
        let resource = desired().with_attribute("timeouts", timeouts_value(&[("delete", "1h")]));

        let state = r.create(&resource).await.unwrap();

        assert_eq!(
            state.attributes.get("timeouts"),
            Some(&timeouts_value(&[("delete", "1h")]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successful_delete_prunes_its_lock() {
        let locks = ResourceLocks::new();
        let r = Reconciler::new(
            Arc::new(FakeHandler::observing(vec![Some("available"), None])),
            locks.clone(),
        );

        r.delete(&ResourceId::new("volume", "data"), "vol-1")
            .await
            .unwrap();

        assert_eq!(locks.len(), 0);
    }
}
