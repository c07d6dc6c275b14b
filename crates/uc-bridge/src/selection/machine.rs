//! Selection flow state machine

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uc_core::{is_remote_control_domain, State};
use uc_remote::{RemoteError, HASS_DRIVER_PREFIX};

use super::{
    Awaiting, CompletionCallback, EntityChoice, FailureMenu, FailureReason, FlowError, FlowInput,
    FlowStep, MenuOption, SelectionContext, SelectionForm, SelectionInput, SelectionOutcome,
    DRIVER_FAILURE,
};
use crate::reconcile::compute_delta;
use crate::registry::{EntityEvents, Subscription};

/// Flow negotiating the entity list of one remote
///
/// Drive it with [`step`](Self::step): first [`FlowInput::Start`], then
/// whatever the returned step asks for. Dropping a pending `step` future
/// abandons the current step.
pub struct EntitySelectionFlow {
    ctx: SelectionContext,
    awaiting: Awaiting,
    /// Client identifier resolved during discovery
    client_id: String,
    /// Error carried into the next form
    discovery_error: Option<String>,
    /// Outcome of a push that succeeded before a later step failed
    applied: Option<SelectionOutcome>,
    on_complete: Option<CompletionCallback>,
}

impl EntitySelectionFlow {
    pub fn new(ctx: SelectionContext, on_complete: CompletionCallback) -> Self {
        Self {
            ctx,
            awaiting: Awaiting::Start,
            client_id: String::new(),
            discovery_error: None,
            applied: None,
            on_complete: Some(on_complete),
        }
    }

    pub fn awaiting(&self) -> Awaiting {
        self.awaiting
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn remote_name(&self) -> &str {
        self.ctx.remote.name()
    }

    /// Advance the flow with user input
    pub async fn step(&mut self, input: FlowInput) -> Result<FlowStep, FlowError> {
        let step = match (self.awaiting, input) {
            (Awaiting::Finished, _) => return Err(FlowError::Finished),
            (Awaiting::Start, FlowInput::Start) => self.start().await,
            (Awaiting::Form, FlowInput::Form(input)) => self.apply(input).await,
            (Awaiting::Menu, FlowInput::Menu(MenuOption::Retry)) => {
                info!(remote = self.ctx.remote.name(), "Retrying entity selection");
                self.applied = None;
                self.start().await
            }
            (Awaiting::Menu, FlowInput::Menu(MenuOption::Skip)) => {
                let outcome = self.applied.take().unwrap_or(SelectionOutcome::Skipped);
                FlowStep::Done(outcome)
            }
            (expected, _) => return Err(FlowError::UnexpectedInput { expected }),
        };

        self.awaiting = match &step {
            FlowStep::Form(_) => Awaiting::Form,
            FlowStep::Menu(_) => Awaiting::Menu,
            FlowStep::Done(outcome) => {
                if let Some(on_complete) = self.on_complete.take() {
                    on_complete(outcome);
                }
                Awaiting::Finished
            }
        };
        Ok(step)
    }

    async fn start(&mut self) -> FlowStep {
        self.discovery_error = self.discover().await.err();

        match self.await_subscription().await {
            Some(subscription) => FlowStep::Form(self.form(&subscription)),
            None => {
                warn!(
                    remote = self.ctx.remote.name(),
                    client_id = %self.client_id,
                    "Remote did not subscribe to entity events"
                );
                FlowStep::Menu(FailureMenu::new(FailureReason::NoSubscription))
            }
        }
    }

    /// Resolve the client id and make the remote reload its Home Assistant
    /// entities
    ///
    /// Every enabled driver is refreshed even when an earlier one fails.
    /// Returns the form error key of the first failure.
    #[instrument(skip(self), fields(remote = self.ctx.remote.name()))]
    async fn discover(&mut self) -> Result<(), String> {
        let remote = Arc::clone(&self.ctx.remote);

        self.client_id = match remote.get_remote_wifi_info().await {
            Ok(info) => info.ip_address.filter(|ip| !ip.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read network info from remote");
                None
            }
        }
        .or_else(|| remote.ip_address())
        .unwrap_or_else(|| remote.hostname().to_string());
        debug!(client_id = %self.client_id, "Resolved client id");

        let integrations = remote
            .get_remote_integrations()
            .await
            .map_err(|e| driver_failure(&e))?;

        let mut failure = None;
        for integration in integrations
            .iter()
            .filter(|i| i.enabled && i.is_hass_driver())
        {
            match remote
                .get_remote_integration_entities(&integration.integration_id, true)
                .await
            {
                Ok(_) => debug!(integration = %integration.integration_id, "Refreshed driver entities"),
                Err(e) => {
                    warn!(integration = %integration.integration_id, "Driver entity refresh failed");
                    let key = driver_failure(&e);
                    failure.get_or_insert(key);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Poll for the client's subscription, then fall back to an
    /// unidentified one
    async fn await_subscription(&self) -> Option<Arc<Subscription<EntityEvents>>> {
        let timing = self.ctx.timing;
        for attempt in 1..=timing.poll_attempts {
            if attempt > 1 {
                tokio::time::sleep(timing.poll_interval).await;
            }
            let found = self
                .ctx
                .registry
                .get_subscribed_entities(Some(self.client_id.as_str()));
            if let Some(subscription) = found {
                debug!(attempt, subscription = %subscription.id, "Found client subscription");
                return Some(subscription);
            }
            debug!(attempt, client_id = %self.client_id, "No subscription yet");
        }
        self.ctx.registry.get_unidentified_subscription()
    }

    /// Current subscription of the client, re-read from the registry
    fn resolve_subscription(&self) -> Option<Arc<Subscription<EntityEvents>>> {
        self.ctx
            .registry
            .get_subscribed_entities(Some(self.client_id.as_str()))
            .or_else(|| self.ctx.registry.get_unidentified_subscription())
    }

    fn form(&self, subscription: &Subscription<EntityEvents>) -> SelectionForm {
        let subscribed = &subscription.entity_ids;
        let stored = &self.ctx.options.available_entities;

        let mut add_entities: Vec<EntityChoice> = self
            .ctx
            .states
            .all()
            .iter()
            .filter(|state| is_remote_control_domain(state.domain()))
            .filter(|state| {
                let id = state.entity_id.to_string();
                !subscribed.contains(&id) && !stored.contains(&id)
            })
            .map(choice)
            .collect();
        add_entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        let remove_entities = (!subscribed.is_empty()).then(|| {
            subscribed
                .iter()
                .map(|id| match self.ctx.states.get(id) {
                    Some(state) => choice(&state),
                    None => EntityChoice {
                        entity_id: id.clone(),
                        name: id.clone(),
                    },
                })
                .collect()
        });

        let mut errors = BTreeMap::new();
        if let Some(key) = &self.discovery_error {
            errors.insert("base".to_string(), key.clone());
        }

        let mut description_placeholders = BTreeMap::new();
        description_placeholders.insert("remote".to_string(), self.ctx.remote.name().to_string());
        description_placeholders.insert("subscribed".to_string(), subscribed.len().to_string());

        SelectionForm {
            add_entities,
            remove_entities,
            subscribe_entities: true,
            errors,
            description_placeholders,
        }
    }

    #[instrument(skip(self, input), fields(remote = self.ctx.remote.name()))]
    async fn apply(&mut self, input: SelectionInput) -> FlowStep {
        let Some(subscription) = self.resolve_subscription() else {
            warn!("Subscription vanished before the selection was applied");
            return FlowStep::Menu(FailureMenu::new(FailureReason::NoSubscription));
        };

        let delta = compute_delta(
            &subscription.entity_ids,
            &input.add_entities,
            &input.remove_entities,
        );
        let states: Vec<State> = delta
            .final_set
            .iter()
            .filter_map(|id| self.ctx.states.get(id))
            .collect();

        let configuration = self
            .ctx
            .registry
            .get_driver_subscription(Some(subscription.client_id.as_str()))
            .or_else(|| self.ctx.registry.get_unidentified_driver_subscription());
        let Some(configuration) = configuration else {
            warn!(client_id = %subscription.client_id, "No configuration subscription to push to");
            return FlowStep::Menu(FailureMenu::new(FailureReason::NoConfigurationSubscription));
        };

        if let Err(e) = configuration.notify(json!({ "data": states })) {
            warn!(error = %e, "Failed to push entity configuration");
            return FlowStep::Menu(FailureMenu::new(FailureReason::PushFailed(e.to_string())));
        }
        info!(
            entities = states.len(),
            added = delta.add.len(),
            removed = delta.remove.len(),
            "Pushed entity configuration"
        );

        let client_id = if subscription.client_id.is_empty() {
            self.client_id.clone()
        } else {
            subscription.client_id.clone()
        };
        self.ctx.client_entities.apply_delta(&client_id, &delta);

        let available_entities: BTreeSet<String> = self
            .ctx
            .options
            .available_entities
            .difference(&delta.remove)
            .cloned()
            .chain(delta.final_set.iter().cloned())
            .collect();
        let outcome = SelectionOutcome::Applied {
            client_id,
            available_entities,
        };

        if !input.subscribe_entities {
            return FlowStep::Done(outcome);
        }
        self.applied = Some(outcome.clone());

        let driver_id = if subscription.driver_id.is_empty() {
            configuration.driver_id.clone()
        } else {
            subscription.driver_id.clone()
        };
        match self.notify_driver(&driver_id).await {
            Ok(()) => {
                self.applied = None;
                FlowStep::Done(outcome)
            }
            Err(reason) => FlowStep::Menu(FailureMenu::new(reason)),
        }
    }

    /// Make the driver reload its entities and reset its selection to all
    async fn notify_driver(&self, driver_id: &str) -> Result<(), FailureReason> {
        let remote = &self.ctx.remote;
        let integrations = remote
            .get_remote_integrations()
            .await
            .map_err(|e| FailureReason::Remote(driver_failure(&e)))?;

        let driver_id = if driver_id.is_empty() {
            HASS_DRIVER_PREFIX
        } else {
            driver_id
        };
        let Some(integration) = integrations.iter().find(|i| i.driver_id == driver_id) else {
            warn!(driver_id, "No integration found for driver");
            return Err(FailureReason::IntegrationNotFound(driver_id.to_string()));
        };

        remote
            .get_remote_integration_entities(&integration.integration_id, true)
            .await
            .map_err(|e| FailureReason::Remote(driver_failure(&e)))?;
        tokio::time::sleep(self.ctx.timing.settle_delay).await;
        remote
            .set_remote_integration_entities(&integration.integration_id, &[])
            .await
            .map_err(|e| FailureReason::Remote(driver_failure(&e)))?;

        info!(
            driver_id,
            integration = %integration.integration_id,
            "Driver entities refreshed"
        );
        Ok(())
    }
}

fn choice(state: &State) -> EntityChoice {
    let entity_id = state.entity_id.to_string();
    let name = state
        .attributes
        .get("friendly_name")
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| entity_id.clone());
    EntityChoice { entity_id, name }
}

fn driver_failure(e: &RemoteError) -> String {
    warn!(error = %e, "Remote driver request failed");
    match e {
        RemoteError::Authentication => e.form_key().to_string(),
        _ => DRIVER_FAILURE.to_string(),
    }
}
