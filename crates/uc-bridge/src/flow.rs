//! Flow manager
//!
//! Hosts entity selection flows behind the `config_entries/flow` commands.
//! Every started flow gets an id; progressing it feeds the user input into
//! the flow and renders the next step in the config-flow result format.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uc_core::DOMAIN;

use crate::integration::Integration;
use crate::selection::{
    Awaiting, EntityChoice, EntitySelectionFlow, FlowError, FlowInput, FlowStep, MenuOption,
    SelectionInput, SelectionOutcome, FAILURE_MENU_STEP, SELECT_ENTITIES_STEP,
};

/// Result of a flow step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    /// form, menu, create_entry or abort
    #[serde(rename = "type")]
    pub result_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Always present, empty if the step has no form
    pub data_schema: Vec<FormField>,
    pub errors: Option<HashMap<String, String>>,
    pub description_placeholders: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub menu_options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub last_step: Option<bool>,
}

impl FlowResult {
    fn new(flow_id: &str, result_type: &str) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            handler: DOMAIN.to_string(),
            result_type: result_type.to_string(),
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            description_placeholders: None,
            menu_options: None,
            title: None,
            reason: None,
            result: None,
            last_step: None,
        }
    }
}

/// Form field schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Choices of a multi-select field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

impl From<&EntityChoice> for SelectOption {
    fn from(choice: &EntityChoice) -> Self {
        Self {
            value: choice.entity_id.clone(),
            label: choice.name.clone(),
        }
    }
}

/// Menu submission
#[derive(Debug, Deserialize)]
struct MenuSelection {
    next_step_id: MenuOption,
}

struct FlowEntry {
    remote: String,
    /// Connection that started the flow
    owner: Option<u64>,
    flow: Arc<Mutex<EntitySelectionFlow>>,
    cancel: CancellationToken,
}

pub struct FlowManager {
    integration: Arc<Integration>,
    flows: DashMap<String, FlowEntry>,
}

impl FlowManager {
    pub fn new(integration: Arc<Integration>) -> Self {
        Self {
            integration,
            flows: DashMap::new(),
        }
    }

    /// Create a selection flow for a remote without running it
    ///
    /// `remote` may be omitted when exactly one remote is configured. A flow
    /// with an `owner` is aborted by [`abort_owned_by`](Self::abort_owned_by).
    pub fn create_flow(
        &self,
        handler: &str,
        remote: Option<&str>,
        owner: Option<u64>,
    ) -> Result<String, String> {
        if handler != DOMAIN {
            return Err(format!("Unknown flow handler: {handler}"));
        }
        let flow = self
            .integration
            .selection_flow(remote)
            .map_err(|e| e.to_string())?;

        let flow_id = ulid::Ulid::new().to_string().to_lowercase();
        let remote = flow.remote_name().to_string();
        info!(flow_id = %flow_id, remote = %remote, ?owner, "Created entity selection flow");
        self.flows.insert(
            flow_id.clone(),
            FlowEntry {
                remote,
                owner,
                flow: Arc::new(Mutex::new(flow)),
                cancel: CancellationToken::new(),
            },
        );
        Ok(flow_id)
    }

    /// Run a created flow to its first step
    pub async fn begin(&self, flow_id: &str) -> Result<FlowResult, String> {
        self.run(flow_id, FlowInput::Start).await
    }

    /// Create a flow and run it to its first step
    pub async fn start_flow(&self, handler: &str, remote: Option<&str>) -> Result<FlowResult, String> {
        let flow_id = self.create_flow(handler, remote, None)?;
        self.begin(&flow_id).await
    }

    /// Continue a flow with user input
    pub async fn progress_flow(
        &self,
        flow_id: &str,
        user_input: Option<Value>,
    ) -> Result<FlowResult, String> {
        let (flow, _) = self.entry(flow_id)?;
        let awaiting = flow.lock().await.awaiting();
        let input = parse_input(awaiting, user_input.unwrap_or_else(|| json!({})))
            .map_err(|e| e.to_string())?;
        self.run(flow_id, input).await
    }

    fn entry(&self, flow_id: &str) -> Result<(Arc<Mutex<EntitySelectionFlow>>, CancellationToken), String> {
        self.flows
            .get(flow_id)
            .map(|entry| (Arc::clone(&entry.flow), entry.cancel.clone()))
            .ok_or_else(|| format!("Flow not found: {flow_id}"))
    }

    /// Step the flow until it yields or is aborted
    ///
    /// An aborted step is dropped at its next suspension point, so no later
    /// device call or completion callback runs.
    async fn run(&self, flow_id: &str, input: FlowInput) -> Result<FlowResult, String> {
        let (flow, cancel) = self.entry(flow_id)?;
        let aborted = || format!("Flow aborted: {flow_id}");

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(aborted()),
            guard = flow.lock() => guard,
        };
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(flow_id, "Flow step cancelled");
                return Err(aborted());
            }
            step = guard.step(input) => step.map_err(|e| e.to_string())?,
        };
        let title = guard.remote_name().to_string();
        drop(guard);

        if let FlowStep::Done(_) = step {
            self.flows.remove(flow_id);
            debug!(flow_id, "Flow finished");
        }
        Ok(render(flow_id, &title, step))
    }

    /// Flows waiting for input
    pub fn list_flows(&self) -> Vec<Value> {
        self.flows
            .iter()
            .map(|entry| {
                json!({
                    "flow_id": entry.key(),
                    "handler": DOMAIN,
                    "context": { "source": "user", "remote": entry.remote },
                })
            })
            .collect()
    }

    /// Remove a flow and cancel its running step
    pub fn abort_flow(&self, flow_id: &str) -> bool {
        match self.flows.remove(flow_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                info!(flow_id, "Flow aborted");
                true
            }
            None => false,
        }
    }

    /// Abort every flow started by connection `owner`
    pub fn abort_owned_by(&self, owner: u64) -> usize {
        let owned: Vec<String> = self
            .flows
            .iter()
            .filter(|entry| entry.owner == Some(owner))
            .map(|entry| entry.key().clone())
            .collect();
        owned.iter().filter(|flow_id| self.abort_flow(flow_id)).count()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

fn parse_input(awaiting: Awaiting, user_input: Value) -> Result<FlowInput, FlowError> {
    match awaiting {
        Awaiting::Form => serde_json::from_value::<SelectionInput>(user_input)
            .map(FlowInput::Form)
            .map_err(|e| FlowError::InvalidInput(e.to_string())),
        Awaiting::Menu => serde_json::from_value::<MenuSelection>(user_input)
            .map(|selection| FlowInput::Menu(selection.next_step_id))
            .map_err(|e| FlowError::InvalidInput(e.to_string())),
        Awaiting::Start => Ok(FlowInput::Start),
        Awaiting::Finished => Err(FlowError::Finished),
    }
}

fn render(flow_id: &str, title: &str, step: FlowStep) -> FlowResult {
    match step {
        FlowStep::Form(form) => {
            let mut data_schema = vec![FormField {
                name: "add_entities".to_string(),
                field_type: "multi_select".to_string(),
                required: Some(false),
                default: Some(json!([])),
                options: Some(form.add_entities.iter().map(SelectOption::from).collect()),
            }];
            if let Some(remove) = &form.remove_entities {
                data_schema.push(FormField {
                    name: "remove_entities".to_string(),
                    field_type: "multi_select".to_string(),
                    required: Some(false),
                    default: Some(json!([])),
                    options: Some(remove.iter().map(SelectOption::from).collect()),
                });
            }
            data_schema.push(FormField {
                name: "subscribe_entities".to_string(),
                field_type: "boolean".to_string(),
                required: Some(false),
                default: Some(json!(form.subscribe_entities)),
                options: None,
            });

            FlowResult {
                step_id: Some(SELECT_ENTITIES_STEP.to_string()),
                data_schema,
                errors: Some(form.errors.into_iter().collect()),
                description_placeholders: Some(form.description_placeholders.into_iter().collect()),
                last_step: Some(false),
                ..FlowResult::new(flow_id, "form")
            }
        }
        FlowStep::Menu(menu) => {
            let mut placeholders = HashMap::new();
            placeholders.insert("reason".to_string(), menu.reason.key().to_string());
            FlowResult {
                step_id: Some(FAILURE_MENU_STEP.to_string()),
                description_placeholders: Some(placeholders),
                menu_options: Some(menu.options.iter().map(|o| o.as_str().to_string()).collect()),
                ..FlowResult::new(flow_id, "menu")
            }
        }
        FlowStep::Done(outcome @ SelectionOutcome::Applied { .. }) => FlowResult {
            title: Some(title.to_string()),
            result: serde_json::to_value(&outcome).ok(),
            ..FlowResult::new(flow_id, "create_entry")
        },
        FlowStep::Done(SelectionOutcome::Skipped) => FlowResult {
            reason: Some("skipped".to_string()),
            ..FlowResult::new(flow_id, "abort")
        },
    }
}
