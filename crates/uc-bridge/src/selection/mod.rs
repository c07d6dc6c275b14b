//! Interactive entity selection
//!
//! Negotiates with the user which entities a remote gets. The flow waits
//! for the remote to subscribe, presents add/remove choices, pushes the
//! resulting entity list through the remote's configuration subscription
//! and finally asks the remote's driver to pick up the new list.
//!
//! ```text
//! Start -> discover integrations -> await subscription -> form
//! form  -> apply selection -> notify driver -> done
//! any failure -> menu (retry | skip)
//! ```

mod machine;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uc_config::SelectionConfig;
use uc_hass::StateStore;
use uc_remote::RemoteClient;

use crate::reconcile::ClientEntityRegistry;
use crate::registry::SubscriptionRegistry;

pub use machine::EntitySelectionFlow;

/// Step id of the entity form
pub const SELECT_ENTITIES_STEP: &str = "select_entities";
/// Step id of the failure menu
pub const FAILURE_MENU_STEP: &str = "error";

/// Form error shown when the remote's driver could not be reached
pub const DRIVER_FAILURE: &str = "ha_driver_failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionTiming {
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Wait between refreshing the driver's entities and resetting its selection
    pub settle_delay: Duration,
}

impl Default for SelectionTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_attempts: 10,
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl From<&SelectionConfig> for SelectionTiming {
    fn from(config: &SelectionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            poll_attempts: config.poll_attempts.max(1),
            settle_delay: config.settle_delay(),
        }
    }
}

/// Options stored from the previous selection of a remote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOptions {
    #[serde(default)]
    pub available_entities: BTreeSet<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Everything a selection flow reads from or writes to
#[derive(Clone)]
pub struct SelectionContext {
    pub remote: Arc<dyn RemoteClient>,
    pub registry: Arc<SubscriptionRegistry>,
    pub states: Arc<StateStore>,
    pub client_entities: Arc<ClientEntityRegistry>,
    pub timing: SelectionTiming,
    pub options: SelectionOptions,
}

/// One selectable entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityChoice {
    pub entity_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionForm {
    pub add_entities: Vec<EntityChoice>,
    /// Only offered when the remote already subscribes to something
    pub remove_entities: Option<Vec<EntityChoice>>,
    pub subscribe_entities: bool,
    pub errors: BTreeMap<String, String>,
    pub description_placeholders: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuOption {
    Retry,
    Skip,
}

impl MenuOption {
    pub const ALL: [MenuOption; 2] = [MenuOption::Retry, MenuOption::Skip];

    pub fn as_str(&self) -> &'static str {
        match self {
            MenuOption::Retry => "retry",
            MenuOption::Skip => "skip",
        }
    }
}

/// Why the flow fell back to the menu
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The remote never subscribed while we waited
    NoSubscription,
    /// The remote has no configuration subscription to push to
    NoConfigurationSubscription,
    PushFailed(String),
    /// Talking to the remote failed; carries the form error key
    Remote(String),
    IntegrationNotFound(String),
}

impl FailureReason {
    pub fn key(&self) -> &str {
        match self {
            FailureReason::NoSubscription => "no_subscription",
            FailureReason::NoConfigurationSubscription => "no_configuration_subscription",
            FailureReason::PushFailed(_) => "push_failed",
            FailureReason::Remote(key) => key,
            FailureReason::IntegrationNotFound(_) => DRIVER_FAILURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureMenu {
    pub reason: FailureReason,
    pub options: Vec<MenuOption>,
}

impl FailureMenu {
    pub fn new(reason: FailureReason) -> Self {
        Self {
            reason,
            options: MenuOption::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SelectionOutcome {
    Applied {
        client_id: String,
        available_entities: BTreeSet<String>,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep {
    Form(SelectionForm),
    Menu(FailureMenu),
    Done(SelectionOutcome),
}

/// Submitted entity form
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SelectionInput {
    #[serde(default)]
    pub add_entities: BTreeSet<String>,
    #[serde(default)]
    pub remove_entities: BTreeSet<String>,
    #[serde(default = "default_subscribe")]
    pub subscribe_entities: bool,
}

fn default_subscribe() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowInput {
    Start,
    Form(SelectionInput),
    Menu(MenuOption),
}

/// What the flow expects next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Start,
    Form,
    Menu,
    Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow is waiting for {expected:?} input")]
    UnexpectedInput { expected: Awaiting },

    #[error("flow already finished")]
    Finished,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Called once with the outcome when the flow finishes
pub type CompletionCallback = Box<dyn FnOnce(&SelectionOutcome) + Send + Sync>;
