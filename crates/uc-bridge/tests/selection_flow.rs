//! Entity selection flow against an in-memory remote

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uc_bridge::selection::{
    Awaiting, EntitySelectionFlow, FailureReason, FlowError, FlowInput, FlowStep, MenuOption,
    SelectionContext, SelectionInput, SelectionOptions, SelectionOutcome, SelectionTiming,
    DRIVER_FAILURE,
};
use uc_bridge::websocket::{handle_message, ActiveConnection, OutgoingMessage};
use uc_bridge::{
    BridgeError, BridgeState, ClientEntityRegistry, FlowManager, Integration, Notify,
    RemoteCoordinator, SubscriptionRegistry, SubscriptionRequest,
};
use uc_core::Context;
use uc_hass::{EventBus, StateStore};
use uc_remote::{IntegrationEntity, IntegrationInstance, RemoteClient, RemoteError, WifiInfo};

const CLIENT: &str = "192.168.1.20";

struct MockRemote {
    integrations: Mutex<Vec<IntegrationInstance>>,
    fail_integrations: AtomicBool,
    /// Integrations whose entity refresh fails
    fail_refresh: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl MockRemote {
    fn new() -> Self {
        Self {
            integrations: Mutex::new(vec![
                IntegrationInstance {
                    integration_id: "hass.main".to_string(),
                    driver_id: "hass".to_string(),
                    enabled: true,
                    device_state: Some("CONNECTED".to_string()),
                    name: None,
                },
                IntegrationInstance {
                    integration_id: "roon.main".to_string(),
                    driver_id: "roon".to_string(),
                    enabled: true,
                    device_state: None,
                    name: None,
                },
            ]),
            fail_integrations: AtomicBool::new(false),
            fail_refresh: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push((call, Instant::now()));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(call, _)| call.clone()).collect()
    }

    /// Time of the last call named `call`
    fn last_call_at(&self, call: &str) -> Option<Instant> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(c, _)| c == call)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn get_remote_integrations(&self) -> uc_remote::Result<Vec<IntegrationInstance>> {
        self.record("integrations".to_string());
        if self.fail_integrations.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 500,
                message: "driver crashed".to_string(),
            });
        }
        Ok(self.integrations.lock().clone())
    }

    async fn get_remote_integration_entities(
        &self,
        integration_id: &str,
        force_refresh: bool,
    ) -> uc_remote::Result<Vec<IntegrationEntity>> {
        self.record(format!("entities {integration_id} {force_refresh}"));
        if self.fail_refresh.lock().iter().any(|id| id == integration_id) {
            return Err(RemoteError::Status {
                status: 503,
                message: "driver unavailable".to_string(),
            });
        }
        Ok(Vec::new())
    }

    async fn set_remote_integration_entities(
        &self,
        integration_id: &str,
        entity_ids: &[String],
    ) -> uc_remote::Result<()> {
        self.record(format!("set {integration_id} {entity_ids:?}"));
        Ok(())
    }

    async fn get_remote_wifi_info(&self) -> uc_remote::Result<WifiInfo> {
        Ok(WifiInfo {
            address: None,
            ip_address: Some(CLIENT.to_string()),
        })
    }

    fn ip_address(&self) -> Option<String> {
        None
    }

    fn hostname(&self) -> &str {
        "remote.local"
    }

    fn name(&self) -> &str {
        "Living room"
    }
}

struct Fixture {
    remote: Arc<MockRemote>,
    states: Arc<StateStore>,
    registry: Arc<SubscriptionRegistry>,
    client_entities: Arc<ClientEntityRegistry>,
}

impl Fixture {
    fn new() -> Self {
        let states = Arc::new(StateStore::new(Arc::new(EventBus::new())));
        for (entity_id, state) in [
            ("light.x", "on"),
            ("switch.y", "off"),
            ("media_player.tv", "idle"),
            ("sensor.temperature", "21"),
        ] {
            states.set(entity_id.parse().unwrap(), state, HashMap::new(), Context::new());
        }
        Self {
            remote: Arc::new(MockRemote::new()),
            registry: Arc::new(SubscriptionRegistry::new(states.clone())),
            states,
            client_entities: Arc::new(ClientEntityRegistry::new()),
        }
    }

    fn flow(&self, options: SelectionOptions) -> (EntitySelectionFlow, mpsc::UnboundedReceiver<SelectionOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SelectionContext {
            remote: self.remote.clone(),
            registry: self.registry.clone(),
            states: self.states.clone(),
            client_entities: self.client_entities.clone(),
            timing: SelectionTiming::default(),
            options,
        };
        let flow = EntitySelectionFlow::new(
            ctx,
            Box::new(move |outcome: &SelectionOutcome| {
                let _ = tx.send(outcome.clone());
            }),
        );
        (flow, rx)
    }

    fn subscribe(&self, client_id: &str, entities: &[&str]) {
        self.registry.register_entities_subscription(
            SubscriptionRequest::new(client_id, "hass").with_entities(entities.iter().copied()),
            Arc::new(|_: Value| -> Result<(), BridgeError> { Ok(()) }),
        );
    }

    fn configuration(&self, client_id: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify: Arc<dyn Notify> = Arc::new(move |payload: Value| -> Result<(), BridgeError> {
            tx.send(payload).map_err(|e| BridgeError::Notify(e.to_string()))
        });
        self.registry
            .register_configuration_subscription(SubscriptionRequest::new(client_id, "hass"), notify);
        rx
    }
}

fn selection(add: &[&str], remove: &[&str], subscribe: bool) -> FlowInput {
    FlowInput::Form(SelectionInput {
        add_entities: add.iter().map(|s| s.to_string()).collect(),
        remove_entities: remove.iter().map(|s| s.to_string()).collect(),
        subscribe_entities: subscribe,
    })
}

fn ids(choices: &[uc_bridge::selection::EntityChoice]) -> Vec<&str> {
    choices.iter().map(|c| c.entity_id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn end_to_end_selection_pushes_final_states() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &["light.x"]);
    let mut pushes = fixture.configuration(CLIENT);
    let (mut flow, mut completed) = fixture.flow(SelectionOptions::default());

    let FlowStep::Form(form) = flow.step(FlowInput::Start).await.unwrap() else {
        panic!("expected the selection form");
    };
    assert_eq!(ids(&form.add_entities), ["media_player.tv", "switch.y"]);
    assert_eq!(ids(form.remove_entities.as_deref().unwrap()), ["light.x"]);
    assert!(form.subscribe_entities);
    assert!(form.errors.is_empty());
    assert_eq!(flow.client_id(), CLIENT);

    let step = flow
        .step(selection(&["switch.y"], &["light.x"], true))
        .await
        .unwrap();
    let expected = SelectionOutcome::Applied {
        client_id: CLIENT.to_string(),
        available_entities: BTreeSet::from(["switch.y".to_string()]),
    };
    assert_eq!(step, FlowStep::Done(expected.clone()));

    let pushed = pushes.try_recv().unwrap();
    let data = pushed["data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["entity_id"], "switch.y");
    assert_eq!(data[0]["state"], "off");

    assert_eq!(completed.try_recv().unwrap(), expected);
    assert_eq!(
        fixture.client_entities.granted(CLIENT),
        BTreeSet::from(["switch.y".to_string()])
    );

    let calls = fixture.remote.calls();
    assert!(calls.contains(&"entities hass.main true".to_string()));
    assert!(!calls.iter().any(|c| c.contains("roon.main")));
    assert_eq!(calls.last().unwrap(), "set hass.main []");
    assert_eq!(flow.awaiting(), Awaiting::Finished);
}

#[tokio::test(start_paused = true)]
async fn subscription_on_last_poll_reaches_form() {
    let fixture = Fixture::new();
    let registry = fixture.registry.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(8_500)).await;
        registry.register_entities_subscription(
            SubscriptionRequest::new(CLIENT, "hass"),
            Arc::new(|_: Value| -> Result<(), BridgeError> { Ok(()) }),
        );
    });
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    let started = Instant::now();
    let step = flow.step(FlowInput::Start).await.unwrap();
    let elapsed = started.elapsed();

    let FlowStep::Form(form) = step else {
        panic!("expected the selection form");
    };
    assert!(form.remove_entities.is_none());
    assert_eq!(ids(&form.add_entities), ["light.x", "media_player.tv", "switch.y"]);
    assert!(elapsed >= Duration::from_secs(9), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn missing_subscription_leads_to_menu_and_skip() {
    let fixture = Fixture::new();
    let (mut flow, mut completed) = fixture.flow(SelectionOptions::default());

    let FlowStep::Menu(menu) = flow.step(FlowInput::Start).await.unwrap() else {
        panic!("expected the failure menu");
    };
    assert_eq!(menu.reason, FailureReason::NoSubscription);
    assert_eq!(menu.options, [MenuOption::Retry, MenuOption::Skip]);

    let step = flow.step(FlowInput::Menu(MenuOption::Skip)).await.unwrap();
    assert_eq!(step, FlowStep::Done(SelectionOutcome::Skipped));
    assert_eq!(completed.try_recv().unwrap(), SelectionOutcome::Skipped);

    assert_eq!(
        flow.step(FlowInput::Start).await.unwrap_err(),
        FlowError::Finished
    );
}

#[tokio::test(start_paused = true)]
async fn unidentified_subscription_is_used_after_polling() {
    let fixture = Fixture::new();
    fixture.subscribe("", &["switch.y"]);
    let mut pushes = fixture.configuration("");
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    let FlowStep::Form(form) = flow.step(FlowInput::Start).await.unwrap() else {
        panic!("expected the selection form");
    };
    assert_eq!(ids(form.remove_entities.as_deref().unwrap()), ["switch.y"]);

    let step = flow.step(selection(&["light.x"], &[], false)).await.unwrap();
    let FlowStep::Done(SelectionOutcome::Applied { client_id, .. }) = step else {
        panic!("expected an applied selection");
    };
    assert_eq!(client_id, CLIENT);
    assert_eq!(pushes.try_recv().unwrap()["data"].as_array().unwrap().len(), 2);
    assert!(!fixture.remote.calls().iter().any(|c| c.starts_with("set ")));
}

#[tokio::test(start_paused = true)]
async fn driver_failure_is_shown_on_the_form() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &[]);
    fixture.remote.fail_integrations.store(true, Ordering::SeqCst);
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    let FlowStep::Form(form) = flow.step(FlowInput::Start).await.unwrap() else {
        panic!("expected the selection form");
    };
    assert_eq!(form.errors.get("base").map(String::as_str), Some(DRIVER_FAILURE));
    assert!(form.remove_entities.is_none());
}

#[tokio::test(start_paused = true)]
async fn stored_entities_are_not_offered_again() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &[]);
    let options = SelectionOptions {
        available_entities: BTreeSet::from(["media_player.tv".to_string()]),
        client_id: Some(CLIENT.to_string()),
    };
    let (mut flow, _completed) = fixture.flow(options);

    let FlowStep::Form(form) = flow.step(FlowInput::Start).await.unwrap() else {
        panic!("expected the selection form");
    };
    assert_eq!(ids(&form.add_entities), ["light.x", "switch.y"]);
}

#[tokio::test(start_paused = true)]
async fn missing_configuration_subscription_offers_retry() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &["light.x"]);
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    assert!(matches!(
        flow.step(FlowInput::Start).await.unwrap(),
        FlowStep::Form(_)
    ));
    let FlowStep::Menu(menu) = flow.step(selection(&["switch.y"], &[], true)).await.unwrap() else {
        panic!("expected the failure menu");
    };
    assert_eq!(menu.reason, FailureReason::NoConfigurationSubscription);

    let mut pushes = fixture.configuration(CLIENT);
    assert!(matches!(
        flow.step(FlowInput::Menu(MenuOption::Retry)).await.unwrap(),
        FlowStep::Form(_)
    ));
    assert!(matches!(
        flow.step(selection(&["switch.y"], &[], false)).await.unwrap(),
        FlowStep::Done(SelectionOutcome::Applied { .. })
    ));
    assert_eq!(pushes.try_recv().unwrap()["data"].as_array().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn skip_after_push_keeps_applied_selection() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &["light.x"]);
    let _pushes = fixture.configuration(CLIENT);
    fixture.remote.integrations.lock().retain(|i| i.driver_id != "hass");
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    flow.step(FlowInput::Start).await.unwrap();
    let FlowStep::Menu(menu) = flow.step(selection(&["switch.y"], &[], true)).await.unwrap() else {
        panic!("expected the failure menu");
    };
    assert_eq!(menu.reason, FailureReason::IntegrationNotFound("hass".to_string()));

    let step = flow.step(FlowInput::Menu(MenuOption::Skip)).await.unwrap();
    assert!(matches!(step, FlowStep::Done(SelectionOutcome::Applied { .. })));
}

#[tokio::test(start_paused = true)]
async fn input_must_match_the_current_step() {
    let fixture = Fixture::new();
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    let err = flow.step(selection(&[], &[], true)).await.unwrap_err();
    assert_eq!(err, FlowError::UnexpectedInput { expected: Awaiting::Start });
    assert_eq!(flow.awaiting(), Awaiting::Start);
}

#[tokio::test(start_paused = true)]
async fn driver_is_reset_after_settle_delay() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &["light.x"]);
    let _pushes = fixture.configuration(CLIENT);
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    flow.step(FlowInput::Start).await.unwrap();
    let submitted = Instant::now();
    let step = flow.step(selection(&["switch.y"], &[], true)).await.unwrap();
    assert!(matches!(step, FlowStep::Done(SelectionOutcome::Applied { .. })));

    let calls = fixture.remote.calls();
    let tail: Vec<&str> = calls[calls.len() - 3..].iter().map(String::as_str).collect();
    assert_eq!(tail, ["integrations", "entities hass.main true", "set hass.main []"]);

    let refreshed = fixture.remote.last_call_at("entities hass.main true").unwrap();
    let reset = fixture.remote.last_call_at("set hass.main []").unwrap();
    assert!(refreshed >= submitted);
    let settle = SelectionTiming::default().settle_delay;
    assert!(reset - refreshed >= settle, "{:?}", reset - refreshed);
    assert!(reset - refreshed < settle + Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn failing_driver_does_not_stop_refresh_of_others() {
    let fixture = Fixture::new();
    fixture.subscribe(CLIENT, &[]);
    fixture.remote.integrations.lock().push(IntegrationInstance {
        integration_id: "hass.second".to_string(),
        driver_id: "hass_second".to_string(),
        enabled: true,
        device_state: None,
        name: None,
    });
    fixture.remote.fail_refresh.lock().push("hass.main".to_string());
    let (mut flow, _completed) = fixture.flow(SelectionOptions::default());

    let FlowStep::Form(form) = flow.step(FlowInput::Start).await.unwrap() else {
        panic!("expected the selection form");
    };
    assert_eq!(form.errors.get("base").map(String::as_str), Some(DRIVER_FAILURE));

    let calls = fixture.remote.calls();
    assert!(calls.contains(&"entities hass.main true".to_string()));
    assert!(calls.contains(&"entities hass.second true".to_string()));
}

/// Integration with one in-memory remote, set up with both subscriptions of
/// `CLIENT`
struct Managed {
    remote: Arc<MockRemote>,
    coordinator: Arc<RemoteCoordinator>,
    integration: Arc<Integration>,
}

impl Managed {
    fn new() -> Self {
        let fixture = Fixture::new();
        let client: Arc<dyn RemoteClient> = fixture.remote.clone();
        let coordinator = Arc::new(RemoteCoordinator::new(client, SelectionOptions::default()));
        let integration = Arc::new(Integration::new(
            fixture.states.clone(),
            vec![coordinator.clone()],
            SelectionTiming::default(),
        ));
        Self {
            remote: fixture.remote,
            coordinator,
            integration,
        }
    }

    fn subscribe_client(&self) {
        let registry = self.integration.setup();
        registry.register_entities_subscription(
            SubscriptionRequest::new(CLIENT, "hass").with_entities(["light.x"]),
            Arc::new(|_: Value| -> Result<(), BridgeError> { Ok(()) }),
        );
        registry.register_configuration_subscription(
            SubscriptionRequest::new(CLIENT, "hass"),
            Arc::new(|_: Value| -> Result<(), BridgeError> { Ok(()) }),
        );
    }
}

#[tokio::test(start_paused = true)]
async fn aborted_flow_stops_before_driver_reset() {
    let managed = Managed::new();
    managed.subscribe_client();
    let flows = Arc::new(FlowManager::new(managed.integration.clone()));

    let form = flows.start_flow("unfoldedcircle", None).await.unwrap();
    assert_eq!(form.result_type, "form");
    let flow_id = form.flow_id.clone();

    let submit = {
        let flows = flows.clone();
        let flow_id = flow_id.clone();
        tokio::spawn(async move {
            flows
                .progress_flow(&flow_id, Some(json!({"add_entities": ["switch.y"], "subscribe_entities": true})))
                .await
        })
    };
    // Inside the settle delay
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(flows.abort_flow(&flow_id));

    let result = submit.await.unwrap();
    assert!(result.unwrap_err().contains("aborted"));
    assert!(managed.remote.calls().contains(&"entities hass.main true".to_string()));
    assert!(!managed.remote.calls().iter().any(|c| c.starts_with("set ")));
    assert_eq!(managed.coordinator.options().client_id, None);
    assert_eq!(flows.flow_count(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!managed.remote.calls().iter().any(|c| c.starts_with("set ")));
}

#[tokio::test(start_paused = true)]
async fn connection_stays_responsive_and_close_aborts_its_flows() {
    let managed = Managed::new();
    managed.integration.setup();
    let state = BridgeState::new(managed.integration.clone(), Vec::new());
    let conn = Arc::new(ActiveConnection::new(state.clone()));
    let (tx, mut rx) = mpsc::channel::<OutgoingMessage>(16);

    // No subscription: the first step keeps polling
    handle_message(&conn, &json!({"type": "config_entries/flow", "id": 1, "handler": "unfoldedcircle"}).to_string(), &tx)
        .await
        .unwrap();
    assert_eq!(state.flows.flow_count(), 1);

    handle_message(&conn, &json!({"type": "ping", "id": 2}).to_string(), &tx)
        .await
        .unwrap();
    let pong = serde_json::to_value(rx.recv().await.unwrap()).unwrap();
    assert_eq!(pong, json!({"id": 2, "type": "pong"}));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(state.flows.flow_count(), 1);
    assert!(rx.try_recv().is_err());

    conn.close();
    assert_eq!(state.flows.flow_count(), 0);
    let reply = serde_json::to_value(rx.recv().await.unwrap()).unwrap();
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["success"], false);
    assert_eq!(managed.coordinator.options().client_id, None);
}

#[test]
fn submitted_form_parses_from_json() {
    let input: SelectionInput = serde_json::from_value(json!({
        "add_entities": ["switch.y"],
        "remove_entities": ["light.x"]
    }))
    .unwrap();
    assert!(input.subscribe_entities);
    assert!(input.remove_entities.contains("light.x"));
}
