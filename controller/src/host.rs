use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tracing::{debug, info, warn};

use heating_common::{
    parse_inbound_topic, valve_command_topic, Actuation, Coordinator, HeatingConfig,
    HeatingStatus, InboundTopic, TOPIC_BOILER_COMMAND, TOPIC_CONTROLLER_STATE,
    TOPIC_ROOM_TARGET, TOPIC_ROOM_TEMPERATURE, TOPIC_VALVE_FEEDBACK,
};

use crate::feed::{parse_percent, parse_temperature, SensorFeeds};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MAX_CONTROL_SLEEP: Duration = Duration::from_secs(10);
const MIN_CONTROL_SLEEP: Duration = Duration::from_millis(50);
const MQTT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

struct ControlState {
    coordinator: Coordinator,
    feeds: SensorFeeds,
}

#[derive(Clone)]
struct AppState {
    control: Arc<Mutex<ControlState>>,
    config: Arc<HeatingConfig>,
    wake: Arc<Notify>,
    mqtt: AsyncClient,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatePayload {
    #[serde(rename = "generatedAtEpoch")]
    generated_at_epoch: i64,
    #[serde(flatten)]
    status: HeatingStatus,
}

#[derive(Debug, Deserialize)]
struct RoomInputUpdate {
    temperature: Option<f32>,
    target: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct FeedbackUpdate {
    percent: Option<u8>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let config = store
        .load_config()
        .await
        .with_context(|| format!("failed to load {}", store.config_path.display()))?;
    config.validate().context("invalid heating configuration")?;
    info!(rooms = config.rooms.len(), "heating configuration loaded");

    let coordinator = Coordinator::after_restart(config.clone(), monotonic_ms());
    let feeds = SensorFeeds::new(&config);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("heating-controller", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or_default();
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        control: Arc::new(Mutex::new(ControlState { coordinator, feeds })),
        config: Arc::new(config),
        wake: Arc::new(Notify::new()),
        mqtt,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config))
        .route("/api/rooms/{id}/input", put(handle_put_room_input))
        .route("/api/valves/{id}/feedback", put(handle_put_valve_feedback))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_ROOM_TEMPERATURE,
        TOPIC_ROOM_TARGET,
        TOPIC_VALVE_FEEDBACK,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            let publish = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => publish,
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    info!(code = ?ack.code, "mqtt session established");
                    continue;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "mqtt connection lost, reconnecting");
                    tokio::time::sleep(MQTT_RECONNECT_DELAY).await;
                    continue;
                }
            };

            let Some(inbound) = parse_inbound_topic(&publish.topic) else {
                debug!(topic = %publish.topic, "ignoring foreign topic");
                continue;
            };
            if let Err(err) = apply_inbound(&app_state, inbound, &publish.payload).await {
                warn!(topic = %publish.topic, "dropping mqtt message: {err:#}");
            }
        }
    });
}

/// Sole caller of `recompute`. Wakes on new input or on the next core
/// deadline, whichever comes first.
fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        loop {
            let now_ms = monotonic_ms();
            let (actions, next_wake_ms) = {
                let mut control = app_state.control.lock().await;
                let ControlState { coordinator, feeds } = &mut *control;
                for (room_id, input) in feeds.inputs(now_ms) {
                    coordinator.update_room_input(room_id, input);
                }
                let actions = coordinator.recompute(now_ms);
                (actions, coordinator.next_wake_ms(now_ms))
            };

            if !actions.is_empty() {
                dispatch_actuations(&app_state.mqtt, actions).await;
            }

            let sleep = next_wake_ms
                .map(|due_ms| Duration::from_millis(due_ms.saturating_sub(monotonic_ms())))
                .unwrap_or(MAX_CONTROL_SLEEP)
                .clamp(MIN_CONTROL_SLEEP, MAX_CONTROL_SLEEP);

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = app_state.wake.notified() => {}
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let period = Duration::from_secs(app_state.config.state_publish_interval_s.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let payload = serde_json::to_vec(&state_payload(&app_state).await);
            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

async fn state_payload(app_state: &AppState) -> StatePayload {
    let status = {
        let control = app_state.control.lock().await;
        control.coordinator.status(monotonic_ms())
    };
    StatePayload {
        generated_at_epoch: Utc::now().timestamp(),
        status,
    }
}

async fn dispatch_actuations(mqtt: &AsyncClient, actions: Vec<Actuation>) {
    for action in actions {
        let (topic, payload) = match &action {
            Actuation::CommandValve { room_id, percent } => {
                (valve_command_topic(room_id), percent.to_string())
            }
            Actuation::SetBoiler { on } => (
                TOPIC_BOILER_COMMAND.to_string(),
                if *on { "ON" } else { "OFF" }.to_string(),
            ),
        };

        info!(%topic, %payload, "actuation");
        if let Err(err) = mqtt
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("actuation publish to {topic} failed: {err}");
        }
    }
}

async fn apply_inbound(
    app_state: &AppState,
    inbound: InboundTopic<'_>,
    payload: &[u8],
) -> anyhow::Result<()> {
    anyhow::ensure!(
        payload.len() <= MAX_MQTT_PAYLOAD_BYTES,
        "oversized payload ({} bytes)",
        payload.len()
    );
    let message = std::str::from_utf8(payload).context("non utf8 payload")?;
    let now_ms = monotonic_ms();

    let accepted = {
        let mut control = app_state.control.lock().await;
        match inbound {
            InboundTopic::RoomTemperature(room_id) => {
                let value = parse_temperature(message)
                    .with_context(|| format!("bad temperature for room {room_id}"))?;
                control.feeds.set_temperature(room_id, value, now_ms)
            }
            InboundTopic::RoomTarget(room_id) => {
                let value = parse_temperature(message)
                    .with_context(|| format!("bad target for room {room_id}"))?;
                control.feeds.set_target(room_id, value)
            }
            InboundTopic::ValveFeedback(room_id) => {
                let value = parse_percent(message)
                    .with_context(|| format!("bad valve feedback for room {room_id}"))?;
                if control.feeds.knows(room_id) {
                    control.coordinator.record_valve_feedback(room_id, value);
                    true
                } else {
                    false
                }
            }
        }
    };

    if accepted {
        app_state.wake.notify_one();
    } else {
        warn!(?inbound, "message for unconfigured room ignored");
    }
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state_payload(&state).await)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

async fn handle_put_room_input(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(update): Json<RoomInputUpdate>,
) -> impl IntoResponse {
    let valid = |value: Option<f32>| value.is_none_or(|value| value.is_finite());
    if !valid(update.temperature) || !valid(update.target) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    }

    let now_ms = monotonic_ms();
    {
        let mut control = state.control.lock().await;
        if !control.feeds.knows(&room_id) {
            return error_response(StatusCode::NOT_FOUND, "Unknown room");
        }
        control
            .feeds
            .set_temperature(&room_id, update.temperature, now_ms);
        control.feeds.set_target(&room_id, update.target);
    }
    state.wake.notify_one();

    handle_get_status(State(state)).await.into_response()
}

async fn handle_put_valve_feedback(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(update): Json<FeedbackUpdate>,
) -> impl IntoResponse {
    if update.percent.is_some_and(|percent| percent > 100) {
        return error_response(StatusCode::BAD_REQUEST, "Valve position must be 0-100");
    }

    {
        let mut control = state.control.lock().await;
        if !control.feeds.knows(&room_id) {
            return error_response(StatusCode::NOT_FOUND, "Unknown valve");
        }
        control
            .coordinator
            .record_valve_feedback(&room_id, update.percent);
    }
    state.wake.notify_one();

    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heating"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
        }
    }

    async fn load_config(&self) -> anyhow::Result<HeatingConfig> {
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<HeatingConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no configuration file, using defaults");
                Ok(HeatingConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    let body = ErrorBody {
        error: message.to_string(),
    };
    (status, Json(body)).into_response()
}

/// Milliseconds since the first call; the core only needs a monotonic origin.
fn monotonic_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let elapsed = ORIGIN.get_or_init(Instant::now).elapsed();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
