// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Telemetry client: the public entry point tying the pipeline together.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use loom_telemetry_core::{
	Breadcrumb, BreadcrumbType, FailureEvent, HandledState, Metadata, Session, SeverityReason,
	UserContext,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backtrace::capture_stacktrace;
use crate::breadcrumbs::{clamp_capacity, BreadcrumbTrail, DEFAULT_MAX_BREADCRUMBS};
use crate::callbacks::{run_call_callback, CallbackState};
use crate::delivery::{Delivery, HttpDelivery, SDK_NAME, SDK_VERSION};
use crate::error::{CaptureError, Result, StoreError, TelemetryError};
use crate::observers::{Observers, TelemetryNotification};
use crate::panic_hook::install_panic_hook;
use crate::queue::{EventQueue, FlushSummary, FlushTrigger, QueueConfig, DEFAULT_MAX_PERSISTED_EVENTS};
use crate::session::SessionTracker;
use crate::store::{FileRecordStore, RecordId, RecordStore};
use crate::watchdog::{BlockedThread, HangDelegate, HangWatchdog, WorkQueue, DEFAULT_HANG_THRESHOLD};

/// Error class given to hang events.
pub const THREAD_BLOCKED_ERROR_CLASS: &str = "ThreadBlocked";

const LOADED_BREADCRUMB: &str = "Loom telemetry loaded";
const CONNECTIVITY_BREADCRUMB: &str = "Connectivity change";

/// Configuration for the telemetry client.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
	pub api_key: String,
	/// Collector URL. Not needed when a custom delivery is supplied.
	pub endpoint: Option<String>,
	/// Directory for persisted events. Defaults to the XDG data dir.
	pub storage_dir: Option<PathBuf>,
	/// Breadcrumbs kept in the trail, at most 100.
	pub max_breadcrumbs: usize,
	pub max_persisted_events: usize,
	pub detect_hangs: bool,
	pub hang_threshold: Duration,
	pub release_stage: Option<String>,
	/// Stages that report events. Empty means every stage.
	pub enabled_release_stages: Vec<String>,
	pub app_version: Option<String>,
	pub enabled_breadcrumb_types: Vec<BreadcrumbType>,
	/// Events with these error classes are dropped before any callback runs.
	pub discard_classes: Vec<String>,
	/// Context used when an event has none.
	pub context: Option<String>,
	pub request_timeout: Duration,
	pub flush_on_launch: bool,
	pub auto_track_sessions: bool,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			api_key: String::new(),
			endpoint: None,
			storage_dir: None,
			max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
			max_persisted_events: DEFAULT_MAX_PERSISTED_EVENTS,
			detect_hangs: true,
			hang_threshold: DEFAULT_HANG_THRESHOLD,
			release_stage: None,
			enabled_release_stages: Vec::new(),
			app_version: None,
			enabled_breadcrumb_types: BreadcrumbType::ALL.to_vec(),
			discard_classes: Vec::new(),
			context: None,
			request_timeout: Duration::from_secs(30),
			flush_on_launch: true,
			auto_track_sessions: true,
		}
	}
}

/// Builder for constructing a [`TelemetryClient`].
#[derive(Default)]
pub struct TelemetryClientBuilder {
	config: TelemetryConfig,
	runtime: Option<Handle>,
	delivery: Option<Arc<dyn Delivery>>,
	store: Option<Arc<dyn RecordStore>>,
	monitored_queue: Option<Arc<dyn WorkQueue>>,
}

impl TelemetryClientBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Replaces the whole configuration.
	pub fn config(mut self, config: TelemetryConfig) -> Self {
		self.config = config;
		self
	}

	pub fn api_key(mut self, key: impl Into<String>) -> Self {
		self.config.api_key = key.into();
		self
	}

	/// Sets the collector URL.
	///
	/// Example: `https://telemetry.loom.example/v1/events`
	pub fn endpoint(mut self, url: impl Into<String>) -> Self {
		self.config.endpoint = Some(url.into());
		self
	}

	pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config.storage_dir = Some(dir.into());
		self
	}

	pub fn max_breadcrumbs(mut self, max: usize) -> Self {
		self.config.max_breadcrumbs = max;
		self
	}

	pub fn max_persisted_events(mut self, max: usize) -> Self {
		self.config.max_persisted_events = max;
		self
	}

	/// Enables or disables the hang watchdog.
	pub fn detect_hangs(mut self, enabled: bool) -> Self {
		self.config.detect_hangs = enabled;
		self
	}

	pub fn hang_threshold(mut self, threshold: Duration) -> Self {
		self.config.hang_threshold = threshold;
		self
	}

	/// Sets the release stage.
	///
	/// Example: `production`, `staging`, `development`
	pub fn release_stage(mut self, stage: impl Into<String>) -> Self {
		self.config.release_stage = Some(stage.into());
		self
	}

	pub fn enabled_release_stages<I, S>(mut self, stages: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.enabled_release_stages = stages.into_iter().map(Into::into).collect();
		self
	}

	pub fn app_version(mut self, version: impl Into<String>) -> Self {
		self.config.app_version = Some(version.into());
		self
	}

	pub fn enabled_breadcrumb_types(mut self, types: impl IntoIterator<Item = BreadcrumbType>) -> Self {
		self.config.enabled_breadcrumb_types = types.into_iter().collect();
		self
	}

	pub fn discard_classes<I, S>(mut self, classes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.discard_classes = classes.into_iter().map(Into::into).collect();
		self
	}

	pub fn context(mut self, context: impl Into<String>) -> Self {
		self.config.context = Some(context.into());
		self
	}

	/// Sets the HTTP request timeout for the built-in delivery.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn flush_on_launch(mut self, enabled: bool) -> Self {
		self.config.flush_on_launch = enabled;
		self
	}

	pub fn auto_track_sessions(mut self, enabled: bool) -> Self {
		self.config.auto_track_sessions = enabled;
		self
	}

	/// Runtime used for delivery. Defaults to the current runtime.
	pub fn runtime(mut self, handle: Handle) -> Self {
		self.runtime = Some(handle);
		self
	}

	/// Replaces the built-in HTTP delivery.
	pub fn delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
		self.delivery = Some(delivery);
		self
	}

	/// Replaces the on-disk record store.
	pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Work queue watched for hangs. Defaults to the delivery runtime.
	///
	/// On a multi-thread runtime the default only notices when every worker
	/// is blocked, since any free worker runs the liveness task. Pass the
	/// queue of the thread that must stay responsive to watch it alone.
	pub fn monitored_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
		self.monitored_queue = Some(queue);
		self
	}

	/// Builds the client, flushes events left by earlier runs and starts the
	/// hang watchdog.
	pub fn build(self) -> Result<TelemetryClient> {
		let mut config = self.config;
		if config.api_key.trim().is_empty() {
			return Err(TelemetryError::InvalidApiKey);
		}
		if config.max_persisted_events == 0 {
			return Err(TelemetryError::InvalidConfig(
				"max_persisted_events must be greater than zero".to_string(),
			));
		}
		config.max_breadcrumbs = clamp_capacity(config.max_breadcrumbs);

		let runtime = match self.runtime {
			Some(handle) => handle,
			None => Handle::try_current().map_err(|_| TelemetryError::MissingRuntime)?,
		};

		let delivery: Arc<dyn Delivery> = match self.delivery {
			Some(delivery) => delivery,
			None => {
				let endpoint = config
					.endpoint
					.as_deref()
					.map(str::trim)
					.filter(|e| !e.is_empty())
					.ok_or(TelemetryError::MissingEndpoint)?;
				Arc::new(HttpDelivery::new(endpoint, config.request_timeout)?)
			}
		};

		let store: Arc<dyn RecordStore> = match (self.store, &config.storage_dir) {
			(Some(store), _) => store,
			(None, Some(dir)) => Arc::new(FileRecordStore::open(dir)?),
			(None, None) => Arc::new(FileRecordStore::from_xdg()?),
		};

		let callbacks = CallbackState::new();
		if config.enabled_breadcrumb_types.len() < BreadcrumbType::ALL.len() {
			let enabled = config.enabled_breadcrumb_types.clone();
			callbacks
				.on_breadcrumb
				.add(Arc::new(move |b: &mut Breadcrumb| enabled.contains(&b.kind)));
		}

		let observers = Observers::default();
		let breadcrumbs = BreadcrumbTrail::new(
			config.max_breadcrumbs,
			Arc::clone(&callbacks.on_breadcrumb),
			observers.clone(),
		);
		let sessions = SessionTracker::new(Arc::clone(&callbacks.on_session_start), observers.clone());
		let queue = EventQueue::new(
			store,
			delivery,
			callbacks.clone(),
			observers.clone(),
			runtime.clone(),
			QueueConfig {
				max_persisted_events: config.max_persisted_events,
			},
		);

		let monitored = match self.monitored_queue {
			Some(queue) => queue,
			None => {
				if config.detect_hangs && misses_single_blocked_worker(&runtime) {
					warn!("Hang detection is watching a multi-thread runtime; a single blocked worker goes unnoticed");
				}
				Arc::new(runtime.clone()) as Arc<dyn WorkQueue>
			}
		};

		let inner = Arc::new(ClientInner {
			metadata: RwLock::new(Metadata::new()),
			context: RwLock::new(config.context.clone()),
			user: RwLock::new(UserContext::default()),
			config,
			callbacks,
			observers,
			breadcrumbs,
			sessions,
			queue,
			runtime,
			watchdog: Mutex::new(None),
			closed: AtomicBool::new(false),
		});

		if inner.config.flush_on_launch {
			inner.queue.flush(FlushTrigger::Launch);
		}
		inner.breadcrumbs.append(Breadcrumb::with_type(
			LOADED_BREADCRUMB,
			BreadcrumbType::State,
			BTreeMap::new(),
		));
		if inner.config.auto_track_sessions {
			inner.sessions.start_session();
		}
		if inner.config.detect_hangs {
			let delegate = Arc::new(HangReporter {
				client: Arc::downgrade(&inner),
			});
			let watchdog = HangWatchdog::new(inner.config.hang_threshold, monitored, delegate)?;
			watchdog.start()?;
			*inner.watchdog.lock() = Some(watchdog);
		}

		info!(
			sdk = SDK_NAME,
			version = SDK_VERSION,
			release_stage = ?inner.config.release_stage,
			"Telemetry client initialized"
		);

		Ok(TelemetryClient { inner })
	}
}

/// Whether posting onto `runtime` can't see one blocked worker, because
/// another worker would run the liveness task.
fn misses_single_blocked_worker(runtime: &Handle) -> bool {
	runtime.runtime_flavor() == RuntimeFlavor::MultiThread
}

#[derive(Clone, Copy)]
enum CaptureMode {
	/// Persist, then attempt delivery in the background.
	Deliver,
	/// Persist only; sent on the next flush.
	Persist,
}

struct ClientInner {
	config: TelemetryConfig,
	callbacks: CallbackState,
	observers: Observers,
	breadcrumbs: BreadcrumbTrail,
	sessions: SessionTracker,
	queue: EventQueue,
	runtime: Handle,
	metadata: RwLock<Metadata>,
	context: RwLock<Option<String>>,
	user: RwLock<UserContext>,
	watchdog: Mutex<Option<HangWatchdog>>,
	closed: AtomicBool,
}

impl ClientInner {
	fn capture(
		&self,
		mut event: FailureEvent,
		on_failure: impl FnOnce(&mut FailureEvent) -> bool,
		mode: CaptureMode,
	) -> std::result::Result<Option<RecordId>, CaptureError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(CaptureError::Shutdown);
		}
		if self.config.discard_classes.contains(&event.error_class) {
			debug!(error_class = %event.error_class, "Discarding event by error class");
			return Ok(None);
		}
		if !self.release_stage_enabled() {
			debug!(
				release_stage = ?self.config.release_stage,
				"Release stage not enabled, dropping event"
			);
			return Ok(None);
		}

		self.enrich(&mut event);

		let sessions = &self.sessions;
		let accept = move |e: &mut FailureEvent| {
			if !run_call_callback(on_failure, e) {
				return false;
			}
			e.session = sessions.record_event(e.is_unhandled());
			true
		};
		match mode {
			CaptureMode::Deliver => self.queue.capture_with(event, accept),
			CaptureMode::Persist => self.queue.capture_blocking_with(event, accept),
		}
	}

	fn release_stage_enabled(&self) -> bool {
		let stages = &self.config.enabled_release_stages;
		stages.is_empty()
			|| self
				.config
				.release_stage
				.as_ref()
				.is_some_and(|stage| stages.contains(stage))
	}

	fn enrich(&self, event: &mut FailureEvent) {
		event.api_key = self.config.api_key.clone();
		if event.app_version.is_none() {
			event.app_version = self.config.app_version.clone();
		}
		if event.release_stage.is_none() {
			event.release_stage = self.config.release_stage.clone();
		}
		event.session = self.sessions.current_session();
		event.breadcrumbs = self.breadcrumbs.snapshot();
		if event.user.is_empty() {
			event.user = self.user.read().clone();
		}
		if event.context.is_none() {
			event.context = self.context.read().clone();
		}

		// Event values win over global ones.
		for (section, values) in self.metadata.read().iter() {
			let target = event.metadata.entry(section.clone()).or_default();
			for (key, value) in values {
				target.entry(key.clone()).or_insert_with(|| value.clone());
			}
		}
	}

	fn leave_breadcrumb(&self, breadcrumb: Breadcrumb) -> bool {
		self.breadcrumbs.append(breadcrumb)
	}

	fn report_hang(&self, blocked: &BlockedThread) {
		let threshold_ms = blocked.threshold.as_millis() as u64;
		let mut event = FailureEvent::new(
			THREAD_BLOCKED_ERROR_CLASS,
			format!(
				"The {} thread was blocked for at least {threshold_ms} ms",
				blocked.thread_name
			),
			HandledState::unhandled(SeverityReason::ThreadBlocked),
		);
		event.thread_name = Some(blocked.thread_name.clone());
		event.add_metadata("hang", "thresholdMs", json!(threshold_ms));
		event.add_metadata("hang", "detectedAt", json!(blocked.detected_at.to_rfc3339()));

		self.observers.notify(TelemetryNotification::HangDetected {
			thread: blocked.clone(),
		});
		if let Err(e) = self.capture(event, |_| true, CaptureMode::Deliver) {
			warn!(error = %e, "Failed to capture hang event");
		}
	}
}

struct HangReporter {
	client: Weak<ClientInner>,
}

impl HangDelegate for HangReporter {
	fn on_thread_blocked(&self, blocked: &BlockedThread) {
		if let Some(client) = self.client.upgrade() {
			client.report_hang(blocked);
		}
	}
}

/// Client for capturing failure events and delivering them to a collector.
///
/// # Example
///
/// ```ignore
/// use loom_telemetry::TelemetryClient;
///
/// let client = TelemetryClient::builder()
///     .api_key("your_api_key")
///     .endpoint("https://telemetry.loom.example/v1/events")
///     .app_version(env!("CARGO_PKG_VERSION"))
///     .release_stage("production")
///     .build()?;
///
/// client.install_panic_hook();
/// client.leave_breadcrumb("Loaded settings");
///
/// if let Err(e) = do_something() {
///     client.notify(&e)?;
/// }
///
/// client.shutdown().await;
/// ```
#[derive(Clone)]
pub struct TelemetryClient {
	inner: Arc<ClientInner>,
}

impl TelemetryClient {
	pub fn builder() -> TelemetryClientBuilder {
		TelemetryClientBuilder::new()
	}

	/// Reports a handled error.
	///
	/// Returns the persisted record id, or `None` if the event was dropped by
	/// configuration or vetoed by a callback.
	pub fn notify<E>(&self, error: &E) -> std::result::Result<Option<RecordId>, CaptureError>
	where
		E: std::error::Error + ?Sized,
	{
		self.notify_with(error, |_| true)
	}

	/// Reports a handled error, running `on_failure` after the global
	/// on_failure chain.
	pub fn notify_with<E>(
		&self,
		error: &E,
		on_failure: impl FnOnce(&mut FailureEvent) -> bool,
	) -> std::result::Result<Option<RecordId>, CaptureError>
	where
		E: std::error::Error + ?Sized,
	{
		let mut event = FailureEvent::new(
			std::any::type_name::<E>(),
			error.to_string(),
			HandledState::handled(),
		);
		event.stacktrace = capture_stacktrace();
		event.thread_name = std::thread::current().name().map(str::to_string);

		let causes: Vec<Value> = std::iter::successors(error.source(), |e| e.source())
			.map(|cause| Value::String(cause.to_string()))
			.collect();
		if !causes.is_empty() {
			event.add_metadata("error", "causes", Value::Array(causes));
		}

		self.inner.capture(event, on_failure, CaptureMode::Deliver)
	}

	/// Reports a prebuilt event.
	pub fn notify_event(
		&self,
		event: FailureEvent,
	) -> std::result::Result<Option<RecordId>, CaptureError> {
		self.inner.capture(event, |_| true, CaptureMode::Deliver)
	}

	/// Leaves a manual breadcrumb.
	pub fn leave_breadcrumb(&self, message: impl Into<String>) -> bool {
		self.inner.leave_breadcrumb(Breadcrumb::new(message))
	}

	pub fn leave_breadcrumb_with(
		&self,
		message: impl Into<String>,
		kind: BreadcrumbType,
		metadata: BTreeMap<String, Value>,
	) -> bool {
		self.inner
			.leave_breadcrumb(Breadcrumb::with_type(message, kind, metadata))
	}

	/// Current breadcrumb trail, oldest first.
	pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
		self.inner.breadcrumbs.snapshot()
	}

	/// Adds a global metadata value attached to every event.
	pub fn add_metadata(&self, section: impl Into<String>, key: impl Into<String>, value: Value) {
		self.inner
			.metadata
			.write()
			.entry(section.into())
			.or_default()
			.insert(key.into(), value);
	}

	pub fn add_metadata_section(&self, section: impl Into<String>, values: BTreeMap<String, Value>) {
		self.inner
			.metadata
			.write()
			.entry(section.into())
			.or_default()
			.extend(values);
	}

	pub fn clear_metadata(&self, section: &str) {
		self.inner.metadata.write().remove(section);
	}

	pub fn clear_metadata_key(&self, section: &str, key: &str) {
		let mut metadata = self.inner.metadata.write();
		if let Some(values) = metadata.get_mut(section) {
			values.remove(key);
			if values.is_empty() {
				metadata.remove(section);
			}
		}
	}

	pub fn metadata(&self, section: &str) -> Option<BTreeMap<String, Value>> {
		self.inner.metadata.read().get(section).cloned()
	}

	pub fn set_context(&self, context: Option<String>) {
		*self.inner.context.write() = context;
	}

	pub fn context(&self) -> Option<String> {
		self.inner.context.read().clone()
	}

	pub fn set_user(&self, user: UserContext) {
		*self.inner.user.write() = user;
	}

	pub fn user(&self) -> UserContext {
		self.inner.user.read().clone()
	}

	pub fn clear_user(&self) {
		*self.inner.user.write() = UserContext::default();
	}

	/// Starts a new session. Returns `None` if an on_session_start callback
	/// vetoed it.
	pub fn start_session(&self) -> Option<Session> {
		self.inner.sessions.start_session()
	}

	pub fn pause_session(&self) {
		self.inner.sessions.pause_session();
	}

	/// Resumes a paused session; see [`SessionTracker::resume_session`].
	pub fn resume_session(&self) -> bool {
		self.inner.sessions.resume_session()
	}

	pub fn current_session(&self) -> Option<Session> {
		self.inner.sessions.current_session()
	}

	/// Reports a network change from the host. Flushes when connectivity is
	/// restored.
	pub fn on_connectivity_changed(
		&self,
		has_connection: bool,
		network_state: &str,
	) -> Option<JoinHandle<FlushSummary>> {
		let mut metadata = BTreeMap::new();
		metadata.insert("hasConnection".to_string(), json!(has_connection));
		metadata.insert("networkState".to_string(), json!(network_state));
		self.inner.leave_breadcrumb(Breadcrumb::with_type(
			CONNECTIVITY_BREADCRUMB,
			BreadcrumbType::State,
			metadata,
		));

		self.inner
			.observers
			.notify(TelemetryNotification::ConnectivityChanged {
				has_connection,
				network_state: network_state.to_string(),
			});

		if self.is_closed() {
			return None;
		}
		self.inner.queue.on_connectivity_changed(has_connection)
	}

	/// Registered callback chains.
	pub fn callbacks(&self) -> &CallbackState {
		&self.inner.callbacks
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TelemetryNotification> {
		self.inner.observers.subscribe()
	}

	/// Attempts every persisted record in the background.
	pub fn flush(&self) -> JoinHandle<FlushSummary> {
		self.inner.queue.flush(FlushTrigger::Explicit)
	}

	/// Persisted records awaiting delivery, oldest first.
	pub fn pending_records(&self) -> std::result::Result<Vec<RecordId>, StoreError> {
		self.inner.queue.pending()
	}

	/// Waits for every delivery attempt started so far.
	pub async fn idle(&self) {
		self.inner.queue.idle().await;
	}

	/// Installs a panic hook that persists an unhandled-panic event before
	/// the previous hook runs. The event is delivered on the next launch.
	///
	/// The hook holds a weak reference; once every clone of the client is
	/// dropped it stops reporting.
	pub fn install_panic_hook(&self) {
		let client = Arc::downgrade(&self.inner);
		install_panic_hook(move |event| {
			let Some(client) = client.upgrade() else {
				return;
			};
			if let Err(e) = client.capture(event, |_| true, CaptureMode::Persist) {
				error!(error = %e, "Failed to persist panic event");
			}
		});
		info!("Panic hook installed");
	}

	/// Stops the watchdog and waits for in-flight delivery. Pending records
	/// stay on disk for the next launch.
	pub async fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		let watchdog = self.inner.watchdog.lock().take();
		if let Some(watchdog) = watchdog {
			// Joining the watchdog thread blocks.
			if let Err(e) = self.inner.runtime.spawn_blocking(move || watchdog.stop()).await {
				error!(error = %e, "Failed to stop hang watchdog");
			}
		}
		self.inner.queue.shutdown().await;

		info!("Telemetry client shutdown");
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::delivery::{DeliveryHeaders, DeliveryOutcome};
	use crate::error::DeliveryError;
	use crate::store::MemoryRecordStore;
	use async_trait::async_trait;
	use std::sync::mpsc;

	#[derive(Default)]
	struct RecordingDelivery {
		events: Mutex<Vec<Value>>,
	}

	impl RecordingDelivery {
		fn events(&self) -> Vec<Value> {
			self.events.lock().clone()
		}
	}

	#[async_trait]
	impl Delivery for RecordingDelivery {
		async fn deliver(
			&self,
			payload: Vec<u8>,
			_headers: &DeliveryHeaders,
		) -> std::result::Result<DeliveryOutcome, DeliveryError> {
			let envelope: Value =
				serde_json::from_slice(&payload).map_err(|e| DeliveryError::Other(e.to_string()))?;
			self.events.lock().push(envelope["events"][0].clone());
			Ok(DeliveryOutcome::Delivered)
		}
	}

	#[derive(Debug, thiserror::Error)]
	#[error("settings file unreadable")]
	struct SettingsError {
		#[source]
		source: std::io::Error,
	}

	fn builder(delivery: &Arc<RecordingDelivery>) -> TelemetryClientBuilder {
		TelemetryClient::builder()
			.api_key("test-key")
			.delivery(Arc::clone(delivery) as Arc<dyn Delivery>)
			.store(Arc::new(MemoryRecordStore::new()))
			.detect_hangs(false)
	}

	async fn delivered_one(client: &TelemetryClient, delivery: &RecordingDelivery) -> Value {
		client.idle().await;
		let events = delivery.events();
		assert_eq!(events.len(), 1, "expected exactly one delivered event");
		events[0].clone()
	}

	#[test]
	fn test_builder_requires_api_key() {
		let result = TelemetryClient::builder()
			.endpoint("https://example.com/events")
			.build();
		assert!(matches!(result, Err(TelemetryError::InvalidApiKey)));
	}

	#[tokio::test]
	async fn test_builder_requires_endpoint_or_delivery() {
		let result = TelemetryClient::builder()
			.api_key("key")
			.store(Arc::new(MemoryRecordStore::new()))
			.build();
		assert!(matches!(result, Err(TelemetryError::MissingEndpoint)));
	}

	#[test]
	fn test_builder_requires_runtime() {
		let delivery = Arc::new(RecordingDelivery::default());
		let result = builder(&delivery).build();
		assert!(matches!(result, Err(TelemetryError::MissingRuntime)));
	}

	#[tokio::test]
	async fn test_builder_rejects_zero_capacity() {
		let delivery = Arc::new(RecordingDelivery::default());
		let result = builder(&delivery).max_persisted_events(0).build();
		assert!(matches!(result, Err(TelemetryError::InvalidConfig(_))));
	}

	#[tokio::test]
	async fn test_builder_rejects_zero_hang_threshold() {
		let delivery = Arc::new(RecordingDelivery::default());
		let result = builder(&delivery)
			.detect_hangs(true)
			.hang_threshold(Duration::ZERO)
			.build();
		assert!(matches!(result, Err(TelemetryError::Watchdog(_))));
	}

	#[tokio::test]
	async fn test_builder_clamps_breadcrumbs() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).max_breadcrumbs(1000).build().unwrap();
		assert_eq!(client.inner.breadcrumbs.capacity(), 100);
	}

	#[test]
	fn test_config_defaults() {
		let config = TelemetryConfig::default();
		assert_eq!(config.max_breadcrumbs, 25);
		assert_eq!(config.max_persisted_events, 32);
		assert_eq!(config.hang_threshold, Duration::from_secs(5));
		assert_eq!(config.request_timeout, Duration::from_secs(30));
		assert!(config.flush_on_launch);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_notify_enriches_event() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery)
			.app_version("1.2.3")
			.release_stage("staging")
			.context("startup")
			.build()
			.unwrap();
		client.add_metadata("device", "arch", json!("x86_64"));
		client.set_user(UserContext {
			id: Some("u-1".to_string()),
			..Default::default()
		});
		client.leave_breadcrumb("opened settings");

		let error = SettingsError {
			source: std::io::Error::from(std::io::ErrorKind::NotFound),
		};
		client.notify(&error).unwrap().unwrap();
		let event = delivered_one(&client, &delivery).await;

		assert_eq!(event["apiKey"], "test-key");
		assert_eq!(event["message"], "settings file unreadable");
		assert!(event["errorClass"].as_str().unwrap().ends_with("SettingsError"));
		assert_eq!(event["appVersion"], "1.2.3");
		assert_eq!(event["releaseStage"], "staging");
		assert_eq!(event["context"], "startup");
		assert_eq!(event["user"]["id"], "u-1");
		assert_eq!(event["metadata"]["device"]["arch"], "x86_64");
		assert_eq!(event["metadata"]["error"]["causes"].as_array().unwrap().len(), 1);
		assert_eq!(event["severity"], "warning");

		let crumbs: Vec<&str> = event["breadcrumbs"]
			.as_array()
			.unwrap()
			.iter()
			.map(|b| b["message"].as_str().unwrap())
			.collect();
		assert_eq!(crumbs, vec![LOADED_BREADCRUMB, "opened settings"]);
		assert_eq!(event["session"]["handledCount"], 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_event_metadata_wins_over_global() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();
		client.add_metadata("app", "mode", json!("global"));
		client.add_metadata("app", "theme", json!("dark"));

		let mut event = FailureEvent::new("E", "boom", HandledState::handled());
		event.add_metadata("app", "mode", json!("local"));
		client.notify_event(event).unwrap();
		let event = delivered_one(&client, &delivery).await;

		assert_eq!(event["metadata"]["app"]["mode"], "local");
		assert_eq!(event["metadata"]["app"]["theme"], "dark");
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_discard_class_skips_callbacks() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).discard_classes(["Noisy"]).build().unwrap();
		let called = Arc::new(AtomicBool::new(false));
		let flag = Arc::clone(&called);
		client.callbacks().on_failure.add(Arc::new(move |_: &mut FailureEvent| {
			flag.store(true, Ordering::SeqCst);
			true
		}));

		let event = FailureEvent::new("Noisy", "ignored", HandledState::handled());
		assert!(client.notify_event(event).unwrap().is_none());
		client.idle().await;
		assert!(!called.load(Ordering::SeqCst));
		assert!(delivery.events().is_empty());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_disabled_release_stage_drops_event() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery)
			.release_stage("development")
			.enabled_release_stages(["production"])
			.build()
			.unwrap();

		let event = FailureEvent::new("E", "boom", HandledState::handled());
		assert!(client.notify_event(event).unwrap().is_none());
		assert!(client.pending_records().unwrap().is_empty());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_per_call_veto_does_not_count_against_session() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();
		let error = std::io::Error::other("boom");

		assert!(client.notify_with(&error, |_| false).unwrap().is_none());
		client.notify(&error).unwrap();
		let event = delivered_one(&client, &delivery).await;
		assert_eq!(event["session"]["handledCount"], 1);
		assert_eq!(client.current_session().unwrap().handled_count, 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_per_call_callback_runs_after_global_chain() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();
		client.callbacks().on_failure.add(Arc::new(|e: &mut FailureEvent| {
			e.context = Some("global".to_string());
			true
		}));

		let error = std::io::Error::other("boom");
		client
			.notify_with(&error, |e| {
				assert_eq!(e.context.as_deref(), Some("global"));
				e.context = Some("call".to_string());
				true
			})
			.unwrap();
		let event = delivered_one(&client, &delivery).await;
		assert_eq!(event["context"], "call");
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_panicking_per_call_callback_keeps_event() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();

		let error = std::io::Error::other("boom");
		let id = client
			.notify_with(&error, |e| {
				e.context = Some("before-panic".to_string());
				panic!("per-call callback bug");
			})
			.unwrap();
		assert!(id.is_some());

		let event = delivered_one(&client, &delivery).await;
		assert_eq!(event["context"], "before-panic");
		assert_eq!(event["session"]["handledCount"], 1);
	}

	#[tokio::test]
	async fn test_breadcrumb_type_filter() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery)
			.enabled_breadcrumb_types([BreadcrumbType::Manual])
			.build()
			.unwrap();

		assert!(client.leave_breadcrumb("kept"));
		assert!(!client.leave_breadcrumb_with("dropped", BreadcrumbType::Log, BTreeMap::new()));
		let messages: Vec<String> = client.breadcrumbs().into_iter().map(|b| b.message).collect();
		assert_eq!(messages, vec!["kept"]);
	}

	#[tokio::test]
	async fn test_metadata_operations() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();

		client.add_metadata_section(
			"build",
			BTreeMap::from([
				("sha".to_string(), json!("abc")),
				("dirty".to_string(), json!(false)),
			]),
		);
		client.clear_metadata_key("build", "dirty");
		assert_eq!(client.metadata("build").unwrap().len(), 1);

		client.clear_metadata_key("build", "sha");
		assert!(client.metadata("build").is_none());

		client.add_metadata("a", "b", json!(1));
		client.clear_metadata("a");
		assert!(client.metadata("a").is_none());
	}

	#[tokio::test]
	async fn test_context_and_user() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).context("boot").build().unwrap();
		assert_eq!(client.context().as_deref(), Some("boot"));

		client.set_context(Some("editor".to_string()));
		assert_eq!(client.context().as_deref(), Some("editor"));

		client.set_user(UserContext {
			email: Some("a@example.com".to_string()),
			..Default::default()
		});
		assert!(!client.user().is_empty());
		client.clear_user();
		assert!(client.user().is_empty());
	}

	#[tokio::test]
	async fn test_connectivity_change_leaves_breadcrumb() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();
		let mut rx = client.subscribe();

		assert!(client.on_connectivity_changed(false, "none").is_none());
		let crumb = client.breadcrumbs().pop().unwrap();
		assert_eq!(crumb.message, CONNECTIVITY_BREADCRUMB);
		assert_eq!(crumb.kind, BreadcrumbType::State);
		assert_eq!(crumb.metadata["networkState"], "none");

		let mut saw_change = false;
		while let Ok(notification) = rx.try_recv() {
			if let TelemetryNotification::ConnectivityChanged { has_connection, .. } = notification {
				assert!(!has_connection);
				saw_change = true;
			}
		}
		assert!(saw_change);
		assert!(client.on_connectivity_changed(true, "wifi").is_some());
	}

	#[tokio::test]
	async fn test_sessions_can_be_disabled() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).auto_track_sessions(false).build().unwrap();
		assert!(client.current_session().is_none());

		assert!(client.start_session().is_some());
		client.pause_session();
		assert!(client.current_session().is_none());
		assert!(client.resume_session());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_shutdown_rejects_notify() {
		let delivery = Arc::new(RecordingDelivery::default());
		let client = builder(&delivery).build().unwrap();

		client.shutdown().await;
		client.shutdown().await;
		assert!(client.is_closed());

		let error = std::io::Error::other("late");
		assert!(matches!(client.notify(&error), Err(CaptureError::Shutdown)));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_multi_thread_runtime_is_flagged_as_coarse_hang_queue() {
		assert!(misses_single_blocked_worker(&Handle::current()));
	}

	#[tokio::test]
	async fn test_current_thread_runtime_is_a_precise_hang_queue() {
		assert!(!misses_single_blocked_worker(&Handle::current()));
	}

	#[tokio::test]
	async fn test_shutdown_stops_watchdog_on_current_thread_runtime() {
		let delivery = Arc::new(RecordingDelivery::default());
		let (tx, _rx) = mpsc::channel::<crate::watchdog::Task>();
		let client = builder(&delivery)
			.detect_hangs(true)
			.hang_threshold(Duration::from_millis(50))
			.monitored_queue(Arc::new(tx))
			.build()
			.unwrap();
		assert!(client.inner.watchdog.lock().is_some());

		tokio::time::timeout(Duration::from_secs(2), client.shutdown())
			.await
			.expect("shutdown should not hang");
		assert!(client.inner.watchdog.lock().is_none());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_blocked_queue_produces_thread_blocked_event() {
		let delivery = Arc::new(RecordingDelivery::default());
		let (tx, _rx) = mpsc::channel::<crate::watchdog::Task>();
		let client = builder(&delivery)
			.detect_hangs(true)
			.hang_threshold(Duration::from_millis(50))
			.monitored_queue(Arc::new(tx))
			.build()
			.unwrap();

		let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
		while delivery.events().is_empty() && tokio::time::Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		client.shutdown().await;

		let events = delivery.events();
		assert_eq!(events.len(), 1, "one report per blocked period");
		assert_eq!(events[0]["errorClass"], THREAD_BLOCKED_ERROR_CLASS);
		assert_eq!(events[0]["handledState"]["unhandled"], true);
		assert_eq!(events[0]["threadName"], "main");
		assert_eq!(events[0]["session"]["unhandledCount"], 1);
	}
}
