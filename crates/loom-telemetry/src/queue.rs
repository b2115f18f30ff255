// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable event queue: write-ahead persistence, delivery and flushing.
//!
//! An accepted event is persisted before any delivery is attempted, so it
//! survives process death. Delivery runs on the tokio runtime and never
//! blocks the capturing thread. Each record is claimed exclusively for the
//! duration of one attempt; independent records are delivered in parallel.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use loom_telemetry_core::{EncodeResult, FailureEvent, JsonStream};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::callbacks::{run_call_callback, CallbackState};
use crate::delivery::{Delivery, DeliveryHeaders, DeliveryOutcome};
use crate::error::{CaptureError, StoreError};
use crate::observers::{Observers, TelemetryNotification};
use crate::store::{RecordId, RecordStore};

/// Version of the persisted envelope format.
pub const PAYLOAD_VERSION: &str = "1";

/// Default maximum number of records kept on disk.
pub const DEFAULT_MAX_PERSISTED_EVENTS: usize = 32;

#[derive(Debug, Clone)]
pub struct QueueConfig {
	/// Oldest records beyond this count are evicted after each persist.
	pub max_persisted_events: usize,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_persisted_events: DEFAULT_MAX_PERSISTED_EVENTS,
		}
	}
}

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
	Launch,
	ConnectivityRestored,
	Explicit,
}

impl FlushTrigger {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Launch => "launch",
			Self::ConnectivityRestored => "connectivity_restored",
			Self::Explicit => "explicit",
		}
	}
}

impl fmt::Display for FlushTrigger {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Terminal result of one attempt on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
	Delivered,
	RejectedPermanently,
	TransientFailure,
	/// The record could not be decoded and was dropped.
	Corrupt,
}

impl From<DeliveryOutcome> for AttemptOutcome {
	fn from(outcome: DeliveryOutcome) -> Self {
		match outcome {
			DeliveryOutcome::Delivered => Self::Delivered,
			DeliveryOutcome::RejectedPermanently => Self::RejectedPermanently,
			DeliveryOutcome::TransientFailure => Self::TransientFailure,
		}
	}
}

/// Counts of attempt outcomes for one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
	pub delivered: usize,
	pub rejected: usize,
	pub transient: usize,
	pub corrupt: usize,
	/// Records skipped because another attempt held them or they vanished.
	pub skipped: usize,
}

impl FlushSummary {
	fn record(&mut self, outcome: Option<AttemptOutcome>) {
		match outcome {
			Some(AttemptOutcome::Delivered) => self.delivered += 1,
			Some(AttemptOutcome::RejectedPermanently) => self.rejected += 1,
			Some(AttemptOutcome::TransientFailure) => self.transient += 1,
			Some(AttemptOutcome::Corrupt) => self.corrupt += 1,
			None => self.skipped += 1,
		}
	}

	pub fn attempted(&self) -> usize {
		self.delivered + self.rejected + self.transient + self.corrupt
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
	api_key: String,
	payload_version: String,
	event_count: usize,
	events: Vec<FailureEvent>,
}

fn write_envelope(out: &mut dyn Write, event: &FailureEvent) -> EncodeResult<()> {
	let mut stream = JsonStream::new(out);
	stream.begin_object()?;
	stream.field("apiKey", &event.api_key)?;
	stream.field("payloadVersion", PAYLOAD_VERSION)?;
	stream.field("eventCount", &1u32)?;
	stream.name("events")?;
	stream.begin_array()?;
	stream.value(event)?;
	stream.end_array()?;
	stream.end_object()?;
	stream.finish()
}

fn decode_envelope(bytes: &[u8]) -> Result<Envelope, String> {
	let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
	if envelope.payload_version.is_empty() {
		return Err("missing payload version".to_string());
	}
	if envelope.events.is_empty() || envelope.event_count != envelope.events.len() {
		return Err(format!(
			"event count {} does not match {} events",
			envelope.event_count,
			envelope.events.len()
		));
	}
	Ok(envelope)
}

/// Releases a record's in-flight claim when dropped.
struct Claim<'a> {
	in_flight: &'a Mutex<HashSet<RecordId>>,
	id: RecordId,
}

impl Drop for Claim<'_> {
	fn drop(&mut self) {
		self.in_flight.lock().remove(&self.id);
	}
}

/// Persists accepted events and delivers them.
#[derive(Clone)]
pub struct EventQueue {
	inner: Arc<QueueInner>,
}

struct QueueInner {
	store: Arc<dyn RecordStore>,
	delivery: Arc<dyn Delivery>,
	callbacks: CallbackState,
	observers: Observers,
	runtime: Handle,
	config: QueueConfig,
	in_flight: Mutex<HashSet<RecordId>>,
	eviction: Mutex<()>,
	tasks: TaskTracker,
	idle_lock: tokio::sync::Mutex<()>,
	closed: AtomicBool,
	online: AtomicBool,
}

impl EventQueue {
	pub fn new(
		store: Arc<dyn RecordStore>,
		delivery: Arc<dyn Delivery>,
		callbacks: CallbackState,
		observers: Observers,
		runtime: Handle,
		config: QueueConfig,
	) -> Self {
		Self {
			inner: Arc::new(QueueInner {
				store,
				delivery,
				callbacks,
				observers,
				runtime,
				config,
				in_flight: Mutex::new(HashSet::new()),
				eviction: Mutex::new(()),
				tasks: TaskTracker::new(),
				idle_lock: tokio::sync::Mutex::new(()),
				closed: AtomicBool::new(false),
				online: AtomicBool::new(true),
			}),
		}
	}

	/// Runs the on_failure chain, persists the event if accepted, then
	/// schedules an immediate delivery attempt.
	///
	/// Returns `Ok(None)` if a callback vetoed the event. Blocks only on disk
	/// I/O.
	pub fn capture(&self, event: FailureEvent) -> Result<Option<RecordId>, CaptureError> {
		self.capture_with(event, |_| true)
	}

	/// Like [`capture`](Self::capture), with one extra callback that runs
	/// after the registered chain.
	pub fn capture_with(
		&self,
		event: FailureEvent,
		on_failure: impl FnOnce(&mut FailureEvent) -> bool,
	) -> Result<Option<RecordId>, CaptureError> {
		let id = self.accept_and_persist(event, on_failure)?;
		if let Some(id) = &id {
			self.spawn_attempt(id.clone());
		}
		Ok(id)
	}

	/// Persists without scheduling delivery. For callers about to lose the
	/// runtime, such as a panic hook; the record is sent on the next flush.
	pub fn capture_blocking(&self, event: FailureEvent) -> Result<Option<RecordId>, CaptureError> {
		self.capture_blocking_with(event, |_| true)
	}

	pub fn capture_blocking_with(
		&self,
		event: FailureEvent,
		on_failure: impl FnOnce(&mut FailureEvent) -> bool,
	) -> Result<Option<RecordId>, CaptureError> {
		self.accept_and_persist(event, on_failure)
	}

	/// Attempts delivery of one record.
	///
	/// Returns `None` if the record is already in flight, no longer exists,
	/// or the queue is shut down.
	pub async fn attempt_delivery(&self, id: &RecordId) -> Option<AttemptOutcome> {
		self.inner.attempt_delivery(id).await
	}

	/// Attempts every persisted record not currently in flight, oldest first.
	///
	/// Runs in the background; await the handle to observe the summary.
	pub fn flush(&self, trigger: FlushTrigger) -> JoinHandle<FlushSummary> {
		let inner = Arc::clone(&self.inner);
		self.inner
			.tasks
			.spawn_on(async move { inner.flush(trigger).await }, &self.inner.runtime)
	}

	/// Records a connectivity change; flushes on an offline to online
	/// transition.
	pub fn on_connectivity_changed(&self, has_connection: bool) -> Option<JoinHandle<FlushSummary>> {
		let was_online = self.inner.online.swap(has_connection, Ordering::SeqCst);
		if has_connection && !was_online {
			Some(self.flush(FlushTrigger::ConnectivityRestored))
		} else {
			None
		}
	}

	/// Persisted records, oldest first.
	pub fn pending(&self) -> Result<Vec<RecordId>, StoreError> {
		self.inner.store.list()
	}

	pub fn is_in_flight(&self, id: &RecordId) -> bool {
		self.inner.in_flight.lock().contains(id)
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Waits for every delivery and flush task spawned so far.
	pub async fn idle(&self) {
		let _guard = self.inner.idle_lock.lock().await;
		self.inner.tasks.close();
		self.inner.tasks.wait().await;
		if !self.inner.closed.load(Ordering::SeqCst) {
			self.inner.tasks.reopen();
		}
	}

	/// Stops new attempts and waits for in-flight ones. Pending records stay
	/// on disk for the next launch.
	pub async fn shutdown(&self) {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let _guard = self.inner.idle_lock.lock().await;
		self.inner.tasks.close();
		self.inner.tasks.wait().await;
		info!("Event queue shut down");
	}

	fn accept_and_persist(
		&self,
		mut event: FailureEvent,
		on_failure: impl FnOnce(&mut FailureEvent) -> bool,
	) -> Result<Option<RecordId>, CaptureError> {
		if self.is_closed() {
			return Err(CaptureError::Shutdown);
		}

		let accepted = self.inner.callbacks.on_failure.run(&mut event)
			&& run_call_callback(on_failure, &mut event);
		if !accepted {
			debug!(error_class = %event.error_class, "Event vetoed by on_failure callback");
			return Ok(None);
		}

		let id = RecordId::generate();
		if let Err(e) = self
			.inner
			.store
			.persist(&id, &mut |out: &mut dyn Write| write_envelope(out, &event))
		{
			error!(record_id = %id, error = %e, "Failed to persist failure event");
			return Err(e.into());
		}

		debug!(
			record_id = %id,
			error_class = %event.error_class,
			unhandled = event.is_unhandled(),
			"Persisted failure event"
		);

		self.inner.enforce_capacity();
		Ok(Some(id))
	}

	fn spawn_attempt(&self, id: RecordId) {
		if self.is_closed() {
			return;
		}
		let inner = Arc::clone(&self.inner);
		self.inner.tasks.spawn_on(
			async move {
				inner.attempt_delivery(&id).await;
			},
			&self.inner.runtime,
		);
	}
}

impl QueueInner {
	fn claim(&self, id: &RecordId) -> Option<Claim<'_>> {
		if self.in_flight.lock().insert(id.clone()) {
			Some(Claim {
				in_flight: &self.in_flight,
				id: id.clone(),
			})
		} else {
			debug!(record_id = %id, "Record already in flight, skipping");
			None
		}
	}

	fn enforce_capacity(&self) {
		let _guard = self.eviction.lock();
		let max = self.config.max_persisted_events;

		let ids = match self.store.list() {
			Ok(ids) => ids,
			Err(e) => {
				warn!(error = %e, "Failed to list records for capacity check");
				return;
			}
		};
		if ids.len() <= max {
			return;
		}

		let excess = ids.len() - max;
		for id in ids.into_iter().take(excess) {
			match self.store.remove(&id) {
				Ok(()) => warn!(
					record_id = %id,
					max_persisted_events = max,
					"Evicted oldest persisted event over capacity"
				),
				Err(e) => error!(record_id = %id, error = %e, "Failed to evict persisted event"),
			}
		}
	}

	fn remove_record(&self, id: &RecordId) {
		if let Err(e) = self.store.remove(id) {
			error!(record_id = %id, error = %e, "Failed to remove persisted record");
		}
	}

	async fn attempt_delivery(&self, id: &RecordId) -> Option<AttemptOutcome> {
		if self.closed.load(Ordering::SeqCst) {
			debug!(record_id = %id, "Queue closed, not attempting delivery");
			return None;
		}
		let _claim = self.claim(id)?;

		let bytes = match self.store.read(id) {
			Ok(bytes) => bytes,
			Err(e) if e.is_not_found() => {
				debug!(record_id = %id, "Record no longer exists");
				return None;
			}
			Err(e) => {
				warn!(record_id = %id, error = %e, "Failed to read persisted record");
				return Some(self.report(id, AttemptOutcome::TransientFailure));
			}
		};

		let envelope = match decode_envelope(&bytes) {
			Ok(envelope) => envelope,
			Err(reason) => {
				error!(record_id = %id, reason = %reason, "Dropping corrupt persisted record");
				self.remove_record(id);
				self.observers.notify(TelemetryNotification::RecordCorrupt {
					record_id: id.clone(),
				});
				return Some(AttemptOutcome::Corrupt);
			}
		};

		let headers = DeliveryHeaders {
			api_key: envelope.api_key,
			payload_version: envelope.payload_version,
			sent_at: Utc::now(),
			event_id: id.to_string(),
		};

		let (outcome, failure) = match self.delivery.deliver(bytes, &headers).await {
			Ok(outcome) => (outcome, None),
			Err(e) if e.is_retryable() => (DeliveryOutcome::TransientFailure, Some(e.to_string())),
			Err(e) => (DeliveryOutcome::RejectedPermanently, Some(e.to_string())),
		};

		match outcome {
			DeliveryOutcome::Delivered => {
				self.remove_record(id);
				info!(record_id = %id, "Delivered failure event");
			}
			DeliveryOutcome::RejectedPermanently => {
				self.remove_record(id);
				warn!(record_id = %id, error = ?failure, "Failure event rejected permanently, dropping record");
			}
			DeliveryOutcome::TransientFailure => {
				warn!(record_id = %id, error = ?failure, "Failure event delivery failed, keeping record for next flush");
			}
		}

		Some(self.report(id, outcome.into()))
	}

	fn report(&self, id: &RecordId, outcome: AttemptOutcome) -> AttemptOutcome {
		self.observers
			.notify(TelemetryNotification::DeliveryAttempted {
				record_id: id.clone(),
				outcome,
			});
		outcome
	}

	async fn flush(&self, trigger: FlushTrigger) -> FlushSummary {
		let mut summary = FlushSummary::default();

		let ids = match self.store.list() {
			Ok(ids) => ids,
			Err(e) => {
				error!(trigger = %trigger, error = %e, "Failed to list persisted records");
				return summary;
			}
		};
		debug!(trigger = %trigger, pending = ids.len(), "Flushing persisted events");

		for id in ids {
			if self.closed.load(Ordering::SeqCst) {
				break;
			}
			summary.record(self.attempt_delivery(&id).await);
		}

		info!(
			trigger = %trigger,
			delivered = summary.delivered,
			rejected = summary.rejected,
			transient = summary.transient,
			corrupt = summary.corrupt,
			skipped = summary.skipped,
			"Flush complete"
		);
		summary
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::DeliveryError;
	use crate::store::MemoryRecordStore;
	use async_trait::async_trait;
	use loom_telemetry_core::HandledState;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	struct MockDelivery {
		outcome: Mutex<Result<DeliveryOutcome, u16>>,
		calls: AtomicUsize,
		delay: Duration,
		headers: Mutex<Vec<DeliveryHeaders>>,
	}

	impl MockDelivery {
		fn new(outcome: DeliveryOutcome) -> Arc<Self> {
			Self::with_delay(outcome, Duration::ZERO)
		}

		fn with_delay(outcome: DeliveryOutcome, delay: Duration) -> Arc<Self> {
			Arc::new(Self {
				outcome: Mutex::new(Ok(outcome)),
				calls: AtomicUsize::new(0),
				delay,
				headers: Mutex::new(Vec::new()),
			})
		}

		fn set_outcome(&self, outcome: DeliveryOutcome) {
			*self.outcome.lock() = Ok(outcome);
		}

		fn fail_with_status(&self, status: u16) {
			*self.outcome.lock() = Err(status);
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl Delivery for MockDelivery {
		async fn deliver(
			&self,
			_payload: Vec<u8>,
			headers: &DeliveryHeaders,
		) -> Result<DeliveryOutcome, DeliveryError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.headers.lock().push(headers.clone());
			if !self.delay.is_zero() {
				tokio::time::sleep(self.delay).await;
			}
			let outcome = *self.outcome.lock();
			outcome.map_err(|status| DeliveryError::Status {
				status,
				message: "mock".to_string(),
			})
		}
	}

	fn event(class: &str) -> FailureEvent {
		let mut event = FailureEvent::new(class, "boom", HandledState::handled());
		event.api_key = "test-key".to_string();
		event
	}

	fn queue_with(
		store: Arc<MemoryRecordStore>,
		delivery: Arc<MockDelivery>,
		max: usize,
	) -> (EventQueue, CallbackState, Observers) {
		let callbacks = CallbackState::new();
		let observers = Observers::default();
		let queue = EventQueue::new(
			store,
			delivery,
			callbacks.clone(),
			observers.clone(),
			Handle::current(),
			QueueConfig {
				max_persisted_events: max,
			},
		);
		(queue, callbacks, observers)
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_capture_delivers_and_removes_record() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::Delivered);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		let id = queue.capture(event("E")).unwrap().unwrap();
		queue.idle().await;

		assert_eq!(delivery.calls(), 1);
		assert!(store.is_empty());
		let headers = delivery.headers.lock();
		assert_eq!(headers[0].event_id, id.to_string());
		assert_eq!(headers[0].api_key, "test-key");
		assert_eq!(headers[0].payload_version, PAYLOAD_VERSION);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_transient_failure_keeps_record() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::TransientFailure);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		queue.capture(event("E")).unwrap();
		queue.idle().await;

		assert_eq!(store.len(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_rejecting_status_error_drops_record() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::Delivered);
		delivery.fail_with_status(400);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		let id = queue.capture_blocking(event("E")).unwrap().unwrap();
		assert_eq!(
			queue.attempt_delivery(&id).await,
			Some(AttemptOutcome::RejectedPermanently)
		);
		assert!(store.is_empty());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_retryable_status_error_keeps_record() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::Delivered);
		delivery.fail_with_status(503);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		let id = queue.capture_blocking(event("E")).unwrap().unwrap();
		assert_eq!(
			queue.attempt_delivery(&id).await,
			Some(AttemptOutcome::TransientFailure)
		);
		assert_eq!(store.len(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_veto_persists_nothing() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::Delivered);
		let (queue, callbacks, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);
		callbacks.on_failure.add(Arc::new(|_: &mut FailureEvent| false));

		assert!(queue.capture(event("E")).unwrap().is_none());
		queue.idle().await;
		assert!(store.is_empty());
		assert_eq!(delivery.calls(), 0);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_extra_callback_runs_after_chain() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::TransientFailure);
		let (queue, callbacks, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);
		callbacks.on_failure.add(Arc::new(|e: &mut FailureEvent| {
			e.context = Some("chain".to_string());
			true
		}));

		let id = queue
			.capture_blocking_with(event("E"), |e| {
				assert_eq!(e.context.as_deref(), Some("chain"));
				e.context = Some("extra".to_string());
				true
			})
			.unwrap()
			.unwrap();

		let envelope = decode_envelope(&store.read(&id).unwrap()).unwrap();
		assert_eq!(envelope.events[0].context.as_deref(), Some("extra"));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_panicking_extra_callback_keeps_event() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::TransientFailure);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		let id = queue
			.capture_blocking_with(event("E"), |e| {
				e.context = Some("half-applied".to_string());
				panic!("per-call callback bug");
			})
			.unwrap()
			.unwrap();

		let envelope = decode_envelope(&store.read(&id).unwrap()).unwrap();
		assert_eq!(envelope.events[0].context.as_deref(), Some("half-applied"));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_corrupt_record_is_dropped_and_scan_continues() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::Delivered);
		let (queue, _, observers) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);
		let mut notifications = observers.subscribe();

		let corrupt = RecordId::generate();
		store.insert(corrupt.clone(), b"{\"apiKey\":\"k\",\"events\":[".to_vec());
		let mismatched = RecordId::generate();
		store.insert(
			mismatched,
			br#"{"apiKey":"k","payloadVersion":"1","eventCount":2,"events":[]}"#.to_vec(),
		);
		queue.capture_blocking(event("E")).unwrap();

		let summary = queue.flush(FlushTrigger::Explicit).await.unwrap();
		assert_eq!(summary.corrupt, 2);
		assert_eq!(summary.delivered, 1);
		assert!(store.is_empty());
		assert_eq!(delivery.calls(), 1);

		assert!(matches!(
			notifications.recv().await.unwrap(),
			TelemetryNotification::RecordCorrupt { record_id } if record_id == corrupt
		));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_claimed_record_is_skipped() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery =
			MockDelivery::with_delay(DeliveryOutcome::Delivered, Duration::from_millis(200));
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		let id = queue.capture_blocking(event("E")).unwrap().unwrap();
		let first = {
			let queue = queue.clone();
			let id = id.clone();
			tokio::spawn(async move { queue.attempt_delivery(&id).await })
		};
		tokio::time::sleep(Duration::from_millis(50)).await;

		assert!(queue.is_in_flight(&id));
		assert_eq!(queue.attempt_delivery(&id).await, None);
		assert_eq!(first.await.unwrap(), Some(AttemptOutcome::Delivered));
		assert!(!queue.is_in_flight(&id));
		assert_eq!(delivery.calls(), 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_capacity_evicts_oldest() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::TransientFailure);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 2);

		let ids: Vec<RecordId> = (0..4)
			.map(|i| queue.capture_blocking(event(&format!("E{i}"))).unwrap().unwrap())
			.collect();

		assert_eq!(queue.pending().unwrap(), ids[2..].to_vec());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_connectivity_flushes_only_when_restored() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::TransientFailure);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);
		queue.capture_blocking(event("E")).unwrap();

		assert!(queue.on_connectivity_changed(true).is_none());
		assert!(queue.on_connectivity_changed(false).is_none());

		delivery.set_outcome(DeliveryOutcome::Delivered);
		let summary = queue.on_connectivity_changed(true).unwrap().await.unwrap();
		assert_eq!(summary.delivered, 1);
		assert!(store.is_empty());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_shutdown_rejects_capture_and_keeps_pending() {
		let store = Arc::new(MemoryRecordStore::new());
		let delivery = MockDelivery::new(DeliveryOutcome::TransientFailure);
		let (queue, _, _) = queue_with(Arc::clone(&store), Arc::clone(&delivery), 32);

		queue.capture(event("E")).unwrap();
		queue.shutdown().await;

		assert!(matches!(
			queue.capture(event("E")),
			Err(CaptureError::Shutdown)
		));
		assert_eq!(store.len(), 1);
		assert_eq!(queue.flush(FlushTrigger::Explicit).await.unwrap().attempted(), 0);
	}

	#[test]
	fn test_envelope_round_trip() {
		let mut buf = Vec::new();
		write_envelope(&mut buf, &event("E")).unwrap();

		let envelope = decode_envelope(&buf).unwrap();
		assert_eq!(envelope.api_key, "test-key");
		assert_eq!(envelope.event_count, 1);
		assert_eq!(envelope.events[0].error_class, "E");
	}
}
