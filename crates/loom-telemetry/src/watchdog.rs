// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Blocked-thread (hang) detection.
//!
//! A dedicated watchdog thread posts a liveness task onto the monitored
//! thread's work queue, waits for the threshold, then checks whether the task
//! ran. The wait doubles as the stop signal, so the watchdog never busy-polls
//! and stops promptly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::callbacks::{catch_user_panic, panic_message};
use crate::error::WatchdogError;

/// Default time the monitored thread may go without processing its queue.
pub const DEFAULT_HANG_THRESHOLD: Duration = Duration::from_secs(5);

const WATCHDOG_THREAD_NAME: &str = "loom-hang-watchdog";

/// A unit of work posted onto the monitored thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The work queue of the thread being monitored.
pub trait WorkQueue: Send + Sync {
	/// Enqueues `task` to run on the monitored thread. Returns false if the
	/// queue no longer accepts work.
	fn post(&self, task: Task) -> bool;

	fn thread_name(&self) -> String {
		"main".to_string()
	}
}

impl WorkQueue for mpsc::Sender<Task> {
	fn post(&self, task: Task) -> bool {
		self.send(task).is_ok()
	}
}

/// Monitors a tokio runtime's ability to pick up new tasks.
impl WorkQueue for tokio::runtime::Handle {
	fn post(&self, task: Task) -> bool {
		self.spawn(async move { task() });
		true
	}

	fn thread_name(&self) -> String {
		"tokio-runtime".to_string()
	}
}

/// Details of a detected hang.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedThread {
	pub thread_name: String,
	pub threshold: Duration,
	pub detected_at: DateTime<Utc>,
}

/// Receives hang reports. Called on the watchdog thread.
pub trait HangDelegate: Send + Sync {
	fn on_thread_blocked(&self, blocked: &BlockedThread);
}

impl<F> HangDelegate for F
where
	F: Fn(&BlockedThread) + Send + Sync,
{
	fn on_thread_blocked(&self, blocked: &BlockedThread) {
		self(blocked)
	}
}

struct Running {
	stop_tx: mpsc::Sender<()>,
	thread: JoinHandle<()>,
}

/// Watches one thread and reports each unbroken blocked period once.
pub struct HangWatchdog {
	threshold: Duration,
	queue: Arc<dyn WorkQueue>,
	delegate: Arc<dyn HangDelegate>,
	tick: Arc<AtomicU64>,
	running: Mutex<Option<Running>>,
}

impl HangWatchdog {
	pub fn new(
		threshold: Duration,
		queue: Arc<dyn WorkQueue>,
		delegate: Arc<dyn HangDelegate>,
	) -> Result<Self, WatchdogError> {
		if threshold.is_zero() {
			return Err(WatchdogError::InvalidThreshold(threshold));
		}
		Ok(Self {
			threshold,
			queue,
			delegate,
			tick: Arc::new(AtomicU64::new(0)),
			running: Mutex::new(None),
		})
	}

	pub fn threshold(&self) -> Duration {
		self.threshold
	}

	/// Number of liveness tasks the monitored thread has run.
	pub fn ticks(&self) -> u64 {
		self.tick.load(Ordering::SeqCst)
	}

	pub fn is_running(&self) -> bool {
		self.running.lock().is_some()
	}

	/// Spawns the watchdog thread.
	pub fn start(&self) -> Result<(), WatchdogError> {
		let mut running = self.running.lock();
		if running.is_some() {
			return Err(WatchdogError::AlreadyRunning);
		}

		let (stop_tx, stop_rx) = mpsc::channel();
		let monitor = Monitor {
			threshold: self.threshold,
			queue: Arc::clone(&self.queue),
			delegate: Arc::clone(&self.delegate),
			tick: Arc::clone(&self.tick),
			stop_rx,
		};
		let thread = thread::Builder::new()
			.name(WATCHDOG_THREAD_NAME.to_string())
			.spawn(move || monitor.run())
			.map_err(WatchdogError::Spawn)?;

		info!(
			threshold_ms = self.threshold.as_millis() as u64,
			thread = %self.queue.thread_name(),
			"Hang watchdog started"
		);
		*running = Some(Running { stop_tx, thread });
		Ok(())
	}

	/// Stops the watchdog. No report is made after this returns, unless it is
	/// called from the delegate itself, in which case the thread exits after
	/// the current report.
	pub fn stop(&self) {
		let Some(Running { stop_tx, thread }) = self.running.lock().take() else {
			return;
		};
		let _ = stop_tx.send(());

		if thread.thread().id() == thread::current().id() {
			return;
		}
		if thread.join().is_err() {
			error!("Hang watchdog thread panicked");
		}
		info!("Hang watchdog stopped");
	}
}

impl Drop for HangWatchdog {
	fn drop(&mut self) {
		self.stop();
	}
}

struct Monitor {
	threshold: Duration,
	queue: Arc<dyn WorkQueue>,
	delegate: Arc<dyn HangDelegate>,
	tick: Arc<AtomicU64>,
	stop_rx: mpsc::Receiver<()>,
}

impl Monitor {
	fn run(self) {
		let thread_name = self.queue.thread_name();
		let mut blocked = false;

		loop {
			let before = self.tick.load(Ordering::SeqCst);
			let tick = Arc::clone(&self.tick);
			if !self.queue.post(Box::new(move || {
				tick.fetch_add(1, Ordering::SeqCst);
			})) {
				warn!(thread = %thread_name, "Monitored queue closed, stopping hang watchdog");
				break;
			}

			// A stop message or a dropped sender ends the loop; only a timeout
			// counts as a full threshold interval.
			match self.stop_rx.recv_timeout(self.threshold) {
				Err(RecvTimeoutError::Timeout) => {}
				Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
			}

			if self.tick.load(Ordering::SeqCst) != before {
				if blocked {
					info!(thread = %thread_name, "Monitored thread unblocked");
				}
				blocked = false;
				continue;
			}
			if blocked {
				continue;
			}

			blocked = true;
			let report = BlockedThread {
				thread_name: thread_name.clone(),
				threshold: self.threshold,
				detected_at: Utc::now(),
			};
			warn!(
				thread = %report.thread_name,
				threshold_ms = self.threshold.as_millis() as u64,
				"Monitored thread blocked"
			);
			if let Err(payload) = catch_user_panic(|| self.delegate.on_thread_blocked(&report)) {
				error!(panic = %panic_message(payload.as_ref()), "Hang delegate panicked");
			}
		}

		debug!(thread = %thread_name, "Hang watchdog loop exited");
	}
}
