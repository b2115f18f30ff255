// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Panic hook that records unhandled panics before the process unwinds.

use std::any::Any;
use std::cell::Cell;
use std::panic::Location;
use std::thread;

use loom_telemetry_core::{FailureEvent, HandledState, SeverityReason};
use serde_json::json;
use tracing::{debug, error};

use crate::backtrace::capture_stacktrace;
use crate::callbacks::{in_user_callback, panic_message};

/// Error class given to panic events.
pub const PANIC_ERROR_CLASS: &str = "panic";

const REPORTER_THREAD_NAME: &str = "loom-panic-reporter";

thread_local! {
	static IS_REPORTER: Cell<bool> = const { Cell::new(false) };
}

/// Installs a hook that passes an unhandled-panic event to `report`, then
/// runs the previously installed hook.
///
/// Panics caught by the client's own callback isolation are not reported, and
/// neither is a panic raised while `report` runs.
pub(crate) fn install_panic_hook<F>(report: F)
where
	F: Fn(FailureEvent) + Send + Sync + 'static,
{
	let previous = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		if in_user_callback() {
			debug!("Panic in isolated telemetry callback, not reporting");
		} else if IS_REPORTER.with(Cell::get) {
			debug!("Panic inside telemetry panic reporter, not reporting");
		} else {
			let event = panic_event(info.payload(), info.location());
			report_on_helper_thread(&report, event);
		}
		previous(info);
	}));
}

/// Runs `report` on a short-lived helper thread and waits for it.
///
/// A second panic on the panicking thread aborts the process. On the helper
/// a panicking callback unwinds into its `catch_unwind` like anywhere else.
fn report_on_helper_thread<F>(report: &F, event: FailureEvent)
where
	F: Fn(FailureEvent) + Sync,
{
	thread::scope(|scope| {
		let spawned = thread::Builder::new()
			.name(REPORTER_THREAD_NAME.to_string())
			.spawn_scoped(scope, move || {
				IS_REPORTER.with(|flag| flag.set(true));
				report(event);
			});
		match spawned {
			Ok(handle) => {
				if handle.join().is_err() {
					error!("Panic reporter thread panicked");
				}
			}
			Err(e) => error!(error = %e, "Failed to spawn panic reporter thread"),
		}
	});
}

/// Builds the event for a panic on the current thread.
pub(crate) fn panic_event(
	payload: &(dyn Any + Send),
	location: Option<&Location<'_>>,
) -> FailureEvent {
	let mut event = FailureEvent::new(
		PANIC_ERROR_CLASS,
		panic_message(payload),
		HandledState::unhandled(SeverityReason::UnhandledPanic),
	);
	event.stacktrace = capture_stacktrace();
	event.thread_name = thread::current().name().map(str::to_string);

	if let Some(location) = location {
		event.add_metadata("panic", "file", json!(location.file()));
		event.add_metadata("panic", "line", json!(location.line()));
		event.add_metadata("panic", "column", json!(location.column()));
	}
	event
}
