// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Loom client-side crash telemetry SDK.
//!
//! Captures failure events, persists them durably before delivery, and ships
//! them to a collector with at-least-once semantics.
//!
//! # Features
//!
//! - Write-ahead event queue: accepted events survive process death and are
//!   delivered on the next launch
//! - Veto callbacks for events, breadcrumbs and sessions
//! - Bounded breadcrumb trail
//! - Hang watchdog reporting blocked threads as synthetic events
//! - Panic hook for unhandled panics
//!
//! # Example
//!
//! ```ignore
//! use loom_telemetry::TelemetryClient;
//!
//! let client = TelemetryClient::builder()
//!     .api_key("your_api_key")
//!     .endpoint("https://telemetry.loom.example/v1/events")
//!     .release_stage("production")
//!     .build()?;
//!
//! client.install_panic_hook();
//! client.leave_breadcrumb("Started sync");
//!
//! if let Err(e) = sync() {
//!     client.notify(&e)?;
//! }
//!
//! client.shutdown().await;
//! ```

pub mod backtrace;
pub mod breadcrumbs;
pub mod callbacks;
pub mod client;
pub mod delivery;
pub mod error;
pub mod observers;
mod panic_hook;
pub mod queue;
pub mod session;
pub mod store;
pub mod watchdog;

pub use backtrace::capture_stacktrace;
pub use breadcrumbs::{BreadcrumbTrail, DEFAULT_MAX_BREADCRUMBS, MAX_BREADCRUMBS_LIMIT};
pub use callbacks::{Callback, CallbackChain, CallbackState};
pub use client::{TelemetryClient, TelemetryClientBuilder, TelemetryConfig, THREAD_BLOCKED_ERROR_CLASS};
pub use delivery::{Delivery, DeliveryHeaders, DeliveryOutcome, HttpDelivery, SDK_NAME, SDK_VERSION};
pub use error::{
	CaptureError, DeliveryError, Result, StoreError, TelemetryError, WatchdogError,
};
pub use observers::{Observers, TelemetryNotification};
pub use panic_hook::PANIC_ERROR_CLASS;
pub use queue::{
	AttemptOutcome, EventQueue, FlushSummary, FlushTrigger, QueueConfig, PAYLOAD_VERSION,
};
pub use session::SessionTracker;
pub use store::{FileRecordStore, MemoryRecordStore, RecordId, RecordStore};
pub use watchdog::{BlockedThread, HangDelegate, HangWatchdog, Task, WorkQueue};

// Re-export core types for convenience
pub use loom_telemetry_core::{
	Breadcrumb, BreadcrumbType, FailureEvent, Frame, HandledState, Metadata, Session, SessionId,
	Severity, SeverityReason, Stacktrace, UserContext,
};
