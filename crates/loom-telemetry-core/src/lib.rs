// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for Loom client-side crash telemetry.
//!
//! This crate holds the data model shared by the telemetry SDK (failure
//! events, breadcrumbs, sessions, user context) and the streaming JSON
//! encoder used to write events to disk and to the wire.
//!
//! # Overview
//!
//! - [`FailureEvent`] is a snapshot of one reportable incident
//! - [`Breadcrumb`] records app activity leading up to a failure
//! - [`Session`] counts handled and unhandled failures for one period of use
//! - [`JsonStream`] writes any [`Streamable`] value straight into a sink,
//!   omitting null-valued object keys

pub mod breadcrumb;
pub mod context;
pub mod error;
pub mod event;
pub mod session;
pub mod stream;

pub use breadcrumb::{Breadcrumb, BreadcrumbType, MAX_BREADCRUMB_MESSAGE_CHARS};
pub use context::UserContext;
pub use error::{CoreError, EncodeError, EncodeResult, Result};
pub use event::{
	EventId, FailureEvent, Frame, HandledState, Metadata, Severity, SeverityReason, Stacktrace,
};
pub use session::{Session, SessionId};
pub use stream::{to_vec, FileContent, JsonStream, Streamable};
