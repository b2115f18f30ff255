// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: Capture a failure event using the loom-telemetry SDK.
//!
//! Run with:
//!   cargo run --example capture -p loom-telemetry

use std::collections::BTreeMap;

use loom_telemetry::{BreadcrumbType, TelemetryClient, TelemetryNotification, UserContext};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "loom_telemetry=debug".into()),
		)
		.init();

	let api_key =
		std::env::var("LOOM_TELEMETRY_API_KEY").expect("LOOM_TELEMETRY_API_KEY environment variable required");
	let endpoint = std::env::var("LOOM_TELEMETRY_ENDPOINT")
		.unwrap_or_else(|_| "http://localhost:8080/api/telemetry/events".to_string());

	println!("Initializing telemetry client...");
	println!("  Endpoint: {}", endpoint);

	let client = TelemetryClient::builder()
		.api_key(&api_key)
		.endpoint(&endpoint)
		.app_version("0.1.0-example")
		.release_stage("development")
		.build()?;
	client.install_panic_hook();

	let mut notifications = client.subscribe();
	tokio::spawn(async move {
		while let Ok(notification) = notifications.recv().await {
			if let TelemetryNotification::DeliveryAttempted { record_id, outcome } = notification {
				println!("  Delivery of {record_id}: {outcome:?}");
			}
		}
	});

	client.set_user(UserContext {
		id: Some("user_example_123".to_string()),
		email: Some("example@example.com".to_string()),
		username: Some("example_user".to_string()),
	});
	client.add_metadata("example", "rust_version", json!("1.75.0"));

	client.leave_breadcrumb("Application started");
	client.leave_breadcrumb_with(
		"GET /api/data failed",
		BreadcrumbType::Request,
		BTreeMap::from([("status".to_string(), json!(503))]),
	);

	println!("\nCapturing test error...");
	let error = std::io::Error::other("Example test error from loom-telemetry SDK");
	match client.notify(&error)? {
		Some(record_id) => println!("  Persisted as {record_id}"),
		None => println!("  Dropped by configuration or callback"),
	}

	client.idle().await;
	println!("  Still pending: {}", client.pending_records()?.len());

	client.shutdown().await;
	println!("\nClient shutdown complete.");

	Ok(())
}
