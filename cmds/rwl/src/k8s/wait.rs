//! Post-apply wait workers.
//!
//! After a submit the flow can wait for the controller to acknowledge the
//! change (status-change worker) and to reconcile it (readiness worker),
//! racing every worker against a shared timeout and cancellation signal.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
	api::{Api, WatchParams},
	core::WatchEvent,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::workload::Workload;

/// Delay before re-establishing a watch stream that ended early.
const RE_WATCH_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum WaitError {
	#[error("timeout after {} waiting for {name:?} to become ready", humantime::format_duration(*.timeout))]
	Timeout { timeout: Duration, name: String },

	#[error("Failed to become ready: {message}")]
	ReadyFalse { message: String },

	#[error("establishing workload watch")]
	Watch(#[source] kube::Error),

	#[error("reading workload state")]
	Get(#[source] kube::Error),
}

/// How a wait phase ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
	Ready,
	/// The shared cancellation signal fired; not an error.
	Interrupted,
}

/// The wait phase a failure belongs to, used for the message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
	StatusChange,
	ReadyCondition,
}

impl std::fmt::Display for WaitPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			WaitPhase::StatusChange => write!(f, "status change"),
			WaitPhase::ReadyCondition => write!(f, "ready condition"),
		}
	}
}

/// A wait failure with its phase prefix.
#[derive(Debug, Error)]
#[error("Error waiting for {phase}: {error}")]
pub struct WaitFailure {
	pub phase: WaitPhase,
	#[source]
	pub error: WaitError,
}

/// Race a worker against the timeout and the cancellation signal.
pub async fn race_with_timeout<F>(
	name: &str,
	timeout: Duration,
	token: &CancellationToken,
	worker: F,
) -> Result<WaitOutcome, WaitError>
where
	F: std::future::Future<Output = Result<(), WaitError>>,
{
	tokio::select! {
		result = worker => result.map(|_| {
			if token.is_cancelled() {
				WaitOutcome::Interrupted
			} else {
				WaitOutcome::Ready
			}
		}),
		_ = token.cancelled() => Ok(WaitOutcome::Interrupted),
		_ = tokio::time::sleep(timeout) => Err(WaitError::Timeout {
			timeout,
			name: name.to_string(),
		}),
	}
}

/// Completes once the controller has acknowledged the submitted change.
///
/// Acknowledgement means a condition turned `True` with a transition time
/// strictly after the one snapshot from the pre-submit `Ready` condition, or,
/// when no condition existed before the submit, the first condition showing
/// up at all. A stale `Ready=True` carried over from before the update never
/// satisfies this.
#[instrument(skip_all, fields(name = %name))]
pub async fn wait_for_status_change(
	api: &Api<Workload>,
	name: &str,
	since: Option<&Time>,
	token: &CancellationToken,
) -> Result<(), WaitError> {
	observe(api, name, token, |workload| {
		if status_changed(workload, since) {
			Some(Ok(()))
		} else {
			None
		}
	})
	.await
}

/// Completes when the `Ready` condition turns `True`, fails when it turns
/// `False`.
#[instrument(skip_all, fields(name = %name))]
pub async fn wait_for_ready(
	api: &Api<Workload>,
	name: &str,
	token: &CancellationToken,
) -> Result<(), WaitError> {
	observe(api, name, token, ready_state).await
}

/// Drive a watch-based observer until it produces a verdict or the token is
/// cancelled. The workload is fetched up front so a transition that happened
/// before the watch was established is not missed.
async fn observe<F>(
	api: &Api<Workload>,
	name: &str,
	token: &CancellationToken,
	check: F,
) -> Result<(), WaitError>
where
	F: Fn(&Workload) -> Option<Result<(), WaitError>>,
{
	let params = WatchParams::default().fields(&format!("metadata.name={name}"));
	loop {
		if let Some(workload) = api.get_opt(name).await.map_err(WaitError::Get)? {
			if let Some(verdict) = check(&workload) {
				return verdict;
			}
		}

		let mut stream = api
			.watch(&params, "0")
			.await
			.map_err(WaitError::Watch)?
			.boxed();
		loop {
			tokio::select! {
				_ = token.cancelled() => return Ok(()),
				event = stream.try_next() => match event.map_err(WaitError::Watch)? {
					Some(WatchEvent::Added(workload)) | Some(WatchEvent::Modified(workload)) => {
						if let Some(verdict) = check(&workload) {
							return verdict;
						}
					}
					Some(WatchEvent::Error(response)) => {
						return Err(WaitError::Watch(kube::Error::Api(response)));
					}
					Some(_) => {}
					None => break,
				},
			}
		}

		debug!("watch stream ended, re-establishing");
		tokio::select! {
			_ = token.cancelled() => return Ok(()),
			_ = tokio::time::sleep(RE_WATCH_DELAY) => {}
		}
	}
}

fn status_changed(workload: &Workload, since: Option<&Time>) -> bool {
	let Some(status) = &workload.status else {
		return false;
	};
	match since {
		None => !status.conditions.is_empty(),
		Some(since) => status.conditions.iter().any(|condition| {
			condition.status == "True"
				&& condition
					.last_transition_time
					.as_ref()
					.is_some_and(|time| time.0 > since.0)
		}),
	}
}

fn ready_state(workload: &Workload) -> Option<Result<(), WaitError>> {
	let condition = workload.ready_condition()?;
	match condition.status.as_str() {
		"True" => Some(Ok(())),
		"False" => Some(Err(WaitError::ReadyFalse {
			message: condition
				.message
				.clone()
				.or_else(|| condition.reason.clone())
				.unwrap_or_default(),
		})),
		_ => None,
	}
}
