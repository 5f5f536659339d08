//! Pod log tailing for the wait phase.
//!
//! Streams logs from the pods labeled with the workload name. Lines are
//! handed to the apply flow over a channel so they reach the terminal through
//! the one shared writer, interleaved at line boundaries with the other wait
//! output. Termination is cooperative through the shared cancellation token.

use std::{collections::HashSet, time::Duration};

use futures::{
	stream::{BoxStream, SelectAll},
	AsyncBufReadExt, StreamExt,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
	api::{Api, ListParams, LogParams},
	Client,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Label the supply chain stamps onto the pods of a workload.
pub const WORKLOAD_NAME_LABEL: &str = "carto.run/workload-name";

/// How often to look for newly created pods.
const POD_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

type LogLine = (String, std::io::Result<String>);

/// Tail the logs of all pods belonging to the workload until cancelled,
/// sending each line (prefixed with its pod name) to `lines`.
#[instrument(skip_all, fields(workload = %workload_name))]
pub async fn tail_logs(
	client: Client,
	namespace: String,
	workload_name: String,
	timestamps: bool,
	token: CancellationToken,
	lines: UnboundedSender<String>,
) -> Result<(), kube::Error> {
	let api: Api<Pod> = Api::namespaced(client, &namespace);
	let selector = format!("{WORKLOAD_NAME_LABEL}={workload_name}");

	let mut tailed: HashSet<String> = HashSet::new();
	let mut merged: SelectAll<BoxStream<'static, LogLine>> = SelectAll::new();
	let mut refresh = tokio::time::interval(POD_REFRESH_INTERVAL);

	loop {
		tokio::select! {
			_ = token.cancelled() => return Ok(()),
			_ = refresh.tick() => {
				let pods = api.list(&ListParams::default().labels(&selector)).await?;
				for pod in pods.items {
					let Some(pod_name) = pod.metadata.name else {
						continue;
					};
					if !tailed.insert(pod_name.clone()) {
						continue;
					}
					debug!(pod = %pod_name, "tailing pod");
					let params = LogParams {
						follow: true,
						timestamps,
						..LogParams::default()
					};
					match api.log_stream(&pod_name, &params).await {
						Ok(reader) => {
							let label = pod_name.clone();
							merged.push(
								reader
									.lines()
									.map(move |line| (label.clone(), line))
									.boxed(),
							);
						}
						Err(err) => {
							warn!(pod = %pod_name, error = %err, "failed to open log stream");
						}
					}
				}
			}
			line = merged.next(), if !merged.is_empty() => {
				if let Some((pod, Ok(line))) = line {
					// receiver gone means the wait phase is over
					if lines.send(format!("{pod}> {line}")).is_err() {
						return Ok(());
					}
				}
			}
		}
	}
}
