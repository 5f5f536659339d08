//! Kubernetes cluster connection management.

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::{
	api::Api,
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

use crate::workload::Workload;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to or reading from the cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Represents a connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection").finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the active kubeconfig context.
	#[instrument(skip_all)]
	pub async fn connect() -> Result<Self, ConnectionError> {
		let kubeconfig = Kubeconfig::read()?;
		Self::from_kubeconfig(kubeconfig, None).await
	}

	/// Connect using a provided kubeconfig, optionally overriding the context.
	#[instrument(skip_all)]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		let mut config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: context.map(str::to_string),
				..Default::default()
			},
		)
		.await?;
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);

		let client = Client::try_from(config)?;
		Ok(Self { client })
	}

	pub fn client(&self) -> &Client {
		&self.client
	}

	/// The namespace of the active context.
	pub fn default_namespace(&self) -> &str {
		self.client.default_namespace()
	}

	pub fn workloads(&self, namespace: &str) -> Api<Workload> {
		Api::namespaced(self.client.clone(), namespace)
	}

	/// Fetch a workload, mapping NotFound to `None`.
	#[instrument(skip(self))]
	pub async fn get_workload(
		&self,
		namespace: &str,
		name: &str,
	) -> Result<Option<Workload>, ConnectionError> {
		Ok(self.workloads(namespace).get_opt(name).await?)
	}

	/// Check whether a namespace exists.
	#[instrument(skip(self))]
	pub async fn namespace_exists(&self, name: &str) -> Result<bool, ConnectionError> {
		let api: Api<Namespace> = Api::all(self.client.clone());
		Ok(api.get_opt(name).await?.is_some())
	}
}
