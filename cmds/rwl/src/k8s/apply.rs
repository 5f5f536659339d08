//! Workload submission.
//!
//! Creates or updates the resource with full-object writes. A conflicting
//! concurrent update is terminal here, the caller is told to rerun.

use kube::api::{Api, PostParams};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::workload::Workload;

#[derive(Debug, Error)]
pub enum SubmitError {
	#[error("conflict updating workload, the object was modified by another user; please run the update command again")]
	Conflict,

	#[error("creating workload {name:?}")]
	Create {
		name: String,
		#[source]
		source: Box<kube::Error>,
	},

	#[error("updating workload {name:?}")]
	Update {
		name: String,
		#[source]
		source: Box<kube::Error>,
	},
}

/// Create the workload on the cluster.
#[instrument(skip_all, fields(name = %workload.name()))]
pub async fn create_workload(
	api: &Api<Workload>,
	workload: &Workload,
) -> Result<Workload, SubmitError> {
	debug!("creating workload");
	api.create(&PostParams::default(), workload)
		.await
		.map_err(|source| SubmitError::Create {
			name: workload.name().to_string(),
			source: Box::new(source),
		})
}

/// Replace the workload on the cluster with the reconciled resource.
#[instrument(skip_all, fields(name = %workload.name()))]
pub async fn update_workload(
	api: &Api<Workload>,
	workload: &Workload,
) -> Result<Workload, SubmitError> {
	debug!("updating workload");
	match api
		.replace(workload.name(), &PostParams::default(), workload)
		.await
	{
		Ok(updated) => Ok(updated),
		Err(kube::Error::Api(ref response)) if response.code == 409 => Err(SubmitError::Conflict),
		Err(source) => Err(SubmitError::Update {
			name: workload.name().to_string(),
			source: Box::new(source),
		}),
	}
}
