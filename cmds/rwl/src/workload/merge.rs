//! Merge and replace primitives.
//!
//! `merge` folds an incoming document into an existing workload additively;
//! `replace_metadata` carries the server-populated metadata over to a
//! document that wholly replaces the previous state.

use std::collections::BTreeMap;

use super::{EnvVar, Param, ServiceClaim, Workload};

impl Workload {
	/// Merge `other` into `self`.
	///
	/// Scalars: a non-empty incoming value wins, an explicit empty string
	/// deletes. Labels and annotations: union with incoming values winning,
	/// a `key-` entry deletes `key`. Keyed lists (env, build env, params,
	/// service claims): left-join on name, entries new to the incoming list
	/// are appended in their incoming order.
	pub fn merge(&mut self, other: &Workload) {
		if let Some(name) = other.metadata.name.as_deref() {
			if !name.is_empty() {
				self.metadata.name = Some(name.to_string());
			}
		}
		if let Some(namespace) = other.metadata.namespace.as_deref() {
			if !namespace.is_empty() {
				self.metadata.namespace = Some(namespace.to_string());
			}
		}

		merge_string_map(&mut self.metadata.labels, other.metadata.labels.as_ref());
		merge_string_map(
			&mut self.metadata.annotations,
			other.metadata.annotations.as_ref(),
		);

		// an incoming source declaration replaces the previous one wholesale
		if let Some(source) = &other.spec.source {
			if !source.is_empty() {
				self.spec.source = Some(source.clone());
				self.spec.image = None;
			}
		}
		if let Some(image) = other.spec.image.as_deref() {
			if image.is_empty() {
				self.spec.image = None;
			} else {
				self.spec.image = Some(image.to_string());
				self.spec.source = None;
			}
		}

		// presence-tracked: absent keeps, empty deletes, value replaces
		if let Some(service_account_name) = other.spec.service_account_name.as_deref() {
			self.merge_service_account_name(service_account_name);
		}

		merge_env_list(&mut self.spec.env, &other.spec.env);
		if let Some(build) = &other.spec.build {
			for env in &build.env {
				self.put_build_env(&env.name, &env.value);
			}
		}

		if let Some(resources) = &other.spec.resources {
			for (resource, quantity) in &resources.limits {
				self.set_resource_limit(resource, quantity);
			}
			for (resource, quantity) in &resources.requests {
				self.set_resource_request(resource, quantity);
			}
		}

		merge_params(&mut self.spec.params, &other.spec.params);
		merge_service_claims(&mut self.spec.service_claims, &other.spec.service_claims);
	}

	/// Merge a service account name that was explicitly present in the
	/// incoming document. The empty string deletes.
	pub fn merge_service_account_name(&mut self, name: &str) {
		if name.is_empty() {
			self.spec.service_account_name = None;
		} else {
			self.spec.service_account_name = Some(name.to_string());
		}
	}

	/// Carry system-populated metadata over from the previous cluster state.
	///
	/// Everything else in `self` stays authoritative; without this a full
	/// replace would be rejected by the API server for a missing
	/// resourceVersion.
	pub fn replace_metadata(&mut self, current: Option<&Workload>) {
		let Some(current) = current else {
			return;
		};
		self.metadata.resource_version = current.metadata.resource_version.clone();
		self.metadata.uid = current.metadata.uid.clone();
		self.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
		self.metadata.generation = current.metadata.generation;
		self.metadata.managed_fields = current.metadata.managed_fields.clone();
	}
}

fn merge_string_map(dst: &mut Option<BTreeMap<String, String>>, src: Option<&BTreeMap<String, String>>) {
	let Some(src) = src else {
		return;
	};
	let map = dst.get_or_insert_with(BTreeMap::new);
	for (key, value) in src {
		match key.strip_suffix('-') {
			Some(deleted) => {
				map.remove(deleted);
			}
			None => {
				map.insert(key.clone(), value.clone());
			}
		}
	}
	if map.is_empty() {
		*dst = None;
	}
}

fn merge_env_list(dst: &mut Vec<EnvVar>, src: &[EnvVar]) {
	for env in src {
		match dst.iter_mut().find(|e| e.name == env.name) {
			Some(existing) => existing.value = env.value.clone(),
			None => dst.push(env.clone()),
		}
	}
}

fn merge_params(dst: &mut Vec<Param>, src: &[Param]) {
	for param in src {
		match dst.iter_mut().find(|p| p.name == param.name) {
			Some(existing) => existing.value = param.value.clone(),
			None => dst.push(param.clone()),
		}
	}
}

fn merge_service_claims(dst: &mut Vec<ServiceClaim>, src: &[ServiceClaim]) {
	for claim in src {
		match dst.iter_mut().find(|c| c.name == claim.name) {
			Some(existing) => existing.claim_ref = claim.claim_ref.clone(),
			None => dst.push(claim.clone()),
		}
	}
}
