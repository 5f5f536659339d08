//! The Workload resource model.
//!
//! Typed representation of the `carto.run/v1alpha1` Workload custom resource,
//! along with the field-level mutation primitives the apply flow is built on.

mod merge;
pub mod validation;

use std::{borrow::Cow, collections::BTreeMap};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};

/// API group of the Workload resource.
pub const GROUP: &str = "carto.run";

/// API version of the Workload resource.
pub const VERSION: &str = "v1alpha1";

/// Kind of the Workload resource.
pub const KIND: &str = "Workload";

/// Label carrying the workload type (e.g. `web`).
pub const WORKLOAD_TYPE_LABEL: &str = "apps.tanzu.vmware.com/workload-type";

/// Annotation marking a source image published through the Local Source Proxy.
pub const LOCAL_SOURCE_PROXY_ANNOTATION: &str = "local-source-proxy.apps.tanzu.vmware.com";

/// Reserved param name carrying Maven artifact coordinates.
pub const MAVEN_PARAM_NAME: &str = "maven";

/// Condition type marking successful reconciliation.
pub const READY_CONDITION: &str = "Ready";

/// A declarative application workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
	pub api_version: String,
	pub kind: String,
	#[serde(default)]
	pub metadata: ObjectMeta,
	#[serde(default)]
	pub spec: WorkloadSpec,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<WorkloadStatus>,
}

impl Default for Workload {
	fn default() -> Self {
		Self {
			api_version: format!("{}/{}", GROUP, VERSION),
			kind: KIND.to_string(),
			metadata: ObjectMeta::default(),
			spec: WorkloadSpec::default(),
			status: None,
		}
	}
}

impl kube::Resource for Workload {
	type DynamicType = ();
	type Scope = k8s_openapi::NamespaceResourceScope;

	fn kind(_: &()) -> Cow<'_, str> {
		KIND.into()
	}

	fn group(_: &()) -> Cow<'_, str> {
		GROUP.into()
	}

	fn version(_: &()) -> Cow<'_, str> {
		VERSION.into()
	}

	fn plural(_: &()) -> Cow<'_, str> {
		"workloads".into()
	}

	fn meta(&self) -> &ObjectMeta {
		&self.metadata
	}

	fn meta_mut(&mut self) -> &mut ObjectMeta {
		&mut self.metadata
	}
}

/// Desired state of a Workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
	/// Source of the code to build.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source: Option<WorkloadSource>,

	/// Pre-built application image, mutually exclusive with `source`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub build: Option<WorkloadBuild>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub env: Vec<EnvVar>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resources: Option<ResourceSpec>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub service_account_name: Option<String>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub params: Vec<Param>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub service_claims: Vec<ServiceClaim>,
}

/// Location of the application source code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSource {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub git: Option<GitSource>,

	/// Source image, either user provided or published through the LSP.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub image: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sub_path: Option<String>,
}

impl WorkloadSource {
	fn is_empty(&self) -> bool {
		self.git.is_none() && self.image.is_none() && self.sub_path.is_none()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub url: String,

	#[serde(rename = "ref", default, skip_serializing_if = "GitRef::is_empty")]
	pub git_ref: GitRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub branch: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tag: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub commit: Option<String>,
}

impl GitRef {
	pub fn is_empty(&self) -> bool {
		self.branch.is_none() && self.tag.is_none() && self.commit.is_none()
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadBuild {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
	pub name: String,
	#[serde(default)]
	pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub limits: BTreeMap<String, String>,

	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub requests: BTreeMap<String, String>,
}

impl ResourceSpec {
	fn is_empty(&self) -> bool {
		self.limits.is_empty() && self.requests.is_empty()
	}
}

/// An opaque key/value handed to the supply chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Param {
	pub name: String,
	#[serde(default)]
	pub value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceClaim {
	pub name: String,
	#[serde(rename = "ref", default)]
	pub claim_ref: ServiceClaimRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClaimRef {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub api_version: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
}

/// Maven artifact coordinates stored in the reserved `maven` param.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MavenSource {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub artifact_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub group_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub version: String,
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub artifact_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
	#[serde(rename = "type")]
	pub type_: String,
	#[serde(default)]
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_transition_time: Option<Time>,
}

/// Exclusive view over the possible source declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
	/// `spec.source.git`
	Git,
	/// `spec.source.image` without the LSP annotation
	SourceImage,
	/// `spec.source.image` published through the LSP
	LocalImage,
	/// `spec.image`
	Image,
	/// the reserved `maven` param
	Maven,
	None,
}

impl Workload {
	pub fn name(&self) -> &str {
		self.metadata.name.as_deref().unwrap_or_default()
	}

	pub fn namespace(&self) -> &str {
		self.metadata.namespace.as_deref().unwrap_or_default()
	}

	/// Classify the declared source. When more than one is present (a state
	/// `validate` rejects), precedence follows the declaration order below.
	pub fn source_kind(&self) -> SourceKind {
		if let Some(source) = &self.spec.source {
			if source.git.is_some() {
				return SourceKind::Git;
			}
			if source.image.is_some() {
				if self.annotation(LOCAL_SOURCE_PROXY_ANNOTATION).is_some() {
					return SourceKind::LocalImage;
				}
				return SourceKind::SourceImage;
			}
		}
		if self.spec.image.is_some() {
			return SourceKind::Image;
		}
		if self.maven_param().is_some() {
			return SourceKind::Maven;
		}
		SourceKind::None
	}

	pub fn label(&self, key: &str) -> Option<&str> {
		self.metadata
			.labels
			.as_ref()
			.and_then(|labels| labels.get(key))
			.map(String::as_str)
	}

	/// Set or delete (`value: None`) a label.
	pub fn set_label(&mut self, key: &str, value: Option<&str>) {
		match value {
			Some(value) => {
				self.metadata
					.labels
					.get_or_insert_with(BTreeMap::new)
					.insert(key.to_string(), value.to_string());
			}
			None => {
				if let Some(labels) = self.metadata.labels.as_mut() {
					labels.remove(key);
					if labels.is_empty() {
						self.metadata.labels = None;
					}
				}
			}
		}
	}

	pub fn annotation(&self, key: &str) -> Option<&str> {
		self.metadata
			.annotations
			.as_ref()
			.and_then(|annotations| annotations.get(key))
			.map(String::as_str)
	}

	/// Set or delete (`value: None`) an annotation.
	pub fn set_annotation(&mut self, key: &str, value: Option<&str>) {
		match value {
			Some(value) => {
				self.metadata
					.annotations
					.get_or_insert_with(BTreeMap::new)
					.insert(key.to_string(), value.to_string());
			}
			None => {
				if let Some(annotations) = self.metadata.annotations.as_mut() {
					annotations.remove(key);
					if annotations.is_empty() {
						self.metadata.annotations = None;
					}
				}
			}
		}
	}

	/// Set the git repository URL. An empty value removes the git source; when
	/// nothing else remains in `spec.source` the whole source is dropped.
	pub fn set_git_url(&mut self, url: &str) {
		if url.is_empty() {
			if let Some(source) = self.spec.source.as_mut() {
				source.git = None;
				if source.is_empty() {
					self.spec.source = None;
				}
			}
			return;
		}
		let source = self.spec.source.get_or_insert_with(WorkloadSource::default);
		source.git.get_or_insert_with(GitSource::default).url = url.to_string();
		// a git declaration displaces the other source kinds
		source.image = None;
		self.spec.image = None;
	}

	pub fn set_git_branch(&mut self, branch: &str) {
		self.with_git_ref(|git_ref| {
			git_ref.branch = non_empty(branch);
		});
	}

	pub fn set_git_tag(&mut self, tag: &str) {
		self.with_git_ref(|git_ref| {
			git_ref.tag = non_empty(tag);
		});
	}

	pub fn set_git_commit(&mut self, commit: &str) {
		self.with_git_ref(|git_ref| {
			git_ref.commit = non_empty(commit);
		});
	}

	fn with_git_ref(&mut self, f: impl FnOnce(&mut GitRef)) {
		let source = self.spec.source.get_or_insert_with(WorkloadSource::default);
		let git = source.git.get_or_insert_with(GitSource::default);
		f(&mut git.git_ref);
	}

	/// Set the pre-built application image. Clears any `spec.source`.
	pub fn set_image(&mut self, image: &str) {
		self.spec.image = non_empty(image);
		if self.spec.image.is_some() {
			self.spec.source = None;
		}
	}

	/// Set the source image (`spec.source.image`). Clears any git source.
	pub fn set_source_image(&mut self, image: &str) {
		if image.is_empty() {
			if let Some(source) = self.spec.source.as_mut() {
				source.image = None;
				if source.is_empty() {
					self.spec.source = None;
				}
			}
			return;
		}
		let source = self.spec.source.get_or_insert_with(WorkloadSource::default);
		source.image = Some(image.to_string());
		source.git = None;
		self.spec.image = None;
	}

	pub fn set_sub_path(&mut self, sub_path: &str) {
		if let Some(source) = self.spec.source.as_mut() {
			source.sub_path = non_empty(sub_path);
		} else if !sub_path.is_empty() {
			self.spec.source = Some(WorkloadSource {
				sub_path: Some(sub_path.to_string()),
				..WorkloadSource::default()
			});
		}
	}

	/// Set or delete (empty value) the service account name.
	pub fn set_service_account_name(&mut self, name: &str) {
		self.spec.service_account_name = non_empty(name);
	}

	/// Upsert an entry in `spec.env`, keyed by name.
	pub fn put_env(&mut self, name: &str, value: &str) {
		upsert_env(&mut self.spec.env, name, value);
	}

	pub fn delete_env(&mut self, name: &str) {
		self.spec.env.retain(|e| e.name != name);
	}

	/// Upsert an entry in `spec.build.env`, keyed by name.
	pub fn put_build_env(&mut self, name: &str, value: &str) {
		let build = self.spec.build.get_or_insert_with(WorkloadBuild::default);
		upsert_env(&mut build.env, name, value);
	}

	pub fn delete_build_env(&mut self, name: &str) {
		if let Some(build) = self.spec.build.as_mut() {
			build.env.retain(|e| e.name != name);
			if build.env.is_empty() {
				self.spec.build = None;
			}
		}
	}

	/// Upsert an entry in `spec.params`, keyed by name.
	pub fn put_param(&mut self, name: &str, value: serde_json::Value) {
		match self.spec.params.iter_mut().find(|p| p.name == name) {
			Some(param) => param.value = value,
			None => self.spec.params.push(Param {
				name: name.to_string(),
				value,
			}),
		}
	}

	pub fn delete_param(&mut self, name: &str) {
		self.spec.params.retain(|p| p.name != name);
	}

	pub fn maven_param(&self) -> Option<MavenSource> {
		self.spec
			.params
			.iter()
			.find(|p| p.name == MAVEN_PARAM_NAME)
			.and_then(|p| serde_json::from_value(p.value.clone()).ok())
	}

	pub fn set_maven_param(&mut self, maven: &MavenSource) {
		let value = serde_json::to_value(maven).unwrap_or(serde_json::Value::Null);
		self.put_param(MAVEN_PARAM_NAME, value);
	}

	/// Upsert an entry in `spec.serviceClaims`, keyed by name.
	pub fn put_service_claim(&mut self, name: &str, claim_ref: ServiceClaimRef) {
		match self.spec.service_claims.iter_mut().find(|c| c.name == name) {
			Some(claim) => claim.claim_ref = claim_ref,
			None => self.spec.service_claims.push(ServiceClaim {
				name: name.to_string(),
				claim_ref,
			}),
		}
	}

	pub fn set_resource_limit(&mut self, resource: &str, quantity: &str) {
		let resources = self.spec.resources.get_or_insert_with(ResourceSpec::default);
		if quantity.is_empty() {
			resources.limits.remove(resource);
		} else {
			resources
				.limits
				.insert(resource.to_string(), quantity.to_string());
		}
		if resources.is_empty() {
			self.spec.resources = None;
		}
	}

	pub fn set_resource_request(&mut self, resource: &str, quantity: &str) {
		let resources = self.spec.resources.get_or_insert_with(ResourceSpec::default);
		if quantity.is_empty() {
			resources.requests.remove(resource);
		} else {
			resources
				.requests
				.insert(resource.to_string(), quantity.to_string());
		}
		if resources.is_empty() {
			self.spec.resources = None;
		}
	}

	pub fn condition(&self, type_: &str) -> Option<&Condition> {
		self.status
			.as_ref()
			.and_then(|status| status.conditions.iter().find(|c| c.type_ == type_))
	}

	pub fn ready_condition(&self) -> Option<&Condition> {
		self.condition(READY_CONDITION)
	}

	/// JSON value with alphabetically ordered object keys. Keyed lists keep
	/// their insertion order.
	pub fn canonical_value(&self) -> serde_json::Value {
		serde_json::to_value(self).expect("workload serialization is infallible")
	}

	/// Canonical form used for diffing and change detection: the resource
	/// without `status` and `metadata.managedFields`.
	pub fn diffable_value(&self) -> serde_json::Value {
		let mut trimmed = self.clone();
		trimmed.status = None;
		trimmed.metadata.managed_fields = None;
		trimmed.canonical_value()
	}

	pub fn to_canonical_yaml(&self) -> String {
		serde_yaml::to_string(&self.canonical_value()).expect("yaml from json value")
	}

	pub fn to_canonical_json(&self) -> String {
		serde_json::to_string_pretty(&self.canonical_value()).expect("json from json value")
	}

	pub fn to_diffable_yaml(&self) -> String {
		serde_yaml::to_string(&self.diffable_value()).expect("yaml from json value")
	}

	/// True when both resources canonicalize to the same diffable form.
	pub fn same_as(&self, other: &Workload) -> bool {
		self.diffable_value() == other.diffable_value()
	}
}

fn non_empty(value: &str) -> Option<String> {
	if value.is_empty() {
		None
	} else {
		Some(value.to_string())
	}
}

fn upsert_env(envs: &mut Vec<EnvVar>, name: &str, value: &str) {
	match envs.iter_mut().find(|e| e.name == name) {
		Some(env) => env.value = value.to_string(),
		None => envs.push(EnvVar {
			name: name.to_string(),
			value: value.to_string(),
		}),
	}
}
