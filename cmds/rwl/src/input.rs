//! Input assembly for the apply flow.
//!
//! Composes the workload from, lowest precedence first: environment-variable
//! defaults, a file / stdin / URL document, and command-line flag values.

use std::{collections::BTreeMap, io::BufRead};

use thiserror::Error;
use tracing::debug;

use crate::workload::{
	validation::{FieldError, FieldErrors},
	ServiceClaimRef, Workload, MAVEN_PARAM_NAME, WORKLOAD_TYPE_LABEL,
};

/// Prefix of the environment variables supplying flag defaults.
pub const ENV_VAR_PREFIX: &str = "TANZU_APPS_";

/// The closed allow-list of recognized default variables (without prefix).
const ALLOWED_ENV_VARS: &[&str] = &[
	"TYPE",
	"LABEL",
	"ANNOTATION",
	"NAMESPACE",
	"SERVICE_ACCOUNT_NAME",
	"GIT_REPO",
	"GIT_BRANCH",
	"GIT_TAG",
	"GIT_COMMIT",
	"PARAMS_YAML",
];

#[derive(Debug, Error)]
pub enum InputError {
	#[error("unsupported scheme {scheme:?} in file path, only http and https URLs are accepted")]
	UnsupportedScheme { scheme: String },

	#[error("reading {path}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},

	#[error("fetching {url}")]
	Fetch {
		url: String,
		#[source]
		source: reqwest::Error,
	},

	#[error("parsing workload document")]
	Parse(#[source] serde_yaml::Error),

	#[error("expected exactly one workload document, got {count}")]
	MultipleDocuments { count: usize },

	#[error("empty workload document")]
	EmptyDocument,
}

/// Where a `--file` argument points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileInput {
	/// The literal `-`, reading from standard input.
	Stdin,
	Url(String),
	Path(String),
}

/// Classify a `--file` argument. URL schemes other than http/https are
/// rejected; anything without a scheme is a local path.
pub fn classify_file_arg(arg: &str) -> Result<FileInput, InputError> {
	if arg == "-" {
		return Ok(FileInput::Stdin);
	}
	if let Some((scheme, _)) = arg.split_once("://") {
		return match scheme {
			"http" | "https" => Ok(FileInput::Url(arg.to_string())),
			other => Err(InputError::UnsupportedScheme {
				scheme: other.to_string(),
			}),
		};
	}
	Ok(FileInput::Path(arg.to_string()))
}

/// Fetch the raw document bytes for a classified input.
pub async fn fetch_document(
	input: &FileInput,
	stdin: &mut (dyn BufRead + Send),
) -> Result<String, InputError> {
	match input {
		FileInput::Stdin => {
			let mut text = String::new();
			stdin
				.read_to_string(&mut text)
				.map_err(|source| InputError::Read {
					path: "-".to_string(),
					source,
				})?;
			Ok(text)
		}
		FileInput::Url(url) => {
			debug!(url = %url, "fetching workload document");
			let response = reqwest::get(url).await.map_err(|source| InputError::Fetch {
				url: url.clone(),
				source,
			})?;
			response
				.error_for_status()
				.map_err(|source| InputError::Fetch {
					url: url.clone(),
					source,
				})?
				.text()
				.await
				.map_err(|source| InputError::Fetch {
					url: url.clone(),
					source,
				})
		}
		FileInput::Path(path) => {
			std::fs::read_to_string(path).map_err(|source| InputError::Read {
				path: path.clone(),
				source,
			})
		}
	}
}

/// Parse exactly one workload out of a YAML (or JSON) document.
pub fn parse_workload_document(text: &str) -> Result<Workload, InputError> {
	let mut documents = Vec::new();
	for document in serde_yaml::Deserializer::from_str(text) {
		let value: serde_yaml::Value =
			serde::Deserialize::deserialize(document).map_err(InputError::Parse)?;
		if !value.is_null() {
			documents.push(value);
		}
	}
	match documents.len() {
		0 => Err(InputError::EmptyDocument),
		1 => serde_yaml::from_value(documents.remove(0)).map_err(InputError::Parse),
		count => Err(InputError::MultipleDocuments { count }),
	}
}

/// A parsed `NAME=VALUE` style assignment with a `NAME-` delete form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
	Set(String, String),
	Delete(String),
}

/// Parse one repeatable key/value flag occurrence.
pub fn parse_assignment(field: &str, raw: &str) -> Result<Assignment, FieldError> {
	if let Some((name, value)) = raw.split_once('=') {
		if name.is_empty() {
			return Err(FieldError::invalid_array_value(
				field,
				raw,
				"name must not be empty",
			));
		}
		return Ok(Assignment::Set(name.to_string(), value.to_string()));
	}
	if let Some(name) = raw.strip_suffix('-') {
		if name.is_empty() {
			return Err(FieldError::invalid_array_value(
				field,
				raw,
				"name must not be empty",
			));
		}
		return Ok(Assignment::Delete(name.to_string()));
	}
	Err(FieldError::invalid_array_value(
		field,
		raw,
		"expected NAME=VALUE or NAME- to delete",
	))
}

/// A parsed `--service-ref` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRefArg {
	pub name: String,
	pub claim_ref: ServiceClaimRef,
	/// True for the four-segment cross-namespace form.
	pub cross_namespace: bool,
}

/// Parse `name=apiVersion:Kind:name`, accepting the deprecated
/// `name=apiVersion:Kind:namespace:name` form.
pub fn parse_service_ref(raw: &str) -> Result<ServiceRefArg, FieldError> {
	let field = "--service-ref";
	let Some((name, reference)) = raw.split_once('=') else {
		return Err(FieldError::invalid_array_value(
			field,
			raw,
			"expected NAME=apiVersion:Kind:name",
		));
	};
	let segments: Vec<&str> = reference.split(':').collect();
	let (claim_ref, cross_namespace) = match segments.as_slice() {
		[api_version, kind, object] => (
			ServiceClaimRef {
				api_version: api_version.to_string(),
				kind: kind.to_string(),
				name: object.to_string(),
				namespace: None,
			},
			false,
		),
		[api_version, kind, namespace, object] => (
			ServiceClaimRef {
				api_version: api_version.to_string(),
				kind: kind.to_string(),
				name: object.to_string(),
				namespace: Some(namespace.to_string()),
			},
			true,
		),
		_ => {
			return Err(FieldError::invalid_array_value(
				field,
				raw,
				"expected apiVersion:Kind:name",
			))
		}
	};
	if name.is_empty() || claim_ref.api_version.is_empty() || claim_ref.kind.is_empty() {
		return Err(FieldError::invalid_array_value(
			field,
			raw,
			"name, apiVersion and Kind must not be empty",
		));
	}
	Ok(ServiceRefArg {
		name: name.to_string(),
		claim_ref,
		cross_namespace,
	})
}

/// Parse one `--params-yaml name=<yaml-or-json>` occurrence.
pub fn parse_param_yaml(raw: &str) -> Result<(String, serde_json::Value), FieldError> {
	let field = "--params-yaml";
	let Some((name, value)) = raw.split_once('=') else {
		return Err(FieldError::invalid_array_value(
			field,
			raw,
			"expected NAME=<yaml or json value>",
		));
	};
	if name.is_empty() {
		return Err(FieldError::invalid_array_value(
			field,
			raw,
			"name must not be empty",
		));
	}
	let value: serde_json::Value = serde_yaml::from_str(value).map_err(|err| {
		FieldError::invalid_array_value(field, raw, format!("malformed value: {err}"))
	})?;
	Ok((name.to_string(), value))
}

/// Flag-level overrides layered over the file document.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub workload_type: Option<String>,
	pub labels: Vec<String>,
	pub annotations: Vec<String>,
	pub service_account_name: Option<String>,
	pub params_yaml: Vec<String>,
	pub service_refs: Vec<String>,
	pub envs: Vec<String>,
	pub build_envs: Vec<String>,
	pub limit_cpu: Option<String>,
	pub limit_memory: Option<String>,
	pub request_cpu: Option<String>,
	pub request_memory: Option<String>,
	pub git_repo: Option<String>,
	pub git_branch: Option<String>,
	pub git_tag: Option<String>,
	pub git_commit: Option<String>,
	pub image: Option<String>,
	pub source_image: Option<String>,
	pub sub_path: Option<String>,
	pub maven_artifact: Option<String>,
	pub maven_version: Option<String>,
	pub maven_group: Option<String>,
	pub maven_type: Option<String>,
}

impl Overrides {
	/// Apply flag mutations to the workload in the documented order: labels,
	/// annotations, type, service account, params, service claims, env,
	/// build env, resources, source fields, subpath.
	///
	/// Returns the user-facing notices that the mutations produced.
	pub fn apply_to(&self, workload: &mut Workload) -> Result<Vec<String>, FieldErrors> {
		let mut errs = FieldErrors::new();
		let mut notices = Vec::new();

		for raw in &self.labels {
			match parse_assignment("--label", raw) {
				Ok(Assignment::Set(name, value)) => workload.set_label(&name, Some(&value)),
				Ok(Assignment::Delete(name)) => workload.set_label(&name, None),
				Err(err) => errs.push(err),
			}
		}
		for raw in &self.annotations {
			match parse_assignment("--annotation", raw) {
				Ok(Assignment::Set(name, value)) => workload.set_annotation(&name, Some(&value)),
				Ok(Assignment::Delete(name)) => workload.set_annotation(&name, None),
				Err(err) => errs.push(err),
			}
		}

		if let Some(workload_type) = &self.workload_type {
			if workload_type.is_empty() {
				workload.set_label(WORKLOAD_TYPE_LABEL, None);
			} else {
				workload.set_label(WORKLOAD_TYPE_LABEL, Some(workload_type));
			}
		}

		if let Some(service_account_name) = &self.service_account_name {
			workload.set_service_account_name(service_account_name);
		}

		let mut maven_from_params = false;
		for raw in &self.params_yaml {
			match parse_param_yaml(raw) {
				Ok((name, value)) => {
					if name == MAVEN_PARAM_NAME {
						maven_from_params = true;
						// a maven declaration displaces the other source kinds
						workload.spec.source = None;
						workload.spec.image = None;
					}
					workload.put_param(&name, value);
				}
				Err(err) => errs.push(err),
			}
		}

		for raw in &self.service_refs {
			match parse_service_ref(raw) {
				Ok(service_ref) => {
					if service_ref.cross_namespace {
						notices.push(
							"NOTICE: the \"apiVersion:Kind:namespace:name\" form of --service-ref \
							 is deprecated, cross-namespace references move to annotations"
								.to_string(),
						);
					}
					workload.put_service_claim(&service_ref.name, service_ref.claim_ref);
				}
				Err(err) => errs.push(err),
			}
		}

		for raw in &self.envs {
			match parse_assignment("--env", raw) {
				Ok(Assignment::Set(name, value)) => workload.put_env(&name, &value),
				Ok(Assignment::Delete(name)) => workload.delete_env(&name),
				Err(err) => errs.push(err),
			}
		}
		for raw in &self.build_envs {
			match parse_assignment("--build-env", raw) {
				Ok(Assignment::Set(name, value)) => workload.put_build_env(&name, &value),
				Ok(Assignment::Delete(name)) => workload.delete_build_env(&name),
				Err(err) => errs.push(err),
			}
		}

		if let Some(quantity) = &self.limit_cpu {
			workload.set_resource_limit("cpu", quantity);
		}
		if let Some(quantity) = &self.limit_memory {
			workload.set_resource_limit("memory", quantity);
		}
		if let Some(quantity) = &self.request_cpu {
			workload.set_resource_request("cpu", quantity);
		}
		if let Some(quantity) = &self.request_memory {
			workload.set_resource_request("memory", quantity);
		}

		if let Some(url) = &self.git_repo {
			workload.set_git_url(url);
			if url.is_empty() && workload.spec.source.is_none() && workload.spec.image.is_none() {
				notices.push(
					"NOTICE: no source code or image has been specified for this workload"
						.to_string(),
				);
			}
		}
		if let Some(branch) = &self.git_branch {
			workload.set_git_branch(branch);
		}
		if let Some(tag) = &self.git_tag {
			workload.set_git_tag(tag);
		}
		if let Some(commit) = &self.git_commit {
			workload.set_git_commit(commit);
		}
		if let Some(image) = &self.image {
			workload.set_image(image);
		}
		if let Some(source_image) = &self.source_image {
			workload.set_source_image(source_image);
		}

		let has_maven_flag = self.maven_artifact.is_some()
			|| self.maven_version.is_some()
			|| self.maven_group.is_some()
			|| self.maven_type.is_some();
		if has_maven_flag {
			if maven_from_params {
				notices.push(
					"NOTICE: the maven param set via --params-yaml was overwritten by the \
					 dedicated maven flags"
						.to_string(),
				);
			}
			workload.spec.source = None;
			workload.spec.image = None;
			let mut maven = workload.maven_param().unwrap_or_default();
			if let Some(artifact_id) = &self.maven_artifact {
				maven.artifact_id = artifact_id.clone();
			}
			if let Some(version) = &self.maven_version {
				maven.version = version.clone();
			}
			if let Some(group_id) = &self.maven_group {
				maven.group_id = group_id.clone();
			}
			if let Some(artifact_type) = &self.maven_type {
				maven.artifact_type = if artifact_type.is_empty() {
					None
				} else {
					Some(artifact_type.clone())
				};
			}
			workload.set_maven_param(&maven);
		}

		if let Some(sub_path) = &self.sub_path {
			workload.set_sub_path(sub_path);
		}

		errs.into_result()?;
		Ok(notices)
	}
}

/// Defaults read from `TANZU_APPS_*` environment variables.
///
/// Only the closed allow-list is honored, everything else under the prefix is
/// silently ignored. Defaults are applied last and only to fields that file
/// and flags left unset.
#[derive(Debug, Clone, Default)]
pub struct EnvDefaults {
	values: BTreeMap<String, String>,
}

impl EnvDefaults {
	pub fn from_env() -> Self {
		Self::from_pairs(std::env::vars())
	}

	pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
		let values = pairs
			.into_iter()
			.filter_map(|(key, value)| {
				let suffix = key.strip_prefix(ENV_VAR_PREFIX)?;
				ALLOWED_ENV_VARS
					.contains(&suffix)
					.then(|| (suffix.to_string(), value))
			})
			.collect();
		Self { values }
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.values.get(name).map(String::as_str)
	}

	/// Fill workload fields that are still unset after file and flags.
	pub fn apply_to(&self, workload: &mut Workload) {
		if let Some(workload_type) = self.get("TYPE") {
			if workload.label(WORKLOAD_TYPE_LABEL).is_none() {
				workload.set_label(WORKLOAD_TYPE_LABEL, Some(workload_type));
			}
		}
		for (variable, is_label) in [("LABEL", true), ("ANNOTATION", false)] {
			let Some(raw) = self.get(variable) else {
				continue;
			};
			for assignment in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
				let Ok(Assignment::Set(name, value)) = parse_assignment(variable, assignment)
				else {
					continue;
				};
				if is_label {
					if workload.label(&name).is_none() {
						workload.set_label(&name, Some(&value));
					}
				} else if workload.annotation(&name).is_none() {
					workload.set_annotation(&name, Some(&value));
				}
			}
		}
		if let Some(service_account_name) = self.get("SERVICE_ACCOUNT_NAME") {
			if workload.spec.service_account_name.is_none() {
				workload.set_service_account_name(service_account_name);
			}
		}
		if let Some(url) = self.get("GIT_REPO") {
			if workload.source_kind() == crate::workload::SourceKind::None {
				workload.set_git_url(url);
			}
		}
		let git_ref = workload
			.spec
			.source
			.as_ref()
			.and_then(|source| source.git.as_ref())
			.map(|git| git.git_ref.clone());
		if let Some(git_ref) = git_ref {
			if git_ref.branch.is_none() {
				if let Some(branch) = self.get("GIT_BRANCH") {
					workload.set_git_branch(branch);
				}
			}
			if git_ref.tag.is_none() {
				if let Some(tag) = self.get("GIT_TAG") {
					workload.set_git_tag(tag);
				}
			}
			if git_ref.commit.is_none() {
				if let Some(commit) = self.get("GIT_COMMIT") {
					workload.set_git_commit(commit);
				}
			}
		}
		if let Some(raw) = self.get("PARAMS_YAML") {
			for assignment in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
				let Ok((name, value)) = parse_param_yaml(assignment) else {
					continue;
				};
				if !workload.spec.params.iter().any(|p| p.name == name) {
					workload.put_param(&name, value);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use indoc::indoc;

	use super::*;
	use crate::workload::SourceKind;

	#[test]
	fn classify_rejects_unknown_scheme() {
		assert_matches!(
			classify_file_arg("ftp://example.com/workload.yaml"),
			Err(InputError::UnsupportedScheme { scheme }) if scheme == "ftp"
		);
	}

	#[test]
	fn classify_accepts_http_and_paths() {
		assert_eq!(
			classify_file_arg("https://example.com/w.yaml").unwrap(),
			FileInput::Url("https://example.com/w.yaml".to_string())
		);
		assert_eq!(classify_file_arg("-").unwrap(), FileInput::Stdin);
		assert_eq!(
			classify_file_arg("workload.yaml").unwrap(),
			FileInput::Path("workload.yaml".to_string())
		);
	}

	#[test]
	fn parse_assignment_forms() {
		assert_eq!(
			parse_assignment("--env", "FOO=bar").unwrap(),
			Assignment::Set("FOO".to_string(), "bar".to_string())
		);
		assert_eq!(
			parse_assignment("--env", "FOO-").unwrap(),
			Assignment::Delete("FOO".to_string())
		);
		assert_eq!(
			parse_assignment("--env", "FOO=").unwrap(),
			Assignment::Set("FOO".to_string(), String::new())
		);
		assert_matches!(
			parse_assignment("--env", "FOO"),
			Err(FieldError::InvalidArrayValue { field, .. }) if field == "--env"
		);
	}

	#[test]
	fn parse_service_ref_three_segments() {
		let parsed = parse_service_ref("database=services.example.com/v1alpha1:MySQL:prod-db").unwrap();
		assert_eq!(parsed.name, "database");
		assert_eq!(parsed.claim_ref.kind, "MySQL");
		assert_eq!(parsed.claim_ref.name, "prod-db");
		assert!(!parsed.cross_namespace);
	}

	#[test]
	fn parse_service_ref_four_segments_is_cross_namespace() {
		let parsed =
			parse_service_ref("database=services.example.com/v1alpha1:MySQL:shared:prod-db")
				.unwrap();
		assert_eq!(parsed.claim_ref.namespace.as_deref(), Some("shared"));
		assert!(parsed.cross_namespace);
	}

	#[test]
	fn parse_param_yaml_structured_value() {
		let (name, value) = parse_param_yaml("ports={\"http\": 8080}").unwrap();
		assert_eq!(name, "ports");
		assert_eq!(value["http"], 8080);
	}

	#[test]
	fn document_must_be_single() {
		let text = indoc! {"
			---
			apiVersion: carto.run/v1alpha1
			kind: Workload
			metadata:
			  name: one
			---
			apiVersion: carto.run/v1alpha1
			kind: Workload
			metadata:
			  name: two
		"};
		assert_matches!(
			parse_workload_document(text),
			Err(InputError::MultipleDocuments { count: 2 })
		);
	}

	#[test]
	fn document_parses_workload() {
		let text = indoc! {"
			apiVersion: carto.run/v1alpha1
			kind: Workload
			metadata:
			  name: spring-petclinic
			  namespace: default
			spec:
			  source:
			    git:
			      url: https://example.com/repo.git
			      ref:
			        branch: main
		"};
		let workload = parse_workload_document(text).unwrap();
		assert_eq!(workload.name(), "spring-petclinic");
		assert_eq!(workload.source_kind(), SourceKind::Git);
	}

	#[test]
	fn overrides_flags_win_over_file_values() {
		let mut workload = parse_workload_document(indoc! {"
			apiVersion: carto.run/v1alpha1
			kind: Workload
			metadata:
			  name: spring-petclinic
			spec:
			  source:
			    git:
			      url: https://example.com/file.git
			      ref:
			        branch: file-branch
		"})
		.unwrap();

		let overrides = Overrides {
			git_branch: Some("flag-branch".to_string()),
			..Overrides::default()
		};
		overrides.apply_to(&mut workload).unwrap();

		let git = workload.spec.source.as_ref().unwrap().git.as_ref().unwrap();
		assert_eq!(git.url, "https://example.com/file.git");
		assert_eq!(git.git_ref.branch.as_deref(), Some("flag-branch"));
	}

	#[test]
	fn overrides_maven_flags_beat_params_yaml() {
		let mut workload = Workload::default();
		let overrides = Overrides {
			params_yaml: vec![
				"maven={\"artifactId\": \"from-params\", \"groupId\": \"org.example\", \"version\": \"1.0\"}"
					.to_string(),
			],
			maven_artifact: Some("from-flags".to_string()),
			..Overrides::default()
		};
		let notices = overrides.apply_to(&mut workload).unwrap();

		let maven = workload.maven_param().unwrap();
		assert_eq!(maven.artifact_id, "from-flags");
		// untouched coordinates survive from the params-yaml value
		assert_eq!(maven.group_id, "org.example");
		assert!(notices.iter().any(|n| n.contains("maven")));
	}

	#[test]
	fn overrides_unsetting_git_repo_emits_notice() {
		let mut workload = Workload::default();
		workload.set_git_url("https://example.com/repo.git");
		workload.set_git_branch("main");

		let overrides = Overrides {
			git_repo: Some(String::new()),
			..Overrides::default()
		};
		let notices = overrides.apply_to(&mut workload).unwrap();

		assert!(workload.spec.source.is_none());
		assert!(notices.iter().any(|n| n.contains("no source code")));
	}

	#[test]
	fn env_defaults_fill_only_unset_fields() {
		let defaults = EnvDefaults::from_pairs([
			("TANZU_APPS_TYPE".to_string(), "web".to_string()),
			("TANZU_APPS_GIT_BRANCH".to_string(), "env-branch".to_string()),
			("TANZU_APPS_IGNORED_KEY".to_string(), "x".to_string()),
		]);

		let mut workload = Workload::default();
		workload.set_git_url("https://example.com/repo.git");
		workload.set_git_branch("flag-branch");
		defaults.apply_to(&mut workload);

		assert_eq!(workload.label(WORKLOAD_TYPE_LABEL), Some("web"));
		let git = workload.spec.source.as_ref().unwrap().git.as_ref().unwrap();
		assert_eq!(git.git_ref.branch.as_deref(), Some("flag-branch"));
	}

	#[test]
	fn env_defaults_ignore_unknown_variables() {
		let defaults =
			EnvDefaults::from_pairs([("TANZU_APPS_NOT_A_FLAG".to_string(), "x".to_string())]);
		assert!(defaults.get("NOT_A_FLAG").is_none());
	}
}
