//! Structural validation of workloads and flag input.

use std::fmt;

use thiserror::Error;

use super::Workload;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
	#[error("missing required field {field}")]
	Missing { field: String },

	#[error("invalid value {value:?} for field {field}: {detail}")]
	Invalid {
		field: String,
		value: String,
		detail: String,
	},

	#[error("invalid value {value:?} for field {field}: must be one of [{}]", .allowed.join(", "))]
	EnumInvalid {
		field: String,
		value: String,
		allowed: Vec<String>,
	},

	#[error("invalid array value {value:?} for field {field}: {detail}")]
	InvalidArrayValue {
		field: String,
		value: String,
		detail: String,
	},

	#[error("expected exactly one source, got multiple: [{}]", .fields.join(", "))]
	MultipleSources { fields: Vec<String> },

	#[error("{flag} requires {requires}")]
	ConflictingFlags { flag: String, requires: String },

	#[error("namespace {namespace:?} not found on the cluster")]
	NamespaceNotFound { namespace: String },
}

impl FieldError {
	pub fn missing(field: impl Into<String>) -> Self {
		Self::Missing {
			field: field.into(),
		}
	}

	pub fn invalid(
		field: impl Into<String>,
		value: impl Into<String>,
		detail: impl Into<String>,
	) -> Self {
		Self::Invalid {
			field: field.into(),
			value: value.into(),
			detail: detail.into(),
		}
	}

	pub fn invalid_array_value(
		field: impl Into<String>,
		value: impl Into<String>,
		detail: impl Into<String>,
	) -> Self {
		Self::InvalidArrayValue {
			field: field.into(),
			value: value.into(),
			detail: detail.into(),
		}
	}
}

/// An aggregate of field errors, empty meaning valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, error: FieldError) {
		self.0.push(error);
	}

	/// Fold another aggregate into this one.
	pub fn also(&mut self, other: FieldErrors) {
		self.0.extend(other.0);
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn into_result(self) -> Result<(), FieldErrors> {
		if self.is_empty() {
			Ok(())
		} else {
			Err(self)
		}
	}
}

impl fmt::Display for FieldErrors {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for error in &self.0 {
			if !first {
				write!(f, "; ")?;
			}
			write!(f, "{}", error)?;
			first = false;
		}
		Ok(())
	}
}

impl std::error::Error for FieldErrors {}

impl Workload {
	/// Structural validation: source exclusivity, git ref presence, subpath
	/// placement and keyed-list uniqueness.
	pub fn validate(&self) -> FieldErrors {
		let mut errs = FieldErrors::new();

		let mut sources = Vec::new();
		if let Some(source) = &self.spec.source {
			if source.git.is_some() {
				sources.push("spec.source.git".to_string());
			}
			if source.image.is_some() {
				sources.push("spec.source.image".to_string());
			}
		}
		if self.spec.image.is_some() {
			sources.push("spec.image".to_string());
		}
		if self.maven_param().is_some() {
			sources.push("spec.params[maven]".to_string());
		}
		if sources.len() > 1 {
			errs.push(FieldError::MultipleSources { fields: sources });
		}

		if let Some(git) = self.spec.source.as_ref().and_then(|s| s.git.as_ref()) {
			if git.url.is_empty() {
				errs.push(FieldError::missing("spec.source.git.url"));
			}
			if git.git_ref.is_empty() {
				errs.push(FieldError::invalid(
					"spec.source.git.ref",
					"",
					"at least one of branch, tag or commit must be set",
				));
			}
		}

		if let Some(source) = &self.spec.source {
			if source.sub_path.is_some() && source.git.is_none() && source.image.is_none() {
				errs.push(FieldError::ConflictingFlags {
					flag: "--sub-path".to_string(),
					requires: "a source (--git-repo, --source-image or --local-path)".to_string(),
				});
			}
		}

		check_unique_names(
			&mut errs,
			"spec.env",
			self.spec.env.iter().map(|e| e.name.as_str()),
		);
		if let Some(build) = &self.spec.build {
			check_unique_names(
				&mut errs,
				"spec.build.env",
				build.env.iter().map(|e| e.name.as_str()),
			);
		}
		check_unique_names(
			&mut errs,
			"spec.params",
			self.spec.params.iter().map(|p| p.name.as_str()),
		);
		check_unique_names(
			&mut errs,
			"spec.serviceClaims",
			self.spec.service_claims.iter().map(|c| c.name.as_str()),
		);

		errs
	}
}

fn check_unique_names<'a>(
	errs: &mut FieldErrors,
	field: &str,
	names: impl Iterator<Item = &'a str>,
) {
	let mut seen = std::collections::BTreeSet::new();
	for name in names {
		if name.is_empty() {
			errs.push(FieldError::invalid_array_value(
				field,
				name,
				"name must not be empty",
			));
			continue;
		}
		if !seen.insert(name) {
			errs.push(FieldError::invalid_array_value(
				field,
				name,
				"name must be unique",
			));
		}
	}
}
