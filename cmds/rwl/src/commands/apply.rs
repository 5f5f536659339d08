//! Apply command handler.
//!
//! Composes the workload from environment defaults, an optional document and
//! flags, reconciles it against the cluster state, shows a diff, asks for
//! consent and submits the change, then optionally waits for readiness.

use std::{
	io::{BufRead, Write},
	path::Path,
	process::ExitCode,
	time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
	diff::{self, ColorMode, DiffOutput, ProposedAction},
	input::{
		classify_file_arg, fetch_document, parse_workload_document, EnvDefaults, Overrides,
	},
	k8s::{
		apply::{create_workload, update_workload},
		client::ClusterConnection,
		logs,
		wait::{self, WaitFailure, WaitOutcome, WaitPhase},
	},
	lsp, source,
	workload::{
		validation::{FieldError, FieldErrors},
		Workload, WORKLOAD_TYPE_LABEL,
	},
};

/// Workload type applied when nothing supplies one on create.
const DEFAULT_WORKLOAD_TYPE: &str = "web";

/// Strategy for folding a configuration file into existing cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpdateStrategy {
	/// Additive: keep existing configuration that the file does not mention.
	Merge,
	/// Authoritative: the file wholly replaces the existing configuration.
	Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	Yaml,
	Json,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
	/// Name of the workload
	pub name: Option<String>,

	/// Kubernetes namespace of the workload
	#[arg(long, short = 'n')]
	pub namespace: Option<String>,

	/// Workload definition file, an http(s) URL, or "-" for stdin
	#[arg(long, short = 'f')]
	pub file: Option<String>,

	/// Accept all prompts
	#[arg(long, short = 'y')]
	pub yes: bool,

	/// Print the resource that would be applied without contacting the cluster controller
	#[arg(long)]
	pub dry_run: bool,

	/// Print the applied resource
	#[arg(long, short = 'o', value_enum)]
	pub output: Option<OutputFormat>,

	/// Control whether the configuration file merges into or replaces the existing workload
	#[arg(long, value_enum)]
	pub update_strategy: Option<UpdateStrategy>,

	/// Git repository URL (empty value removes the source)
	#[arg(long)]
	pub git_repo: Option<String>,

	/// Git branch to build from
	#[arg(long)]
	pub git_branch: Option<String>,

	/// Git tag to build from
	#[arg(long)]
	pub git_tag: Option<String>,

	/// Git commit to build from
	#[arg(long)]
	pub git_commit: Option<String>,

	/// Pre-built application image
	#[arg(long, short = 'i')]
	pub image: Option<String>,

	/// Maven artifact id
	#[arg(long)]
	pub maven_artifact: Option<String>,

	/// Maven artifact version
	#[arg(long)]
	pub maven_version: Option<String>,

	/// Maven artifact group
	#[arg(long)]
	pub maven_group: Option<String>,

	/// Maven packaging type
	#[arg(long)]
	pub maven_type: Option<String>,

	/// Source image reference
	#[arg(long, short = 's')]
	pub source_image: Option<String>,

	/// Publish a local directory as the workload source
	#[arg(long)]
	pub local_path: Option<String>,

	/// Path inside the source to build from
	#[arg(long)]
	pub sub_path: Option<String>,

	/// Environment variable as NAME=VALUE, NAME- to delete (repeatable)
	#[arg(long, short = 'e')]
	pub env: Vec<String>,

	/// Build environment variable as NAME=VALUE, NAME- to delete (repeatable)
	#[arg(long)]
	pub build_env: Vec<String>,

	/// Label as NAME=VALUE, NAME- to delete (repeatable)
	#[arg(long, short = 'l')]
	pub label: Vec<String>,

	/// Annotation as NAME=VALUE, NAME- to delete (repeatable)
	#[arg(long)]
	pub annotation: Vec<String>,

	/// Workload type
	#[arg(long = "type", short = 't')]
	pub workload_type: Option<String>,

	/// Service account the workload runs as (empty value removes it)
	#[arg(long)]
	pub service_account: Option<String>,

	/// Service claim as name=apiVersion:Kind:name (repeatable)
	#[arg(long)]
	pub service_ref: Vec<String>,

	/// Supply-chain param as name=<yaml or json value> (repeatable)
	#[arg(long)]
	pub params_yaml: Vec<String>,

	/// CPU resource limit
	#[arg(long)]
	pub limit_cpu: Option<String>,

	/// Memory resource limit
	#[arg(long)]
	pub limit_memory: Option<String>,

	/// CPU resource request
	#[arg(long)]
	pub request_cpu: Option<String>,

	/// Memory resource request
	#[arg(long)]
	pub request_memory: Option<String>,

	/// Enable debug logging
	#[arg(long)]
	pub debug: bool,

	/// Controls color in diff output
	#[arg(long, default_value = "auto", value_enum)]
	pub color: ColorMode,

	/// Wait for the workload to become ready
	#[arg(long, short = 'w')]
	pub wait: bool,

	/// How long to wait for the workload to become ready
	#[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
	pub wait_timeout: Duration,

	/// Stream pod logs while waiting
	#[arg(long)]
	pub tail: bool,

	/// Stream pod logs with timestamps while waiting
	#[arg(long)]
	pub tail_timestamp: bool,
}

/// Run the apply command against the active kubeconfig context.
pub fn run<W: Write + Send>(args: ApplyArgs, writer: W) -> Result<ExitCode> {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")?;

	runtime.block_on(async move {
		let mut stdin = std::io::BufReader::new(std::io::stdin());
		let code = apply_workload(
			args,
			None,
			EnvDefaults::from_env(),
			&mut stdin,
			writer,
			std::io::stderr(),
		)
		.await?;
		Ok(ExitCode::from(code))
	})
}

/// The apply flow, with the cluster connection, defaults, input and outputs
/// injectable. Returns the process exit code.
#[instrument(skip_all, fields(name = ?args.name))]
pub async fn apply_workload<R, O, E>(
	args: ApplyArgs,
	connection: Option<ClusterConnection>,
	env_defaults: EnvDefaults,
	input: &mut R,
	mut writer: O,
	mut err_writer: E,
) -> Result<u8>
where
	R: BufRead + Send,
	O: Write,
	E: Write,
{
	let mut errs = FieldErrors::new();

	if args.update_strategy.is_some() && args.file.is_none() {
		errs.push(FieldError::missing("--file"));
	}
	if args.file.as_deref() == Some("-") && !args.yes {
		bail!("reading the workload from stdin requires the --yes flag");
	}

	// one workload document, highest-precedence layer below the flags
	let mut file_workload = None;
	if let Some(file_arg) = &args.file {
		writeln!(
			writer,
			"WARNING: the default strategy for configuration files will change from \
			 \"merge\" to \"replace\", use --update-strategy to control it explicitly\n"
		)?;
		let file_input = classify_file_arg(file_arg)?;
		let text = fetch_document(&file_input, input).await?;
		file_workload = Some(parse_workload_document(&text)?);
	}

	let sources = declared_sources(&args, file_workload.as_ref());
	if sources.len() > 1 {
		errs.push(FieldError::MultipleSources { fields: sources });
	}

	let name = args.name.clone().or_else(|| {
		file_workload
			.as_ref()
			.map(|w| w.name().to_string())
			.filter(|n| !n.is_empty())
	});
	let Some(name) = name else {
		errs.push(FieldError::missing("name"));
		return Err(errs.into());
	};
	errs.clone().into_result()?;

	let connection = match connection {
		Some(connection) => connection,
		None => ClusterConnection::connect()
			.await
			.context("connecting to the cluster")?,
	};

	let namespace = args
		.namespace
		.clone()
		.or_else(|| {
			file_workload
				.as_ref()
				.map(|w| w.namespace().to_string())
				.filter(|ns| !ns.is_empty())
		})
		.or_else(|| env_defaults.get("NAMESPACE").map(str::to_string))
		.unwrap_or_else(|| connection.default_namespace().to_string());
	if namespace.is_empty() {
		errs.push(FieldError::missing("--namespace"));
	}
	errs.into_result()?;

	let current = connection.get_workload(&namespace, &name).await?;
	if current.is_none() && !connection.namespace_exists(&namespace).await? {
		return Err(FieldError::NamespaceNotFound { namespace }.into());
	}
	debug!(exists = current.is_some(), "fetched cluster state");

	// reconcile: base from current/file per strategy, then flags, then
	// environment defaults for whatever is still unset
	let strategy = args.update_strategy.unwrap_or(UpdateStrategy::Merge);
	let mut workload = match (strategy, &current) {
		(UpdateStrategy::Replace, _) => {
			let mut base = file_workload.clone().unwrap_or_default();
			base.replace_metadata(current.as_ref());
			base
		}
		(UpdateStrategy::Merge, existing) => {
			let mut base = existing.clone().unwrap_or_default();
			if let Some(file) = &file_workload {
				base.merge(file);
			}
			base
		}
	};
	workload.metadata.name = Some(name.clone());
	workload.metadata.namespace = Some(namespace.clone());

	let overrides = overrides_from(&args);
	let notices = overrides.apply_to(&mut workload)?;
	for notice in &notices {
		writeln!(writer, "{notice}")?;
	}
	env_defaults.apply_to(&mut workload);

	if current.is_none() && workload.label(WORKLOAD_TYPE_LABEL).is_none() {
		workload.set_label(WORKLOAD_TYPE_LABEL, Some(DEFAULT_WORKLOAD_TYPE));
	}

	workload.validate().into_result()?;

	if args.dry_run {
		match args.output {
			Some(OutputFormat::Json) => writeln!(writer, "{}", workload.to_canonical_json())?,
			_ => write!(writer, "---\n{}", workload.to_canonical_yaml())?,
		}
		return Ok(0);
	}

	if let Some(local_path) = &args.local_path {
		lsp::check_health(Some(connection.client())).await?;
		let report = source::publish_local_source(
			Some(connection.client()),
			&mut workload,
			Path::new(local_path),
		)
		.await?;
		if report.unchanged {
			writeln!(
				writer,
				"No source code changes detected, reusing {}",
				report.reference
			)?;
		} else {
			writeln!(writer, "Published local source to {}", report.reference)?;
		}
		if let Some(sub_path) = &args.sub_path {
			workload.set_sub_path(sub_path);
		}
	}
	source::reconcile_local_source_annotation(&mut workload);

	if let Some(current) = &current {
		if workload.same_as(current) {
			writeln!(writer, "Workload is unchanged, skipping update")?;
			return Ok(0);
		}
	}

	let workload_exists = current.is_some();
	let action = if workload_exists {
		ProposedAction::Update
	} else {
		ProposedAction::Create
	};
	let should_print = args.output.is_none() || !args.yes;

	if should_print {
		let current_yaml = current
			.as_ref()
			.map(Workload::to_diffable_yaml)
			.unwrap_or_default();
		DiffOutput::new(&mut writer, args.color.should_colorize())
			.write_diff(&current_yaml, &workload.to_diffable_yaml())?;
		writeln!(writer)?;

		if !args.yes {
			let approved = diff::confirm(input, &mut writer, action, &name)?;
			if !approved {
				writeln!(writer, "Skipping workload {name:?}")?;
				return Ok(0);
			}
		}
	}

	let api = connection.workloads(&namespace);
	match action {
		ProposedAction::Create => {
			create_workload(&api, &workload).await?;
			if should_print {
				writeln!(writer, "Created workload {name:?}")?;
			}
		}
		ProposedAction::Update => {
			update_workload(&api, &workload).await?;
			if should_print {
				writeln!(writer, "Updated workload {name:?}")?;
			}
		}
	}

	let any_tail = args.tail || args.tail_timestamp;
	if args.wait || any_tail {
		if should_print {
			writeln!(writer, "Waiting for workload {name:?} to become ready...")?;
		}

		let token = CancellationToken::new();
		{
			let token = token.clone();
			tokio::spawn(async move {
				if tokio::signal::ctrl_c().await.is_ok() {
					token.cancel();
				}
			});
		}

		let mut interrupted = false;

		// the readiness verdict only counts once the controller has seen the
		// update; a stale pre-apply Ready condition must not satisfy the wait
		if workload_exists {
			let since = current
				.as_ref()
				.and_then(|c| c.ready_condition())
				.and_then(|c| c.last_transition_time.clone());
			let status_change = wait::wait_for_status_change(&api, &name, since.as_ref(), &token);
			match wait::race_with_timeout(&name, args.wait_timeout, &token, status_change).await {
				Ok(WaitOutcome::Ready) => {}
				Ok(WaitOutcome::Interrupted) => interrupted = true,
				Err(error) => {
					let failure = WaitFailure {
						phase: WaitPhase::StatusChange,
						error,
					};
					writeln!(err_writer, "{failure}")?;
					if args.output.is_none() {
						return Ok(1);
					}
				}
			}
		}

		if !interrupted {
			// tailed log lines reach the terminal through the one shared
			// writer, so they interleave with other output at line boundaries
			let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
			let tail_handle = if any_tail {
				let client = connection.client().clone();
				let tail_token = token.clone();
				let tail_namespace = namespace.clone();
				let tail_name = name.clone();
				let timestamps = args.tail_timestamp;
				let tail_lines = line_tx.clone();
				Some(tokio::spawn(async move {
					if let Err(err) = logs::tail_logs(
						client,
						tail_namespace,
						tail_name,
						timestamps,
						tail_token.clone(),
						tail_lines,
					)
					.await
					{
						tracing::warn!(error = %err, "log tail failed");
						// a failing peer cancels every other worker
						tail_token.cancel();
					}
				}))
			} else {
				None
			};
			drop(line_tx);

			let ready = wait::wait_for_ready(&api, &name, &token);
			let race = wait::race_with_timeout(&name, args.wait_timeout, &token, ready);
			tokio::pin!(race);
			let mut tail_open = any_tail;
			let result = loop {
				tokio::select! {
					result = &mut race => break result,
					line = line_rx.recv(), if tail_open => match line {
						Some(line) => writeln!(writer, "{line}")?,
						None => tail_open = false,
					},
				}
			};
			token.cancel();
			if let Some(handle) = tail_handle {
				let _ = handle.await;
			}
			while let Ok(line) = line_rx.try_recv() {
				writeln!(writer, "{line}")?;
			}

			match result {
				Ok(WaitOutcome::Ready) => {
					if should_print {
						writeln!(writer, "Workload {name:?} is ready")?;
					}
				}
				Ok(WaitOutcome::Interrupted) => {}
				Err(error) => {
					let failure = WaitFailure {
						phase: WaitPhase::ReadyCondition,
						error,
					};
					writeln!(err_writer, "{failure}")?;
					if args.output.is_none() {
						return Ok(1);
					}
				}
			}
		}
	}

	if let Some(format) = args.output {
		let applied = connection
			.get_workload(&namespace, &name)
			.await?
			.with_context(|| format!("workload {name:?} disappeared after apply"))?;
		match format {
			OutputFormat::Yaml => write!(writer, "---\n{}", applied.to_canonical_yaml())?,
			OutputFormat::Json => writeln!(writer, "{}", applied.to_canonical_json())?,
		}
	}

	Ok(0)
}

fn overrides_from(args: &ApplyArgs) -> Overrides {
	Overrides {
		workload_type: args.workload_type.clone(),
		labels: args.label.clone(),
		annotations: args.annotation.clone(),
		service_account_name: args.service_account.clone(),
		params_yaml: args.params_yaml.clone(),
		service_refs: args.service_ref.clone(),
		envs: args.env.clone(),
		build_envs: args.build_env.clone(),
		limit_cpu: args.limit_cpu.clone(),
		limit_memory: args.limit_memory.clone(),
		request_cpu: args.request_cpu.clone(),
		request_memory: args.request_memory.clone(),
		git_repo: args.git_repo.clone(),
		git_branch: args.git_branch.clone(),
		git_tag: args.git_tag.clone(),
		git_commit: args.git_commit.clone(),
		image: args.image.clone(),
		source_image: args.source_image.clone(),
		// with a local path the subpath applies to the published source
		sub_path: if args.local_path.is_some() {
			None
		} else {
			args.sub_path.clone()
		},
		maven_artifact: args.maven_artifact.clone(),
		maven_version: args.maven_version.clone(),
		maven_group: args.maven_group.clone(),
		maven_type: args.maven_type.clone(),
	}
}

/// Which sources the user declared across flags and file. More than one is
/// rejected before any cluster mutation.
///
/// A flag given as the empty-string delete sentinel is not a declaration,
/// and it also retracts the matching file-declared source, which it is about
/// to remove from the reconciled state.
fn declared_sources(args: &ApplyArgs, file: Option<&Workload>) -> Vec<String> {
	let mut fields = Vec::new();

	let file_source = file.and_then(|w| w.spec.source.as_ref());
	let git_flag = args.git_repo.as_deref();
	if git_flag.is_some_and(|v| !v.is_empty())
		|| (git_flag != Some("") && file_source.is_some_and(|s| s.git.is_some()))
	{
		fields.push("--git-repo".to_string());
	}
	let image_flag = args.image.as_deref();
	if image_flag.is_some_and(|v| !v.is_empty())
		|| (image_flag != Some("") && file.is_some_and(|w| w.spec.image.is_some()))
	{
		fields.push("--image".to_string());
	}
	let source_image_flag = args.source_image.as_deref();
	if source_image_flag.is_some_and(|v| !v.is_empty())
		|| (source_image_flag != Some("") && file_source.is_some_and(|s| s.image.is_some()))
	{
		fields.push("--source-image".to_string());
	}
	let maven_flag = args.maven_artifact.is_some()
		|| args.maven_version.is_some()
		|| args.maven_group.is_some()
		|| args.maven_type.is_some();
	if maven_flag
		|| file.is_some_and(|w| w.maven_param().is_some())
		|| args.params_yaml.iter().any(|p| p.starts_with("maven="))
	{
		fields.push("--maven".to_string());
	}
	if args.local_path.is_some() {
		fields.push("--local-path".to_string());
	}

	fields
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_args() -> ApplyArgs {
		ApplyArgs {
			name: Some("my-workload".to_string()),
			namespace: None,
			file: None,
			yes: true,
			dry_run: false,
			output: None,
			update_strategy: None,
			git_repo: None,
			git_branch: None,
			git_tag: None,
			git_commit: None,
			image: None,
			maven_artifact: None,
			maven_version: None,
			maven_group: None,
			maven_type: None,
			source_image: None,
			local_path: None,
			sub_path: None,
			env: Vec::new(),
			build_env: Vec::new(),
			label: Vec::new(),
			annotation: Vec::new(),
			workload_type: None,
			service_account: None,
			service_ref: Vec::new(),
			params_yaml: Vec::new(),
			limit_cpu: None,
			limit_memory: None,
			request_cpu: None,
			request_memory: None,
			debug: false,
			color: ColorMode::Never,
			wait: false,
			wait_timeout: Duration::from_secs(600),
			tail: false,
			tail_timestamp: false,
		}
	}

	#[test]
	fn single_source_flag_is_accepted() {
		let mut args = base_args();
		args.git_repo = Some("https://example.com/repo.git".to_string());
		assert_eq!(declared_sources(&args, None), ["--git-repo"]);
	}

	#[test]
	fn all_pairs_of_source_flags_conflict() {
		let setters: Vec<(&str, fn(&mut ApplyArgs))> = vec![
			("--git-repo", |a| {
				a.git_repo = Some("https://example.com/r.git".to_string())
			}),
			("--image", |a| a.image = Some("registry/app:v1".to_string())),
			("--source-image", |a| {
				a.source_image = Some("registry/src:latest".to_string())
			}),
			("--maven", |a| a.maven_artifact = Some("app".to_string())),
			("--local-path", |a| a.local_path = Some("./src".to_string())),
		];

		for (i, (left_name, left)) in setters.iter().enumerate() {
			for (right_name, right) in setters.iter().skip(i + 1) {
				let mut args = base_args();
				left(&mut args);
				right(&mut args);
				let sources = declared_sources(&args, None);
				assert_eq!(
					sources.len(),
					2,
					"{left_name} + {right_name} should conflict, got {sources:?}"
				);
			}
		}
	}

	#[test]
	fn maven_params_yaml_counts_as_maven() {
		let mut args = base_args();
		args.params_yaml = vec!["maven={\"artifactId\": \"x\"}".to_string()];
		args.git_repo = Some("https://example.com/repo.git".to_string());
		assert_eq!(declared_sources(&args, None).len(), 2);
	}

	#[test]
	fn maven_flags_and_maven_params_are_one_source() {
		let mut args = base_args();
		args.params_yaml = vec!["maven={\"artifactId\": \"x\"}".to_string()];
		args.maven_version = Some("2.0".to_string());
		assert_eq!(declared_sources(&args, None), ["--maven"]);
	}

	#[test]
	fn file_git_source_counts() {
		let args = base_args();
		let mut file = Workload::default();
		file.set_git_url("https://example.com/repo.git");
		assert_eq!(declared_sources(&args, Some(&file)), ["--git-repo"]);
	}

	#[test]
	fn unsetting_git_repo_is_not_a_source() {
		let mut args = base_args();
		args.git_repo = Some(String::new());
		assert!(declared_sources(&args, None).is_empty());
	}

	#[test]
	fn sentinel_delete_retracts_the_file_git_source() {
		let mut args = base_args();
		args.git_repo = Some(String::new());
		args.maven_artifact = Some("spring-petclinic".to_string());

		let mut file = Workload::default();
		file.set_git_url("https://example.com/repo.git");
		file.set_git_branch("main");

		// the file git source is being deleted by the sentinel, so maven is
		// the only declared source
		assert_eq!(declared_sources(&args, Some(&file)), ["--maven"]);
	}

	#[test]
	fn sentinel_delete_retracts_the_file_image() {
		let mut args = base_args();
		args.image = Some(String::new());
		args.git_repo = Some("https://example.com/repo.git".to_string());

		let mut file = Workload::default();
		file.set_image("registry.example.com/app:v1");

		assert_eq!(declared_sources(&args, Some(&file)), ["--git-repo"]);
	}
}
