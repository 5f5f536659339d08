//! End-to-end apply flow tests against the mock cluster.

use std::time::Duration;

use k8s_mock::{MockCluster, RunningMockCluster};
use rwl::{
	commands::apply::{apply_workload, ApplyArgs, OutputFormat, UpdateStrategy},
	diff::ColorMode,
	input::EnvDefaults,
	k8s::client::ClusterConnection,
};
use serde_json::json;

fn args(name: &str) -> ApplyArgs {
	ApplyArgs {
		name: Some(name.to_string()),
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

async fn connect(cluster: &RunningMockCluster) -> ClusterConnection {
	ClusterConnection::from_kubeconfig(cluster.kubeconfig(), None)
		.await
		.expect("connecting to the mock cluster")
}

/// Run the apply flow, panicking on flow-level errors.
async fn run_apply(
	args: ApplyArgs,
	cluster: &RunningMockCluster,
	stdin: &str,
) -> (u8, String, String) {
	try_apply(args, cluster, stdin).await.expect("apply flow")
}

/// Run the apply flow, returning flow-level errors.
async fn try_apply(
	args: ApplyArgs,
	cluster: &RunningMockCluster,
	stdin: &str,
) -> anyhow::Result<(u8, String, String)> {
	let connection = connect(cluster).await;
	let mut input = stdin.as_bytes();
	let mut out = Vec::new();
	let mut err = Vec::new();
	let code = apply_workload(
		args,
		Some(connection),
		EnvDefaults::from_pairs(Vec::<(String, String)>::new()),
		&mut input,
		&mut out,
		&mut err,
	)
	.await?;
	Ok((
		code,
		String::from_utf8(out).unwrap(),
		String::from_utf8(err).unwrap(),
	))
}

fn git_workload(name: &str, resource_version: &str) -> serde_json::Value {
	json!({
		"apiVersion": "carto.run/v1alpha1",
		"kind": "Workload",
		"metadata": {
			"name": name,
			"namespace": "default",
			"resourceVersion": resource_version,
			"uid": format!("uid-{name}"),
		},
		"spec": {
			"source": {
				"git": {
					"url": "https://example.com/repo.git",
					"ref": { "branch": "main" }
				}
			}
		}
	})
}

fn ready_event(name: &str, status: &str, transitioned: &str) -> serde_json::Value {
	json!({
		"type": "MODIFIED",
		"object": {
			"apiVersion": "carto.run/v1alpha1",
			"kind": "Workload",
			"metadata": { "name": name, "namespace": "default", "resourceVersion": "20" },
			"spec": {},
			"status": {
				"conditions": [{
					"type": "Ready",
					"status": status,
					"lastTransitionTime": transitioned
				}]
			}
		}
	})
}

#[tokio::test]
async fn create_by_flags() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());

	let (code, out, _) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 0);
	assert!(out.contains("Created workload \"my-workload\""), "{out}");

	let stored = cluster.workload("default", "my-workload").expect("created");
	assert_eq!(
		stored.pointer("/spec/source/git/url").unwrap(),
		"https://example.com/repo.git"
	);
	assert_eq!(
		stored.pointer("/spec/source/git/ref/branch").unwrap(),
		"main"
	);
	assert_eq!(
		stored
			.pointer("/metadata/labels/apps.tanzu.vmware.com~1workload-type")
			.unwrap(),
		"web"
	);
}

#[tokio::test]
async fn wait_timeout_on_create() {
	let cluster = MockCluster::builder()
		.watch_events(vec![ready_event(
			"my-workload",
			"True",
			"2025-01-01T00:00:10Z",
		)])
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());
	apply.wait = true;
	apply.wait_timeout = Duration::from_nanos(1);

	let (code, _, err) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 1);
	assert!(
		err.contains(
			"Error waiting for ready condition: timeout after 1ns waiting for \
			 \"my-workload\" to become ready"
		),
		"{err}"
	);
	// the create itself succeeded before the wait gave up
	assert!(cluster.workload("default", "my-workload").is_some());
}

#[tokio::test]
async fn stale_ready_condition_fails_the_status_change_wait() {
	let mut existing = git_workload("my-workload", "10");
	existing["status"] = json!({
		"conditions": [{
			"type": "Ready",
			"status": "True",
			"lastTransitionTime": "2025-01-01T00:00:00Z"
		}]
	});

	// the watch only ever replays the pre-update transition time
	let cluster = MockCluster::builder()
		.workloads(vec![existing])
		.watch_events(vec![ready_event(
			"my-workload",
			"True",
			"2025-01-01T00:00:00Z",
		)])
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.env = vec!["SPRING_PROFILES_ACTIVE=mysql".to_string()];
	apply.wait = true;
	apply.wait_timeout = Duration::from_millis(700);

	let (code, _, err) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 1);
	assert!(err.contains("Error waiting for status change:"), "{err}");
	assert!(err.contains("timeout after 700ms"), "{err}");
}

#[tokio::test]
async fn advanced_transition_reports_ready() {
	let mut existing = git_workload("my-workload", "10");
	existing["status"] = json!({
		"conditions": [{
			"type": "Ready",
			"status": "True",
			"lastTransitionTime": "2025-01-01T00:00:00Z"
		}]
	});

	let cluster = MockCluster::builder()
		.workloads(vec![existing])
		.watch_events(vec![ready_event(
			"my-workload",
			"True",
			"2025-01-01T00:00:10Z",
		)])
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.env = vec!["SPRING_PROFILES_ACTIVE=mysql".to_string()];
	apply.wait = true;
	apply.wait_timeout = Duration::from_secs(30);

	let (code, out, err) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 0, "{err}");
	assert!(out.contains("Workload \"my-workload\" is ready"), "{out}");
}

#[tokio::test]
async fn merge_preserves_unrelated_labels() {
	let mut existing = git_workload("spring-petclinic", "5");
	existing["metadata"]["labels"] = json!({ "preserve-me": "should-exist" });

	let cluster = MockCluster::builder()
		.workloads(vec![existing])
		.build()
		.start()
		.await;

	let document = r#"
apiVersion: carto.run/v1alpha1
kind: Workload
metadata:
  name: spring-petclinic
  labels:
    app.kubernetes.io/part-of: spring-petclinic
    apps.tanzu.vmware.com/workload-type: web
"#;

	let mut apply = args("spring-petclinic");
	apply.file = Some("-".to_string());

	let (code, _, _) = run_apply(apply, &cluster, document).await;
	assert_eq!(code, 0);

	let stored = cluster.workload("default", "spring-petclinic").unwrap();
	let labels = stored.pointer("/metadata/labels").unwrap().as_object().unwrap();
	assert_eq!(labels.len(), 3);
	assert_eq!(labels["preserve-me"], "should-exist");
	assert_eq!(labels["app.kubernetes.io/part-of"], "spring-petclinic");
	assert_eq!(labels["apps.tanzu.vmware.com/workload-type"], "web");
}

#[tokio::test]
async fn replace_strips_labels_not_in_the_file() {
	let mut existing = git_workload("spring-petclinic", "999");
	existing["metadata"]["labels"] = json!({
		"dont-preserve-me": "x",
		"preserve-me": "y"
	});

	let cluster = MockCluster::builder()
		.workloads(vec![existing])
		.build()
		.start()
		.await;

	let document = r#"
apiVersion: carto.run/v1alpha1
kind: Workload
metadata:
  name: spring-petclinic
  labels:
    preserve-me: "y"
    apps.tanzu.vmware.com/workload-type: web
spec:
  source:
    git:
      url: https://example.com/repo.git
      ref:
        branch: main
"#;

	let mut apply = args("spring-petclinic");
	apply.file = Some("-".to_string());
	apply.update_strategy = Some(UpdateStrategy::Replace);

	let (code, _, _) = run_apply(apply, &cluster, document).await;
	assert_eq!(code, 0);

	let stored = cluster.workload("default", "spring-petclinic").unwrap();
	let labels = stored.pointer("/metadata/labels").unwrap().as_object().unwrap();
	assert_eq!(labels.len(), 2);
	assert!(labels.get("dont-preserve-me").is_none());
	// system metadata carried over: the mock bumps the carried 999
	assert_eq!(
		stored.pointer("/metadata/resourceVersion").unwrap(),
		"1000"
	);
}

#[tokio::test]
async fn local_path_publish_and_republish() {
	let cluster = MockCluster::builder()
		.lsp_statuscodes(vec!["200".to_string(), "204".to_string()])
		.build()
		.start()
		.await;

	let source_dir = tempfile::TempDir::new().unwrap();
	std::fs::write(source_dir.path().join("main.go"), "package main").unwrap();

	let mut apply = args("my-workload");
	apply.local_path = Some(source_dir.path().to_string_lossy().to_string());

	let (code, out, _) = run_apply(apply, &cluster, "").await;
	assert_eq!(code, 0);
	assert!(out.contains("Published local source to :default-my-workload@sha256:"), "{out}");

	let stored = cluster.workload("default", "my-workload").unwrap();
	let reference = stored
		.pointer("/spec/source/image")
		.unwrap()
		.as_str()
		.unwrap()
		.to_string();
	assert!(reference.starts_with(":default-my-workload@sha256:"));
	assert_eq!(
		stored
			.pointer("/metadata/annotations/local-source-proxy.apps.tanzu.vmware.com")
			.unwrap()
			.as_str()
			.unwrap(),
		reference
	);

	// identical content published again: same reference, nothing to update
	let mut again = args("my-workload");
	again.local_path = Some(source_dir.path().to_string_lossy().to_string());

	let (code, out, _) = run_apply(again, &cluster, "").await;
	assert_eq!(code, 0);
	assert!(out.contains("No source code changes detected"), "{out}");
	assert!(out.contains("Workload is unchanged, skipping update"), "{out}");
	assert_eq!(cluster.lsp_publish_count(), 2);

	let stored = cluster.workload("default", "my-workload").unwrap();
	assert_eq!(
		stored.pointer("/spec/source/image").unwrap().as_str().unwrap(),
		reference
	);
}

#[tokio::test]
async fn tail_streams_pod_logs_into_the_output() {
	let cluster = MockCluster::builder()
		.pods(vec![json!({
			"apiVersion": "v1",
			"kind": "Pod",
			"metadata": {
				"name": "my-workload-build-1",
				"namespace": "default",
				"labels": { "carto.run/workload-name": "my-workload" }
			}
		})])
		.pod_log_lines(vec!["server started".to_string()])
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());
	apply.tail = true;
	apply.wait_timeout = Duration::from_secs(2);

	let (code, out, err) = run_apply(apply, &cluster, "").await;

	// no ready condition ever arrives, so the wait times out after the log
	// lines have flowed through the shared writer
	assert_eq!(code, 1);
	assert!(err.contains("Error waiting for ready condition:"), "{err}");
	assert!(out.contains("my-workload-build-1> server started"), "{out}");
}

#[tokio::test]
async fn rejected_consent_skips_the_create() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());
	apply.yes = false;

	// end of input counts as a rejection
	let (code, out, _) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 0);
	assert!(out.contains("Skipping workload \"my-workload\""), "{out}");
	assert!(cluster.workload("default", "my-workload").is_none());
}

#[tokio::test]
async fn explicit_no_skips_the_update() {
	let cluster = MockCluster::builder()
		.workloads(vec![git_workload("my-workload", "3")])
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.env = vec!["PORT=8080".to_string()];
	apply.yes = false;

	let (code, out, _) = run_apply(apply, &cluster, "n\n").await;

	assert_eq!(code, 0);
	assert!(out.contains("Really update the workload \"my-workload\"?"), "{out}");
	assert!(out.contains("Skipping workload \"my-workload\""), "{out}");

	let stored = cluster.workload("default", "my-workload").unwrap();
	assert!(stored.pointer("/spec/env").is_none());
}

#[tokio::test]
async fn unchanged_workload_skips_the_update() {
	let cluster = MockCluster::builder()
		.workloads(vec![git_workload("my-workload", "7")])
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());

	let (code, out, _) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 0);
	assert!(out.contains("Workload is unchanged, skipping update"), "{out}");

	let stored = cluster.workload("default", "my-workload").unwrap();
	assert_eq!(stored.pointer("/metadata/resourceVersion").unwrap(), "7");
}

#[tokio::test]
async fn conflicting_update_is_terminal() {
	let cluster = MockCluster::builder()
		.workloads(vec![git_workload("my-workload", "3")])
		.conflict_on_update(true)
		.build()
		.start()
		.await;

	let mut apply = args("my-workload");
	apply.env = vec!["PORT=8080".to_string()];

	let err = try_apply(apply, &cluster, "").await.unwrap_err();
	assert_eq!(
		err.to_string(),
		"conflict updating workload, the object was modified by another user; \
		 please run the update command again"
	);
}

#[tokio::test]
async fn missing_namespace_is_reported() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.namespace = Some("missing".to_string());
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());

	let err = try_apply(apply, &cluster, "").await.unwrap_err();
	assert!(
		err.to_string().contains("namespace \"missing\" not found"),
		"{err}"
	);
}

#[tokio::test]
async fn dry_run_prints_without_submitting() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());
	apply.dry_run = true;

	let (code, out, _) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 0);
	assert!(out.contains("kind: Workload"), "{out}");
	assert!(out.contains("url: https://example.com/repo.git"), "{out}");
	assert!(cluster.workload("default", "my-workload").is_none());
}

#[tokio::test]
async fn output_prints_the_applied_resource() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());
	apply.output = Some(OutputFormat::Yaml);

	let (code, out, _) = run_apply(apply, &cluster, "").await;

	assert_eq!(code, 0);
	// pre-approved with output requested: no diff, just the final resource
	assert!(!out.contains("Created workload"), "{out}");
	assert!(out.contains("apiVersion: carto.run/v1alpha1"), "{out}");
	assert!(out.contains("resourceVersion:"), "{out}");
}

#[tokio::test]
async fn multiple_sources_are_rejected_before_submit() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.git_repo = Some("https://example.com/repo.git".to_string());
	apply.git_branch = Some("main".to_string());
	apply.image = Some("registry.example.com/app:v1".to_string());

	let err = try_apply(apply, &cluster, "").await.unwrap_err();
	assert!(
		err.to_string().contains("expected exactly one source"),
		"{err}"
	);
	assert!(cluster.workload("default", "my-workload").is_none());
}

#[tokio::test]
async fn missing_lsp_fails_local_publish() {
	let cluster = MockCluster::builder()
		.lsp_installed(false)
		.build()
		.start()
		.await;

	let source_dir = tempfile::TempDir::new().unwrap();
	std::fs::write(source_dir.path().join("main.go"), "package main").unwrap();

	let mut apply = args("my-workload");
	apply.local_path = Some(source_dir.path().to_string_lossy().to_string());

	let err = try_apply(apply, &cluster, "").await.unwrap_err();
	assert!(
		err.to_string()
			.contains("Local Source Proxy is not installed on the Cluster"),
		"{err}"
	);
	assert!(cluster.workload("default", "my-workload").is_none());
}

#[tokio::test]
async fn stdin_requires_pre_approval() {
	let cluster = MockCluster::builder().build().start().await;

	let mut apply = args("my-workload");
	apply.file = Some("-".to_string());
	apply.yes = false;

	let err = try_apply(apply, &cluster, "apiVersion: carto.run/v1alpha1\n")
		.await
		.unwrap_err();
	assert!(err.to_string().contains("requires the --yes flag"), "{err}");
}
