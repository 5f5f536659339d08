//! HTTP mock of the pieces of a cluster the apply flow touches.
//!
//! Built on wiremock so real kubeconfig-based clients can connect. Serves
//! the workload custom resource with full-object writes and resourceVersion
//! bumps, namespace lookups, canned watch streams and the Local Source Proxy
//! service-proxy endpoints.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, RwLock,
	},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use tracing::{debug, trace};
use wiremock::{
	matchers::{method, path, path_regex, query_param},
	Mock, MockServer, Request, ResponseTemplate,
};

/// Collection path for workloads in a namespace.
fn workloads_path(namespace: &str) -> String {
	format!("/apis/carto.run/v1alpha1/namespaces/{namespace}/workloads")
}

/// Shared mutable resource state, keyed by (collection path, name).
pub type SharedResources = Arc<RwLock<HashMap<(String, String), serde_json::Value>>>;

/// A mock cluster exposed over HTTP.
#[derive(Builder)]
pub struct MockCluster {
	/// Workload manifests present on the cluster at startup.
	#[builder(default)]
	workloads: Vec<serde_json::Value>,

	/// Pod manifests present on the cluster at startup (for log tailing).
	#[builder(default)]
	pods: Vec<serde_json::Value>,

	/// Lines answered by every pod log request.
	#[builder(default)]
	pod_log_lines: Vec<String>,

	/// Namespaces that exist, `default` is always present.
	#[builder(default)]
	namespaces: Vec<String>,

	/// Watch events replayed (in order) to every workload watch request,
	/// as `{"type": ..., "object": ...}` values.
	#[builder(default)]
	watch_events: Vec<serde_json::Value>,

	/// Envelope statuscodes answered by successive Local Source Proxy
	/// publishes; the last entry repeats. Empty means `"200"`.
	#[builder(default)]
	lsp_statuscodes: Vec<String>,

	/// When false, proxy endpoints answer 404 as if the LSP were missing.
	#[builder(default = true)]
	lsp_installed: bool,

	/// When true, every workload update answers 409.
	#[builder(default)]
	conflict_on_update: bool,
}

/// A running mock cluster instance.
pub struct RunningMockCluster {
	server: MockServer,
	resources: SharedResources,
	lsp_publishes: Arc<AtomicUsize>,
}

impl MockCluster {
	/// Start the mock server with the configured state.
	pub async fn start(self) -> RunningMockCluster {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "started mock cluster");

		let mut resources: HashMap<(String, String), serde_json::Value> = HashMap::new();

		let mut namespaces = self.namespaces.clone();
		if !namespaces.iter().any(|ns| ns == "default") {
			namespaces.push("default".to_string());
		}
		for namespace in &namespaces {
			resources.insert(
				("/api/v1/namespaces".to_string(), namespace.clone()),
				serde_json::json!({
					"apiVersion": "v1",
					"kind": "Namespace",
					"metadata": { "name": namespace }
				}),
			);
		}

		for manifest in &self.workloads {
			let Some((namespace, name)) = manifest_key(manifest) else {
				continue;
			};
			trace!(namespace = %namespace, name = %name, "registered workload");
			resources.insert((workloads_path(&namespace), name), manifest.clone());
		}
		for manifest in &self.pods {
			let Some((namespace, name)) = manifest_key(manifest) else {
				continue;
			};
			trace!(namespace = %namespace, name = %name, "registered pod");
			resources.insert(
				(format!("/api/v1/namespaces/{namespace}/pods"), name),
				manifest.clone(),
			);
		}

		let resources = Arc::new(RwLock::new(resources));
		let lsp_publishes = Arc::new(AtomicUsize::new(0));

		mount_version(&server).await;
		mount_lsp(
			&server,
			self.lsp_installed,
			self.lsp_statuscodes.clone(),
			Arc::clone(&lsp_publishes),
		)
		.await;
		mount_watch(&server, self.watch_events.clone()).await;
		mount_pod_logs(&server, self.pod_log_lines.clone()).await;
		mount_resources(&server, &resources, self.conflict_on_update).await;

		RunningMockCluster {
			server,
			resources,
			lsp_publishes,
		}
	}
}

fn manifest_key(manifest: &serde_json::Value) -> Option<(String, String)> {
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_string();
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(|v| v.as_str())
		.unwrap_or("default")
		.to_string();
	Some((namespace, name))
}

impl RunningMockCluster {
	/// The server's URI (e.g. `http://127.0.0.1:12345`).
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// A kubeconfig pointing at this mock cluster, context namespace
	/// `default`.
	pub fn kubeconfig(&self) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";
		let context_name = "mock-context";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: user_name.to_string(),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	/// The stored state of a workload, if present.
	pub fn workload(&self, namespace: &str, name: &str) -> Option<serde_json::Value> {
		self.resources
			.read()
			.unwrap()
			.get(&(workloads_path(namespace), name.to_string()))
			.cloned()
	}

	/// How many source publishes the Local Source Proxy mock received.
	pub fn lsp_publish_count(&self) -> usize {
		self.lsp_publishes.load(Ordering::SeqCst)
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"major": "1",
			"minor": "30",
			"gitVersion": "v1.30.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2025-01-01T00:00:00Z",
			"goVersion": "go1.22.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

async fn mount_lsp(
	server: &MockServer,
	installed: bool,
	statuscodes: Vec<String>,
	publishes: Arc<AtomicUsize>,
) {
	const LSP_PATH: &str =
		"^/api/v1/namespaces/tap-local-source-system/services/local-source-proxy:upload/proxy/.*";

	if !installed {
		Mock::given(path_regex(LSP_PATH))
			.respond_with(ResponseTemplate::new(404).set_body_string("not found"))
			.with_priority(1)
			.mount(server)
			.await;
		return;
	}

	Mock::given(method("GET"))
		.and(path_regex(LSP_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"statuscode": "200",
			"message": "any source image available"
		})))
		.with_priority(1)
		.mount(server)
		.await;

	Mock::given(method("POST"))
		.and(path_regex(LSP_PATH))
		.respond_with(move |_req: &Request| {
			let index = publishes.fetch_add(1, Ordering::SeqCst);
			let statuscode = statuscodes
				.get(index)
				.or_else(|| statuscodes.last())
				.map(String::as_str)
				.unwrap_or("200");
			ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"statuscode": statuscode,
				"message": "source upload",
			}))
		})
		.with_priority(1)
		.mount(server)
		.await;
}

async fn mount_watch(server: &MockServer, events: Vec<serde_json::Value>) {
	let body = events
		.iter()
		.map(|event| serde_json::to_string(event).expect("serializing watch event"))
		.collect::<Vec<_>>()
		.join("\n");

	Mock::given(method("GET"))
		.and(path_regex(r"^/apis/carto\.run/v1alpha1/.*/workloads$"))
		.and(query_param("watch", "true"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
		.with_priority(1)
		.mount(server)
		.await;
}

async fn mount_pod_logs(server: &MockServer, lines: Vec<String>) {
	let body = if lines.is_empty() {
		String::new()
	} else {
		lines.join("\n") + "\n"
	};

	Mock::given(method("GET"))
		.and(path_regex(r"^/api/v1/namespaces/[^/]+/pods/[^/]+/log$"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/plain"))
		.with_priority(1)
		.mount(server)
		.await;
}

async fn mount_resources(server: &MockServer, resources: &SharedResources, conflict: bool) {
	let put_resources = Arc::clone(resources);
	let post_resources = Arc::clone(resources);
	let get_resources = Arc::clone(resources);

	// PUT replaces a stored resource, bumping its resourceVersion
	Mock::given(method("PUT"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			if conflict {
				return status_response(
					409,
					"Conflict",
					"Operation cannot be fulfilled on workloads.carto.run: \
					 the object has been modified",
				);
			}

			let (collection, name) = parse_resource_path(req.url.path());
			let mut body: serde_json::Value = match serde_json::from_slice(&req.body) {
				Ok(body) => body,
				Err(_) => return status_response(400, "BadRequest", "malformed body"),
			};

			let mut resources = put_resources.write().unwrap();
			let Some(existing) = resources.get(&(collection.clone(), name.clone())) else {
				return status_response(404, "NotFound", "not found");
			};

			let next_version = existing
				.pointer("/metadata/resourceVersion")
				.and_then(|v| v.as_str())
				.and_then(|v| v.parse::<u64>().ok())
				.unwrap_or(0)
				+ 1;
			if let Some(metadata) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
				metadata.insert(
					"resourceVersion".to_string(),
					serde_json::Value::String(next_version.to_string()),
				);
			}

			resources.insert((collection, name), body.clone());
			ResponseTemplate::new(200).set_body_json(body)
		})
		.mount(server)
		.await;

	// POST creates a resource with resourceVersion 1
	Mock::given(method("POST"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let collection = req.url.path().trim_end_matches('/').to_string();
			let mut body: serde_json::Value = match serde_json::from_slice(&req.body) {
				Ok(body) => body,
				Err(_) => return status_response(400, "BadRequest", "malformed body"),
			};
			let name = body
				.pointer("/metadata/name")
				.and_then(|v| v.as_str())
				.unwrap_or_default()
				.to_string();
			if name.is_empty() {
				return status_response(422, "Invalid", "metadata.name is required");
			}

			let mut resources = post_resources.write().unwrap();
			if resources.contains_key(&(collection.clone(), name.clone())) {
				return status_response(409, "AlreadyExists", "workload already exists");
			}

			if let Some(metadata) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
				metadata.insert(
					"resourceVersion".to_string(),
					serde_json::Value::String("1".to_string()),
				);
				metadata.insert(
					"uid".to_string(),
					serde_json::Value::String(format!("uid-{name}")),
				);
			}

			resources.insert((collection, name), body.clone());
			ResponseTemplate::new(201).set_body_json(body)
		})
		.mount(server)
		.await;

	// GET serves single resources and empty lists for everything else
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let path_str = req.url.path();
			let resources = get_resources.read().unwrap();

			let (collection, name) = parse_resource_path(path_str);
			if !name.is_empty() {
				if let Some(resource) = resources.get(&(collection, name)) {
					return ResponseTemplate::new(200).set_body_json(resource.clone());
				}
				return status_response(404, "NotFound", "not found");
			}

			let items: Vec<_> = resources
				.iter()
				.filter(|((collection, _), _)| collection == path_str)
				.map(|(_, resource)| resource.clone())
				.collect();
			ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"kind": "List",
				"apiVersion": "v1",
				"metadata": { "resourceVersion": "1" },
				"items": items
			}))
		})
		.mount(server)
		.await;
}

fn status_response(code: u16, reason: &str, message: &str) -> ResponseTemplate {
	ResponseTemplate::new(code).set_body_json(serde_json::json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message,
		"reason": reason,
		"code": code
	}))
}

/// Split a resource path into (collection path, resource name).
///
/// `/apis/carto.run/v1alpha1/namespaces/default/workloads/my-workload`
/// becomes (`…/workloads`, `my-workload`); a collection request keeps an
/// empty name when the path ends at a known collection.
fn parse_resource_path(path: &str) -> (String, String) {
	let path = path.trim_end_matches('/');
	const COLLECTIONS: &[&str] = &["workloads", "namespaces", "pods", "services"];
	if let Some(last_slash) = path.rfind('/') {
		let candidate = &path[last_slash + 1..];
		if COLLECTIONS.contains(&candidate) {
			return (path.to_string(), String::new());
		}
		(path[..last_slash].to_string(), candidate.to_string())
	} else {
		(path.to_string(), String::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_single_resource_path() {
		let (collection, name) =
			parse_resource_path("/apis/carto.run/v1alpha1/namespaces/default/workloads/my-app");
		assert_eq!(
			collection,
			"/apis/carto.run/v1alpha1/namespaces/default/workloads"
		);
		assert_eq!(name, "my-app");
	}

	#[test]
	fn parse_collection_path() {
		let (collection, name) =
			parse_resource_path("/apis/carto.run/v1alpha1/namespaces/default/workloads");
		assert_eq!(
			collection,
			"/apis/carto.run/v1alpha1/namespaces/default/workloads"
		);
		assert_eq!(name, "");
	}

	#[test]
	fn parse_namespace_path() {
		let (collection, name) = parse_resource_path("/api/v1/namespaces/my-ns");
		assert_eq!(collection, "/api/v1/namespaces");
		assert_eq!(name, "my-ns");
	}

	#[tokio::test]
	async fn default_namespace_always_exists() {
		let cluster = MockCluster::builder().build().start().await;
		assert!(cluster
			.resources
			.read()
			.unwrap()
			.contains_key(&("/api/v1/namespaces".to_string(), "default".to_string())));
	}
}
