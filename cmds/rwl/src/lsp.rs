//! Local Source Proxy client.
//!
//! The proxy is an in-cluster HTTP endpoint reached through the API server
//! service proxy. Responses carry a `{"statuscode", "message"}` envelope whose
//! interpretation, combined with the outer HTTP status, is a pure function.

use kube::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Namespace the proxy deployment lives in.
pub const LSP_NAMESPACE: &str = "tap-local-source-system";

/// Service name of the proxy.
pub const LSP_SERVICE: &str = "local-source-proxy";

#[derive(Debug, Error)]
pub enum LspError {
	#[error("client transport not provided")]
	TransportNotProvided,

	#[error("Local source proxy failed to upload source to the repository\nReason: {reason}\nMessages:\n- {message}")]
	Upstream { reason: String, message: String },

	#[error("Local Source Proxy is not installed on the Cluster or you don't have permissions to access it\nReason: {reason}")]
	Unreachable { reason: String },

	#[error("unexpected response status {code} from the local source proxy")]
	UnexpectedStatus { code: u16 },

	#[error("decoding local source proxy response")]
	Decode(#[source] serde_json::Error),

	#[error("building local source proxy request")]
	Request(#[source] http::Error),

	#[error("calling local source proxy")]
	Transport(#[source] kube::Error),

	#[error("reading local source proxy response")]
	Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Successful publish outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
	/// Source uploaded, the reference is now served.
	Published,
	/// Content already known, nothing was uploaded.
	Unchanged,
}

#[derive(Debug, Deserialize)]
struct Envelope {
	statuscode: String,
	#[serde(default)]
	message: String,
}

/// Interpret an outer HTTP status plus response body.
///
/// All user-facing wording for proxy failures is produced here and nowhere
/// else.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<PublishOutcome, LspError> {
	match status {
		200 => {
			let envelope: Envelope = serde_json::from_slice(body).map_err(LspError::Decode)?;
			match envelope.statuscode.as_str() {
				"200" => Ok(PublishOutcome::Published),
				"204" => Ok(PublishOutcome::Unchanged),
				"302" => Err(LspError::Upstream {
					reason: "Local source proxy was redirected and could not reach the repository"
						.to_string(),
					message: envelope.message,
				}),
				"401" => Err(LspError::Upstream {
					reason: "The local source proxy is not authorized to push to the repository"
						.to_string(),
					message: envelope.message,
				}),
				"404" => Err(LspError::Upstream {
					reason: "The repository was not found".to_string(),
					message: envelope.message,
				}),
				"500" => Err(LspError::Upstream {
					reason: "The repository returned an internal error".to_string(),
					message: envelope.message,
				}),
				other => Err(LspError::UnexpectedStatus {
					code: other.parse().unwrap_or(0),
				}),
			}
		}
		302 => Err(LspError::Unreachable {
			reason: "Local source proxy was moved and is not reachable".to_string(),
		}),
		401 => Err(LspError::Unreachable {
			reason: "The current user does not have permission to access the local source proxy"
				.to_string(),
		}),
		404 => Err(LspError::Unreachable {
			reason: "Local source proxy is not installed or the deployment is not healthy. \
			         Either install it or use the --source-image flag"
				.to_string(),
		}),
		code => Err(LspError::UnexpectedStatus { code }),
	}
}

fn proxy_path(suffix: &str) -> String {
	format!(
		"/api/v1/namespaces/{LSP_NAMESPACE}/services/{LSP_SERVICE}:upload/proxy/{suffix}"
	)
}

/// Issue a request through the API server service proxy and hand back the
/// raw status and body. Redirects are not followed, so a relocated proxy
/// surfaces as its 302.
async fn proxy_request(
	client: &Client,
	request: http::Request<Vec<u8>>,
) -> Result<(u16, Vec<u8>), LspError> {
	use http_body_util::BodyExt;

	let response = client
		.send(request.map(kube::client::Body::from))
		.await
		.map_err(LspError::Transport)?;
	let status = response.status().as_u16();
	let body = response
		.into_body()
		.collect()
		.await
		.map_err(|err| LspError::Body(err.into()))?
		.to_bytes()
		.to_vec();
	Ok((status, body))
}

/// Push a packed source layer. The reference is treated as opaque by the
/// caller; the proxy decides where the content lands.
#[instrument(skip_all, fields(reference = %reference))]
pub async fn publish(
	client: Option<&Client>,
	reference: &str,
	body: Vec<u8>,
) -> Result<PublishOutcome, LspError> {
	let client = client.ok_or(LspError::TransportNotProvided)?;

	let request = http::Request::post(proxy_path(&format!("source?image={reference}")))
		.header(http::header::CONTENT_TYPE, "application/x-tar")
		.body(body)
		.map_err(LspError::Request)?;

	let (status, body) = proxy_request(client, request).await?;
	debug!(status, "local source proxy answered");
	interpret_response(status, &body)
}

/// Probe the proxy before attempting an upload.
#[instrument(skip_all)]
pub async fn check_health(client: Option<&Client>) -> Result<(), LspError> {
	let client = client.ok_or(LspError::TransportNotProvided)?;

	let request = http::Request::get(proxy_path("health"))
		.body(Vec::new())
		.map_err(LspError::Request)?;

	let (status, body) = proxy_request(client, request).await?;
	interpret_response(status, &body).map(|_| ())
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	fn envelope(statuscode: &str, message: &str) -> Vec<u8> {
		serde_json::to_vec(&serde_json::json!({
			"statuscode": statuscode,
			"message": message,
		}))
		.unwrap()
	}

	#[test]
	fn published_envelope() {
		assert_matches!(
			interpret_response(200, &envelope("200", "ok")),
			Ok(PublishOutcome::Published)
		);
	}

	#[test]
	fn unchanged_envelope() {
		assert_matches!(
			interpret_response(200, &envelope("204", "no change")),
			Ok(PublishOutcome::Unchanged)
		);
	}

	#[test]
	fn upstream_errors_keep_the_envelope_message() {
		for statuscode in ["302", "401", "404", "500"] {
			let result = interpret_response(200, &envelope(statuscode, "registry said no"));
			assert_matches!(
				result,
				Err(LspError::Upstream { message, .. }) if message == "registry said no"
			);
		}
	}

	#[test]
	fn upstream_error_text_is_multi_line() {
		let err = interpret_response(200, &envelope("500", "boom")).unwrap_err();
		let text = err.to_string();
		assert!(text.starts_with("Local source proxy failed to upload source to the repository"));
		assert!(text.contains("\nReason: "));
		assert!(text.contains("\n- boom"));
	}

	#[test]
	fn moved_proxy_is_unreachable() {
		assert_matches!(
			interpret_response(302, b""),
			Err(LspError::Unreachable { reason }) if reason.contains("moved")
		);
	}

	#[test]
	fn missing_proxy_suggests_source_image() {
		assert_matches!(
			interpret_response(404, b""),
			Err(LspError::Unreachable { reason }) if reason.contains("--source-image")
		);
	}

	#[test]
	fn unauthorized_user_is_unreachable() {
		assert_matches!(
			interpret_response(401, b""),
			Err(LspError::Unreachable { reason }) if reason.contains("permission")
		);
	}

	#[test]
	fn garbage_envelope_is_a_decode_error() {
		assert_matches!(interpret_response(200, b"not json"), Err(LspError::Decode(_)));
	}

	#[test]
	fn unexpected_outer_status() {
		assert_matches!(
			interpret_response(503, b""),
			Err(LspError::UnexpectedStatus { code: 503 })
		);
	}

	#[tokio::test]
	async fn publish_without_transport_fails() {
		let err = publish(None, ":ns-w@sha256:abc", Vec::new())
			.await
			.unwrap_err();
		assert_eq!(err.to_string(), "client transport not provided");
	}
}
