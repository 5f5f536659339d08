//! Local source packing and publication.
//!
//! Packs a directory into a deterministic tar layer, derives the
//! content-addressed image reference and pushes the layer through the Local
//! Source Proxy.

use std::{
	io::Write,
	path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
	lsp::{self, LspError, PublishOutcome},
	workload::{Workload, LOCAL_SOURCE_PROXY_ANNOTATION},
};

#[derive(Debug, Error)]
pub enum SourceError {
	#[error("packing local source directory {}", .path.display())]
	Pack {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("local source path {} is not a directory", .path.display())]
	NotADirectory { path: PathBuf },

	#[error(transparent)]
	Lsp(#[from] LspError),
}

/// A packed source layer with its content digest.
pub struct PackedSource {
	pub tarball: Vec<u8>,
	pub digest: String,
}

/// Pack a directory into a tar layer.
///
/// Entries are appended in sorted path order with zeroed timestamps and
/// ownership, so identical trees produce identical bytes and therefore
/// identical digests.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn pack_directory(path: &Path) -> Result<PackedSource, SourceError> {
	if !path.is_dir() {
		return Err(SourceError::NotADirectory {
			path: path.to_path_buf(),
		});
	}

	let pack_err = |source| SourceError::Pack {
		path: path.to_path_buf(),
		source,
	};

	let mut files = Vec::new();
	collect_files(path, path, &mut files).map_err(pack_err)?;
	files.sort();

	let mut builder = tar::Builder::new(Vec::new());
	for relative in &files {
		let contents = std::fs::read(path.join(relative)).map_err(pack_err)?;
		let mut header = tar::Header::new_gnu();
		header.set_size(contents.len() as u64);
		header.set_mode(0o644);
		header.set_mtime(0);
		header.set_uid(0);
		header.set_gid(0);
		header.set_cksum();
		builder
			.append_data(&mut header, relative, contents.as_slice())
			.map_err(pack_err)?;
	}
	let tarball = builder.into_inner().map_err(pack_err)?;

	let digest = hex_digest(&tarball);
	debug!(files = files.len(), digest = %digest, "packed local source");

	Ok(PackedSource { tarball, digest })
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let path = entry.path();
		if entry.file_type()?.is_dir() {
			collect_files(root, &path, files)?;
		} else {
			let relative = path
				.strip_prefix(root)
				.expect("entry path is under the walk root");
			files.push(relative.to_path_buf());
		}
	}
	Ok(())
}

fn hex_digest(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	format!("{:x}", hasher.finalize())
}

/// The content-addressed reference the published source is known by.
pub fn image_reference(namespace: &str, name: &str, digest: &str) -> String {
	format!(":{namespace}-{name}@sha256:{digest}")
}

/// Outcome of publishing a local source directory.
pub struct PublishReport {
	pub reference: String,
	/// True when the proxy already held this content and uploaded nothing.
	pub unchanged: bool,
}

/// Pack and publish a local directory, then point the workload source at the
/// published reference.
#[instrument(skip_all, fields(path = %local_path.display()))]
pub async fn publish_local_source(
	client: Option<&kube::Client>,
	workload: &mut Workload,
	local_path: &Path,
) -> Result<PublishReport, SourceError> {
	let packed = pack_directory(local_path)?;
	let reference = image_reference(workload.namespace(), workload.name(), &packed.digest);

	let pack_err = |source| SourceError::Pack {
		path: local_path.to_path_buf(),
		source,
	};
	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	encoder.write_all(&packed.tarball).map_err(pack_err)?;
	let compressed = encoder.finish().map_err(pack_err)?;

	let outcome = lsp::publish(client, &reference, compressed).await?;

	workload.set_source_image(&reference);
	workload.set_annotation(LOCAL_SOURCE_PROXY_ANNOTATION, Some(&reference));
	Ok(PublishReport {
		reference,
		unchanged: outcome == PublishOutcome::Unchanged,
	})
}

/// Drop the Local Source Proxy annotation when the source no longer points at
/// the published reference (switched to git, a plain image or another source
/// image).
pub fn reconcile_local_source_annotation(workload: &mut Workload) {
	let Some(annotation) = workload
		.annotation(LOCAL_SOURCE_PROXY_ANNOTATION)
		.map(str::to_string)
	else {
		return;
	};
	let source_image = workload
		.spec
		.source
		.as_ref()
		.and_then(|source| source.image.as_deref());
	if source_image != Some(annotation.as_str()) {
		workload.set_annotation(LOCAL_SOURCE_PROXY_ANNOTATION, None);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_tree(root: &Path, files: &[(&str, &str)]) {
		for (path, contents) in files {
			let path = root.join(path);
			std::fs::create_dir_all(path.parent().unwrap()).unwrap();
			std::fs::write(path, contents).unwrap();
		}
	}

	#[test]
	fn identical_trees_produce_identical_digests() {
		let left = tempfile::TempDir::new().unwrap();
		let right = tempfile::TempDir::new().unwrap();
		let files = [("src/main.rs", "fn main() {}"), ("Cargo.toml", "[package]")];
		write_tree(left.path(), &files);
		write_tree(right.path(), &files);

		let left_digest = pack_directory(left.path()).unwrap().digest;
		let right_digest = pack_directory(right.path()).unwrap().digest;
		assert_eq!(left_digest, right_digest);
	}

	#[test]
	fn changed_content_changes_the_digest() {
		let dir = tempfile::TempDir::new().unwrap();
		write_tree(dir.path(), &[("main.go", "package main")]);
		let before = pack_directory(dir.path()).unwrap().digest;

		write_tree(dir.path(), &[("main.go", "package main // changed")]);
		let after = pack_directory(dir.path()).unwrap().digest;
		assert_ne!(before, after);
	}

	#[test]
	fn packing_a_file_is_rejected() {
		let dir = tempfile::TempDir::new().unwrap();
		let file = dir.path().join("workload.yaml");
		std::fs::write(&file, "apiVersion: carto.run/v1alpha1").unwrap();

		assert!(matches!(
			pack_directory(&file),
			Err(SourceError::NotADirectory { .. })
		));
	}

	#[test]
	fn image_reference_is_content_addressed() {
		assert_eq!(
			image_reference("default", "my-workload", "abc123"),
			":default-my-workload@sha256:abc123"
		);
	}

	#[test]
	fn annotation_removed_when_source_switches_to_git() {
		let mut workload = Workload::default();
		workload.set_source_image(":default-w@sha256:abc");
		workload.set_annotation(LOCAL_SOURCE_PROXY_ANNOTATION, Some(":default-w@sha256:abc"));

		workload.set_git_url("https://example.com/repo.git");
		workload.set_git_branch("main");
		reconcile_local_source_annotation(&mut workload);

		assert!(workload.annotation(LOCAL_SOURCE_PROXY_ANNOTATION).is_none());
	}

	#[test]
	fn annotation_kept_while_source_matches() {
		let mut workload = Workload::default();
		workload.set_source_image(":default-w@sha256:abc");
		workload.set_annotation(LOCAL_SOURCE_PROXY_ANNOTATION, Some(":default-w@sha256:abc"));

		reconcile_local_source_annotation(&mut workload);

		assert_eq!(
			workload.annotation(LOCAL_SOURCE_PROXY_ANNOTATION),
			Some(":default-w@sha256:abc")
		);
	}
}
