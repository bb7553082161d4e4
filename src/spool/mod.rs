//! Filesystem spool shared by the proxy's DIMSE services.
//!
//! Datasets are written to `<root>/<destinationAET>/` in two steps: a
//! uniquely named `.part` file that no consumer ever reads, followed by an
//! atomic rename to the final suffix. A plaintext `.info` sidecar with the
//! same stem captures the routing context (calling AET, override AET) that
//! cannot be recovered from the dataset itself. The scheduler drains final
//! files; `.part` orphans from crashed writers are reclaimed by the
//! recovery sweep.

pub mod recovery;

use dicom::object::{FileMetaTable, InMemDicomObject};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// In-progress write, never visible as a final file.
pub const PART_SUFFIX: &str = "part";
/// Final dataset file, ready for scheduler pickup.
pub const DCM_SUFFIX: &str = "dcm";
/// Deferred MPPS N-CREATE half, awaiting the matching N-SET.
pub const NCREATE_SUFFIX: &str = "ncreate";
/// Routing sidecar, same stem as the dataset file.
pub const INFO_SUFFIX: &str = "info";
/// Transmission-in-flight marker set by the scheduler.
pub const SND_SUFFIX: &str = "snd";
/// Codec scratch files under the C-STORE root.
pub const TMP_BULK_SUFFIX: &str = "tmpBulkData";

#[derive(Debug, Error)]
pub enum SpoolError {
	#[error("Failed to create spool directory {path}: {source}")]
	CreateDirectory {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to create spool file {path}: {source}")]
	CreateFile {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to write spool file {path}: {source}")]
	WriteFile {
		path: PathBuf,
		source: dicom::object::WriteError,
	},
	#[error("Failed to write info file {path}: {source}")]
	WriteInfo {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to rename file")]
	Rename {
		from: PathBuf,
		to: PathBuf,
		source: std::io::Error,
	},
	#[error("Failed to read spool file {path}: {source}")]
	ReadFile {
		path: PathBuf,
		source: dicom::object::ReadError,
	},
}

/// Everything needed to persist one dataset for one destination.
pub struct SpoolEntry<'a> {
	pub base_dir: &'a Path,
	pub destination_aet: &'a str,
	pub fmi: FileMetaTable,
	pub data: &'a InMemDicomObject,
	/// AE title of the peer the request was accepted from.
	pub source_aet: &'a str,
	/// Optional calling-AET override recorded for the scheduled forward.
	pub use_calling_aet: Option<&'a str>,
}

/// Writes the dataset and its `.info` sidecar into the destination
/// directory under a unique `.part` name and returns the temp path.
///
/// On any I/O error both files are removed again so that no half-written
/// entry survives.
pub fn create(entry: &SpoolEntry<'_>) -> Result<PathBuf, SpoolError> {
	let dir = entry.base_dir.join(entry.destination_aet);
	fs::create_dir_all(&dir).map_err(|source| SpoolError::CreateDirectory {
		path: dir.clone(),
		source,
	})?;

	let path = dir.join(format!("dcm{}.{PART_SUFFIX}", Uuid::new_v4().simple()));
	let info_path = path.with_extension(INFO_SUFFIX);

	info!("create {}", path.display());
	if let Err(err) = write_entry(entry, &path, &info_path) {
		// Leave no partial pair behind.
		let _ = fs::remove_file(&path);
		let _ = fs::remove_file(&info_path);
		warn!(
			"failed to create {} and/or {}",
			path.display(),
			info_path.display()
		);
		return Err(err);
	}

	Ok(path)
}

fn write_entry(entry: &SpoolEntry<'_>, path: &Path, info_path: &Path) -> Result<(), SpoolError> {
	let mut file = File::create(path).map_err(|source| SpoolError::CreateFile {
		path: path.to_path_buf(),
		source,
	})?;

	let object = entry.data.clone().with_exact_meta(entry.fmi.clone());
	object
		.write_all(&mut file)
		.map_err(|source| SpoolError::WriteFile {
			path: path.to_path_buf(),
			source,
		})?;
	file.sync_all().map_err(|source| SpoolError::CreateFile {
		path: path.to_path_buf(),
		source,
	})?;

	debug!("create {}", info_path.display());
	let mut info = File::create(info_path).map_err(|source| SpoolError::WriteInfo {
		path: info_path.to_path_buf(),
		source,
	})?;
	let mut contents = format!("source-aet={}\n", entry.source_aet);
	if let Some(use_calling_aet) = entry.use_calling_aet {
		contents.push_str(&format!("use-calling-aet={use_calling_aet}\n"));
	}
	info.write_all(contents.as_bytes())
		.and_then(|()| info.sync_all())
		.map_err(|source| SpoolError::WriteInfo {
			path: info_path.to_path_buf(),
			source,
		})?;

	Ok(())
}

/// Promotes a `.part` file to `<stem>.<suffix>` (`dcm` or `ncreate`) and
/// stamps the mtime so the scheduler sees a fresh entry. The sidecar is
/// moved to the final stem first, so a visible dataset file always has its
/// `.info` next to it.
pub fn rename(temp_path: &Path, stem: &str, suffix: &str) -> Result<PathBuf, SpoolError> {
	let dir = temp_path.parent().unwrap_or_else(|| Path::new(""));
	let final_path = dir.join(format!("{stem}.{suffix}"));

	let info_temp = temp_path.with_extension(INFO_SUFFIX);
	let info_final = dir.join(format!("{stem}.{INFO_SUFFIX}"));
	fs::rename(&info_temp, &info_final).map_err(|source| SpoolError::Rename {
		from: info_temp.clone(),
		to: info_final.clone(),
		source,
	})?;

	fs::rename(temp_path, &final_path).map_err(|source| SpoolError::Rename {
		from: temp_path.to_path_buf(),
		to: final_path.clone(),
		source,
	})?;

	match File::options().write(true).open(&final_path) {
		Ok(file) => {
			if let Err(err) = file.set_modified(SystemTime::now()) {
				warn!("failed to update mtime of {}: {err}", final_path.display());
			}
		}
		Err(err) => warn!("failed to update mtime of {}: {err}", final_path.display()),
	}

	info!("RENAME {} to {}", temp_path.display(), final_path.display());
	Ok(final_path)
}

/// Removes a final dataset file together with its sidecar and prunes the
/// destination directory if it became empty. Failures are logged, never
/// raised; deletion is cleanup, not correctness.
pub fn delete(path: &Path) {
	match fs::remove_file(path) {
		Ok(()) => debug!("DELETE {}", path.display()),
		Err(err) => warn!("failed to DELETE {}: {err}", path.display()),
	}

	let info_path = path.with_extension(INFO_SUFFIX);
	match fs::remove_file(&info_path) {
		Ok(()) => debug!("DELETE {}", info_path.display()),
		Err(err) => debug!("failed to DELETE {}: {err}", info_path.display()),
	}

	if let Some(parent) = path.parent() {
		let is_empty = fs::read_dir(parent)
			.map(|mut entries| entries.next().is_none())
			.unwrap_or(false);
		if is_empty {
			if let Err(err) = fs::remove_dir(parent) {
				debug!("failed to prune {}: {err}", parent.display());
			}
		}
	}
}

/// Reads a spooled Part-10 file back into memory.
pub fn read(path: &Path) -> Result<dicom::object::DefaultDicomObject, SpoolError> {
	dicom::object::open_file(path).map_err(|source| SpoolError::ReadFile {
		path: path.to_path_buf(),
		source,
	})
}
