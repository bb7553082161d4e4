//! Startup/shutdown cleanup of the spool directories.
//!
//! The sweep restores in-flight `.snd` markers to their pre-transmit form,
//! removes `.part` and codec scratch files, and drops datasets whose `.info`
//! sidecar is missing. Running it on a clean tree is a no-op.

use crate::config::ApplicationEntityConfig;
use crate::spool::{DCM_SUFFIX, INFO_SUFFIX, PART_SUFFIX, SND_SUFFIX, TMP_BULK_SUFFIX};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Sweeps every spool root of every proxy AE. `action` names the occasion
/// (`start-up` or `shut-down`) in the logs.
pub fn reset_spool_files(aets: &[ApplicationEntityConfig], action: &str) {
	for ae in aets {
		info!("Reset spool files for {} on {action}", ae.aet);
		let [cstore, naction, nevent, ncreate, nset] = ae.spool.sweep_roots();
		sweep(cstore, true, action);
		sweep(naction, false, action);
		sweep(nevent, false, action);
		sweep(ncreate, false, action);
		sweep(nset, false, action);
	}
}

/// Sweeps one spool root. Descends depth-first into sub-directories only,
/// one level per step. `cstore_root` enables the checks that apply to the
/// C-STORE root alone: codec scratch files and datasets missing their
/// sidecar. Every action is logged; none is fatal.
pub fn sweep(root: &Path, cstore_root: bool, action: &str) {
	let entries = match fs::read_dir(root) {
		Ok(entries) => entries,
		Err(err) => {
			warn!("failed to list {} on {action}: {err}", root.display());
			return;
		}
	};

	for entry in entries {
		let Ok(entry) = entry else { continue };
		let path = entry.path();

		if path.is_dir() {
			sweep(&path, cstore_root, action);
			continue;
		}

		let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
			continue;
		};

		if let Some(stem) = name.strip_suffix(&format!(".{SND_SUFFIX}")) {
			restore_snd_file(&path, stem, action);
		} else if name.ends_with(&format!(".{PART_SUFFIX}")) {
			delete_file(&path, action);
		} else if cstore_root && name.ends_with(&format!(".{TMP_BULK_SUFFIX}")) {
			delete_file(&path, action);
		} else if cstore_root
			&& name.ends_with(&format!(".{DCM_SUFFIX}"))
			&& !path.with_extension(INFO_SUFFIX).exists()
		{
			info!(
				"Delete incomplete dcm file {} (without info file) on {action}",
				path.display()
			);
			if let Err(err) = fs::remove_file(&path) {
				warn!("Failed to delete {} on {action}: {err}", path.display());
			}
		}
	}
}

/// Strips the `.snd` marker so the scheduler retries the transmission.
/// A marker whose remaining name is empty is malformed and deleted instead.
fn restore_snd_file(path: &Path, stem: &str, action: &str) {
	if stem.is_empty() {
		delete_file(path, action);
		return;
	}

	let target = path.with_file_name(stem);
	match fs::rename(path, &target) {
		Ok(()) => info!(
			"Rename {} to {} on {action}",
			path.display(),
			target.display()
		),
		Err(err) => warn!(
			"Failed to rename {} to {} on {action}: {err}",
			path.display(),
			target.display()
		),
	}
}

fn delete_file(path: &Path, action: &str) {
	match fs::remove_file(path) {
		Ok(()) => info!("Delete {} on {action}", path.display()),
		Err(err) => warn!("Failed to delete {} on {action}: {err}", path.display()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn touch(path: &Path) {
		fs::write(path, b"x").unwrap();
	}

	#[test]
	fn sweep_cleans_partial_and_orphan_files() {
		let tmp = tempfile::tempdir().unwrap();
		let dir = tmp.path().join("ARCHIVE");
		fs::create_dir_all(&dir).unwrap();

		touch(&dir.join("foo.part"));
		touch(&dir.join("bar.dcm"));
		touch(&dir.join("baz.dcm"));
		touch(&dir.join("baz.info"));
		touch(&dir.join("qux.snd"));
		touch(&dir.join("scratch.tmpBulkData"));

		sweep(tmp.path(), true, "start-up");

		assert!(!dir.join("foo.part").exists());
		assert!(!dir.join("bar.dcm").exists());
		assert!(baz_pair_exists(&dir));
		assert!(!dir.join("qux.snd").exists());
		assert!(dir.join("qux").exists());
		assert!(!dir.join("scratch.tmpBulkData").exists());
	}

	fn baz_pair_exists(dir: &Path) -> bool {
		dir.join("baz.dcm").exists() && dir.join("baz.info").exists()
	}

	#[test]
	fn sweep_is_idempotent() {
		let tmp = tempfile::tempdir().unwrap();
		let dir = tmp.path().join("ARCHIVE");
		fs::create_dir_all(&dir).unwrap();
		touch(&dir.join("baz.dcm"));
		touch(&dir.join("baz.info"));

		sweep(tmp.path(), true, "start-up");
		sweep(tmp.path(), true, "start-up");

		assert!(baz_pair_exists(&dir));
	}

	#[test]
	fn orphan_dcm_outside_cstore_root_survives() {
		// N-CREATE/N-SET roots also hold .dcm files; losing the sidecar
		// there must not cost the dataset.
		let tmp = tempfile::tempdir().unwrap();
		let dir = tmp.path().join("ARCHIVE");
		fs::create_dir_all(&dir).unwrap();
		touch(&dir.join("1.2.3.dcm"));

		sweep(tmp.path(), false, "start-up");

		assert!(dir.join("1.2.3.dcm").exists());
	}

	#[test]
	fn sweep_keeps_ncreate_intermediates() {
		let tmp = tempfile::tempdir().unwrap();
		let dir = tmp.path().join("SR_ARCHIVE");
		fs::create_dir_all(&dir).unwrap();
		touch(&dir.join("9.9.ncreate"));
		touch(&dir.join("9.9.info"));

		sweep(tmp.path(), false, "start-up");

		assert!(dir.join("9.9.ncreate").exists());
		assert!(dir.join("9.9.info").exists());
	}

	#[test]
	fn sweep_missing_root_is_harmless() {
		let tmp = tempfile::tempdir().unwrap();
		sweep(&tmp.path().join("does-not-exist"), false, "start-up");
	}
}
