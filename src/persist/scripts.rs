// src/persist/scripts.rs

//! Storage of uploaded task scripts: single files and ZIP bundles.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::errors::Result;
use crate::persist::Persistence;
use crate::types::TaskId;

/// Entry-point names probed, in order, when a bundle has several scripts.
const MAIN_SCRIPT_CANDIDATES: &[&str] = &["main.py", "app.py", "run.py", "start.py"];

/// Outcome of unpacking a ZIP bundle into a task's script directory.
#[derive(Debug, Clone)]
pub struct ZipUnpackResult {
    pub script_dir: PathBuf,
    pub saved_files: Vec<PathBuf>,
    /// Detected entry point, if any `*.py` file was present.
    pub main_script: Option<PathBuf>,
}

impl Persistence {
    /// Store one uploaded script under `scripts/<task_id>/` and return its
    /// final path. The filename is stripped to its base name first.
    pub fn save_script_file(
        &self,
        content: &[u8],
        filename: &str,
        task_id: TaskId,
    ) -> Result<PathBuf> {
        let safe_name = Path::new(filename)
            .file_name()
            .with_context(|| format!("invalid script filename {filename:?}"))?;

        let script_dir = self.task_scripts_dir(task_id);
        fs::create_dir_all(&script_dir)
            .with_context(|| format!("creating script directory {script_dir:?}"))?;

        let path = script_dir.join(safe_name);
        fs::write(&path, content).with_context(|| format!("writing script {path:?}"))?;

        info!(task_id, script = %path.display(), "script file saved");
        Ok(path)
    }

    /// Extract a ZIP bundle into `scripts/<task_id>/`, preserving the
    /// archive's directory structure, and detect a likely main script.
    ///
    /// The archive is staged through a temp directory so a malformed bundle
    /// never leaves a half-written script directory behind.
    pub fn unpack_zip_scripts(&self, zip_bytes: &[u8], task_id: TaskId) -> Result<ZipUnpackResult> {
        let script_dir = self.task_scripts_dir(task_id);
        fs::create_dir_all(&script_dir)
            .with_context(|| format!("creating script directory {script_dir:?}"))?;

        let staging = tempfile::tempdir().context("creating zip staging directory")?;

        let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))
            .context("opening uploaded ZIP archive")?;
        archive
            .extract(staging.path())
            .context("extracting ZIP archive")?;

        let mut saved_files = Vec::new();
        copy_tree(staging.path(), staging.path(), &script_dir, &mut saved_files)?;

        let main_script = detect_main_script(&saved_files);

        info!(
            task_id,
            files = saved_files.len(),
            script_dir = %script_dir.display(),
            "ZIP bundle unpacked"
        );

        Ok(ZipUnpackResult {
            script_dir,
            saved_files,
            main_script,
        })
    }
}

/// Copy every file under `dir` (relative to `root`) into `dst`.
fn copy_tree(
    root: &Path,
    dir: &Path,
    dst: &Path,
    saved: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("listing {dir:?}"))? {
        let entry = entry.with_context(|| format!("listing {dir:?}"))?;
        let src_path = entry.path();
        if src_path.is_dir() {
            copy_tree(root, &src_path, dst, saved)?;
        } else {
            let rel = src_path
                .strip_prefix(root)
                .expect("staged file is under staging root");
            let dst_path = dst.join(rel);
            if let Some(parent) = dst_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {parent:?}"))?;
            }
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copying {src_path:?} to {dst_path:?}"))?;
            saved.push(dst_path);
        }
    }
    Ok(())
}

/// Pick the most likely entry point among the unpacked files: a well-known
/// name first, else the first Python file.
fn detect_main_script(files: &[PathBuf]) -> Option<PathBuf> {
    let python_files: Vec<&PathBuf> = files
        .iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("py"))
        .collect();

    for candidate in MAIN_SCRIPT_CANDIDATES {
        if let Some(found) = python_files
            .iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(candidate))
        {
            return Some((*found).clone());
        }
    }

    python_files.first().map(|p| (*p).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn make_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options =
                FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn save_script_file_strips_directories_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let persist = Persistence::new(dir.path()).unwrap();

        let path = persist
            .save_script_file(b"print('hi')", "../../evil/hello.py", 4)
            .unwrap();
        assert_eq!(path, persist.task_scripts_dir(4).join("hello.py"));
        assert_eq!(fs::read_to_string(path).unwrap(), "print('hi')");
    }

    #[test]
    fn zip_unpack_detects_well_known_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let persist = Persistence::new(dir.path()).unwrap();

        let bytes = make_zip(&[
            ("util.py", "x = 1\n"),
            ("main.py", "print('main')\n"),
            ("data/config.yaml", "a: 1\n"),
        ]);
        let result = persist.unpack_zip_scripts(&bytes, 9).unwrap();

        assert_eq!(result.saved_files.len(), 3);
        assert_eq!(
            result.main_script.as_deref(),
            Some(persist.task_scripts_dir(9).join("main.py").as_path())
        );
    }

    #[test]
    fn zip_unpack_falls_back_to_first_python_file() {
        let dir = tempfile::tempdir().unwrap();
        let persist = Persistence::new(dir.path()).unwrap();

        let bytes = make_zip(&[("job.py", "print('job')\n"), ("readme.md", "hi\n")]);
        let result = persist.unpack_zip_scripts(&bytes, 2).unwrap();

        assert_eq!(
            result.main_script.as_deref(),
            Some(persist.task_scripts_dir(2).join("job.py").as_path())
        );
    }
}
