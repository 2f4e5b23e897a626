//! Working-directory materialization: template copy plus submission overlay.

use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkdirError {
    #[error("io error while preparing working directory: {0}")]
    Io(#[from] io::Error),
    #[error("cannot unpack {archive}: {source}")]
    Unpack {
        archive: String,
        #[source]
        source: zip::result::ZipError,
    },
}

/// Build `TMP_DIR/judgement_for_{id}` from scratch: remove any prior copy,
/// copy the cached template tree in, then unpack the submission zip directly
/// over the template root.
///
/// Layout contract: submission archives are rooted, so their entries land on
/// the template's own structure (`src/…`, `CMakeLists.txt`, …) and replace
/// the template's placeholders file by file.
pub fn materialize(template: &Path, workdir: &Path, submission_zip: &Path) -> Result<(), WorkdirError> {
    if workdir.exists() {
        std::fs::remove_dir_all(workdir)?;
    }
    copy_dir_all(template, workdir)?;
    unpack_zip(submission_zip, workdir)?;
    Ok(())
}

pub fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), WorkdirError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|source| WorkdirError::Unpack {
        archive: archive.display().to_string(),
        source,
    })?;
    zip.extract(dest).map_err(|source| WorkdirError::Unpack {
        archive: archive.display().to_string(),
        source,
    })
}

pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn copies_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("inner")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("inner/b.txt"), "b").unwrap();

        let dst = dir.path().join("dst");
        copy_dir_all(&src, &dst).unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(dst.join("inner/b.txt")).unwrap(), "b");
    }

    #[test]
    fn submission_overlays_template_root() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        std::fs::create_dir_all(template.join("src")).unwrap();
        std::fs::write(template.join("CMakeLists.txt"), "project(dandelion)").unwrap();
        std::fs::write(template.join("src/geo.cc"), "// placeholder").unwrap();

        let submission = dir.path().join("submission.zip");
        write_zip(&submission, &[("src/geo.cc", "// student code")]);

        let workdir = dir.path().join("judgement_for_1");
        // A leftover from a previous run must not survive.
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::write(workdir.join("stale"), "old").unwrap();

        materialize(&template, &workdir, &submission).unwrap();
        assert!(!workdir.join("stale").exists());
        assert_eq!(
            std::fs::read_to_string(workdir.join("CMakeLists.txt")).unwrap(),
            "project(dandelion)"
        );
        assert_eq!(
            std::fs::read_to_string(workdir.join("src/geo.cc")).unwrap(),
            "// student code"
        );
    }
}
