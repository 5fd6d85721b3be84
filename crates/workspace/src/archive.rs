//! Zip snapshot of a workspace subtree.

use anyhow::{Context, Result};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zips `dir` recursively. Entries are sorted for stable output; files get
/// mode 0644 and forward-slash UTF-8 paths.
pub(crate) fn zip_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut files = Vec::new();
    collect(dir, dir, &mut files)?;
    files.sort();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for rel in files {
        let name = rel
            .to_str()
            .with_context(|| format!("non-utf8 path in workspace: {}", rel.display()))?
            .replace('\\', "/");
        writer.start_file(name, options)?;
        let mut file = std::fs::File::open(dir.join(&rel))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        writer.write_all(&buf)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// Zips several directories into one archive, each under its own prefix.
pub(crate) fn zip_dirs(entries: &[(String, std::path::PathBuf)]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for (prefix, dir) in entries {
        let mut files = Vec::new();
        collect(dir, dir, &mut files)?;
        files.sort();
        for rel in files {
            let name = rel
                .to_str()
                .with_context(|| format!("non-utf8 path in workspace: {}", rel.display()))?
                .replace('\\', "/");
            writer.start_file(format!("{prefix}/{name}"), options)?;
            let mut file = std::fs::File::open(dir.join(&rel))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            writer.write_all(&buf)?;
        }
    }

    Ok(writer.finish()?.into_inner())
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, out)?;
        } else {
            out.push(path.strip_prefix(root)?.to_path_buf());
        }
    }
    Ok(())
}
