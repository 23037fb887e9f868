use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process,
};

use anyhow::{Context, Result};
use log::debug;

pub fn check_read_simple<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists() && path.as_ref().is_file()
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path_ref = path.as_ref();
    let mut file = File::open(path_ref)
        .with_context(|| format!("Failed to open file for reading: {}", path_ref.display()))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Failed to read from file: {}", path_ref.display()))?;

    Ok(content)
}

/// 临时文件与目标文件位于同一目录，保证 rename 是原子操作
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp.{}", name, process::id()))
}

/// 原子写入：先写临时文件并 fsync，再 rename 覆盖目标文件。
/// 并发读取者要么看到旧内容，要么看到完整的新内容。
pub fn write_file_atomic<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path_ref = path.as_ref();

    if let Some(parent) = path_ref.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let tmp_path = temp_path_for(path_ref);
    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&tmp_path)
            .with_context(|| format!("Failed to open file for writing: {}", tmp_path.display()))?;

        file.write_all(content.as_ref())
            .with_context(|| format!("Failed to write to file: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync file: {}", tmp_path.display()))?;

        let mut perms = file
            .metadata()
            .with_context(|| format!("Failed to get metadata for: {}", tmp_path.display()))?
            .permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&tmp_path, perms)
            .with_context(|| format!("Failed to set permissions for: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, path_ref).with_context(|| {
            format!(
                "Failed to replace {} with {}",
                path_ref.display(),
                tmp_path.display()
            )
        })
    })();

    if result.is_err() {
        // 失败时清理残留的临时文件
        if let Err(e) = fs::remove_file(&tmp_path) {
            debug!("Failed to remove temp file {}: {}", tmp_path.display(), e);
        }
    }

    result
}

/// 删除文件，文件本就不存在时视为成功
pub fn remove_file_idempotent<P: AsRef<Path>>(path: P) -> Result<()> {
    let path_ref = path.as_ref();
    match fs::remove_file(path_ref) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("File already absent: {}", path_ref.display());
            Ok(())
        }
        Err(e) => {
            Err(e).with_context(|| format!("Failed to remove file: {}", path_ref.display()))
        }
    }
}
