use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use inotify::WatchMask;
use log::{debug, info};

use crate::{
    datasource::file_path::LOG_LEVEL_THREAD,
    utils::{inotify::InotifyWatcher, logger::update_log_level},
};

/// 监控状态目录中的 log_level 文件，变更后立即生效
pub fn monitor_log_level(log_level_path: PathBuf) -> Result<()> {
    info!("{LOG_LEVEL_THREAD} Start");

    let dir = log_level_path
        .parent()
        .map(Path::to_path_buf)
        .with_context(|| format!("No parent dir for {}", log_level_path.display()))?;
    let file_name = log_level_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    info!("Using log level path: {}", log_level_path.display());

    // 监控目录而不是文件本身：文件可以在启动后才创建，也可以被整体替换
    let mut inotify = InotifyWatcher::new()?;
    inotify.add(
        &dir,
        WatchMask::CLOSE_WRITE | WatchMask::MODIFY | WatchMask::CREATE | WatchMask::MOVED_TO,
    )?;

    loop {
        let events = inotify.wait_and_handle()?;

        if let Some(event) = events
            .iter()
            .find(|e| e.name.as_deref() == Some(file_name.as_str()))
        {
            debug!("Log level file changed: {:?}", event.mask);
            update_log_level(&log_level_path);
        }
    }
}
