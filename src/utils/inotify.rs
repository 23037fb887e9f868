use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result, anyhow};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::debug;

#[derive(Debug, Clone)]
pub struct SimpleEvent {
    pub mask: EventMask,
    pub name: Option<String>,
}

/// 简单的 inotify 封装，按目录监控，调用方按文件名过滤事件
pub struct InotifyWatcher {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, String>,
}

impl InotifyWatcher {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init().with_context(|| "Failed to initialize inotify")?;

        Ok(Self {
            inotify,
            watches: HashMap::new(),
        })
    }

    pub fn add<P: AsRef<Path>>(&mut self, path: P, mask: WatchMask) -> Result<()> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .with_context(|| format!("Invalid path: {}", path_ref.display()))?;

        // 监控对象本身被删除或移走时也要收到通知
        let mask = mask | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;

        let wd = self
            .inotify
            .watches()
            .add(path_ref, mask)
            .with_context(|| format!("Failed to add watch for: {}", path_ref.display()))?;

        self.watches.insert(wd, path_str.to_string());

        Ok(())
    }

    /// 阻塞等待一批事件。所有监控都失效后返回错误，避免永久阻塞
    pub fn wait_and_handle(&mut self) -> Result<Vec<SimpleEvent>> {
        let mut buffer = [0; 4096];
        let mut simple_events = Vec::new();

        let events = self
            .inotify
            .read_events_blocking(&mut buffer)
            .with_context(|| "Failed to read inotify events")?;

        for event in events {
            if event.mask.contains(EventMask::IGNORED) {
                if let Some(path) = self.watches.remove(&event.wd) {
                    debug!("Watch removed by kernel: {path}");
                }
                continue;
            }

            simple_events.push(SimpleEvent {
                mask: event.mask,
                name: event.name.map(|n| n.to_string_lossy().into_owned()),
            });
        }

        if self.watches.is_empty() {
            return Err(anyhow!("No inotify watches left"));
        }

        Ok(simple_events)
    }
}
