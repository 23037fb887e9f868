use std::time::Duration;

use anyhow::{Result, anyhow};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{datasource::file_path::SYSTEMD_INHIBIT, utils::command::run_with_timeout};

/// 外部的休眠抑制登记表，返回当前持有者名称
pub trait InhibitorRegistry {
    fn active_inhibitors(&self) -> Result<Vec<String>>;
}

// WHO UID USER PID COMM WHAT WHY MODE
// WHO 和 WHY 可以包含空格，其余列不会
static INHIBIT_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?P<who>.+?)\s+(?P<uid>\d+)\s+(?P<user>\S+)\s+(?P<pid>\d+)\s+(?P<comm>\S+)\s+(?P<what>[a-z:-]+)\s+(?P<why>.*?)\s+(?P<mode>block|delay)\s*$",
    )
    .expect("inhibitor row regex is valid")
});

/// 从 `systemd-inhibit --list --no-legend` 输出中提取阻止休眠的持有者
pub fn parse_inhibitor_list(output: &str) -> Vec<String> {
    let mut holders: Vec<String> = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let Some(caps) = INHIBIT_ROW.captures(line) else {
            debug!("Skipping unparsable inhibitor row: {line}");
            continue;
        };

        let what = &caps["what"];
        let mode = &caps["mode"];
        if mode != "block" || !what.split(':').any(|w| w == "sleep") {
            continue;
        }

        let who = caps["who"].trim().to_string();
        if !holders.contains(&who) {
            holders.push(who);
        }
    }

    holders
}

/// 通过 systemd-inhibit 查询 logind 的抑制锁
pub struct SystemdInhibitorRegistry {
    command_timeout: Duration,
}

impl SystemdInhibitorRegistry {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

impl InhibitorRegistry for SystemdInhibitorRegistry {
    fn active_inhibitors(&self) -> Result<Vec<String>> {
        let output = run_with_timeout(
            SYSTEMD_INHIBIT,
            &["--list", "--no-pager", "--no-legend"],
            self.command_timeout,
        )?;

        if !output.success() {
            return Err(anyhow!(
                "{SYSTEMD_INHIBIT} --list failed ({}): {}",
                output.status,
                output.combined()
            ));
        }

        let holders = parse_inhibitor_list(&output.stdout);
        debug!("Active sleep inhibitors: {holders:?}");
        Ok(holders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
     ModemManager    0 root     1021 ModemManager     sleep                        ModemManager needs to reset devices           delay
     NetworkManager  0 root     1003 NetworkManager   sleep                        NetworkManager needs to turn off networks     delay
     GNOME Shell  1000 alice    2345 gnome-shell      sleep                        GNOME needs to lock the screen                delay
     Unattended Upgrades Shutdown 0 root 1450 unattended-upgr shutdown Stop ongoing upgrades or perform upgrades before shutdown delay
     ollama          0 root     7788 ollama           sleep:idle                   model download in progress                    block
     ollama          0 root     7790 ollama           sleep                        second lock                                   block
     backup          0 root     8000 rsync            shutdown                     nightly backup                                block
";

    #[test]
    fn only_blocking_sleep_locks_count() {
        assert_eq!(parse_inhibitor_list(SAMPLE), vec!["ollama".to_string()]);
    }

    #[test]
    fn holder_names_may_contain_spaces() {
        let row = "     Jupyter Kernel 1000 bob 4242 python3 idle:sleep long training run block\n";
        assert_eq!(parse_inhibitor_list(row), vec!["Jupyter Kernel".to_string()]);
    }

    #[test]
    fn empty_listing_means_no_inhibitors() {
        assert!(parse_inhibitor_list("").is_empty());
        assert!(parse_inhibitor_list("\n\n").is_empty());
    }
}
