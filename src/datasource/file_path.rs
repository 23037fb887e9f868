// Thread names
#![allow(dead_code)]
pub const MAIN_THREAD: &str = "IdleAgent";
pub const LOG_LEVEL_THREAD: &str = "LogLevelWatcher";

// Environment overrides
pub const STATE_DIR_ENV: &str = "IDLEGOVERNOR_STATE_DIR";
pub const XDG_STATE_HOME_ENV: &str = "XDG_STATE_HOME";
pub const HOME_ENV: &str = "HOME";

// State directory layout
pub const ROOT_STATE_DIR: &str = "/var/lib/idlegovernor";
pub const USER_STATE_SUBDIR: &str = ".local/state";
pub const APP_DIR_NAME: &str = "idlegovernor";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATE_FILE_NAME: &str = "idle_state.json";
pub const LOG_LEVEL_FILE_NAME: &str = "log_level";

// System nodes
pub const PROC_STAT: &str = "/proc/stat";
pub const SYS_POWER_STATE: &str = "/sys/power/state";

// External facilities
pub const NVIDIA_SMI: &str = "nvidia-smi";
pub const SYSTEMD_INHIBIT: &str = "systemd-inhibit";
pub const SYSTEMCTL: &str = "systemctl";
