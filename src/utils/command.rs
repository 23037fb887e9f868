use std::{
    env,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use wait_timeout::ChildExt;

/// 外部命令的执行结果
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stdout 和 stderr 合并后的文本，用于错误信息
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// 在 PATH 中查找可执行文件
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let p = Path::new(program);
        return p.is_file().then(|| p.to_path_buf());
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// 运行命令并等待结束，不设超时
pub fn run(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to spawn {program}"))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// 运行命令，超过 timeout 仍未结束则杀掉子进程并返回错误
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;

    // 管道缓冲区写满会让子进程阻塞，所以在独立线程里读取输出
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let started = Instant::now();
    let status = match child
        .wait_timeout(timeout)
        .with_context(|| format!("Failed to wait for {program}"))?
    {
        Some(status) => status,
        None => {
            if let Err(e) = child.kill() {
                warn!("Failed to kill timed out {program}: {e}");
            }
            if let Err(e) = child.wait() {
                debug!("Failed to reap timed out {program}: {e}");
            }
            // 孙进程可能仍持有管道，读取线程不等待，管道关闭后自行退出
            debug!("Detaching output readers of timed out {program}");
            drop((stdout_reader, stderr_reader));
            return Err(anyhow!(
                "{program} timed out after {}s",
                timeout.as_secs_f64()
            ));
        }
    };

    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();
    debug!("{program} exited with {status} after {:?}", started.elapsed());

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("Failed to read command output: {e}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_of_fast_command() {
        let out = run_with_timeout("sh", &["-c", "echo hello; echo oops >&2"], Duration::from_secs(5))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.combined(), "hello\noops");
    }

    #[test]
    fn kills_command_exceeding_timeout() {
        let started = Instant::now();
        let err = run_with_timeout("sleep", &["5"], Duration::from_millis(200)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_does_not_wait_for_grandchild_holding_pipes() {
        let started = Instant::now();
        let err = run_with_timeout("sh", &["-c", "sleep 5 & sleep 5"], Duration::from_millis(200))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn reports_non_zero_exit_without_timeout() {
        let out = run_with_timeout("sh", &["-c", "echo denied >&2; exit 3"], Duration::from_secs(5))
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.combined(), "denied");
    }

    #[test]
    fn finds_shell_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }
}
