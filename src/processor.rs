use crate::config::Config;
use crate::error::RelayError;
use crate::workspace::ScopedDir;
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io::ErrorKind as StdIoErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const OUTPUT_DIR_ENV: &str = "VIDEO_OUTPUT_DIR";
pub const OUTPUT_PATH_ENV: &str = "VIDEO_OUTPUT_PATH";

const OUTPUT_DIR_TOKEN: &str = "{output_dir}";
const OUTPUT_PATH_TOKEN: &str = "{output_path}";

/// The external program that turns an uploaded video into a result file.
///
/// It gets the raw upload on stdin and is told where to write through
/// `VIDEO_OUTPUT_DIR` / `VIDEO_OUTPUT_PATH` and the `{output_dir}` /
/// `{output_path}` argument tokens. Exit status 0 means success.
#[derive(Debug, Clone)]
pub struct Processor {
    pub program: String,
    pub args: Vec<String>,
    pub output_file: String,
    pub timeout: Duration,
}

impl Processor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.processor.clone(),
            args: config.processor_args.clone(),
            output_file: config.output_file.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build_args(&self, scope: &ScopedDir) -> Vec<String> {
        let output_dir = scope.path().to_string_lossy();
        let output_path = scope.output_path(&self.output_file);
        let output_path = output_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(OUTPUT_DIR_TOKEN, &output_dir)
                    .replace(OUTPUT_PATH_TOKEN, &output_path)
            })
            .collect()
    }

    /// Run the processor to completion on `input`, returning the path of the
    /// artifact it was asked to produce. The artifact's existence is not
    /// checked here.
    pub async fn run(&self, input: Bytes, scope: &ScopedDir) -> Result<PathBuf, RelayError> {
        let request_id = scope.request_id();
        let output_path = scope.output_path(&self.output_file);

        let mut child = Command::new(&self.program)
            .args(self.build_args(scope))
            .env(OUTPUT_DIR_ENV, scope.path())
            .env(OUTPUT_PATH_ENV, &output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                error!(%request_id, program = %self.program, %error, "Failed to spawn processor");
                RelayError::ProcessorSpawn(error)
            })?;

        let group = ProcessGroup::of(&child, request_id);
        info!(%request_id, pid = ?child.id(), size = input.len(), "Processor started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(request_id, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(request_id, "stderr", stderr));
        }
        let stdin = child.stdin.take();

        let status = match tokio::time::timeout(
            self.timeout,
            feed_and_wait(request_id, &mut child, stdin, input),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(%request_id, timeout = ?self.timeout, "Processor timed out, killing process group");
                group.kill();
                if let Err(error) = child.kill().await {
                    error!(%request_id, %error, "Failed to kill processor");
                }
                return Err(RelayError::ProcessorTimeout(self.timeout));
            }
        };

        if !status.success() {
            error!(%request_id, exit_code = ?status.code(), "Processor failed");
            return Err(RelayError::ProcessorFailed(status));
        }

        info!(%request_id, "Processor finished");
        Ok(output_path)
    }
}

/// The processor runs as leader of its own process group. Dropping this
/// SIGKILLs the whole group, so helpers the processor started die with it
/// on timeout, on a dropped request and after a normal exit.
struct ProcessGroup {
    request_id: Uuid,
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn of(child: &Child, request_id: Uuid) -> Self {
        Self {
            request_id,
            pgid: child.id().map(|id| Pid::from_raw(id as i32)),
        }
    }

    fn kill(&self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!(request_id = %self.request_id, %pgid, "Processor group killed"),
            Err(Errno::ESRCH) => {}
            Err(error) => {
                warn!(request_id = %self.request_id, %pgid, %error, "Failed to kill processor group");
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn feed_and_wait(
    request_id: Uuid,
    child: &mut Child,
    stdin: Option<ChildStdin>,
    input: Bytes,
) -> Result<ExitStatus, RelayError> {
    let feed = async move {
        let Some(mut stdin) = stdin else {
            return;
        };
        // stdin is closed when dropped at the end of this block
        match stdin.write_all(&input).await {
            Ok(()) => debug!(%request_id, "Processor stdin written"),
            Err(error) if error.kind() == StdIoErrorKind::BrokenPipe => {
                warn!(%request_id, "Processor closed stdin before reading all input");
            }
            Err(error) => warn!(%request_id, %error, "Failed to write processor stdin"),
        }
    };

    let ((), status) = tokio::join!(feed, child.wait());
    status.map_err(|error| {
        error!(%request_id, %error, "Failed to wait for processor");
        RelayError::ProcessorIo(error)
    })
}

async fn forward_lines<R>(request_id: Uuid, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(%request_id, stream, "{line}"),
            Ok(None) => break,
            Err(error) => {
                debug!(%request_id, stream, %error, "Processor output stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::init_workspace;

    fn sh(script: &str, timeout: Duration) -> Processor {
        Processor {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            output_file: "video.mp4".into(),
            timeout,
        }
    }

    #[test]
    fn test_build_args_substitutes_scoped_paths() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();

        let processor = Processor {
            program: "infer".into(),
            args: vec![
                "--out".into(),
                "{output_path}".into(),
                "--dir={output_dir}".into(),
            ],
            output_file: "result.mp4".into(),
            timeout: Duration::from_secs(1),
        };

        let args = processor.build_args(&scope);
        assert_eq!(args[0], "--out");
        assert_eq!(
            args[1],
            scope.output_path("result.mp4").to_string_lossy().as_ref()
        );
        assert_eq!(
            args[2],
            format!("--dir={}", scope.path().to_string_lossy())
        );
        assert_eq!(processor.command_line(), "infer --out {output_path} --dir={output_dir}");
    }

    #[tokio::test]
    async fn test_run_writes_stdin_to_scoped_output() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();

        let processor = sh("cat > \"$VIDEO_OUTPUT_PATH\"", Duration::from_secs(10));
        let path = processor
            .run(Bytes::from_static(b"mp4 bytes"), &scope)
            .await
            .unwrap();

        assert_eq!(path, scope.output_path("video.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), b"mp4 bytes");
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();

        let processor = sh("cat > /dev/null; exit 3", Duration::from_secs(10));
        let err = processor
            .run(Bytes::from_static(b"x"), &scope)
            .await
            .unwrap_err();

        match err {
            RelayError::ProcessorFailed(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_ignores_unread_stdin() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();

        // exits without touching stdin, larger than a pipe buffer
        let processor = sh("printf ok > \"$VIDEO_OUTPUT_PATH\"", Duration::from_secs(10));
        let input = Bytes::from(vec![0u8; 1024 * 1024]);
        let path = processor.run(input, &scope).await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();

        let processor = Processor {
            program: "/nonexistent/video-processor".into(),
            args: vec![],
            output_file: "video.mp4".into(),
            timeout: Duration::from_secs(1),
        };
        let err = processor
            .run(Bytes::from_static(b"x"), &scope)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::ProcessorSpawn(_)));
    }

    fn process_alive(pid: i32) -> bool {
        // zombies count as gone, only the reaper is missing
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z"),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_run_timeout_kills_background_helpers() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();
        let pid_file = root.path().join("helper.pid");

        let processor = sh(
            &format!("cat > /dev/null; sleep 30 & echo $! > '{}'; wait", pid_file.display()),
            Duration::from_millis(500),
        );
        let err = processor
            .run(Bytes::from_static(b"x"), &scope)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ProcessorTimeout(_)));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..50 {
            alive = process_alive(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "helper {pid} survived the timeout");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let root = tempfile::tempdir().unwrap();
        let jobs = init_workspace(root.path()).unwrap();
        let scope = ScopedDir::create(&jobs, Uuid::new_v4()).unwrap();

        let processor = sh("sleep 30", Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = processor
            .run(Bytes::from_static(b"x"), &scope)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::ProcessorTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
