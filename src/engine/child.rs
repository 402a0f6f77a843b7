//! Worker processes.
//!
//! A [`ChildProcessor`] keeps one long-lived OS process per worker and talks
//! to it with JSON lines: one [`Request`] on the child's stdin, one [`Reply`]
//! back on its stdout. The loaded model lives in the child, so an abort, a
//! segfault or an OOM kill there only takes down that process. The worker
//! thread sees the pipe close, requeues the item and exits, and the pool
//! starts a replacement with a fresh child.
//!
//! [`serve`] is the child's side of the pipe.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::processor::{ProcessError, Processor, ProcessorFactory};
use crate::error::Result;
use crate::model::{ModelTag, WorkItem, WorkerId};

/// How long a child gets to exit after its stdin closes before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Parent to child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Load { model: ModelTag },
    Process { item: WorkItem },
}

/// Child to parent, one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Transient { message: String },
    Fatal { message: String },
}

impl From<std::result::Result<(), ProcessError>> for Reply {
    fn from(result: std::result::Result<(), ProcessError>) -> Self {
        match result {
            Ok(()) => Reply::Ok,
            Err(ProcessError::Transient(message)) => Reply::Transient { message },
            Err(ProcessError::Fatal(message)) => Reply::Fatal { message },
        }
    }
}

impl Reply {
    pub fn into_result(self) -> std::result::Result<(), ProcessError> {
        match self {
            Reply::Ok => Ok(()),
            Reply::Transient { message } => Err(ProcessError::Transient(message)),
            Reply::Fatal { message } => Err(ProcessError::Fatal(message)),
        }
    }
}

// ---------------------------------------------------------------------------
// Parent side
// ---------------------------------------------------------------------------

/// Program started once per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Factory starting one [`ChildProcessor`] per worker from `command`.
pub fn child_factory(command: ChildCommand) -> impl ProcessorFactory {
    move |worker_id: WorkerId| ChildProcessor::spawn(worker_id, &command)
}

/// A [`Processor`] whose work happens in a long-lived child process.
pub struct ChildProcessor {
    worker_id: WorkerId,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildProcessor {
    /// Start the child. It inherits our stderr.
    pub fn spawn(worker_id: WorkerId, command: &ChildCommand) -> std::result::Result<Self, ProcessError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .env("BATCHQ_WORKER_ID", worker_id.0.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ProcessError::fatal(format!("spawn {}: {e}", command.program.display()))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::fatal("worker process pipes were not captured"));
        };

        debug!(worker_id = %worker_id, pid = child.id(), "worker process started");
        Ok(Self {
            worker_id,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Exit status, once the child has gone.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    fn call(&mut self, request: &Request) -> std::result::Result<(), ProcessError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| ProcessError::fatal(format!("encode request: {e}")))?;
        line.push('\n');

        let sent = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(line.as_bytes()).and_then(|()| stdin.flush()),
            None => Err(ErrorKind::BrokenPipe.into()),
        };
        if let Err(e) = sent {
            return Err(self.lost(&format!("stopped reading ({e})")));
        }

        let mut reply = String::new();
        match self.stdout.read_line(&mut reply) {
            Ok(0) => Err(self.lost("closed its output")),
            Ok(_) => serde_json::from_str::<Reply>(reply.trim())
                .map_err(|e| ProcessError::fatal(format!("bad reply from worker process: {e}")))?
                .into_result(),
            Err(e) => Err(self.lost(&format!("unreadable ({e})"))),
        }
    }

    /// The child is gone or unusable. Make sure it is dead and say how it
    /// ended.
    fn lost(&mut self, what: &str) -> ProcessError {
        let pid = self.child.id();
        self.stdin = None;
        let status = match self.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            _ => {
                let _ = self.child.kill();
                match self.child.wait() {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                }
            }
        };
        warn!(worker_id = %self.worker_id, pid, %status, "worker process {what}");
        ProcessError::fatal(format!("worker process {pid} {what}: {status}"))
    }
}

impl Processor for ChildProcessor {
    fn load(&mut self, model: &ModelTag) -> std::result::Result<(), ProcessError> {
        self.call(&Request::Load {
            model: model.clone(),
        })
    }

    fn process(&mut self, item: &WorkItem) -> std::result::Result<(), ProcessError> {
        self.call(&Request::Process { item: item.clone() })
    }

    fn check(&mut self) -> std::result::Result<(), ProcessError> {
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(ProcessError::fatal(format!(
                "worker process {} exited: {status}",
                self.child.id()
            ))),
            Err(e) => Err(ProcessError::fatal(format!("poll worker process: {e}"))),
        }
    }
}

impl Drop for ChildProcessor {
    fn drop(&mut self) {
        // Closing stdin ends the child's request loop.
        self.stdin = None;
        let deadline = Instant::now() + EXIT_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Ok(Some(_)) | Err(_) => return,
            }
        }
        warn!(worker_id = %self.worker_id, pid = self.child.id(), "worker process did not exit, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ---------------------------------------------------------------------------
// Child side
// ---------------------------------------------------------------------------

/// Answer requests from `input` with `processor` until `input` ends.
///
/// Nothing but replies may be written to `output`.
pub fn serve<P>(processor: &mut P, input: impl BufRead, mut output: impl Write) -> Result<()>
where
    P: Processor + ?Sized,
{
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = serde_json::from_str(line)?;
        let result = match &request {
            Request::Load { model } => processor.load(model),
            Request::Process { item } => processor.process(item),
        };
        serde_json::to_writer(&mut output, &Reply::from(result))?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Default)]
    struct Echo {
        loaded: Vec<ModelTag>,
    }

    impl Processor for Echo {
        fn load(&mut self, model: &ModelTag) -> std::result::Result<(), ProcessError> {
            self.loaded.push(model.clone());
            Ok(())
        }

        fn process(&mut self, item: &WorkItem) -> std::result::Result<(), ProcessError> {
            match item.file_key() {
                "busy.wav" => Err(ProcessError::transient("device busy")),
                "bad.wav" => Err(ProcessError::fatal("corrupt header")),
                _ => Ok(()),
            }
        }
    }

    fn request_lines(requests: &[Request]) -> String {
        requests
            .iter()
            .map(|r| serde_json::to_string(r).unwrap() + "\n")
            .collect()
    }

    #[test]
    fn serve_answers_every_request_in_order() {
        let model = ModelTag::from("m.onnx");
        let item = |key: &str| Request::Process {
            item: WorkItem::new("in", "out", key, model.clone()),
        };
        let input = request_lines(&[
            Request::Load {
                model: model.clone(),
            },
            item("ok.wav"),
            item("busy.wav"),
            item("bad.wav"),
        ]);

        let mut echo = Echo::default();
        let mut output = Vec::new();
        serve(&mut echo, Cursor::new(input + "\n"), &mut output).unwrap();

        let replies: Vec<Reply> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            replies,
            vec![
                Reply::Ok,
                Reply::Ok,
                Reply::Transient {
                    message: "device busy".to_string()
                },
                Reply::Fatal {
                    message: "corrupt header".to_string()
                },
            ]
        );
        assert_eq!(echo.loaded, vec![model]);
    }

    #[test]
    fn serve_rejects_garbage() {
        let mut echo = Echo::default();
        let result = serve(&mut echo, Cursor::new("not json\n"), Vec::new());
        assert!(matches!(result, Err(crate::Error::Json(_))));
    }

    #[test]
    fn reply_wire_format() {
        let json = serde_json::to_string(&Reply::Transient {
            message: "busy".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"transient","message":"busy"}"#);
        assert_eq!(
            serde_json::to_string(&Reply::Ok).unwrap(),
            r#"{"status":"ok"}"#
        );
    }
}
