use crate::error::{CoreError, CoreResult};
use crate::io::handle::{HandleRead, HandleWrite};
use bedrock::logging;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub type ExecRead = HandleRead<ChildStdout>;
pub type ExecWrite = HandleWrite<ChildStdin>;

/// Spawns a worker subprocess and exposes its stdio as two handles.
/// Construction only records parameters; `open` performs the actual spawn
/// and connects the pipes. `free` closes stdin, waits up to the configured
/// timeout for the child to exit and then escalates to a kill.
pub struct ExecChild {
    name: String,
    program: String,
    param: Vec<String>,
    timeout: Duration,
    child: Option<Child>,
    read: Option<ExecRead>,
    write: Option<ExecWrite>,
    log: logging::Logger,
}

impl ExecChild {
    const WAIT_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new<'a, P, N, L>(
        program: P,
        param: Vec<String>,
        name: N,
        timeout: Duration,
        log: L,
    ) -> ExecChild
    where
        P: Into<String>,
        N: Into<String>,
        L: Into<Option<&'a logging::Logger>>,
    {
        ExecChild {
            name: name.into(),
            program: program.into(),
            param,
            timeout,
            child: None,
            read: None,
            write: None,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn param(&self) -> &[String] {
        &self.param
    }

    /// Spawns the child and wires up the pipes. The parent end of the
    /// child's stdout becomes the read handle and stdin the write handle;
    /// stderr is inherited so worker diagnostics reach the operator.
    pub fn open(&mut self) -> CoreResult<()> {
        if self.child.is_some() {
            panic!("Attempted to open an already open child");
        }

        logging::debug!(self.log, "spawning child";
                        "name" => &self.name,
                        "program" => &self.program,
                        "param" => ?self.param);

        let mut child = Command::new(&self.program)
            .args(&self.param)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| CoreError::ExecSpawn {
                name: self.name.clone(),
                kind: err.kind(),
            })?;

        let stdin = child.stdin.take().expect("Child must have piped stdin");
        let stdout = child.stdout.take().expect("Child must have piped stdout");

        self.read = Some(HandleRead::new(
            format!("{} read", self.name),
            stdout,
            Some(self.timeout),
            &self.log,
        ));
        self.write = Some(HandleWrite::new(
            format!("{} write", self.name),
            stdin,
            Some(self.timeout),
            &self.log,
        ));
        self.child = Some(child);

        logging::debug!(self.log, "child spawned"; "name" => &self.name);

        Ok(())
    }

    /// Surrenders ownership of the stdio handles, e.g. to a protocol client
    /// layered on top of this child.
    pub fn take_io(&mut self) -> (ExecRead, ExecWrite) {
        let read = self.read.take().expect("Child io already taken");
        let write = self.write.take().expect("Child io already taken");
        (read, write)
    }

    pub fn io_read(&mut self) -> &mut ExecRead {
        self.read.as_mut().expect("Child must be open")
    }

    pub fn io_write(&mut self) -> &mut ExecWrite {
        self.write.as_mut().expect("Child must be open")
    }

    /// Terminates the child: closing stdin delivers a graceful end of
    /// stream, then the child gets the configured timeout to exit before it
    /// is killed. The exit code is surfaced so callers can distinguish a
    /// clean shutdown from a crash.
    pub fn free(mut self) -> CoreResult<i32> {
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return Ok(0),
        };

        // EOF on stdin is the graceful shutdown signal.
        drop(self.write.take());
        drop(self.read.take());

        let deadline = Instant::now() + self.timeout;

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        logging::warn!(self.log, "child did not exit, killing"; "name" => &self.name);

                        child.kill().map_err(|err| CoreError::ExecSpawn {
                            name: self.name.clone(),
                            kind: err.kind(),
                        })?;

                        break child.wait().map_err(|err| CoreError::ExecSpawn {
                            name: self.name.clone(),
                            kind: err.kind(),
                        })?;
                    }

                    thread::sleep(Self::WAIT_INTERVAL);
                }
                Err(err) => {
                    return Err(CoreError::ExecSpawn {
                        name: self.name.clone(),
                        kind: err.kind(),
                    })
                }
            }
        };

        logging::debug!(self.log, "child exited"; "name" => &self.name, "status" => ?status);

        match status.code() {
            Some(0) => Ok(0),
            Some(code) => Err(CoreError::ExecStatus {
                name: self.name,
                code,
            }),
            // Killed by signal, e.g. after the timeout escalation.
            None => Err(CoreError::ExecStatus {
                name: self.name,
                code: -1,
            }),
        }
    }
}
