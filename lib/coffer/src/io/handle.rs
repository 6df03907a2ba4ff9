use crate::error::{CoreError, CoreResult};
use crate::io::buffer::Buffer;
use bedrock::logging;
use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Level-triggered readiness wait on a raw descriptor, used to bound how
/// long a blocking handle operation may stall.
struct Readiness {
    poll: Poll,
    events: Events,
}

impl Readiness {
    fn new(fd: RawFd, interest: Ready) -> io::Result<Readiness> {
        let poll = Poll::new()?;
        poll.register(&EventedFd(&fd), Token(0), interest, PollOpt::level())?;

        Ok(Readiness {
            poll,
            events: Events::with_capacity(4),
        })
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(self.events.iter().next().is_some())
    }
}

/// Presents a readable OS handle as a chain source. A single OS read fills
/// the writable tail of the supplied buffer; 0 signals a clean end of
/// stream. When a timeout is configured the read fails with
/// `ProtocolTimeout` if no data arrives in time.
pub struct HandleRead<H> {
    name: String,
    handle: H,
    timeout: Option<Duration>,
    readiness: Option<Readiness>,
    log: logging::Logger,
}

impl<H: io::Read + AsRawFd> HandleRead<H> {
    pub fn new<'a, N, L>(name: N, handle: H, timeout: Option<Duration>, log: L) -> HandleRead<H>
    where
        N: Into<String>,
        L: Into<Option<&'a logging::Logger>>,
    {
        HandleRead {
            name: name.into(),
            handle,
            timeout,
            readiness: None,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&mut self, buffer: &mut Buffer) -> CoreResult<usize> {
        self.wait_ready()?;

        loop {
            match self.handle.read(buffer.write_slice()) {
                Ok(count) => {
                    buffer.advance(count);
                    return Ok(count);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::debug!(self.log, "read failure";
                                    "name" => &self.name,
                                    "kind" => ?err.kind());
                    return Err(CoreError::IoRead(err.kind()));
                }
            }
        }
    }

    fn wait_ready(&mut self) -> CoreResult<()> {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return Ok(()),
        };

        if self.readiness.is_none() {
            self.readiness = Some(
                Readiness::new(self.handle.as_raw_fd(), Ready::readable())
                    .map_err(|err| CoreError::IoRead(err.kind()))?,
            );
        }

        let ready = self
            .readiness
            .as_mut()
            .expect("Readiness must be initialized")
            .wait(timeout)
            .map_err(|err| CoreError::IoRead(err.kind()))?;

        if !ready {
            logging::debug!(self.log, "read timeout"; "name" => &self.name, "timeout" => ?timeout);
            return Err(CoreError::ProtocolTimeout);
        }

        Ok(())
    }
}

impl<H: io::Read + AsRawFd> io::Read for HandleRead<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Err(err) = self.wait_ready() {
            return Err(match err {
                CoreError::ProtocolTimeout => io::ErrorKind::TimedOut.into(),
                CoreError::IoRead(kind) => kind.into(),
                _ => io::ErrorKind::Other.into(),
            });
        }

        self.handle.read(buf)
    }
}

/// Presents a writable OS handle as a chain sink. `write` drains the whole
/// readable region, retrying short writes; genuine failures propagate.
pub struct HandleWrite<H> {
    name: String,
    handle: H,
    timeout: Option<Duration>,
    readiness: Option<Readiness>,
    log: logging::Logger,
}

impl<H: io::Write + AsRawFd> HandleWrite<H> {
    pub fn new<'a, N, L>(name: N, handle: H, timeout: Option<Duration>, log: L) -> HandleWrite<H>
    where
        N: Into<String>,
        L: Into<Option<&'a logging::Logger>>,
    {
        HandleWrite {
            name: name.into(),
            handle,
            timeout,
            readiness: None,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write(&mut self, buffer: &Buffer) -> CoreResult<()> {
        let mut offset = 0;

        while offset < buffer.used() {
            self.wait_ready()?;

            match self.handle.write(&buffer.bytes()[offset..]) {
                Ok(0) => return Err(CoreError::IoWrite(io::ErrorKind::WriteZero)),
                Ok(count) => offset += count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::debug!(self.log, "write failure";
                                    "name" => &self.name,
                                    "kind" => ?err.kind());
                    return Err(CoreError::IoWrite(err.kind()));
                }
            }
        }

        Ok(())
    }

    fn wait_ready(&mut self) -> CoreResult<()> {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return Ok(()),
        };

        if self.readiness.is_none() {
            self.readiness = Some(
                Readiness::new(self.handle.as_raw_fd(), Ready::writable())
                    .map_err(|err| CoreError::IoWrite(err.kind()))?,
            );
        }

        let ready = self
            .readiness
            .as_mut()
            .expect("Readiness must be initialized")
            .wait(timeout)
            .map_err(|err| CoreError::IoWrite(err.kind()))?;

        if !ready {
            logging::debug!(self.log, "write timeout"; "name" => &self.name, "timeout" => ?timeout);
            return Err(CoreError::ProtocolTimeout);
        }

        Ok(())
    }
}

impl<H: io::Write + AsRawFd> io::Write for HandleWrite<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Err(err) = self.wait_ready() {
            return Err(match err {
                CoreError::ProtocolTimeout => io::ErrorKind::TimedOut.into(),
                CoreError::IoWrite(kind) => kind.into(),
                _ => io::ErrorKind::Other.into(),
            });
        }

        self.handle.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

    fn spawn_cat(
        read_timeout: Duration,
    ) -> (Child, HandleWrite<ChildStdin>, HandleRead<ChildStdout>) {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Error spawning cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        (
            child,
            HandleWrite::new("cat stdin", stdin, None, None),
            HandleRead::new("cat stdout", stdout, Some(read_timeout), None),
        )
    }

    #[test]
    fn test_round_trip() {
        let (mut child, mut write, mut read) = spawn_cat(Duration::from_secs(5));

        let mut out = Buffer::allocate(64);
        out.append(b"over the pipe");
        write.write(&out).unwrap();

        let mut input = Buffer::allocate(64);
        let count = read.read(&mut input).unwrap();

        assert_eq!(&input.bytes()[..count], b"over the pipe");

        drop(write);
        child.wait().unwrap();
    }

    #[test]
    fn test_read_eof() {
        let (mut child, write, mut read) = spawn_cat(Duration::from_secs(5));

        drop(write);

        let mut input = Buffer::allocate(16);
        assert_eq!(read.read(&mut input).unwrap(), 0);

        child.wait().unwrap();
    }

    #[test]
    fn test_read_timeout() {
        // The peer stays idle: stdin is held open and nothing is written.
        let (mut child, write, mut read) = spawn_cat(Duration::from_millis(100));

        let mut input = Buffer::allocate(16);
        assert_eq!(read.read(&mut input).unwrap_err(), CoreError::ProtocolTimeout);

        drop(write);
        child.wait().unwrap();
    }

    #[test]
    fn test_write_drains_fully() {
        let (mut child, mut write, mut read) = spawn_cat(Duration::from_secs(5));

        let mut out = Buffer::allocate(8192);
        out.advance(8192);
        write.write(&out).unwrap();
        drop(write);

        let mut total = 0;
        let mut input = Buffer::allocate(1024);

        loop {
            input.clear();
            let count = read.read(&mut input).unwrap();

            if count == 0 {
                break;
            }

            total += count;
        }

        assert_eq!(total, 8192);
        child.wait().unwrap();
    }
}
