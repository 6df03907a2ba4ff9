use crate::error::{CoreError, CoreResult};
use crate::protocol::frame::{self, Greeting, Request, Response};
use bedrock::logging;
use indexmap::IndexMap;
use serde_json::Value;
use std::io;

/// Framed request/response client over a pair of endpoints.
///
/// A client serves one caller at a time and never multiplexes: there is at
/// most one request in flight, and responses match requests in FIFO order.
/// Creation performs the service handshake; `free` sends the session
/// terminate frame the worker needs to exit cleanly.
pub struct ProtocolClient<R, W> {
    name: String,
    service: String,
    read: R,
    write: W,
    sequence: u64,
    log: logging::Logger,
}

impl<R, W> std::fmt::Debug for ProtocolClient<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl<R: io::Read, W: io::Write> ProtocolClient<R, W> {
    pub fn new<'a, N, S, L>(
        name: N,
        service: S,
        read: R,
        write: W,
        log: L,
    ) -> CoreResult<ProtocolClient<R, W>>
    where
        N: Into<String>,
        S: Into<String>,
        L: Into<Option<&'a logging::Logger>>,
    {
        let mut client = ProtocolClient {
            name: name.into(),
            service: service.into(),
            read,
            write,
            sequence: 0,
            log: logging::child(log),
        };

        client.handshake()?;
        Ok(client)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exchanges service greetings with the peer. A mismatched service name
    /// means the two ends would disagree about every frame that follows, so
    /// the session fails before any work is accepted.
    fn handshake(&mut self) -> CoreResult<()> {
        logging::trace!(self.log, "sending greeting";
                        "name" => &self.name,
                        "service" => &self.service);

        frame::write_frame(
            &mut self.write,
            &Greeting {
                service: self.service.clone(),
            },
        )?;

        let peer: Greeting = frame::read_frame(&mut self.read)?;

        if peer.service != self.service {
            return Err(CoreError::ProtocolHandshake {
                expected: self.service.clone(),
                actual: peer.service,
            });
        }

        logging::debug!(self.log, "session established";
                        "name" => &self.name,
                        "service" => &self.service);

        Ok(())
    }

    /// Writes a request and reads exactly one response, returning the value
    /// or raising the peer's coded error.
    pub fn call(&mut self, command: &str, param: IndexMap<String, Value>) -> CoreResult<Value> {
        self.sequence += 1;

        logging::trace!(self.log, "protocol call";
                        "name" => &self.name,
                        "command" => command,
                        "sequence" => self.sequence);

        frame::write_frame(
            &mut self.write,
            &Request {
                cmd: command.to_string(),
                param,
            },
        )?;

        let response: Response = frame::read_frame(&mut self.read)?;

        logging::trace!(self.log, "protocol response";
                        "name" => &self.name,
                        "sequence" => self.sequence,
                        "error" => response.err.is_some());

        response.into_value()
    }

    /// Asks the peer for the named configuration option values, returned in
    /// request order.
    pub fn option(&mut self, names: &[&str]) -> CoreResult<Vec<Value>> {
        let mut param = IndexMap::new();
        param.insert(
            "name".to_string(),
            Value::from(names.iter().map(|&name| Value::from(name)).collect::<Vec<_>>()),
        );

        let value = self.call(frame::OPTION_COMMAND, param)?;

        match value {
            Value::Array(values) => Ok(values),
            value => Err(CoreError::ProtocolFrame(format!(
                "expected option list, got {}",
                value
            ))),
        }
    }

    /// Terminates the session. The noop frame tells the worker to exit; a
    /// write failure here means the worker is already gone, which is fine
    /// since the caller is tearing the connection down anyway.
    pub fn free(mut self) -> CoreResult<()> {
        logging::debug!(self.log, "closing session"; "name" => &self.name);

        let result = frame::write_frame(
            &mut self.write,
            &Request {
                cmd: frame::NOOP_COMMAND.to_string(),
                param: IndexMap::new(),
            },
        );

        if let Err(err) = result {
            logging::debug!(self.log, "session close notify failed";
                            "name" => &self.name,
                            "error" => %err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{read_frame, write_frame};
    use serde_json::json;
    use std::io::Cursor;

    fn greeting_bytes(service: &str) -> Vec<u8> {
        let mut wire = Vec::new();
        write_frame(
            &mut wire,
            &Greeting {
                service: service.to_string(),
            },
        )
        .unwrap();
        wire
    }

    #[test]
    fn test_handshake_ok() {
        let mut outbound = Vec::new();
        let client = ProtocolClient::new(
            "test protocol",
            "repo",
            Cursor::new(greeting_bytes("repo")),
            &mut outbound,
            None,
        );

        assert!(client.is_ok());
        drop(client);

        // The client announced the same service it expected back.
        let sent: Greeting = read_frame(&mut Cursor::new(&outbound)).unwrap();
        assert_eq!(sent.service, "repo");
    }

    #[test]
    fn test_handshake_mismatch() {
        let mut outbound = Vec::new();
        let err = ProtocolClient::new(
            "test protocol",
            "repo",
            Cursor::new(greeting_bytes("archive")),
            &mut outbound,
            None,
        )
        .err()
        .unwrap();

        assert_eq!(
            err,
            CoreError::ProtocolHandshake {
                expected: "repo".to_string(),
                actual: "archive".to_string()
            }
        );
    }

    #[test]
    fn test_call_ok() {
        let mut inbound = greeting_bytes("repo");
        write_frame(&mut inbound, &Response::ok(json!({"total": 3}))).unwrap();

        let mut outbound = Vec::new();
        let mut client = ProtocolClient::new(
            "test protocol",
            "repo",
            Cursor::new(inbound),
            &mut outbound,
            None,
        )
        .unwrap();

        let mut param = IndexMap::new();
        param.insert("set".to_string(), json!("incr"));

        assert_eq!(
            client.call("backup-list", param).unwrap(),
            json!({"total": 3})
        );
        drop(client);

        // Skip the greeting, then verify the request on the wire.
        let mut cursor = Cursor::new(&outbound);
        let _: Greeting = read_frame(&mut cursor).unwrap();
        let request: Request = read_frame(&mut cursor).unwrap();

        assert_eq!(request.cmd, "backup-list");
        assert_eq!(request.param.get("set"), Some(&json!("incr")));
    }

    #[test]
    fn test_call_error_response() {
        let mut inbound = greeting_bytes("repo");
        write_frame(&mut inbound, &Response::error("FileMissingError", 55, "unable to open")).unwrap();

        let mut outbound = Vec::new();
        let mut client = ProtocolClient::new(
            "test protocol",
            "repo",
            Cursor::new(inbound),
            &mut outbound,
            None,
        )
        .unwrap();

        assert_eq!(
            client.call("backup-list", IndexMap::new()).unwrap_err(),
            CoreError::ProtocolResponse {
                code: 55,
                message: "unable to open".to_string()
            }
        );
    }

    #[test]
    fn test_option() {
        let mut inbound = greeting_bytes("repo");
        write_frame(&mut inbound, &Response::ok(json!(["aes-256-cbc", "secret"]))).unwrap();

        let mut outbound = Vec::new();
        let mut client = ProtocolClient::new(
            "test protocol",
            "repo",
            Cursor::new(inbound),
            &mut outbound,
            None,
        )
        .unwrap();

        let values = client
            .option(&["repo-cipher-type", "repo-cipher-pass"])
            .unwrap();

        assert_eq!(values, vec![json!("aes-256-cbc"), json!("secret")]);
        drop(client);

        let mut cursor = Cursor::new(&outbound);
        let _: Greeting = read_frame(&mut cursor).unwrap();
        let request: Request = read_frame(&mut cursor).unwrap();

        assert_eq!(request.cmd, "option");
        assert_eq!(
            request.param.get("name"),
            Some(&json!(["repo-cipher-type", "repo-cipher-pass"]))
        );
    }

    #[test]
    fn test_free_sends_noop() {
        let mut outbound = Vec::new();
        let client = ProtocolClient::new(
            "test protocol",
            "repo",
            Cursor::new(greeting_bytes("repo")),
            &mut outbound,
            None,
        )
        .unwrap();

        client.free().unwrap();

        let mut cursor = Cursor::new(&outbound);
        let _: Greeting = read_frame(&mut cursor).unwrap();
        let request: Request = read_frame(&mut cursor).unwrap();

        assert_eq!(request.cmd, "noop");
        assert!(request.param.is_empty());
    }
}
