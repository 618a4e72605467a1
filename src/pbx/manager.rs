//! Minimal client for the PBX Manager API, used to originate outbound
//! calls and set global dialplan variables.
//!
//! The protocol is newline-delimited `Key: Value` records terminated by a
//! double CRLF. A reply counts as successful when it carries
//! `Response: Success`.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use thiserror::Error;
use tracing::info;

/// Errors raised by manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("could not connect to the manager api: {0}")]
    ConnectFailed(std::io::Error),

    #[error("manager login failed")]
    LoginFailed,

    #[error("call originate failed")]
    OriginateFailed,

    #[error("setvar failed for {0}")]
    SetVarFailed(String),

    #[error("manager i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Limited Manager API client for originating calls from the PBX.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    host: String,
    port: u16,
    username: String,
    secret: String,
}

struct ManagerSession {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl ManagerSession {
    fn send_action(&mut self, lines: &[String]) -> Result<bool, ManagerError> {
        let mut message = lines.join("\r\n");
        message.push_str("\r\n\r\n");
        self.writer.write_all(message.as_bytes())?;
        self.writer.flush()?;
        self.read_record()
    }

    /// Reads one record and reports whether it signalled success.
    fn read_record(&mut self) -> Result<bool, ManagerError> {
        let mut success = false;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some(value) = trimmed.strip_prefix("Response:") {
                success = value.trim() == "Success";
            }
        }
        Ok(success)
    }
}

impl ManagerClient {
    #[must_use]
    pub fn new(host: String, port: u16, username: String, secret: String) -> Self {
        Self {
            host,
            port,
            username,
            secret,
        }
    }

    fn login(&self) -> Result<ManagerSession, ManagerError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(ManagerError::ConnectFailed)?;
        let writer = stream.try_clone()?;
        let mut session = ManagerSession {
            reader: BufReader::new(stream),
            writer,
        };
        // The manager greets with a banner line before the first record.
        let mut banner = String::new();
        session.reader.read_line(&mut banner)?;

        let login = vec![
            "Action: Login".to_string(),
            format!("Username: {}", self.username),
            format!("Secret: {}", self.secret),
            "ActionID: 1".to_string(),
        ];
        if !session.send_action(&login)? {
            return Err(ManagerError::LoginFailed);
        }
        Ok(session)
    }

    fn logoff(&self, session: &mut ManagerSession) {
        let logoff = vec!["Action: Logoff".to_string(), "ActionID: 3".to_string()];
        let _ = session.send_action(&logoff);
    }

    /// The local address this host uses to reach the PBX; the FastAGI
    /// callback address is advertised as this.
    pub fn local_ip(&self) -> Result<String, ManagerError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(ManagerError::ConnectFailed)?;
        Ok(stream.local_addr()?.ip().to_string())
    }

    /// Originates an outgoing call that connects back to the given FastAGI
    /// endpoint carrying `handler_id`.
    pub fn dial(
        &self,
        number: &str,
        channel: &str,
        agi_port: u16,
        handler_id: &str,
    ) -> Result<(), ManagerError> {
        let mut session = self.login()?;
        let agi_host = session.writer.local_addr()?.ip().to_string();

        // Console channels collapse to the soundcard for debugging.
        let (channel, number) = if channel.starts_with("Console") {
            ("Console", "dsp")
        } else {
            (channel, number)
        };

        let originate = vec![
            "Action: Originate".to_string(),
            format!("Channel: {channel}/{number}"),
            "Priority: 1".to_string(),
            "Exten: s".to_string(),
            "Context: default".to_string(),
            format!("CallerID: {number}"),
            format!(
                "Variable: keyword=keywords|agihost={agi_host}|agiport={agi_port}|ivrhandlerid={handler_id}"
            ),
            "ActionID: 2".to_string(),
        ];
        let ok = session.send_action(&originate)?;
        self.logoff(&mut session);
        if !ok {
            return Err(ManagerError::OriginateFailed);
        }
        info!("originated call to {number} on {channel}");
        Ok(())
    }

    /// Sets a global PBX variable.
    pub fn set_var(&self, name: &str, value: &str) -> Result<(), ManagerError> {
        let mut session = self.login()?;
        let setvar = vec![
            "Action: Setvar".to_string(),
            format!("Variable: {name}"),
            format!("Value: {value}"),
        ];
        let ok = session.send_action(&setvar)?;
        self.logoff(&mut session);
        if !ok {
            return Err(ManagerError::SetVarFailed(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Scripted manager endpoint: answers every action with the given
    /// response lines.
    fn scripted_manager(responses: Vec<&'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            writer.write_all(b"Asterisk Call Manager/1.1\r\n").unwrap();
            for response in responses {
                // Drain one inbound record.
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        return;
                    }
                    if line.trim_end().is_empty() {
                        break;
                    }
                }
                writer
                    .write_all(format!("Response: {response}\r\n\r\n").as_bytes())
                    .unwrap();
            }
        });
        port
    }

    #[test]
    fn dial_succeeds_when_manager_accepts() {
        let port = scripted_manager(vec!["Success", "Success", "Goodbye"]);
        let client = ManagerClient::new("127.0.0.1".into(), port, "u".into(), "s".into());
        client.dial("5551234", "SIP/line1", 6500, "handler-1").unwrap();
    }

    #[test]
    fn failed_login_is_reported() {
        let port = scripted_manager(vec!["Error"]);
        let client = ManagerClient::new("127.0.0.1".into(), port, "u".into(), "bad".into());
        assert!(matches!(
            client.set_var("agihost", "10.0.0.1"),
            Err(ManagerError::LoginFailed)
        ));
    }

    #[test]
    fn failed_originate_is_reported() {
        let port = scripted_manager(vec!["Success", "Error", "Goodbye"]);
        let client = ManagerClient::new("127.0.0.1".into(), port, "u".into(), "s".into());
        assert!(matches!(
            client.dial("5551234", "SIP/line1", 6500, "handler-1"),
            Err(ManagerError::OriginateFailed)
        ));
    }
}
