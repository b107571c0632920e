//! RFC 5424 syslog export for audit entries (optional; off by default).
//!
//! No external syslog crate is used — the format is simple enough to build
//! directly over a UDP or TCP socket.

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::event::AuditEntry;
use crate::config::SyslogConfig;

#[derive(Clone)]
pub struct SyslogSender {
    address: SocketAddr,
    facility: u8,
    app_name: String,
    transport: SyslogTransport,
}

#[derive(Clone, Debug)]
enum SyslogTransport {
    Udp,
    Tcp,
}

impl SyslogSender {
    pub fn new(config: &SyslogConfig) -> Result<Self, std::io::Error> {
        let address: SocketAddr = config
            .address
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let transport = match config.transport.as_str() {
            "tcp" => SyslogTransport::Tcp,
            _ => SyslogTransport::Udp,
        };

        let app_name = config.app_name.clone().unwrap_or_else(|| "gateway".to_string());

        Ok(Self { address, facility: config.facility, app_name, transport })
    }

    pub async fn send(&self, entry: &AuditEntry) -> Result<(), std::io::Error> {
        let message = self.format_rfc5424(entry);

        match self.transport {
            SyslogTransport::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.send_to(message.as_bytes(), self.address).await?;
            }
            SyslogTransport::Tcp => {
                use tokio::io::AsyncWriteExt;
                use tokio::net::TcpStream;
                let mut stream = TcpStream::connect(self.address).await?;
                let framed = format!("{message}\n");
                stream.write_all(framed.as_bytes()).await?;
            }
        }

        Ok(())
    }

    /// `<PRI>VERSION TIMESTAMP HOSTNAME APP-NAME PROCID MSGID [SD-ID SD-PARAM...] MSG`
    fn format_rfc5424(&self, entry: &AuditEntry) -> String {
        let severity = match entry.result {
            super::event::AuditResult::Ok => 6u16,
            super::event::AuditResult::Denied => 4,
            super::event::AuditResult::Error => 3,
        };
        let pri = (self.facility as u16) * 8 + severity;
        let timestamp = entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ");
        let hostname = &self.app_name;
        let msgid = &entry.agent;

        let mut sd_params = vec![format!("seq=\"{}\"", entry.seq), format!("action=\"{}\"", escape(&entry.action))];
        if let Some(ref target) = entry.target {
            sd_params.push(format!("target=\"{}\"", escape(target)));
        }
        if let Some(ref user_id) = entry.user_id {
            sd_params.push(format!("user_id=\"{}\"", escape(user_id)));
        }
        if let Some(ref request_id) = entry.request_id {
            sd_params.push(format!("request_id=\"{}\"", escape(request_id)));
        }
        sd_params.push(format!("hash=\"{}\"", entry.hash));

        let structured_data = format!("[audit@49610 {}]", sd_params.join(" "));
        let msg = format!("{} {} seq={}", entry.agent, entry.action, entry.seq);

        format!("<{pri}>1 {timestamp} {hostname} {} - {msgid} {structured_data} {msg}", self.app_name)
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace(']', "\\]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::AuditResult;

    #[test]
    fn formats_rfc5424() {
        let sender = SyslogSender {
            address: "127.0.0.1:514".parse().unwrap(),
            facility: 13,
            app_name: "gateway".to_string(),
            transport: SyslogTransport::Udp,
        };
        let entry = AuditEntry::new("auth", "login", AuditResult::Ok);
        let message = sender.format_rfc5424(&entry);
        assert!(message.starts_with("<110>1"));
        assert!(message.contains("auth"));
        assert!(message.contains("login"));
    }

    #[test]
    fn escape_handles_special_chars() {
        assert_eq!(escape("he\"llo"), "he\\\"llo");
        assert_eq!(escape("he]llo"), "he\\]llo");
    }
}
