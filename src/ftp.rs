//! Minimal passive-mode FTP retrieval (`USER`/`PASS`/`TYPE I`/`PASV`/`RETR`).
//!
//! Only whole-file downloads are supported. Reply 550 maps to a 404 response
//! so missing remote files are terminal, like HTTP.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::transport::{HttpResponse, TransportError};

pub struct FtpClient {
    connect_timeout: Duration,
    io_timeout: Duration,
}

struct Reply {
    code: u16,
    text: String,
}

struct Control {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Control {
    fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let code = parse_code(&line)?;
        let mut text = line.trim_end().to_string();
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                line.clear();
                let read = self
                    .reader
                    .read_line(&mut line)
                    .map_err(|err| TransportError::Io(err.to_string()))?;
                if read == 0 {
                    return Err(TransportError::Io("control connection closed".to_string()));
                }
                text.push('\n');
                text.push_str(line.trim_end());
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }
        Ok(Reply { code, text })
    }

    fn command(&mut self, command: &str) -> Result<Reply, TransportError> {
        let shown = if command.starts_with("PASS ") {
            "PASS ****"
        } else {
            command
        };
        debug!(command = shown, "ftp command");
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .map_err(|err| TransportError::Io(err.to_string()))?;
        self.read_reply()
    }
}

impl FtpClient {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    pub fn retrieve(&self, url: &Url) -> Result<HttpResponse, TransportError> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::Invalid(format!("ftp url without host: {url}")))?;
        let port = url.port().unwrap_or(21);
        let stream = self.connect(host, port)?;
        let writer = stream
            .try_clone()
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let mut control = Control {
            reader: BufReader::new(stream),
            writer,
        };

        expect(&control.read_reply()?, &[220])?;
        let user = if url.username().is_empty() {
            "anonymous"
        } else {
            url.username()
        };
        let reply = control.command(&format!("USER {user}"))?;
        if reply.code == 331 {
            let password = url.password().unwrap_or("anonymous@");
            expect(&control.command(&format!("PASS {password}"))?, &[230, 202])?;
        } else {
            expect(&reply, &[230])?;
        }
        expect(&control.command("TYPE I")?, &[200])?;

        let pasv = control.command("PASV")?;
        expect(&pasv, &[227])?;
        let data_addr = parse_pasv(&pasv.text)?;
        let mut data = TcpStream::connect_timeout(&data_addr, self.connect_timeout)
            .map_err(|err| TransportError::Io(format!("data connection: {err}")))?;
        data.set_read_timeout(Some(self.io_timeout))
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let path = url.path();
        let retr = control.command(&format!("RETR {path}"))?;
        if retr.code == 550 {
            return Ok(HttpResponse::new(404, retr.text));
        }
        expect(&retr, &[125, 150])?;

        let mut body = Vec::new();
        data.read_to_end(&mut body)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        drop(data);
        expect(&control.read_reply()?, &[226, 250])?;
        let _ = control.command("QUIT");

        Ok(HttpResponse::new(200, body))
    }

    fn connect(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|err| TransportError::HostUnreachable(format!("{host}: {err}")))?
            .collect::<Vec<_>>();
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.io_timeout))
                        .map_err(|err| TransportError::Io(err.to_string()))?;
                    return Ok(stream);
                }
                Err(err) => last_error = Some(err),
            }
        }
        match last_error {
            Some(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                Err(TransportError::ConnectTimeout(format!("{host}:{port}: {err}")))
            }
            Some(err) => Err(TransportError::HostUnreachable(format!(
                "{host}:{port}: {err}"
            ))),
            None => Err(TransportError::HostUnreachable(format!(
                "{host}: no addresses"
            ))),
        }
    }
}

fn parse_code(line: &str) -> Result<u16, TransportError> {
    line.get(..3)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TransportError::Io(format!("malformed ftp reply: {}", line.trim_end())))
}

fn expect(reply: &Reply, codes: &[u16]) -> Result<(), TransportError> {
    if codes.contains(&reply.code) {
        return Ok(());
    }
    Err(TransportError::Io(format!(
        "unexpected ftp reply: {}",
        reply.text
    )))
}

fn parse_pasv(text: &str) -> Result<SocketAddr, TransportError> {
    let malformed = || TransportError::Io(format!("malformed PASV reply: {text}"));
    let start = text.find('(').ok_or_else(malformed)?;
    let end = text[start..].find(')').ok_or_else(malformed)? + start;
    let parts = text[start + 1..end]
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed())?;
    if parts.len() != 6 {
        return Err(malformed());
    }
    let ip = std::net::Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = u16::from(parts[4]) << 8 | u16::from(parts[5]);
    Ok(SocketAddr::from((ip, port)))
}
