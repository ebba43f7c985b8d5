use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use xref_fetch::transport::{DefaultTransport, HttpRequest, Transport};

/// Serves one passive-mode session; `file` is None to answer RETR with 550.
fn serve_once(file: Option<&'static [u8]>) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (control, _) = listener.accept().unwrap();
        let mut writer = control.try_clone().unwrap();
        let mut reader = BufReader::new(control);
        let mut seen = Vec::new();
        let mut data_listener: Option<TcpListener> = None;
        writer.write_all(b"220 ready\r\n").unwrap();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                break;
            }
            let command = line.trim_end().to_string();
            seen.push(command.clone());
            let verb = command.split(' ').next().unwrap_or("");
            match verb {
                "USER" => writer.write_all(b"331 password please\r\n").unwrap(),
                "PASS" => writer.write_all(b"230 logged in\r\n").unwrap(),
                "TYPE" => writer.write_all(b"200 binary\r\n").unwrap(),
                "PASV" => {
                    let data = TcpListener::bind("127.0.0.1:0").unwrap();
                    let p = data.local_addr().unwrap().port();
                    data_listener = Some(data);
                    let reply = format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                        p >> 8,
                        p & 0xff
                    );
                    writer.write_all(reply.as_bytes()).unwrap();
                }
                "RETR" => {
                    let (mut data, _) = data_listener.take().unwrap().accept().unwrap();
                    match file {
                        Some(content) => {
                            writer.write_all(b"150 opening\r\n").unwrap();
                            data.write_all(content).unwrap();
                            drop(data);
                            writer.write_all(b"226 done\r\n").unwrap();
                        }
                        None => {
                            drop(data);
                            writer.write_all(b"550 no such file\r\n").unwrap();
                        }
                    }
                }
                "QUIT" => {
                    writer.write_all(b"221 bye\r\n").unwrap();
                    break;
                }
                _ => writer.write_all(b"502 unsupported\r\n").unwrap(),
            }
        }
        seen
    });
    (port, handle)
}

#[test]
fn anonymous_retr_returns_file_body() {
    let (port, server) = serve_once(Some(b"CHEMBL1\tP00533\n"));
    let transport = DefaultTransport::new(Duration::from_secs(5));
    let request = HttpRequest::get(format!("ftp://127.0.0.1:{port}/pub/chembl_uniprot.txt"));

    let response = transport.send(&request, Duration::from_secs(5)).unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"CHEMBL1\tP00533\n".to_vec());
    let seen = server.join().unwrap();
    assert_eq!(seen[0], "USER anonymous");
    assert!(seen.contains(&"RETR /pub/chembl_uniprot.txt".to_string()));
}

#[test]
fn missing_remote_file_maps_to_not_found() {
    let (port, server) = serve_once(None);
    let transport = DefaultTransport::new(Duration::from_secs(5));
    let request = HttpRequest::get(format!("ftp://127.0.0.1:{port}/pub/missing.txt"));

    let response = transport.send(&request, Duration::from_secs(5)).unwrap();

    assert_eq!(response.status, 404);
    server.join().unwrap();
}
