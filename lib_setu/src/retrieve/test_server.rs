//! Minimal scripted HTTP server for client tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

/// Reads one request: headers, then `Content-Length` bytes of body.
fn read_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(end) = text.find("\r\n\r\n") {
            let body_len = text[..end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if data.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Answers each incoming connection with the next canned `(status, body)`
/// and hands back the raw requests. The base URL ends in `/api`.
pub(crate) fn scripted_server(
    replies: Vec<(&'static str, &'static str)>,
) -> (String, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        for (status, body) in replies {
            let (mut stream, _) = listener.accept().unwrap();
            seen.push(read_request(&mut stream));
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        }
        seen
    });
    (format!("http://127.0.0.1:{}/api", port), handle)
}

/// First line of a raw request, e.g. `GET /api/x/ HTTP/1.1`.
pub(crate) fn request_line(raw: &str) -> &str {
    raw.lines().next().unwrap_or_default()
}
