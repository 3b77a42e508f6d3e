//! Minimal HTTP/1.1 server for the ranged-POST protocol used by the storage
//! cluster: the byte range rides in the URL path as `/<from>-<to>`, the
//! response is a plain 200 with the requested slice.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

/// Starts a server in a background thread serving `body`. Returns the base
/// URL (e.g. "http://127.0.0.1:12345"). The server runs until the process
/// exits.
pub fn start(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let body = Arc::new(body);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                // read until end of headers; ranged POSTs carry no payload
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut tmp) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&tmp[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let path = request
                    .lines()
                    .next()
                    .and_then(|l| l.split_whitespace().nth(1))
                    .unwrap_or("/");

                // path is "/<from>-<to>" with an inclusive end
                let range = path
                    .rsplit('/')
                    .next()
                    .and_then(|r| r.split_once('-'))
                    .and_then(|(a, b)| {
                        Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
                    });

                match range {
                    Some((from, to)) if from <= to && to < body.len() => {
                        let slice = &body[from..=to];
                        let header = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            slice.len()
                        );
                        let _ = stream.write_all(header.as_bytes());
                        let _ = stream.write_all(slice);
                    }
                    _ => {
                        let _ = stream.write_all(
                            b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        );
                    }
                }
            });
        }
    });

    format!("http://127.0.0.1:{}", port)
}
