#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Minimal HTTP/1.1 file server for exercising the downloader without a
/// network. One resource, `Connection: close` per request.
pub struct TestServer {
    pub url: String,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// HEAD advertises the size, range requests are honored.
    Full,
    /// HEAD works but every range request fails with 500, forcing the
    /// single-stream fallback.
    NoRanges,
    /// The range starting at byte 0 fails immediately; every other range
    /// stalls, then answers with garbage bytes. Full-body GETs stay
    /// correct. Exercises worker cleanup when one range gives up first.
    PoisonRanges,
}

impl TestServer {
    pub async fn start(body: Vec<u8>, mode: ServerMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Arc::new(body);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, &body, mode).await;
                });
            }
        });
        Self {
            url: format!("http://{addr}/file.zip"),
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    body: &[u8],
    mode: ServerMode,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let is_head = request_line.starts_with("HEAD");

    let mut range = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("range")
        {
            range = parse_range(value.trim(), body.len());
        }
    }

    let mut response = Vec::new();
    if is_head {
        write!(
            response,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            body.len()
        )?;
    } else if let Some((start, end)) = range {
        if mode == ServerMode::NoRanges || (mode == ServerMode::PoisonRanges && start == 0) {
            let msg = b"range disabled";
            write!(
                response,
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                msg.len()
            )?;
            response.extend_from_slice(msg);
        } else if mode == ServerMode::PoisonRanges {
            tokio::time::sleep(std::time::Duration::from_millis(400)).await;
            let len = end - start + 1;
            write!(
                response,
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {len}\r\nContent-Range: bytes {start}-{end}/{}\r\nConnection: close\r\n\r\n",
                body.len()
            )?;
            response.extend_from_slice(&vec![0xEE; len]);
        } else {
            let slice = &body[start..=end];
            write!(
                response,
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{end}/{}\r\nConnection: close\r\n\r\n",
                slice.len(),
                body.len()
            )?;
            response.extend_from_slice(slice);
        }
    } else {
        write!(
            response,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )?;
        response.extend_from_slice(body);
    }

    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

/// Builds an in-memory ZIP containing the given (name, contents) entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}
