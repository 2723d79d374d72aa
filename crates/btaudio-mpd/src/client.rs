//! Minimal MPD protocol client.
//!
//! The protocol is plain lines over TCP: the server greets with
//! `OK MPD <version>`, each command is a single line, each response is
//! zero or more `key: value` lines terminated by `OK` or an
//! `ACK [...]` error line. Only the handful of commands the AVRCP
//! bridge needs is implemented.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use btaudio_core::{Error, Result};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MpdClient {
    port: u16,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl MpdClient {
    /// Connect to the daemon on localhost and consume the banner.
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| mpd_err(port, "connect timed out"))?
            .map_err(|e| mpd_err(port, &e.to_string()))?;
        let (read, writer) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut banner = String::new();
        timeout(IO_TIMEOUT, reader.read_line(&mut banner))
            .await
            .map_err(|_| mpd_err(port, "banner timed out"))?
            .map_err(|e| mpd_err(port, &e.to_string()))?;
        if !banner.starts_with("OK MPD") {
            return Err(mpd_err(port, &format!("unexpected banner {banner:?}")));
        }
        debug!(port, banner = banner.trim(), "MPD client connected");
        Ok(Self {
            port,
            reader,
            writer,
        })
    }

    /// Send one command and collect its response lines.
    async fn command(&mut self, cmd: &str) -> Result<Vec<String>> {
        let port = self.port;
        timeout(IO_TIMEOUT, async {
            self.writer.write_all(cmd.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                if self.reader.read_line(&mut line).await? == 0 {
                    return Err(std::io::Error::other("connection closed"));
                }
                let line = line.trim_end().to_string();
                if line == "OK" {
                    return Ok(lines);
                }
                if line.starts_with("ACK") {
                    return Err(std::io::Error::other(line));
                }
                lines.push(line);
            }
        })
        .await
        .map_err(|_| mpd_err(port, &format!("{cmd} timed out")))?
        .map_err(|e| mpd_err(port, &e.to_string()))
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.command("ping").await.map(|_| ())
    }

    pub async fn play(&mut self) -> Result<()> {
        self.command("play").await.map(|_| ())
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.command("pause 1").await.map(|_| ())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.command("stop").await.map(|_| ())
    }

    pub async fn next(&mut self) -> Result<()> {
        self.command("next").await.map(|_| ())
    }

    pub async fn previous(&mut self) -> Result<()> {
        self.command("previous").await.map(|_| ())
    }

    pub async fn set_volume(&mut self, pct: u8) -> Result<()> {
        self.command(&format!("setvol {}", pct.min(100)))
            .await
            .map(|_| ())
    }

    /// `status` as a key/value map (`state`, `volume`, ...).
    pub async fn status(&mut self) -> Result<HashMap<String, String>> {
        let lines = self.command("status").await?;
        Ok(lines
            .iter()
            .filter_map(|line| {
                line.split_once(": ")
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect())
    }

    /// Toggle between play and pause based on current state.
    pub async fn play_pause(&mut self) -> Result<()> {
        let status = self.status().await?;
        if status.get("state").map(String::as_str) == Some("play") {
            self.pause().await
        } else {
            self.play().await
        }
    }

    /// Ask the daemon to shut down. The connection drops afterwards.
    pub async fn kill(&mut self) -> Result<()> {
        let port = self.port;
        timeout(IO_TIMEOUT, async {
            self.writer.write_all(b"kill\n").await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| mpd_err(port, "kill timed out"))?
        .map_err(|e| mpd_err(port, &e.to_string()))
    }
}

fn mpd_err(port: u16, detail: &str) -> Error {
    Error::MpdFailed {
        address: format!("port {port}"),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// A scripted MPD: sends the banner, then answers each command line
    /// with the next canned response.
    async fn fake_mpd(responses: Vec<&'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"OK MPD 0.23.5\n").await.unwrap();
            let mut buf = [0u8; 256];
            for response in responses {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn connects_and_plays() {
        let port = fake_mpd(vec!["OK\n"]).await;
        let mut client = MpdClient::connect(port).await.unwrap();
        client.play().await.unwrap();
    }

    #[tokio::test]
    async fn status_parses_key_values() {
        let port = fake_mpd(vec!["volume: 70\nstate: play\nOK\n"]).await;
        let mut client = MpdClient::connect(port).await.unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.get("state").map(String::as_str), Some("play"));
        assert_eq!(status.get("volume").map(String::as_str), Some("70"));
    }

    #[tokio::test]
    async fn ack_is_an_error() {
        let port = fake_mpd(vec!["ACK [5@0] {play} No such song\n"]).await;
        let mut client = MpdClient::connect(port).await.unwrap();
        let err = client.play().await.unwrap_err();
        assert_eq!(err.kind(), btaudio_core::ErrorKind::MpdFailed);
    }

    #[tokio::test]
    async fn bad_banner_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"HTTP/1.1 400 nope\n").await.unwrap();
        });
        assert!(MpdClient::connect(port).await.is_err());
    }
}
