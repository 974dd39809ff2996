//! SSH session wrapper.
//!
//! `Connector` and `Remote` are the seam between stage operations and the
//! transport: open a connection to a host, run a command streaming its
//! output, push and fetch files, close. The real implementation rides on
//! openssh multiplexed sessions; tests substitute mocks.
//!
//! Failure is classified from the remote exit status, never by scanning
//! command output for error strings.

use std::io::Write;

use async_trait::async_trait;
use colored::ColoredString;
use colourado::{Color, ColorPalette, PaletteType};
use futures::future::join;
use openssh::{KnownHosts, Session as SSHSession, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

use crate::executor::{OpError, Transcript};
use crate::host::HostTarget;

/// Opens connections to hosts. One implementation per transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &HostTarget) -> Result<Box<dyn Remote>, OpError>;
}

/// One live connection to one host. Owned by the operation that opened it
/// and released on every exit path: `close` on success, drop otherwise.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Runs a shell command, streaming stdout and stderr line by line into
    /// the transcript. Zero exit is Ok; nonzero is `RemoteCommand`.
    async fn run(&self, command: &str, out: &Transcript) -> Result<(), OpError>;

    /// Writes `data` to `dest` on the host.
    async fn push(&self, data: &[u8], dest: &str, out: &Transcript) -> Result<(), OpError>;

    /// Reads the file at `path` on the host.
    async fn fetch(&self, path: &str, out: &Transcript) -> Result<Vec<u8>, OpError>;

    async fn close(self: Box<Self>) -> Result<(), OpError>;
}

pub struct SshConnector {
    /// Stable per-host palette color, assigned in host-input order.
    colors: Vec<(String, Color)>,
}

impl SshConnector {
    pub fn new(hosts: &[HostTarget]) -> Self {
        let palette = ColorPalette::new(hosts.len().max(1) as u32, PaletteType::Pastel, false);
        let colors = palette
            .colors
            .into_iter()
            .zip(hosts.iter())
            .map(|(color, host)| (host.destination(), color))
            .collect();
        Self { colors }
    }

    fn color_for(&self, host: &HostTarget) -> Color {
        let destination = host.destination();
        self.colors
            .iter()
            .find(|(known, _)| *known == destination)
            .map(|(_, color)| Color {
                red: color.red,
                green: color.green,
                blue: color.blue,
            })
            .unwrap_or(Color {
                red: 0.7,
                green: 0.7,
                blue: 0.7,
            })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &HostTarget) -> Result<Box<dyn Remote>, OpError> {
        let colorhost = host.prettify(self.color_for(host));
        let destination = host.destination();
        let session = match SSHSession::connect_mux(&destination, KnownHosts::Add).await {
            Ok(session) => session,
            Err(e) => {
                eprintln!("{} Failed to connect to host: {:?}", colorhost, e);
                return Err(OpError::Connection(e.to_string()));
            }
        };
        eprintln!("{} Connected to host.", colorhost);
        Ok(Box::new(SshRemote { colorhost, session }))
    }
}

pub struct SshRemote {
    colorhost: ColoredString,
    session: SSHSession,
}

#[async_trait]
impl Remote for SshRemote {
    async fn run(&self, command: &str, out: &Transcript) -> Result<(), OpError> {
        println!("{} === run '{}' ===", self.colorhost, command);
        let mut cmd = self.session.command("sh");
        let process = cmd
            .arg("-c")
            .raw_arg(format!("'{}'", command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut process = process
            .spawn()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        join(
            self.stream(process.stdout().take().expect("stdout requested as piped"), out),
            self.stream(process.stderr().take().expect("stderr requested as piped"), out),
        )
        .await;
        let status = process
            .wait()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        match status.code() {
            Some(0) => {
                println!("{} === done ({}) ===", self.colorhost, status);
                Ok(())
            }
            Some(code) => {
                println!("{} === done ({}) ===", self.colorhost, status);
                Err(OpError::RemoteCommand { code })
            }
            // Killed by a signal.
            None => Err(OpError::RemoteCommand { code: -1 }),
        }
    }

    async fn push(&self, data: &[u8], dest: &str, out: &Transcript) -> Result<(), OpError> {
        println!(
            "{} === push {} bytes to '{}' ===",
            self.colorhost,
            data.len(),
            dest
        );
        let mut cmd = self.session.command("sh");
        let process = cmd
            .arg("-c")
            .raw_arg(format!("'cat > {}'", dest))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut process = process
            .spawn()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        let mut stdin = process.stdin().take().expect("stdin requested as piped");
        stdin
            .write_all(data)
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        // Closing stdin lets the remote cat see EOF and exit.
        drop(stdin);
        let status = process
            .wait()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        match status.code() {
            Some(0) => {
                out.push(format!("pushed {} bytes to {}", data.len(), dest));
                Ok(())
            }
            Some(code) => Err(OpError::RemoteCommand { code }),
            None => Err(OpError::RemoteCommand { code: -1 }),
        }
    }

    async fn fetch(&self, path: &str, out: &Transcript) -> Result<Vec<u8>, OpError> {
        println!("{} === fetch '{}' ===", self.colorhost, path);
        let mut cmd = self.session.command("cat");
        let process = cmd.arg(path).stdout(Stdio::piped()).stderr(Stdio::null());
        let mut process = process
            .spawn()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        let mut data = Vec::new();
        process
            .stdout()
            .take()
            .expect("stdout requested as piped")
            .read_to_end(&mut data)
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        let status = process
            .wait()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))?;
        match status.code() {
            Some(0) => {
                out.push(format!("fetched {} bytes from {}", data.len(), path));
                Ok(data)
            }
            Some(code) => Err(OpError::RemoteCommand { code }),
            None => Err(OpError::RemoteCommand { code: -1 }),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), OpError> {
        let this = *self;
        eprintln!("{} Terminating connection.", this.colorhost);
        this.session
            .close()
            .await
            .map_err(|e| OpError::Connection(e.to_string()))
    }
}

impl SshRemote {
    async fn stream<B: AsyncRead + Unpin>(&self, stream: B, out: &Transcript) {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(reader.buffer().len());
        loop {
            // Read into the buffer until either \r or \n is met.
            read_until2(&mut reader, b'\r', b'\n', &mut buf)
                .await
                .expect("Failed to read from stream.");
            // An empty buffer means that EOF was reached.
            if buf.is_empty() {
                break;
            }
            // The delimiter is included when one was found; at EOF the tail
            // may arrive without one.
            let line_bytes = match buf.last() {
                Some(b'\r') | Some(b'\n') => &buf[..buf.len() - 1],
                _ => &buf[..],
            };
            let line = String::from_utf8_lossy(line_bytes).into_owned();
            {
                // Without the lock, when multiple hosts output at once,
                // lines from different hosts get mixed.
                let stdout = std::io::stdout();
                let mut guard = stdout.lock();
                writeln!(guard, "{} {}", self.colorhost, line).unwrap();
            }
            out.push(line);
            buf.clear();
        }
    }
}

async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}
