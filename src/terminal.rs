//! Terminal bridge: interactive shells on a PTY, exposed as a pair of byte
//! channels.
//!
//! Blocking PTY I/O lives on two dedicated threads per shell. Output is pushed
//! into a bounded channel with `blocking_send`, so a slow client stalls the
//! reader thread instead of growing an unbounded buffer.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{RunnerError, RunnerResult};

const OUTPUT_CHANNEL_CAPACITY: usize = 64;
const INPUT_CHANNEL_CAPACITY: usize = 256;
const PTY_READ_BUFFER_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Where a shell should be started.
#[derive(Clone, Debug)]
pub struct AttachTarget {
    pub container_name: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// The same directory as seen from the host.
    pub host_dir: PathBuf,
}

#[async_trait]
pub trait TerminalBridge: Send + Sync + 'static {
    async fn attach(&self, target: &AttachTarget, size: TerminalSize) -> RunnerResult<ShellHandle>;
}

#[derive(Clone, Debug)]
pub enum ShellLauncher {
    /// `docker exec -i -t` into the project's container.
    DockerExec { docker_path: String, shell: String },
    /// Run the shell directly on the host, rooted at the project directory.
    Host { shell: String },
}

impl ShellLauncher {
    pub fn argv(&self, target: &AttachTarget) -> Vec<String> {
        match self {
            ShellLauncher::DockerExec { docker_path, shell } => vec![
                docker_path.clone(),
                "exec".to_string(),
                "-i".to_string(),
                "-t".to_string(),
                "-e".to_string(),
                "TERM=xterm-256color".to_string(),
                "-e".to_string(),
                "LANG=C.UTF-8".to_string(),
                "-w".to_string(),
                target.workdir.clone(),
                target.container_name.clone(),
                shell.clone(),
            ],
            ShellLauncher::Host { shell } => vec![shell.clone()],
        }
    }

    fn command(&self, target: &AttachTarget) -> CommandBuilder {
        let argv = self.argv(target);
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);

        match self {
            ShellLauncher::DockerExec { .. } => {
                cmd.env("TERM", "xterm-256color");
            }
            ShellLauncher::Host { .. } => {
                cmd.env_clear();
                if let Ok(path) = std::env::var("PATH") {
                    cmd.env("PATH", path);
                }
                cmd.env("HOME", &target.host_dir);
                cmd.env("TERM", "xterm-256color");
                cmd.env("LANG", "C.UTF-8");
                cmd.env("PS1", "$ ");
                cmd.cwd(&target.host_dir);
            }
        }
        cmd
    }
}

/// Spawns shells through the native PTY system.
pub struct PtyBridge {
    launcher: ShellLauncher,
}

impl PtyBridge {
    pub fn new(launcher: ShellLauncher) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &ShellLauncher {
        &self.launcher
    }
}

#[async_trait]
impl TerminalBridge for PtyBridge {
    async fn attach(&self, target: &AttachTarget, size: TerminalSize) -> RunnerResult<ShellHandle> {
        let cmd = self.launcher.command(target);
        let name = target.container_name.clone();

        tokio::task::spawn_blocking(move || spawn_shell(name, cmd, size))
            .await
            .map_err(|e| RunnerError::Internal(format!("pty spawn task failed: {e}")))?
    }
}

fn spawn_shell(name: String, cmd: CommandBuilder, size: TerminalSize) -> RunnerResult<ShellHandle> {
    let attach_failed = |message: String| RunnerError::AttachFailed {
        name: name.clone(),
        message,
    };

    let pair = native_pty_system()
        .openpty(size.into())
        .map_err(|e| attach_failed(format!("failed to open pty: {e}")))?;

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| attach_failed(format!("failed to spawn shell: {e}")))?;
    // Release slave so reads hit EOF when the child exits.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| attach_failed(format!("failed to clone pty reader: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| attach_failed(format!("failed to take pty writer: {e}")))?;

    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);

    let reader_label = name.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("[reader:{}] pty read ended: {}", reader_label, e);
                    break;
                }
            }
        }
        debug!("[reader:{}] reader thread exiting", reader_label);
    });

    let writer_label = name.clone();
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data) {
                warn!("[writer:{}] pty write failed: {}", writer_label, e);
                break;
            }
            let _ = writer.flush();
        }
        debug!("[writer:{}] writer thread exiting", writer_label);
    });

    info!("[terminal:{}] shell attached ({}x{})", name, size.cols, size.rows);
    Ok(ShellHandle {
        label: name,
        input_tx,
        output_rx,
        control: parking_lot::Mutex::new(ShellControl {
            master: Some(pair.master),
            child: Some(child),
        }),
        closed: AtomicBool::new(false),
    })
}

struct ShellControl {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Option<Box<dyn Child + Send>>,
}

/// A live shell. Input goes in through [`ShellHandle::write`], output comes
/// out of [`ShellHandle::recv_output`] until the shell exits.
pub struct ShellHandle {
    label: String,
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    control: parking_lot::Mutex<ShellControl>,
    closed: AtomicBool,
}

impl ShellHandle {
    pub async fn write(&self, data: Vec<u8>) -> RunnerResult<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| RunnerError::Internal(format!("shell input for {} is closed", self.label)))
    }

    /// Next chunk of output, or `None` once the shell has exited.
    pub async fn recv_output(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    pub fn resize(&self, size: TerminalSize) -> RunnerResult<()> {
        let control = self.control.lock();
        let Some(master) = control.master.as_ref() else {
            return Ok(());
        };
        master
            .resize(size.into())
            .map_err(|e| RunnerError::Internal(format!("failed to resize pty: {e}")))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Kills the shell and releases the PTY. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (master, child) = {
            let mut control = self.control.lock();
            (control.master.take(), control.child.take())
        };
        let label = self.label.clone();
        let result = tokio::task::spawn_blocking(move || {
            if let Some(mut child) = child {
                let _ = child.kill();
                let _ = child.wait();
            }
            drop(master);
        })
        .await;
        if let Err(e) = result {
            warn!("[terminal:{}] shell cleanup task failed: {}", label, e);
        }
        debug!("[terminal:{}] shell closed", self.label);
    }
}

impl Drop for ShellHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut child) = self.control.get_mut().child.take() {
            let _ = child.kill();
        }
    }
}

/// Splits a byte stream into UTF-8 text without cutting a multi-byte
/// sequence in half across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let boundary = utf8_boundary(&self.pending);
        let rest = self.pending.split_off(boundary);
        let ready = std::mem::replace(&mut self.pending, rest);
        String::from_utf8_lossy(&ready).into_owned()
    }

    /// Flushes whatever is left, replacing an incomplete tail.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Length of the prefix of `bytes` that does not end in a truncated
/// multi-byte sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        // continuation byte: keep looking for the lead byte
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target(dir: &std::path::Path) -> AttachTarget {
        AttachTarget {
            container_name: "runner-u1-p1".to_string(),
            workdir: "/workspace".to_string(),
            host_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn decoder_holds_back_split_sequences() {
        let mut decoder = Utf8Decoder::new();
        let snowman = "☃".as_bytes();
        assert_eq!(decoder.push(b"ab"), "ab");
        assert_eq!(decoder.push(&snowman[..1]), "");
        assert_eq!(decoder.push(&snowman[1..2]), "");
        assert_eq!(decoder.push(&snowman[2..]), "☃");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_finish_replaces_truncated_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(&[b'x', 0xE2, 0x98]), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn utf8_boundary_cases() {
        assert_eq!(utf8_boundary(b""), 0);
        assert_eq!(utf8_boundary(b"hello"), 5);
        assert_eq!(utf8_boundary("é".as_bytes()), 2);
        assert_eq!(utf8_boundary(&[b'a', 0xC3]), 1);
        assert_eq!(utf8_boundary(&[0xF0, 0x9F, 0x98]), 0);
    }

    #[test]
    fn docker_exec_argv_targets_container_workdir() {
        let launcher = ShellLauncher::DockerExec {
            docker_path: "/usr/bin/docker".to_string(),
            shell: "/bin/sh".to_string(),
        };
        let argv = launcher.argv(&target(std::path::Path::new("/srv/code/u1/p1")));
        assert_eq!(argv[0], "/usr/bin/docker");
        assert_eq!(argv[1], "exec");
        let w = argv.iter().position(|a| a == "-w").unwrap();
        assert_eq!(argv[w + 1], "/workspace");
        assert_eq!(&argv[argv.len() - 2..], &["runner-u1-p1", "/bin/sh"]);
    }

    #[tokio::test]
    async fn host_shell_echoes_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = PtyBridge::new(ShellLauncher::Host {
            shell: "/bin/sh".to_string(),
        });
        let mut shell = bridge
            .attach(&target(dir.path()), TerminalSize::default())
            .await
            .unwrap();

        shell.write(b"echo bridge-$((40+2))\n".to_vec()).await.unwrap();

        let mut decoder = Utf8Decoder::new();
        let mut seen = String::new();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(chunk) = shell.recv_output().await {
                seen.push_str(&decoder.push(&chunk));
                if seen.contains("bridge-42") {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "expected echoed output, got {seen:?}");

        shell.close().await;
        shell.close().await;
        assert!(shell.is_closed());
    }
}
