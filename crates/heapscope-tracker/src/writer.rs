//! Polymorphic record output.
//!
//! The destination is chosen once at initialization: stdout, stderr, a file
//! path with `$$` substituted by the pid, or a TCP listener. Dispatch is
//! per record and irrelevant next to the trace tree lookup, so a plain
//! trait object does.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};

use thiserror::Error;

/// Minimal output surface, mirrored by every destination.
pub trait OutStream: Send {
    fn putc(&mut self, c: u8) -> io::Result<()>;
    fn puts(&mut self, s: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Adapter so records can be formatted straight into an [`OutStream`]
/// without an intermediate allocation.
struct RecordWriter<'a> {
    out: &'a mut dyn OutStream,
    error: Option<io::Error>,
}

impl fmt::Write for RecordWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Err(error) = self.out.puts(s) {
            self.error = Some(error);
            return Err(fmt::Error);
        }
        Ok(())
    }
}

/// Write one formatted record.
pub fn write_record(out: &mut dyn OutStream, args: fmt::Arguments<'_>) -> io::Result<()> {
    use fmt::Write as _;
    let mut writer = RecordWriter { out, error: None };
    match writer.write_fmt(args) {
        Ok(()) => Ok(()),
        Err(_) => Err(writer
            .error
            .unwrap_or_else(|| io::Error::other("record formatting failed"))),
    }
}

macro_rules! record {
    ($out:expr, $($arg:tt)*) => {
        $crate::writer::write_record($out, format_args!($($arg)*))
    };
}
pub(crate) use record;

/// Buffered stream over a file descriptor destination.
pub struct FileStream {
    inner: BufWriter<Box<dyn Write + Send>>,
}

impl FileStream {
    pub fn stdout() -> Self {
        Self {
            inner: BufWriter::new(Box::new(io::stdout())),
        }
    }

    pub fn stderr() -> Self {
        Self {
            inner: BufWriter::new(Box::new(io::stderr())),
        }
    }

    pub fn create(path: &str) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: BufWriter::new(Box::new(file)),
        })
    }
}

impl OutStream for FileStream {
    fn putc(&mut self, c: u8) -> io::Result<()> {
        self.inner.write_all(&[c])
    }

    fn puts(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_all(s.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        let _ = self.inner.flush();
    }
}

/// Stream over an accepted TCP connection.
///
/// Binds a listener, waits for one client, optionally sends a prompt line,
/// then writes blocking for the rest of the run.
pub struct SocketStream {
    inner: BufWriter<TcpStream>,
}

/// Default and allowed port range for socket output.
pub const DEFAULT_SOCKET_PORT: u16 = 5050;
pub const MIN_SOCKET_PORT: u16 = 1024;

impl SocketStream {
    pub fn listen(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        let (stream, _peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            inner: BufWriter::new(stream),
        })
    }

    /// First line pushed to the client before any record.
    pub fn send_prompt(&mut self, prompt: &str) -> io::Result<()> {
        self.inner.write_all(prompt.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()
    }
}

impl OutStream for SocketStream {
    fn putc(&mut self, c: u8) -> io::Result<()> {
        self.inner.write_all(&[c])
    }

    fn puts(&mut self, s: &str) -> io::Result<()> {
        self.inner.write_all(s.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Where the raw stream goes, parsed from `DUMP_HEAPTRACK_OUTPUT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    Stdout,
    Stderr,
    Socket,
    /// File path template; `$$` expands to the pid.
    Path(String),
}

impl OutputSpec {
    /// Parse the destination from the environment, falling back to the
    /// `heapscope.$$` file template when unset.
    pub fn from_env() -> Self {
        match std::env::var("DUMP_HEAPTRACK_OUTPUT") {
            Ok(value) => Self::parse(&value),
            Err(_) => OutputSpec::Path("heapscope.$$".into()),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "-" | "stdout" => OutputSpec::Stdout,
            "stderr" => OutputSpec::Stderr,
            "socket" => OutputSpec::Socket,
            "" => OutputSpec::Path("heapscope.$$".into()),
            path => OutputSpec::Path(path.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to open output destination: {0}")]
    Io(#[from] io::Error),
}

fn socket_port_from_env() -> u16 {
    match std::env::var("DUMP_HEAPTRACK_SOCKET") {
        Ok(value) => match value.parse::<u16>() {
            Ok(port) if port >= MIN_SOCKET_PORT => port,
            _ => {
                tracing::warn!(
                    "DUMP_HEAPTRACK_SOCKET must be a port in {}-{}, using default {}",
                    MIN_SOCKET_PORT,
                    u16::MAX,
                    DEFAULT_SOCKET_PORT
                );
                DEFAULT_SOCKET_PORT
            }
        },
        Err(_) => DEFAULT_SOCKET_PORT,
    }
}

/// Expand the `$$` pid placeholder in a file template.
pub fn expand_pid_template(template: &str, pid: u32) -> String {
    template.replace("$$", &pid.to_string())
}

/// Open the configured destination.
pub fn open_output(spec: &OutputSpec) -> Result<Box<dyn OutStream>, OpenError> {
    match spec {
        OutputSpec::Stdout => Ok(Box::new(FileStream::stdout())),
        OutputSpec::Stderr => Ok(Box::new(FileStream::stderr())),
        OutputSpec::Socket => {
            let mut stream = SocketStream::listen(socket_port_from_env())?;
            if let Ok(prompt) = std::env::var("DUMP_HEAPTRACK_SOCKET_PROMPT") {
                if stream.send_prompt(&prompt).is_err() {
                    tracing::warn!("failed to send socket prompt");
                }
            }
            Ok(Box::new(stream))
        }
        OutputSpec::Path(template) => {
            let path = expand_pid_template(template, std::process::id());
            Ok(Box::new(FileStream::create(&path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_spec_parsing() {
        assert_eq!(OutputSpec::parse("-"), OutputSpec::Stdout);
        assert_eq!(OutputSpec::parse("stdout"), OutputSpec::Stdout);
        assert_eq!(OutputSpec::parse("stderr"), OutputSpec::Stderr);
        assert_eq!(OutputSpec::parse("socket"), OutputSpec::Socket);
        assert_eq!(
            OutputSpec::parse("/tmp/out.$$"),
            OutputSpec::Path("/tmp/out.$$".into())
        );
        assert_eq!(OutputSpec::parse(""), OutputSpec::Path("heapscope.$$".into()));
    }

    #[test]
    fn test_pid_template_expansion() {
        assert_eq!(expand_pid_template("trace.$$", 42), "trace.42");
        assert_eq!(expand_pid_template("no-placeholder", 42), "no-placeholder");
        assert_eq!(expand_pid_template("a.$$.b.$$", 7), "a.7.b.7");
    }

    #[test]
    fn test_file_stream_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        {
            let mut stream = FileStream::create(path.to_str().unwrap()).unwrap();
            write_record(&mut stream, format_args!("+ {:x} {:x} {:x}\n", 32, 1, 0x100)).unwrap();
            stream.flush().unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "+ 20 1 100\n");
    }
}
