use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt, EnvFilter,
    Layer,
};
use vm_core::error::{Result, VmError};

// --- Tee writer: console and file at once ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write_all(buf);
        let res_b = self.b.write_all(buf);
        res_a.or(res_b).map(|_| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(&self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(&self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

/// Subscriber settings, normally read from `VM_LOG_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: env::temp_dir().join("vm-orchestrator.log"),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Unknown values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(level) = lookup("VM_LOG_LEVEL") {
            settings.level = level;
        }
        settings.format = match lookup("VM_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Human,
        };
        settings.output = match lookup("VM_LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            _ => LogOutput::Console,
        };
        if let Some(path) = lookup("VM_LOG_FILE") {
            settings.file_path = PathBuf::from(path);
        }
        settings
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    fn file_parts(&self) -> (PathBuf, PathBuf) {
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(env::temp_dir);
        let name = self
            .file_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("vm-orchestrator.log"));
        (dir, name)
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Human => layer.pretty().boxed(),
    }
}

/// Initializes the global tracing subscriber from `VM_LOG_*` variables.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process when file output is enabled.
pub fn init_subscriber() -> Result<Option<WorkerGuard>> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let mut guard = None;

    let layer = match (settings.output.console(), settings.output.file()) {
        (true, true) => {
            let (dir, name) = settings.file_parts();
            let (writer, file_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            guard = Some(file_guard);
            fmt_layer(
                settings.format,
                MakeTee {
                    make_a: io::stdout,
                    make_b: writer,
                },
                false,
            )
        }
        (false, true) => {
            let (dir, name) = settings.file_parts();
            let (writer, file_guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            guard = Some(file_guard);
            fmt_layer(settings.format, writer, false)
        }
        _ => fmt_layer(settings.format, io::stdout, true),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(settings.filter())
        .try_init()
        .map_err(|e| VmError::Internal(format!("Failed to initialize tracing: {}", e)))?;

    Ok(guard)
}

/// Test-friendly subscriber writing through the test harness capture.
/// Safe to call from many tests; only the first call installs it.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]);
        assert_eq!(s.level, "info");
        assert_eq!(s.format, LogFormat::Human);
        assert_eq!(s.output, LogOutput::Console);
    }

    #[test]
    fn test_reads_all_variables() {
        let s = settings(&[
            ("VM_LOG_LEVEL", "vm_orchestrator=trace"),
            ("VM_LOG_FORMAT", "json"),
            ("VM_LOG_OUTPUT", "both"),
            ("VM_LOG_FILE", "/var/log/vm/orch.log"),
        ]);
        assert_eq!(s.level, "vm_orchestrator=trace");
        assert_eq!(s.format, LogFormat::Json);
        assert_eq!(s.output, LogOutput::Both);

        let (dir, name) = s.file_parts();
        assert_eq!(dir, PathBuf::from("/var/log/vm"));
        assert_eq!(name, PathBuf::from("orch.log"));
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let s = settings(&[("VM_LOG_FORMAT", "xml"), ("VM_LOG_OUTPUT", "syslog")]);
        assert_eq!(s.format, LogFormat::Human);
        assert_eq!(s.output, LogOutput::Console);
    }

    #[test]
    fn test_bare_file_name_goes_to_temp_dir() {
        let s = settings(&[("VM_LOG_FILE", "orch.log")]);
        let (dir, name) = s.file_parts();
        assert_eq!(dir, env::temp_dir());
        assert_eq!(name, PathBuf::from("orch.log"));
    }

    #[test]
    fn test_output_flags() {
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::File.console());
        assert!(!LogOutput::Console.file());
    }
}
