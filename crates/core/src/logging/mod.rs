use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::Local;
use log::LevelFilter;
use once_cell::sync::OnceCell;
use tracing::{subscriber, Level};
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::{filter_fn, EnvFilter, LevelFilter as TracingLevelFilter},
    fmt::{self, format::Writer, time::FormatTime, writer::MakeWriter},
    layer::{Layer, SubscriberExt},
    registry,
};

use crate::config::LoggingConfig;

static INIT_GUARD: OnceCell<()> = OnceCell::new();

/// 初始化 tracing 日志：终端输出 + info/error 两个按大小滚动的文件。
pub fn init_logging(config: &LoggingConfig) -> Result<(), LogInitError> {
    if INIT_GUARD.get().is_some() {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        if !err.to_string().contains("already") {
            return Err(LogInitError::Bridge(err.to_string()));
        }
    }

    let directive = resolve_directive(config)?;
    let env_filter = EnvFilter::try_new(directive)
        .or_else(|_| EnvFilter::try_new(config.level.trim()))
        .map_err(|err| LogInitError::InvalidFilter(err.to_string()))?;

    let log_dir = Path::new(&config.directory);
    fs::create_dir_all(log_dir)
        .map_err(|err| LogInitError::Io(format!("创建日志目录失败: {}", err)))?;

    let policy = RotationPolicy::from_config(config);
    let info_writer = RotatingFileWriter::new(log_dir.join("info.log"), policy)
        .map_err(|err| LogInitError::Io(format!("初始化 info.log 失败: {}", err)))?;
    let error_writer = RotatingFileWriter::new(log_dir.join("error.log"), policy)
        .map_err(|err| LogInitError::Io(format!("初始化 error.log 失败: {}", err)))?;

    let shared_format = fmt::format()
        .with_timer(LocalTimer)
        .with_level(true)
        .with_target(true)
        .with_thread_names(true);

    let console_layer = fmt::layer()
        .event_format(shared_format.clone())
        .with_writer(std::io::stdout)
        .with_ansi(true);

    let info_layer = fmt::layer()
        .event_format(shared_format.clone())
        .with_ansi(false)
        .with_writer(info_writer)
        .with_filter(filter_fn(|metadata| {
            let level = metadata.level();
            *level >= Level::INFO && *level <= Level::WARN
        }));

    let error_layer = fmt::layer()
        .event_format(shared_format)
        .with_ansi(false)
        .with_writer(error_writer)
        .with_filter(TracingLevelFilter::ERROR);

    let subscriber = registry::Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(info_layer)
        .with(error_layer);

    match subscriber::set_global_default(subscriber) {
        Ok(()) => {
            let _ = INIT_GUARD.set(());
            Ok(())
        }
        Err(err) if err.to_string().contains("already") => {
            let _ = INIT_GUARD.set(());
            Ok(())
        }
        Err(err) => Err(LogInitError::Init(err.to_string())),
    }
}

/// 过滤规则优先取自规则文件（每行一条，`#` 开头为注释），否则使用 `level`。
fn resolve_directive(config: &LoggingConfig) -> Result<String, LogInitError> {
    if let Some(path) = &config.config_file {
        let cfg_path = Path::new(path);
        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .map_err(|err| LogInitError::ConfigFile(err.to_string()))?;
            let directives: Vec<&str> = raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect();
            if !directives.is_empty() {
                return Ok(directives.join(","));
            }
        }
    }

    Ok(config.level.trim().to_string())
}

#[derive(Debug, Clone, Copy)]
struct RotationPolicy {
    max_size: u64,
    max_files: usize,
}

impl RotationPolicy {
    fn from_config(config: &LoggingConfig) -> Self {
        Self {
            max_size: if config.max_size_mb == 0 {
                u64::MAX
            } else {
                config.max_size_mb.saturating_mul(1024 * 1024)
            },
            max_files: config.max_files,
        }
    }
}

#[derive(Clone)]
struct RotatingFileWriter {
    inner: Arc<RotatingFileInner>,
}

struct RotatingFileInner {
    path: PathBuf,
    base_name: String,
    policy: RotationPolicy,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    size: u64,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl RotatingFileWriter {
    fn new(path: PathBuf, policy: RotationPolicy) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        let base_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("log")
            .to_string();
        Ok(Self {
            inner: Arc::new(RotatingFileInner {
                path,
                base_name,
                policy,
                state: Mutex::new(FileState { file, size }),
            }),
        })
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileGuard {
            inner: self.inner.clone(),
        }
    }
}

struct RotatingFileGuard {
    inner: Arc<RotatingFileInner>,
}

#[derive(Clone)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

impl RotatingFileInner {
    fn lock(&self) -> io::Result<MutexGuard<'_, FileState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "日志文件锁失效"))
    }

    fn should_rotate(&self, state: &FileState, incoming: usize) -> bool {
        self.policy.max_size != u64::MAX
            && state.size > 0
            && state.size.saturating_add(incoming as u64) > self.policy.max_size
    }

    /// 当前文件改名为 `<name>.<时间戳>`，再新建同名文件继续写。
    fn rotate(&self, state: &mut FileState) -> io::Result<()> {
        state.file.flush()?;
        let rotated_name = format!(
            "{}.{}",
            self.base_name,
            Local::now().format("%Y%m%d%H%M%S%3f")
        );
        let rotated_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(rotated_name);
        if self.path.exists() {
            fs::rename(&self.path, &rotated_path)?;
        }
        state.file = open_append(&self.path)?;
        state.size = 0;
        self.prune_rotated()
    }

    /// 只保留最新的 `max_files` 个历史文件，0 表示不限制。
    fn prune_rotated(&self) -> io::Result<()> {
        if self.policy.max_files == 0 {
            return Ok(());
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}.", self.base_name);
        let mut rotated: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        if rotated.len() <= self.policy.max_files {
            return Ok(());
        }
        // 时间戳定长，字典序即时间序
        rotated.sort();
        let excess = rotated.len() - self.policy.max_files;
        for path in rotated.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }
}

impl Write for RotatingFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock()?;
        if self.inner.should_rotate(&state, buf.len()) {
            self.inner.rotate(&mut state)?;
        }
        let written = state.file.write(buf)?;
        state.size = state.size.saturating_add(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock()?.file.flush()
    }
}

/// 日志初始化相关错误。
#[derive(thiserror::Error, Debug)]
pub enum LogInitError {
    #[error("日志桥接初始化失败: {0}")]
    Bridge(String),
    #[error("日志过滤规则解析失败: {0}")]
    InvalidFilter(String),
    #[error("日志配置文件读取失败: {0}")]
    ConfigFile(String),
    #[error("日志系统初始化失败: {0}")]
    Init(String),
    #[error("日志 IO 操作失败: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_files(dir: &Path, base: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{}.", base))
            })
            .count()
    }

    #[test]
    fn test_writer_rotates_by_size_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RotatingFileWriter::new(
            dir.path().join("info.log"),
            RotationPolicy {
                max_size: 16,
                max_files: 2,
            },
        )
        .unwrap();

        for _ in 0..5 {
            let mut guard = writer.make_writer();
            guard.write_all(b"0123456789abcd\n").unwrap();
            guard.flush().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(rotated_files(dir.path(), "info.log") <= 2);
        let current = fs::read(dir.path().join("info.log")).unwrap();
        assert_eq!(current.len(), 15);
    }

    #[test]
    fn test_directive_file_overrides_level() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("log.rules");
        fs::write(&rules, "# 注释\nliquidity_snapshot_core=debug\n\nwarn\n").unwrap();
        let config = LoggingConfig {
            level: "info".into(),
            config_file: Some(rules.to_string_lossy().into_owned()),
            directory: dir.path().to_string_lossy().into_owned(),
            max_size_mb: 1,
            max_files: 1,
        };
        assert_eq!(
            resolve_directive(&config).unwrap(),
            "liquidity_snapshot_core=debug,warn"
        );
    }
}
