use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error)
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// コンソール出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
}

#[derive(Debug, Clone)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            console_enabled: true,
            file_enabled: true,
            rotation: LogRotation::Daily,
        }
    }
}

/// tracing サブスクライバーを初期化
///
/// 返り値の `WorkerGuard` はプロセス終了までドロップしないこと。
/// ドロップするとバッファ済みのファイル出力が失われる。
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = if config.console_enabled {
        Some(fmt::layer().with_target(true))
    } else {
        None
    };

    let (file_layer, guard) = if config.file_enabled {
        fs::create_dir_all(&config.log_dir)?;
        let appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, "mall-compliance.log"),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, "mall-compliance.log"),
            LogRotation::Never => rolling::never(&config.log_dir, "mall-compliance.log"),
        };
        let (writer, guard) = non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}
