use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// 外部プロバイダー単位のポリシー設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderPolicy {
    /// 表示名
    pub display_name: String,
    /// 1分あたりの許容リクエスト数（時間上限はこの値×60で導出される）
    pub requests_per_minute: u64,
    /// 1日あたりの許容リクエスト数
    pub requests_per_day: u64,
    /// キャッシュ保持期間（時間）
    pub retention_hours: i64,
}

/// コンプライアンスコアの設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComplianceConfig {
    /// 事前設定されたプロバイダー（キーは大文字識別子）
    pub providers: HashMap<String, ProviderPolicy>,
    /// 個人識別データのキャッシュ保持期間（日数）
    pub pii_retention_days: i64,
    /// 監査ログの出力ディレクトリ
    pub log_dir: PathBuf,
    /// エクスポート成果物の出力ディレクトリ
    pub export_dir: PathBuf,
    /// 確認リンク・配信停止リンクのベースURL
    pub base_url: String,
    /// CAN-SPAM用のブランド表示名
    pub brand_name: String,
    /// CAN-SPAM用の郵送先住所（フッターに必須）
    pub postal_address: String,
    /// mailto: フォールバックの配信停止アドレス
    pub unsubscribe_mailbox: String,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "KROGER".to_string(),
            ProviderPolicy {
                display_name: "Kroger Product Catalog".to_string(),
                requests_per_minute: 300,
                requests_per_day: 50_000,
                retention_hours: 24,
            },
        );
        providers.insert(
            "SPOONACULAR".to_string(),
            ProviderPolicy {
                display_name: "Spoonacular Recipe API".to_string(),
                requests_per_minute: 60,
                requests_per_day: 1_500,
                retention_hours: 24,
            },
        );

        Self {
            providers,
            pii_retention_days: 30,
            log_dir: PathBuf::from("logs/compliance"),
            export_dir: PathBuf::from("exports"),
            base_url: "https://3cmall.app".to_string(),
            brand_name: "3C Mall".to_string(),
            postal_address: "3C Mall, 2261 Market Street #4628, San Francisco, CA 94114".to_string(),
            unsubscribe_mailbox: "unsubscribe@3cmall.app".to_string(),
        }
    }
}

impl ComplianceConfig {
    /// 設定ファイルから読み込み、環境変数で上書き
    pub fn load() -> crate::error::Result<Self> {
        let mut settings = config::Config::builder();

        // デフォルト値を設定
        let default_config = ComplianceConfig::default();
        settings = settings.add_source(
            config::Config::try_from(&default_config)
                .map_err(|e| crate::error::Error::Config(e.to_string()))?,
        );

        // 設定ファイルを読み込み（複数の場所を試行）
        let config_paths = ["compliance.toml", "config/compliance.toml"];
        for path in &config_paths {
            if std::path::Path::new(path).exists() {
                settings = settings.add_source(config::File::with_name(path));
                break;
            }
        }

        // 環境変数で上書き (MALL_で始まる変数)
        settings = settings.add_source(
            config::Environment::with_prefix("MALL")
                .separator("__")
                .try_parsing(true),
        );

        let config: ComplianceConfig = settings
            .build()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;

        Ok(config)
    }

    /// プロバイダーのポリシーを取得
    pub fn provider(&self, name: &str) -> Option<&ProviderPolicy> {
        self.providers.get(name)
    }
}
