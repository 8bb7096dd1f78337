//! 3C Mall Compliance Core
//!
//! API利用統制・CAN-SPAM同意管理・データライフサイクルのコア。
//!
//! ## 主要機能
//!
//! - **レート・保持統制**: プロバイダー別の固定ウィンドウカウンターと
//!   キャッシュデータの保持期限追跡
//! - **監査・違反ログ**: 統制対象イベントの追記専用記録と
//!   セキュリティインシデント管理
//! - **同意管理**: 受信者×カテゴリ単位の送信可否判定と配信停止処理
//! - **データライフサイクル**: ポータビリティエクスポートと
//!   消去権ワークフロー
//!
//! ## 使用例
//!
//! ```rust
//! use mall_compliance::compliance::ComplianceEngine;
//! use mall_compliance::config::ComplianceConfig;
//! use mall_compliance::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ComplianceEngine::new(
//!     ComplianceConfig::default(),
//!     Arc::new(MemoryStore::new()),
//! );
//!
//! let decision = engine.track_api_request("KROGER", "/v1/products", None).await;
//! if decision.allowed {
//!     // パートナーAPIを呼び出す
//! }
//! # Ok(())
//! # }
//! ```

pub mod audit_log;
pub mod consent_manager;
pub mod engine;
pub mod lifecycle_manager;
pub mod rate_ledger;
pub mod types;

pub use audit_log::{AuditLog, BreachNotifyOutcome};
pub use consent_manager::{ConsentLedger, UnsubscribeHeaders};
pub use engine::ComplianceEngine;
pub use lifecycle_manager::LifecycleManager;
pub use rate_ledger::RateLedger;
pub use types::*;
