//! Compliance Engine
//!
//! 外部の呼び出し元（HTTPハンドラー・メール送信側）が叩くポリシー
//! ファサード。各操作は該当する台帳に問い合わせ、監査記録を残した上で
//! 構造化された結果を返す。ポリシーによる拒否は戻り値であり、
//! 依存先の生の例外をこの境界の外へ漏らさない。
//!
//! グローバルシングルトンは持たない。プロセス起動時に構築し、
//! テストは独立したインスタンスを立てられる。

use super::audit_log::{AuditLog, BreachNotifyOutcome};
use super::consent_manager::{ConsentLedger, ConsentStatistics, UnsubscribeHeaders};
use super::lifecycle_manager::LifecycleManager;
use super::rate_ledger::RateLedger;
use super::types::{
    BreachSeverity, CachedDataClass, ComplianceReport, ContentCompliance, CredentialScan,
    DeletionRequest, EmailCategory, ConsentStatus, PolicyDecision, ReportPeriod,
    ReportStatistics, SecurityBreachRecord,
};
use crate::config::ComplianceConfig;
use crate::error::Result;
use crate::store::DataStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 同意記録の受理結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentReceipt {
    /// 記録されたか
    pub recorded: bool,
    /// 対象カテゴリ
    pub categories: Vec<EmailCategory>,
}

/// 配信停止の受理結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeReceipt {
    /// 処理されたか
    pub processed: bool,
}

/// エクスポートの受理結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReceipt {
    /// 成功したか
    pub success: bool,
    /// エクスポートID
    pub export_id: String,
    /// ダウンロードURL
    pub download_url: Option<String>,
    /// ダウンロード期限
    pub expires_at: DateTime<Utc>,
}

/// アカウント削除の受理結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionReceipt {
    /// 成功したか
    pub success: bool,
    /// 削除リクエストID
    pub deletion_id: String,
    /// 本人確認URL
    pub verification_url: String,
}

/// 削除確定の結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionConfirmation {
    /// 成功したか
    pub success: bool,
    /// メッセージ
    pub message: String,
    /// 完了日時
    pub completed_at: DateTime<Utc>,
}

/// 残留データ掃除の結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualCleanup {
    /// 削除したキャッシュ記録数
    pub cache_records_removed: usize,
    /// 削除したエクスポート成果物数
    pub artifacts_removed: usize,
}

/// コンプライアンスエンジン（ポリシーファサード)
pub struct ComplianceEngine {
    /// 監査・違反ログ
    audit: Arc<AuditLog>,
    /// レート・保持台帳
    rate_ledger: Arc<RateLedger>,
    /// 同意台帳
    consent: Arc<ConsentLedger>,
    /// ライフサイクル管理
    lifecycle: Arc<LifecycleManager>,
}

impl ComplianceEngine {
    /// 新しいエンジンを構築
    pub fn new(config: ComplianceConfig, store: Arc<dyn DataStore>) -> Self {
        let audit = Arc::new(AuditLog::new(config.log_dir.clone()));
        let rate_ledger = Arc::new(RateLedger::new(&config, Arc::clone(&audit)));
        let consent = Arc::new(ConsentLedger::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&audit),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            store,
            Arc::clone(&audit),
            config.export_dir.clone(),
            config.base_url.clone(),
        ));

        Self {
            audit,
            rate_ledger,
            consent,
            lifecycle,
        }
    }

    /// パートナーAPI呼び出しの可否を判定
    pub async fn track_api_request(
        &self,
        provider: &str,
        endpoint: &str,
        user_id: Option<&str>,
    ) -> PolicyDecision {
        self.rate_ledger
            .track_request(provider, endpoint, user_id)
            .await
    }

    /// キャッシュしたパートナーデータを登録
    pub async fn track_cached_data(
        &self,
        provider: &str,
        data_id: &str,
        data_size: u64,
        user_id: Option<&str>,
        class: CachedDataClass,
    ) {
        self.rate_ledger
            .track_cached_data(provider, data_id, data_size, user_id, class)
            .await
    }

    /// メール送信可否を判定
    pub async fn verify_opt_in(&self, email: &str, category: EmailCategory) -> PolicyDecision {
        self.consent.verify_opt_in(email, category).await
    }

    /// 同意を記録
    pub async fn record_consent(
        &self,
        email: &str,
        categories: &[EmailCategory],
        consent_type: Option<ConsentStatus>,
    ) -> Result<ConsentReceipt> {
        self.consent
            .record_consent(email, categories, consent_type)
            .await?;
        Ok(ConsentReceipt {
            recorded: true,
            categories: categories.to_vec(),
        })
    }

    /// 配信停止を処理
    pub async fn process_unsubscribe(
        &self,
        email: &str,
        categories: &[EmailCategory],
        reason: Option<&str>,
    ) -> Result<UnsubscribeReceipt> {
        self.consent
            .process_unsubscribe(email, categories, reason)
            .await?;
        Ok(UnsubscribeReceipt { processed: true })
    }

    /// メール本文のCAN-SPAM検証
    pub fn validate_email_content(&self, body: &str, category: EmailCategory) -> ContentCompliance {
        self.consent.validate_content(body, category)
    }

    /// ワンクリック配信停止ヘッダーを生成
    pub fn unsubscribe_headers(&self, email: &str) -> UnsubscribeHeaders {
        self.consent.unsubscribe_headers(email)
    }

    /// データエクスポートを実行
    pub async fn request_data_export(&self, user_id: &str, email: &str) -> Result<ExportReceipt> {
        let request = self.lifecycle.request_export(user_id, email).await?;
        Ok(ExportReceipt {
            success: true,
            export_id: request.id,
            download_url: request.download_url,
            expires_at: request.expires_at,
        })
    }

    /// エクスポート成果物を取得
    pub async fn get_data_export(&self, export_id: &str) -> Result<serde_json::Value> {
        self.lifecycle.get_export(export_id).await
    }

    /// アカウント削除を受け付け
    pub async fn request_account_deletion(
        &self,
        user_id: &str,
        email: &str,
        reason: Option<String>,
    ) -> Result<DeletionReceipt> {
        let request = self.lifecycle.request_deletion(user_id, email, reason).await?;
        let verification_url = self.lifecycle.verification_url(&request.id);
        Ok(DeletionReceipt {
            success: true,
            deletion_id: request.id,
            verification_url,
        })
    }

    /// アカウント削除を確定
    pub async fn confirm_account_deletion(&self, deletion_id: &str) -> Result<DeletionConfirmation> {
        let request = self.lifecycle.confirm_deletion(deletion_id).await?;
        Ok(DeletionConfirmation {
            success: true,
            message: format!("account data for user {} permanently removed", request.user_id),
            completed_at: request.deleted_at.unwrap_or_else(Utc::now),
        })
    }

    /// 削除リクエストの状態を取得
    pub async fn get_deletion_status(&self, deletion_id: &str) -> Option<DeletionRequest> {
        self.lifecycle.get_deletion_status(deletion_id).await
    }

    /// セキュリティインシデントを記録
    pub async fn report_security_breach(
        &self,
        incident_type: &str,
        description: &str,
        affected_users: Vec<String>,
        severity: BreachSeverity,
    ) -> SecurityBreachRecord {
        self.audit
            .report_security_breach(incident_type, description, affected_users, severity)
            .await
    }

    /// インシデントを通知済みに遷移
    pub async fn mark_breach_notified(&self, breach_id: &str, method: &str) -> BreachNotifyOutcome {
        self.audit.mark_breach_notified(breach_id, method).await
    }

    /// 自由テキストを秘密情報パターンでスキャン
    pub async fn scan_for_credential_exposure(
        &self,
        content: &str,
        provider: &str,
    ) -> CredentialScan {
        self.audit
            .scan_for_credential_exposure(content, provider)
            .await
    }

    /// 保持期限を過ぎたキャッシュデータを削除
    pub async fn enforce_retention(&self) -> usize {
        self.rate_ledger.enforce_retention().await
    }

    /// 残留データ掃除（ベストエフォート）
    pub async fn cleanup_residual_data(&self, user_id: &str, days: u64) -> ResidualCleanup {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let cache_records_removed = self
            .rate_ledger
            .purge_cached_for_user(user_id, cutoff)
            .await;
        let artifacts_removed = match self.lifecycle.purge_expired_artifacts(days).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "artifact purge failed during residual cleanup");
                0
            }
        };
        ResidualCleanup {
            cache_records_removed,
            artifacts_removed,
        }
    }

    /// コンプライアンスレポートを生成
    ///
    /// 期間未指定は直近30日。`period` はメタデータであり、`statistics`
    /// はプロセス開始以降の累積値をそのまま報告する。
    pub async fn get_compliance_report(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> ComplianceReport {
        let end = end.unwrap_or_else(Utc::now);
        let start = start.unwrap_or(end - Duration::days(30));
        let (breach_count, unresolved_breaches) = self.audit.breach_counts().await;

        ComplianceReport {
            id: uuid::Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            period: ReportPeriod { start, end },
            statistics: ReportStatistics {
                total_requests_tracked: self.rate_ledger.total_tracked(),
                total_requests_denied: self.rate_ledger.total_denied(),
                cached_items: self.rate_ledger.cached_item_count().await,
                violation_count: self.audit.violation_count().await,
                breach_count,
                unresolved_breaches,
            },
            recent_violations: self.audit.recent_violations(100).await,
            recent_audit_entries: self.audit.recent_entries(50).await,
        }
    }

    /// 同意台帳の統計を取得
    pub async fn consent_statistics(&self) -> ConsentStatistics {
        self.consent.get_statistics().await
    }

    /// 定期メンテナンスタスクを起動
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        Arc::clone(&self.rate_ledger).spawn_maintenance()
    }

    /// 監査ログへの参照
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_engine() -> (ComplianceEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let mut config = ComplianceConfig::default();
        config.log_dir = dir.path().join("logs");
        config.export_dir = dir.path().join("exports");
        let engine = ComplianceEngine::new(config, Arc::new(MemoryStore::new()));
        (engine, dir)
    }

    #[tokio::test]
    async fn test_report_reflects_lifetime_statistics() {
        let (engine, _dir) = test_engine();

        engine.track_api_request("KROGER", "/v1/products", None).await;
        engine.track_api_request("ACME", "/v1/products", None).await;

        // 過去の期間を指定しても統計は累積値のまま
        let report = engine
            .get_compliance_report(
                Some(Utc::now() - Duration::days(365)),
                Some(Utc::now() - Duration::days(300)),
            )
            .await;

        assert_eq!(report.statistics.total_requests_tracked, 1);
        assert_eq!(report.statistics.total_requests_denied, 1);
        assert_eq!(report.statistics.violation_count, 1);
    }

    #[tokio::test]
    async fn test_report_default_period_is_trailing_thirty_days() {
        let (engine, _dir) = test_engine();

        let report = engine.get_compliance_report(None, None).await;
        let window = report.period.end - report.period.start;
        assert_eq!(window, Duration::days(30));
    }

    #[tokio::test]
    async fn test_facade_wires_consent_and_lifecycle() {
        let (engine, _dir) = test_engine();

        let receipt = engine
            .record_consent("user@example.com", &[EmailCategory::Marketing], None)
            .await
            .expect("record failed");
        assert!(receipt.recorded);

        let decision = engine
            .verify_opt_in("user@example.com", EmailCategory::Marketing)
            .await;
        assert!(decision.allowed);

        let export = engine
            .request_data_export("u-1", "user@example.com")
            .await
            .expect("export failed");
        assert!(export.success);
        assert!(export.download_url.is_some());
    }
}
