//! Data Lifecycle Manager
//!
//! データポータビリティ（エクスポート）とアカウント削除（消去権）を
//! 明示的なステータス付きワークフローとして実行する。
//! どちらも分散トランザクションは使わない。削除はプロフィール行の
//! 削除成功を完了の確定シグナルとし、従属テーブルの部分失敗は
//! 記録したうえで先へ進む。

use super::audit_log::AuditLog;
use super::types::{DeletionRequest, DeletionStatus, ExportRequest, ExportStatus};
use crate::error::{Error, Result};
use crate::store::{DataDomain, DataStore};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};
use tokio::sync::RwLock;

/// エクスポートから一律に除去するフィールド名（小文字比較）
const SENSITIVE_FIELDS: [&str; 5] = ["password", "secret", "token", "api_key", "stripe_customer_id"];

/// データライフサイクル管理
pub struct LifecycleManager {
    /// 永続ストア
    store: Arc<dyn DataStore>,
    /// 監査ログ
    audit: Arc<AuditLog>,
    /// エクスポート成果物の出力先
    export_dir: PathBuf,
    /// ダウンロードURLのベース
    base_url: String,
    /// エクスポートリクエスト登録簿
    exports: Arc<RwLock<HashMap<String, ExportRequest>>>,
    /// 削除リクエスト登録簿
    deletions: Arc<RwLock<HashMap<String, DeletionRequest>>>,
}

impl LifecycleManager {
    /// 新しいライフサイクル管理を作成
    pub fn new(
        store: Arc<dyn DataStore>,
        audit: Arc<AuditLog>,
        export_dir: PathBuf,
        base_url: String,
    ) -> Self {
        Self {
            store,
            audit,
            export_dir,
            base_url,
            exports: Arc::new(RwLock::new(HashMap::new())),
            deletions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// データエクスポートを実行
    ///
    /// 各ドメインを順に収集する。1ドメインの失敗は他を中断させず、
    /// 失敗したドメインはバンドルに現れないだけ。機微フィールドは
    /// ドメインを問わず同じ除去リストで落とす。
    pub async fn request_export(&self, user_id: &str, email: &str) -> Result<ExportRequest> {
        let now = Utc::now();
        let mut request = ExportRequest::new(user_id, email, now);

        {
            let mut exports = self.exports.write().await;
            exports.insert(request.id.clone(), request.clone());
        }

        let mut domains = serde_json::Map::new();
        for domain in DataDomain::export_domains() {
            match self.store.fetch_user_rows(domain, user_id).await {
                Ok(rows) => {
                    let sanitized: Vec<serde_json::Value> =
                        rows.iter().map(strip_sensitive_fields).collect();
                    domains.insert(
                        domain.table_name().to_string(),
                        serde_json::Value::Array(sanitized),
                    );
                }
                Err(e) => {
                    tracing::warn!(domain = %domain, user_id = user_id, error = %e, "export domain fetch failed, continuing");
                }
            }
        }

        let bundle = serde_json::json!({
            "export_id": request.id,
            "user_id": user_id,
            "email": request.email,
            "generated_at": now,
            "domains": domains,
        });

        tokio::fs::create_dir_all(&self.export_dir).await?;
        let artifact_path = self.artifact_path(&request.id);
        let body = serde_json::to_vec_pretty(&bundle)?;
        tokio::fs::write(&artifact_path, body)
            .await
            .map_err(|e| Error::Artifact(format!("failed to write export artifact: {}", e)))?;

        request.status = ExportStatus::Completed;
        request.download_url = Some(format!("{}/api/data-export/{}", self.base_url, request.id));
        {
            let mut exports = self.exports.write().await;
            exports.insert(request.id.clone(), request.clone());
        }

        self.audit
            .record(
                "data_export_completed",
                "internal",
                serde_json::json!({
                    "export_id": request.id,
                    "user_id": user_id,
                    "expires_at": request.expires_at,
                }),
            )
            .await;

        Ok(request)
    }

    /// エクスポート成果物を取得
    ///
    /// 未知のIDと期限切れは同じ「not found or expired」として扱う。
    /// 期限切れ成果物の物理削除は別の残留データ掃除が担う。
    pub async fn get_export(&self, export_id: &str) -> Result<serde_json::Value> {
        let request = {
            let exports = self.exports.read().await;
            exports.get(export_id).cloned()
        };

        let request = request.ok_or_else(|| Error::NotFound("export not found or expired".to_string()))?;
        if Utc::now() > request.expires_at {
            return Err(Error::NotFound("export not found or expired".to_string()));
        }

        let artifact_path = self.artifact_path(export_id);
        let body = tokio::fs::read(&artifact_path)
            .await
            .map_err(|_| Error::NotFound("export not found or expired".to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// アカウント削除を受け付け
    ///
    /// この時点ではデータに触れない。本人確認メールの送信は
    /// 外部コラボレーターの仕事。
    pub async fn request_deletion(
        &self,
        user_id: &str,
        email: &str,
        reason: Option<String>,
    ) -> Result<DeletionRequest> {
        let request = DeletionRequest::new(user_id, email, reason, Utc::now());

        {
            let mut deletions = self.deletions.write().await;
            deletions.insert(request.id.clone(), request.clone());
        }

        self.audit
            .record(
                "deletion_requested",
                "internal",
                serde_json::json!({
                    "deletion_id": request.id,
                    "user_id": user_id,
                }),
            )
            .await;

        Ok(request)
    }

    /// 削除確認URL
    pub fn verification_url(&self, deletion_id: &str) -> String {
        format!(
            "{}/account/confirm-deletion?id={}",
            self.base_url,
            urlencoding::encode(deletion_id)
        )
    }

    /// 削除を確定
    ///
    /// 遷移は pending_verification → completed の一方向のみ。
    /// 完了済みリクエストへの再確認は成功の繰り返しではなくエラー。
    /// 手順: 削除前エクスポート（失敗は記録のみ）→ 従属ドメイン削除
    /// （失敗しても続行）→ プロフィール削除（失敗したら確認全体が失敗）。
    pub async fn confirm_deletion(&self, deletion_id: &str) -> Result<DeletionRequest> {
        let request = {
            let deletions = self.deletions.read().await;
            deletions.get(deletion_id).cloned()
        };

        let request = request.ok_or_else(|| {
            Error::InvalidState(format!("unknown deletion request: {}", deletion_id))
        })?;
        if request.status != DeletionStatus::PendingVerification {
            return Err(Error::InvalidState(format!(
                "deletion request {} is already completed",
                deletion_id
            )));
        }

        // 削除前の記録としてフルエクスポートを試みる
        if let Err(e) = self.request_export(&request.user_id, &request.email).await {
            tracing::warn!(deletion_id = deletion_id, error = %e, "pre-deletion export failed, continuing");
            self.audit
                .record(
                    "pre_deletion_export_failed",
                    "internal",
                    serde_json::json!({ "deletion_id": deletion_id, "error": e.to_string() }),
                )
                .await;
        }

        // 従属ドメインの掃除。部分的な失敗でも止めない
        for domain in DataDomain::dependent_domains() {
            match self.store.delete_user_rows(domain, &request.user_id).await {
                Ok(removed) => {
                    tracing::debug!(domain = %domain, removed = removed, "dependent domain cleared");
                }
                Err(e) => {
                    tracing::warn!(domain = %domain, error = %e, "dependent domain deletion failed, continuing");
                    self.audit
                        .record(
                            "domain_deletion_failed",
                            "internal",
                            serde_json::json!({
                                "deletion_id": deletion_id,
                                "domain": domain.table_name(),
                                "error": e.to_string(),
                            }),
                        )
                        .await;
                }
            }
        }

        // プロフィール削除が完了の確定シグナル。ここで失敗したら
        // 従属テーブルが先に消えていても確認全体を失敗させる
        self.store.delete_profile(&request.user_id).await?;

        let completed_at = Utc::now();
        let updated = {
            let mut deletions = self.deletions.write().await;
            let entry = deletions.get_mut(deletion_id).ok_or_else(|| {
                Error::InvalidState(format!("unknown deletion request: {}", deletion_id))
            })?;
            entry.status = DeletionStatus::Completed;
            entry.deleted_at = Some(completed_at);
            entry.clone()
        };

        self.audit
            .record(
                "account_deleted",
                "internal",
                serde_json::json!({
                    "deletion_id": deletion_id,
                    "user_id": updated.user_id,
                    "completed_at": completed_at,
                }),
            )
            .await;

        Ok(updated)
    }

    /// 削除リクエストの状態を取得（読み取り専用）
    pub async fn get_deletion_status(&self, deletion_id: &str) -> Option<DeletionRequest> {
        let deletions = self.deletions.read().await;
        deletions.get(deletion_id).cloned()
    }

    /// 古いエクスポート成果物を削除（残留データ掃除）
    ///
    /// ファイルの更新時刻ベースのベストエフォート。削除ワークフローの
    /// 正しさには関与しない。
    pub async fn purge_expired_artifacts(&self, days: u64) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(StdDuration::from_secs(days * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.export_dir).await {
            Ok(entries) => entries,
            // 出力先が未作成なら掃除するものがない
            Err(_) => return Ok(0),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified < cutoff {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove expired artifact");
                } else {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.audit
                .record(
                    "expired_artifacts_purged",
                    "internal",
                    serde_json::json!({ "removed": removed, "older_than_days": days }),
                )
                .await;
        }

        Ok(removed)
    }

    fn artifact_path(&self, export_id: &str) -> PathBuf {
        self.export_dir.join(format!("{}.json", export_id))
    }
}

/// 機微フィールドを再帰的に除去
fn strip_sensitive_fields(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let cleaned: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter(|(key, _)| {
                    let key = key.to_lowercase();
                    !SENSITIVE_FIELDS.contains(&key.as_str())
                })
                .map(|(key, value)| (key.clone(), strip_sensitive_fields(value)))
                .collect();
            serde_json::Value::Object(cleaned)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(strip_sensitive_fields).collect())
        }
        other => other.clone(),
    }
}
