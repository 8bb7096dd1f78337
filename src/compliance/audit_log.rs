//! Audit & Violation Log
//!
//! 統制対象イベントの追記専用記録。高速な直近照会のための有界
//! インメモリミラーと、カテゴリ別に分割された耐久ログファイルを併せ持つ。

use super::types::{
    AuditEntry, BreachSeverity, BreachStatus, CredentialFinding, CredentialScan,
    SecurityBreachRecord, ViolationRecord, ViolationType,
};
use chrono::Utc;
use regex::RegexBuilder;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// インメモリミラーの上限
const MAX_MEMORY_ENTRIES: usize = 10_000;
/// 上限超過時に残す直近エントリ数（バッチトリム）
const TRIM_TO: usize = 5_000;

/// 検出抜粋の最大文字数（秘密情報の再露出防止）
const EXCERPT_CHARS: usize = 20;

/// 耐久ログのカテゴリ別ファイル名
const AUDIT_LOG_FILE: &str = "audit.log";
const VIOLATIONS_LOG_FILE: &str = "violations.log";
const INCIDENTS_LOG_FILE: &str = "security-incidents.log";

/// インシデント通知の処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachNotifyOutcome {
    /// 通知済みに遷移した
    Notified,
    /// 既に通知済み（遷移は一度だけ）
    AlreadyNotified,
    /// 該当インシデントなし
    NotFound,
}

/// 監査・違反ログ
pub struct AuditLog {
    /// 耐久ログの出力ディレクトリ
    log_dir: PathBuf,
    /// インメモリミラー（有界）
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    /// 違反記録（ミラーとは独立・非有界）
    violations: Arc<RwLock<Vec<ViolationRecord>>>,
    /// インシデント記録（削除されない）
    breaches: Arc<RwLock<HashMap<String, SecurityBreachRecord>>>,
    /// 汎用の秘密情報パターン
    generic_patterns: Vec<(String, regex::Regex)>,
}

impl AuditLog {
    /// 新しい監査ログを作成
    pub fn new(log_dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            tracing::error!(dir = %log_dir.display(), error = %e, "failed to create audit log directory");
        }

        let generic_patterns = [
            ("api_key", r"api[_-]?key\s*[=:]\s*[^\s'\x22]+"),
            ("key", r"\bkey\s*=\s*[^\s'\x22]+"),
            ("token", r"\btoken\s*[=:]\s*[^\s'\x22]+"),
            ("secret", r"\bsecret\s*[=:]\s*[^\s'\x22]+"),
            ("password", r"\bpassword\s*[=:]\s*[^\s'\x22]+"),
            ("bearer", r"\bbearer\s+[a-z0-9._\-]+"),
        ]
        .into_iter()
        .filter_map(|(name, pattern)| {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => Some((name.to_string(), re)),
                Err(e) => {
                    tracing::error!(pattern = name, error = %e, "invalid credential pattern");
                    None
                }
            }
        })
        .collect();

        Self {
            log_dir,
            entries: Arc::new(RwLock::new(Vec::new())),
            violations: Arc::new(RwLock::new(Vec::new())),
            breaches: Arc::new(RwLock::new(HashMap::new())),
            generic_patterns,
        }
    }

    /// 監査エントリを記録
    ///
    /// インメモリミラーは10,000件を超えた時点で直近5,000件まで
    /// 一括でトリムされる（常時固定長のスライディングウィンドウではない）。
    /// 耐久ログへの書き込み失敗は判定を妨げない。
    pub async fn record(&self, event_type: &str, provider: &str, details: serde_json::Value) {
        let entry = AuditEntry {
            event_type: event_type.to_string(),
            provider: provider.to_string(),
            timestamp: Utc::now(),
            details,
        };

        {
            let mut entries = self.entries.write().await;
            entries.push(entry.clone());
            if entries.len() > MAX_MEMORY_ENTRIES {
                let drop = entries.len() - TRIM_TO;
                entries.drain(..drop);
            }
        }

        self.append_line(AUDIT_LOG_FILE, &entry).await;
    }

    /// 違反を記録
    ///
    /// 違反リストは監査ミラーとは別に保持され、トリムされない。
    pub async fn report_violation(
        &self,
        violation_type: ViolationType,
        provider: &str,
        endpoint: &str,
        user_id: Option<&str>,
        details: impl Into<String>,
    ) {
        let violation = ViolationRecord {
            violation_type,
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            user_id: user_id.map(|s| s.to_string()),
            timestamp: Utc::now(),
            details: details.into(),
        };

        tracing::warn!(
            violation = %violation_type,
            provider = provider,
            endpoint = endpoint,
            "compliance violation recorded"
        );

        self.append_line(VIOLATIONS_LOG_FILE, &violation).await;

        {
            let mut violations = self.violations.write().await;
            violations.push(violation.clone());
        }

        self.record(
            "violation",
            provider,
            serde_json::json!({
                "violation_type": violation_type,
                "endpoint": endpoint,
                "user_id": violation.user_id,
                "details": violation.details,
            }),
        )
        .await;
    }

    /// セキュリティインシデントを記録
    ///
    /// 通知期限は発見時刻から48時間で確定する（規制要件）。
    /// 作成した記録を返すので、呼び出し側はIDを参照できる。
    pub async fn report_security_breach(
        &self,
        incident_type: &str,
        description: &str,
        affected_users: Vec<String>,
        severity: BreachSeverity,
    ) -> SecurityBreachRecord {
        let breach = SecurityBreachRecord::new(
            incident_type,
            description,
            affected_users,
            severity,
            Utc::now(),
        );

        tracing::error!(
            breach_id = %breach.id,
            incident_type = incident_type,
            affected = breach.affected_users.len(),
            "security breach reported"
        );

        self.append_line(INCIDENTS_LOG_FILE, &breach).await;

        {
            let mut breaches = self.breaches.write().await;
            breaches.insert(breach.id.clone(), breach.clone());
        }

        self.record(
            "security_breach",
            "internal",
            serde_json::json!({
                "breach_id": breach.id,
                "incident_type": incident_type,
                "severity": severity,
                "notification_deadline": breach.notification_deadline,
            }),
        )
        .await;

        breach
    }

    /// インシデントを通知済みに遷移
    ///
    /// 未知のIDはエラーにしない。遷移成功・通知済み・未検出は
    /// それぞれ別の結果として返し、監査ログにも区別して残す。
    pub async fn mark_breach_notified(&self, breach_id: &str, method: &str) -> BreachNotifyOutcome {
        let outcome = {
            let mut breaches = self.breaches.write().await;
            match breaches.get_mut(breach_id) {
                None => BreachNotifyOutcome::NotFound,
                Some(breach) if breach.status == BreachStatus::Notified => {
                    BreachNotifyOutcome::AlreadyNotified
                }
                Some(breach) => {
                    breach.status = BreachStatus::Notified;
                    breach.notified_at = Some(Utc::now());
                    breach.notification_method = Some(method.to_string());
                    BreachNotifyOutcome::Notified
                }
            }
        };

        match outcome {
            BreachNotifyOutcome::Notified => {
                self.record(
                    "breach_notified",
                    "internal",
                    serde_json::json!({ "breach_id": breach_id, "method": method }),
                )
                .await;
            }
            BreachNotifyOutcome::AlreadyNotified => {
                tracing::warn!(breach_id = breach_id, "breach already notified");
                self.record(
                    "breach_notification_skipped",
                    "internal",
                    serde_json::json!({ "breach_id": breach_id, "reason": "already_notified" }),
                )
                .await;
            }
            BreachNotifyOutcome::NotFound => {
                tracing::warn!(breach_id = breach_id, "breach not found");
                self.record(
                    "breach_notification_skipped",
                    "internal",
                    serde_json::json!({ "breach_id": breach_id, "reason": "not_found" }),
                )
                .await;
            }
        }

        outcome
    }

    /// 自由テキストを秘密情報パターンでスキャン
    ///
    /// 文字列パターンによるベストエフォートの安全網であり、
    /// 専用のシークレットスキャナーの代替ではない。検出時は抜粋のみを
    /// 返し、マッチ全文は記録しない。検出があればCRITICAL違反として記録。
    pub async fn scan_for_credential_exposure(
        &self,
        content: &str,
        provider: &str,
    ) -> CredentialScan {
        let mut findings = Vec::new();

        for (name, re) in &self.generic_patterns {
            for m in re.find_iter(content) {
                findings.push(CredentialFinding {
                    pattern: name.clone(),
                    excerpt: truncate_excerpt(m.as_str()),
                });
            }
        }

        // プロバイダー固有の認証情報（client id / secret）
        let provider_pattern = format!(
            r"{}[_-]?(client[_-]?)?(id|secret)\s*[=:]\s*[^\s'\x22]+",
            regex::escape(&provider.to_lowercase())
        );
        if let Ok(re) = RegexBuilder::new(&provider_pattern)
            .case_insensitive(true)
            .build()
        {
            for m in re.find_iter(content) {
                findings.push(CredentialFinding {
                    pattern: format!("{}_credential", provider.to_lowercase()),
                    excerpt: truncate_excerpt(m.as_str()),
                });
            }
        }

        let exposed = !findings.is_empty();
        if exposed {
            self.report_violation(
                ViolationType::CredentialExposure,
                provider,
                "content-scan",
                None,
                format!("{} credential-like pattern(s) detected", findings.len()),
            )
            .await;
        }

        CredentialScan { exposed, findings }
    }

    /// 直近の違反を取得（新しい順）
    pub async fn recent_violations(&self, count: usize) -> Vec<ViolationRecord> {
        let violations = self.violations.read().await;
        let start = violations.len().saturating_sub(count);
        let mut recent: Vec<ViolationRecord> = violations[start..].to_vec();
        recent.reverse();
        recent
    }

    /// 直近の監査エントリを取得（新しい順）
    pub async fn recent_entries(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        let start = entries.len().saturating_sub(count);
        let mut recent: Vec<AuditEntry> = entries[start..].to_vec();
        recent.reverse();
        recent
    }

    /// 違反記録数
    pub async fn violation_count(&self) -> usize {
        self.violations.read().await.len()
    }

    /// インメモリミラーのエントリ数
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// インシデント数と未解決数
    pub async fn breach_counts(&self) -> (usize, usize) {
        let breaches = self.breaches.read().await;
        let total = breaches.len();
        let unresolved = breaches.values().filter(|b| !b.resolved).count();
        (total, unresolved)
    }

    /// インシデントを取得
    pub async fn get_breach(&self, breach_id: &str) -> Option<SecurityBreachRecord> {
        let breaches = self.breaches.read().await;
        breaches.get(breach_id).cloned()
    }

    /// 耐久ログへ1行追記（ISO-8601タイムスタンプ + JSON）
    ///
    /// 書き込み失敗は運用チャネルへの報告のみで、呼び出し元の
    /// 判定結果には影響させない。
    async fn append_line<T: serde::Serialize>(&self, file_name: &str, payload: &T) {
        let line = match serde_json::to_string(payload) {
            Ok(json) => format!("{} {}\n", Utc::now().to_rfc3339(), json),
            Err(e) => {
                tracing::error!(file = file_name, error = %e, "failed to serialize log line");
                return;
            }
        };

        let path = self.log_dir.join(file_name);
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;

        match result {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::error!(file = %path.display(), error = %e, "failed to append log line");
                } else if let Err(e) = file.flush().await {
                    tracing::error!(file = %path.display(), error = %e, "failed to flush log line");
                }
            }
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "failed to open durable log");
            }
        }
    }
}

/// マッチ全文の再露出を防ぐための切り詰め
fn truncate_excerpt(matched: &str) -> String {
    let truncated: String = matched.chars().take(EXCERPT_CHARS).collect();
    if truncated.len() < matched.len() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
