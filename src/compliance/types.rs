//! Compliance Types
//!
//! API利用統制・CAN-SPAM・データライフサイクルに関連する型定義

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// セキュリティインシデントの通知期限（規制要件・時間単位）
pub const BREACH_NOTIFICATION_WINDOW_HOURS: i64 = 48;

/// ポリシー判定結果
///
/// ポリシーによる拒否はエラーではなく第一級の戻り値。呼び出し側は
/// `allowed` で分岐し、拒否理由をそのまま利用者に提示できる。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDecision {
    /// 許可されたか
    pub allowed: bool,
    /// 拒否理由（拒否時のみ）
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// 許可判定を作成
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// 拒否判定を作成
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// メールカテゴリ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmailCategory {
    /// マーケティング
    Marketing,
    /// トランザクション（注文確認等）
    Transactional,
    /// プロモーション
    Promotional,
    /// アカウント通知
    Account,
    /// セキュリティ通知
    Security,
    /// ウェイトリスト案内
    Waitlist,
}

impl EmailCategory {
    /// 初回接触時に明示的同意を必要とするカテゴリか
    ///
    /// トランザクション・セキュリティ・アカウント通知はサービス利用に
    /// 伴うメールであり、同意記録なしで送信できる。
    pub fn requires_explicit_consent(&self) -> bool {
        matches!(
            self,
            EmailCategory::Marketing | EmailCategory::Promotional | EmailCategory::Waitlist
        )
    }

    /// 全カテゴリ
    pub fn all() -> [EmailCategory; 6] {
        [
            EmailCategory::Marketing,
            EmailCategory::Transactional,
            EmailCategory::Promotional,
            EmailCategory::Account,
            EmailCategory::Security,
            EmailCategory::Waitlist,
        ]
    }
}

impl fmt::Display for EmailCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmailCategory::Marketing => "marketing",
            EmailCategory::Transactional => "transactional",
            EmailCategory::Promotional => "promotional",
            EmailCategory::Account => "account",
            EmailCategory::Security => "security",
            EmailCategory::Waitlist => "waitlist",
        };
        write!(f, "{}", s)
    }
}

/// 同意ステータス
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    /// オプトイン済み
    OptedIn,
    /// オプトアウト済み
    OptedOut,
    /// 保留
    Pending,
    /// 明示的同意
    ExplicitConsent,
    /// 黙示的同意
    ImpliedConsent,
}

/// 同意記録（メールアドレスが自然キー）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// メールアドレス（小文字化済み）
    pub email: String,
    /// 同意ステータス
    pub consent_status: ConsentStatus,
    /// カテゴリ別フラグ（不在は「許可」と解釈される。例外は §初回接触ルール）
    pub categories: HashMap<EmailCategory, bool>,
    /// 同意取得日時
    pub consented_at: Option<DateTime<Utc>>,
    /// 配信停止日時
    pub unsubscribed_at: Option<DateTime<Utc>>,
    /// 配信停止理由
    pub unsubscribe_reason: Option<String>,
}

impl ConsentRecord {
    /// 新しい同意記録を作成（メールアドレスは小文字化される）
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into().to_lowercase(),
            consent_status: ConsentStatus::Pending,
            categories: HashMap::new(),
            consented_at: None,
            unsubscribed_at: None,
            unsubscribe_reason: None,
        }
    }

    /// 指定カテゴリへの同意を付与
    ///
    /// 同じカテゴリで複数回呼んでも最終状態は変わらない（冪等）。
    pub fn grant(&mut self, categories: &[EmailCategory], status: ConsentStatus, now: DateTime<Utc>) {
        for category in categories {
            self.categories.insert(*category, true);
        }
        self.consent_status = status;
        self.consented_at = Some(now);
    }

    /// 指定カテゴリの配信を停止
    pub fn revoke(&mut self, categories: &[EmailCategory], reason: Option<String>, now: DateTime<Utc>) {
        for category in categories {
            self.categories.insert(*category, false);
        }
        self.unsubscribed_at = Some(now);
        self.unsubscribe_reason = reason;
    }

    /// 全カテゴリの配信を停止し、オプトアウト状態に遷移
    pub fn revoke_all(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        self.revoke(&EmailCategory::all(), reason, now);
        self.consent_status = ConsentStatus::OptedOut;
    }

    /// カテゴリのフラグ値（記録がないカテゴリは None）
    pub fn category_flag(&self, category: EmailCategory) -> Option<bool> {
        self.categories.get(&category).copied()
    }
}

/// 違反種別
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// 未設定プロバイダーへの呼び出し
    UnknownProvider,
    /// 時間レート上限超過（分単位レートから導出）
    RateLimitMinute,
    /// 日次レート上限超過
    RateLimitDaily,
    /// 競合分析の疑いがあるアクセスパターン
    SuspectedCompetitiveAnalysis,
    /// 認証情報の露出
    CredentialExposure,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationType::UnknownProvider => "UNKNOWN_PROVIDER",
            ViolationType::RateLimitMinute => "RATE_LIMIT_MINUTE",
            ViolationType::RateLimitDaily => "RATE_LIMIT_DAILY",
            ViolationType::SuspectedCompetitiveAnalysis => "SUSPECTED_COMPETITIVE_ANALYSIS",
            ViolationType::CredentialExposure => "CREDENTIAL_EXPOSURE",
        };
        write!(f, "{}", s)
    }
}

/// 違反記録（作成後は不変）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// 違反種別
    pub violation_type: ViolationType,
    /// プロバイダー
    pub provider: String,
    /// エンドポイント
    pub endpoint: String,
    /// ユーザーID（存在する場合）
    pub user_id: Option<String>,
    /// 発生日時
    pub timestamp: DateTime<Utc>,
    /// 詳細
    pub details: String,
}

/// インシデント深刻度
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreachSeverity {
    /// 低
    Low,
    /// 中
    Medium,
    /// 高
    High,
    /// 重大
    Critical,
}

/// インシデント通知ステータス
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreachStatus {
    /// 通知待ち
    PendingNotification,
    /// 通知済み
    Notified,
}

/// セキュリティインシデント記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityBreachRecord {
    /// インシデントID
    pub id: String,
    /// インシデント種別
    pub incident_type: String,
    /// 説明
    pub description: String,
    /// 影響を受けたユーザー
    pub affected_users: Vec<String>,
    /// 深刻度
    pub severity: BreachSeverity,
    /// 発見日時
    pub discovered_at: DateTime<Utc>,
    /// 通知期限（発見から48時間・規制要件）
    pub notification_deadline: DateTime<Utc>,
    /// 通知ステータス
    pub status: BreachStatus,
    /// 通知日時
    pub notified_at: Option<DateTime<Utc>>,
    /// 通知方法
    pub notification_method: Option<String>,
    /// 解決済みフラグ
    pub resolved: bool,
}

impl SecurityBreachRecord {
    /// 新しいインシデント記録を作成
    pub fn new(
        incident_type: impl Into<String>,
        description: impl Into<String>,
        affected_users: Vec<String>,
        severity: BreachSeverity,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            incident_type: incident_type.into(),
            description: description.into(),
            affected_users,
            severity,
            discovered_at,
            notification_deadline: discovered_at
                + Duration::hours(BREACH_NOTIFICATION_WINDOW_HOURS),
            status: BreachStatus::PendingNotification,
            notified_at: None,
            notification_method: None,
            resolved: false,
        }
    }
}

/// 監査エントリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// イベント種別
    pub event_type: String,
    /// プロバイダー
    pub provider: String,
    /// 記録日時
    pub timestamp: DateTime<Utc>,
    /// 詳細ペイロード
    pub details: serde_json::Value,
}

/// キャッシュデータの保持クラス
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CachedDataClass {
    /// プロバイダー既定の保持期間（24時間）
    Standard,
    /// 個人識別データ（30日の独立クラス）
    Pii,
}

/// キャッシュデータ記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDataRecord {
    /// プロバイダー
    pub provider: String,
    /// データID
    pub data_id: String,
    /// データサイズ（バイト）
    pub data_size: u64,
    /// 所有ユーザーID
    pub user_id: Option<String>,
    /// 保持クラス
    pub class: CachedDataClass,
    /// キャッシュ日時
    pub cached_at: DateTime<Utc>,
    /// 失効日時（作成時に保持期間から確定し、以後変化しない）
    pub expires_at: DateTime<Utc>,
}

/// 削除リクエストのステータス
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    /// 本人確認待ち
    PendingVerification,
    /// 完了
    Completed,
}

/// アカウント削除リクエスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionRequest {
    /// リクエストID（userId + タイムスタンプから導出）
    pub id: String,
    /// ユーザーID
    pub user_id: String,
    /// メールアドレス
    pub email: String,
    /// 削除理由
    pub reason: Option<String>,
    /// 受付日時
    pub requested_at: DateTime<Utc>,
    /// ステータス（pending_verification → completed の一方向のみ）
    pub status: DeletionStatus,
    /// 削除完了日時
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DeletionRequest {
    /// 新しい削除リクエストを作成
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            id: format!("del_{}_{}", user_id, now.timestamp_millis()),
            user_id,
            email: email.into().to_lowercase(),
            reason,
            requested_at: now,
            status: DeletionStatus::PendingVerification,
            deleted_at: None,
        }
    }
}

/// エクスポートリクエストのステータス
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    /// 処理中
    InProgress,
    /// 完了
    Completed,
}

/// データエクスポートリクエスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    /// エクスポートID
    pub id: String,
    /// ユーザーID
    pub user_id: String,
    /// メールアドレス
    pub email: String,
    /// 受付日時
    pub requested_at: DateTime<Utc>,
    /// ステータス
    pub status: ExportStatus,
    /// ダウンロードURL（完了後）
    pub download_url: Option<String>,
    /// ダウンロード期限（受付から7日）
    pub expires_at: DateTime<Utc>,
}

impl ExportRequest {
    /// 新しいエクスポートリクエストを作成
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            email: email.into().to_lowercase(),
            requested_at: now,
            status: ExportStatus::InProgress,
            download_url: None,
            expires_at: now + Duration::days(7),
        }
    }
}

/// メール本文の検証結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentCompliance {
    /// 準拠しているか
    pub compliant: bool,
    /// 指摘事項
    pub issues: Vec<String>,
}

/// 認証情報スキャンの検出結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFinding {
    /// マッチしたパターン名
    pub pattern: String,
    /// 検出箇所の抜粋（再露出を防ぐため切り詰め済み）
    pub excerpt: String,
}

/// 認証情報スキャン結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialScan {
    /// 露出が検出されたか
    pub exposed: bool,
    /// 検出結果
    pub findings: Vec<CredentialFinding>,
}

/// レポート対象期間
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPeriod {
    /// 開始
    pub start: DateTime<Utc>,
    /// 終了
    pub end: DateTime<Utc>,
}

/// レポート統計
///
/// プロセス開始以降の累積値。`period` はメタデータであり、
/// この統計ブロックは期間では絞り込まれない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStatistics {
    /// 追跡したリクエスト総数
    pub total_requests_tracked: u64,
    /// 拒否したリクエスト総数
    pub total_requests_denied: u64,
    /// 現在のキャッシュアイテム数
    pub cached_items: usize,
    /// 違反記録数
    pub violation_count: usize,
    /// インシデント数
    pub breach_count: usize,
    /// 未解決インシデント数
    pub unresolved_breaches: usize,
}

/// コンプライアンスレポート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// レポートID
    pub id: String,
    /// 生成日時
    pub generated_at: DateTime<Utc>,
    /// 対象期間（メタデータ）
    pub period: ReportPeriod,
    /// 統計（累積値）
    pub statistics: ReportStatistics,
    /// 直近の違反（最大100件）
    pub recent_violations: Vec<ViolationRecord>,
    /// 直近の監査エントリ（最大50件）
    pub recent_audit_entries: Vec<AuditEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_deadline_is_48_hours() {
        let t0 = Utc::now();
        let breach = SecurityBreachRecord::new(
            "credential_leak",
            "API key committed to public repo",
            vec!["user-1".to_string()],
            BreachSeverity::High,
            t0,
        );

        assert_eq!(breach.notification_deadline, t0 + Duration::hours(48));
        assert_eq!(breach.status, BreachStatus::PendingNotification);
        assert!(!breach.resolved);
    }

    #[test]
    fn test_consent_record_lowercases_email() {
        let record = ConsentRecord::new("User@Example.COM");
        assert_eq!(record.email, "user@example.com");
    }

    #[test]
    fn test_consent_grant_is_idempotent() {
        let now = Utc::now();
        let mut record = ConsentRecord::new("user@example.com");

        record.grant(&[EmailCategory::Marketing], ConsentStatus::ExplicitConsent, now);
        let first = record.categories.clone();
        record.grant(&[EmailCategory::Marketing], ConsentStatus::ExplicitConsent, now);

        assert_eq!(record.categories, first);
        assert_eq!(record.category_flag(EmailCategory::Marketing), Some(true));
    }

    #[test]
    fn test_service_categories_skip_explicit_consent() {
        assert!(!EmailCategory::Transactional.requires_explicit_consent());
        assert!(!EmailCategory::Security.requires_explicit_consent());
        assert!(!EmailCategory::Account.requires_explicit_consent());
        assert!(EmailCategory::Marketing.requires_explicit_consent());
        assert!(EmailCategory::Promotional.requires_explicit_consent());
        assert!(EmailCategory::Waitlist.requires_explicit_consent());
    }

    #[test]
    fn test_deletion_id_derives_from_user_and_timestamp() {
        let now = Utc::now();
        let request = DeletionRequest::new("u-42", "User@Example.com", None, now);

        assert_eq!(
            request.id,
            format!("del_u-42_{}", now.timestamp_millis())
        );
        assert_eq!(request.email, "user@example.com");
        assert_eq!(request.status, DeletionStatus::PendingVerification);
        assert!(request.deleted_at.is_none());
    }

    #[test]
    fn test_export_expiry_is_seven_days() {
        let now = Utc::now();
        let request = ExportRequest::new("u-1", "a@b.com", now);
        assert_eq!(request.expires_at, now + Duration::days(7));
        assert_eq!(request.status, ExportStatus::InProgress);
    }
}
