//! Supervisor 전용 에러 타입 — 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드를 반환할 수 있게 합니다.
//! `Display` 문자열이 그대로 운영자에게 보여지는 메시지입니다.

use axum::http::StatusCode;

use crate::console::ConsoleError;
use crate::crash_report::CrashReportError;
use crate::relay::bindings::BindingError;
use crate::relay::RelayError;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("'{0}' is not a configured server")]
    ServerNotFound(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    CrashReport(#[from] CrashReportError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ServerNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning(_) | Self::NotRunning(_) => StatusCode::CONFLICT,
            Self::CrashReport(CrashReportError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Binding(BindingError::AlreadyBound { .. }) => StatusCode::CONFLICT,
            Self::Binding(BindingError::NotBound(_)) => StatusCode::NOT_FOUND,
            Self::Relay(RelayError::AlreadyRunning(_)) => StatusCode::CONFLICT,
            Self::Console(ConsoleError::UnknownServer(_)) => StatusCode::NOT_FOUND,
            Self::Console(ConsoleError::EmptyInvocation(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::CrashReport(CrashReportError::NotFound { .. }) => "NO_CRASH_REPORT",
            Self::CrashReport(_) => "CRASH_REPORT_ERROR",
            Self::Binding(BindingError::AlreadyBound { .. }) => "ALREADY_BOUND",
            Self::Binding(BindingError::NotBound(_)) => "NOT_BOUND",
            Self::Binding(_) => "BINDINGS_ERROR",
            Self::Relay(RelayError::AlreadyRunning(_)) => "RELAY_ALREADY_RUNNING",
            Self::Relay(_) => "RELAY_ERROR",
            Self::Console(_) => "CONSOLE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_code_mapping() {
        let err = SupervisorError::ServerNotFound("creative".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "SERVER_NOT_FOUND");

        let err = SupervisorError::from(BindingError::AlreadyBound {
            client: "survival".into(),
            channel: "123".into(),
        });
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "survival is already registered with channel 123");

        let err = SupervisorError::from(CrashReportError::NotFound {
            server: "survival".into(),
            ordinal: 2,
        });
        assert_eq!(err.to_json()["error_code"], "NO_CRASH_REPORT");
        assert_eq!(err.to_json()["success"], false);
    }
}
