use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;

use crate::error::{ErrorKind, FieldViolation, StoreError, Warning};
use crate::supplement_store::Written;

/// Failure half of an [`AppResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldViolation>,
}

/// The `{success, data?, error?, warnings?}` shape every operation returns
/// across the C ABI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

impl<T> AppResponse<T> {
    pub fn success(data: T) -> Self {
        AppResponse {
            success: true,
            data: Some(data),
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        AppResponse {
            success: false,
            data: None,
            error: Some(ErrorBody {
                kind,
                message: message.into(),
                fields: Vec::new(),
            }),
            warnings: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::failure(ErrorKind::BadRequest, message)
    }

    pub fn from_result(result: Result<T, StoreError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::from(e),
        }
    }

    pub fn from_written(result: Result<Written<T>, StoreError>) -> Self {
        match result {
            Ok(Written { data, warnings }) => AppResponse {
                warnings,
                ..Self::success(data)
            },
            Err(e) => Self::from(e),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl<T> From<StoreError> for AppResponse<T> {
    fn from(err: StoreError) -> Self {
        let mut response = Self::failure(err.kind(), err.to_string());
        if let Some(body) = response.error.as_mut() {
            body.fields = err.violations().to_vec();
        }
        response
    }
}

impl<T> From<SerdeError> for AppResponse<T> {
    fn from(err: SerdeError) -> Self {
        Self::failure(ErrorKind::SerializationError, format!("Invalid JSON: {err}"))
    }
}

impl<T> Display for AppResponse<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            None if self.warnings.is_empty() => write!(f, "Ok"),
            None => write!(f, "Ok with {} warning(s)", self.warnings.len()),
            Some(body) => write!(f, "{}: {}", body.kind, body.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ValidationError, WarningKind};

    #[test]
    fn success_omits_error_and_warnings() {
        let json = serde_json::to_string(&AppResponse::success(5)).unwrap();
        assert_eq!(json, r#"{"success":true,"data":5}"#);
    }

    #[test]
    fn validation_failure_lists_fields() {
        let err = StoreError::from(ValidationError::single("price.value", "must be >= 0"));
        let response: AppResponse<()> = AppResponse::from(err);
        let json: serde_json::Value = serde_json::to_value(&response).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "ValidationError");
        assert_eq!(json["error"]["fields"][0]["field"], "price.value");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn degraded_write_carries_warnings() {
        let written = Written {
            data: "rec",
            warnings: vec![Warning::new(WarningKind::ClassifierFailed, "timeout")],
        };
        let response = AppResponse::from_written(Ok(written));
        assert!(response.success);
        assert_eq!(response.warnings.len(), 1);
        assert_eq!(response.to_string(), "Ok with 1 warning(s)");
    }

    #[test]
    fn not_found_maps_to_its_kind() {
        let response: AppResponse<()> = AppResponse::from_result(Err(StoreError::NotFound("x".into())));
        assert_eq!(response.kind(), Some(ErrorKind::NotFoundError));
    }
}
