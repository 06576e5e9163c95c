use crate::error::ResultsError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ResultsError> for HandlerErr {
    fn from(e: ResultsError) -> Self {
        let code = e.code();
        let details = match &e {
            ResultsError::Validation { details, .. } => details.clone(),
            ResultsError::Locked { period } => Some(json!({
                "year": period.year,
                "month": period.month
            })),
            ResultsError::Store(_) | ResultsError::Settings(_) => None,
        };
        HandlerErr {
            code,
            message: e.to_string(),
            details,
        }
    }
}
