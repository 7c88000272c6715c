//! Response status vocabulary
//!
//! Every reply exchanged between runtime nodes, and every completion handed
//! back to a caller of connect/disconnect, carries one of these statuses.
//! A response is successful iff its status is in `200..=206`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Numeric status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum Status {
    Ok,
    Accepted,
    BadRequest,
    NotFound,
    Gone,
    InternalError,
    ServiceUnavailable,
    GatewayTimeout,
    /// Any other code received from a peer
    Other(u16),
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Accepted => 202,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::Gone => 410,
            Status::InternalError => 500,
            Status::ServiceUnavailable => 503,
            Status::GatewayTimeout => 504,
            Status::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..=206).contains(&self.code())
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        match code {
            200 => Status::Ok,
            202 => Status::Accepted,
            400 => Status::BadRequest,
            404 => Status::NotFound,
            410 => Status::Gone,
            500 => Status::InternalError,
            503 => Status::ServiceUnavailable,
            504 => Status::GatewayTimeout,
            other => Status::Other(other),
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Accepted => "ACCEPTED",
            Status::BadRequest => "BAD_REQUEST",
            Status::NotFound => "NOT_FOUND",
            Status::Gone => "GONE",
            Status::InternalError => "INTERNAL_ERROR",
            Status::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Status::GatewayTimeout => "GATEWAY_TIMEOUT",
            Status::Other(_) => "STATUS",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Status plus optional structured data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self { status, data: None }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok)
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            status: Status::Ok,
            data: Some(data),
        }
    }

    pub fn with_data(status: Status, data: Value) -> Self {
        Self {
            status,
            data: Some(data),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Field of the data mapping, if any
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }
}

impl From<bool> for Response {
    fn from(success: bool) -> Self {
        if success {
            Response::ok()
        } else {
            Response::new(Status::InternalError)
        }
    }
}

impl From<Status> for Response {
    fn from(status: Status) -> Self {
        Response::new(status)
    }
}

impl PartialEq<Status> for Response {
    fn eq(&self, other: &Status) -> bool {
        self.status == *other
    }
}

impl PartialEq<u16> for Response {
    fn eq(&self, other: &u16) -> bool {
        self.status.code() == *other
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} {}", self.status, data),
            None => write!(f, "{}", self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_range() {
        assert!(Response::ok().is_success());
        assert!(Response::new(Status::Accepted).is_success());
        assert!(Response::new(Status::Other(206)).is_success());
        assert!(!Response::new(Status::Other(207)).is_success());
        assert!(!Response::new(Status::Gone).is_success());
    }

    #[test]
    fn test_codes_round_trip() {
        for code in [200u16, 202, 400, 404, 410, 500, 503, 504, 418] {
            assert_eq!(Status::from(code).code(), code);
        }
    }

    #[test]
    fn test_compare_with_code_and_status() {
        let r = Response::new(Status::NotFound);
        assert!(r == 404);
        assert!(r == Status::NotFound);
        assert!(!Response::from(false).is_success());
    }

    #[test]
    fn test_wire_shape() {
        let r = Response::ok_with(json!({"tunnel_id": 50}));
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"status": 200, "data": {"tunnel_id": 50}})
        );
        assert_eq!(r.field("tunnel_id"), Some(&json!(50)));
    }
}
