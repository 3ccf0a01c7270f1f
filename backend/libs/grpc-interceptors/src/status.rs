//! gRPC status code helpers shared by the interceptors
//!
//! Label values follow the canonical gRPC code names (`OK`, `NotFound`,
//! `DeadlineExceeded`, ...) so dashboards line up with other gRPC stacks.

use http::HeaderMap;
use tonic::{Code, Status};

/// Canonical name of a gRPC status code, as used for metric labels and span attributes
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Status code of a handler result (`Code::Ok` for success)
pub fn code_of<T>(result: &Result<T, Status>) -> Code {
    match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    }
}

/// Non-OK status carried in response headers (trailers-only responses)
///
/// Successful unary responses send `grpc-status` in the trailers, so an absent
/// header is treated as success at this point of the exchange.
pub fn status_from_headers(headers: &HeaderMap) -> Option<Status> {
    Status::from_header_map(headers).filter(|status| status.code() != Code::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names() {
        assert_eq!(code_name(Code::Ok), "OK");
        assert_eq!(code_name(Code::Cancelled), "Canceled");
        assert_eq!(code_name(Code::DeadlineExceeded), "DeadlineExceeded");
        assert_eq!(code_name(Code::Unauthenticated), "Unauthenticated");
    }

    #[test]
    fn test_code_of_result() {
        let ok: Result<&str, Status> = Ok("response");
        assert_eq!(code_of(&ok), Code::Ok);

        let err: Result<&str, Status> = Err(Status::not_found("missing"));
        assert_eq!(code_of(&err), Code::NotFound);
    }

    #[test]
    fn test_status_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(status_from_headers(&headers).is_none());

        headers.insert("grpc-status", "0".parse().unwrap());
        assert!(status_from_headers(&headers).is_none());

        headers.insert("grpc-status", "5".parse().unwrap());
        headers.insert("grpc-message", "user%20missing".parse().unwrap());
        let status = status_from_headers(&headers).expect("non-OK status");
        assert_eq!(status.code(), Code::NotFound);
    }
}
