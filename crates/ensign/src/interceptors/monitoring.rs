//! Per-RPC metrics and the structured log line of every handled request.

use std::time::Instant;

use tonic::{Code, Status};

use super::Next;
use crate::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Log level of a handled RPC by its status code.
pub fn severity(code: Code) -> Severity {
    match code {
        Code::Ok
        | Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Severity::Info,

        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Severity::Warn,

        Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Severity::Error,
    }
}

pub async fn intercept<T: Send + 'static>(ctx: Context, next: Next<T>) -> Result<T, Status> {
    let method = ctx.method;
    let kind = method.kind.as_str();
    metrics::counter!(
        "ensign_rpc_started_total",
        "service" => method.service,
        "method" => method.method,
        "type" => kind
    )
    .increment(1);

    let start = Instant::now();
    let result = next(ctx.monitored()).await;
    let elapsed = start.elapsed();

    let code = match &result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    };
    let code_label = format!("{code:?}");

    metrics::counter!(
        "ensign_rpc_handled_total",
        "service" => method.service,
        "method" => method.method,
        "type" => kind,
        "code" => code_label.clone()
    )
    .increment(1);
    metrics::histogram!(
        "ensign_rpc_duration_seconds",
        "service" => method.service,
        "method" => method.method,
        "type" => kind
    )
    .record(elapsed.as_secs_f64());

    let error = result.as_ref().err().map(|status| status.message().to_string());
    let latency_ms = elapsed.as_secs_f64() * 1000.0;
    match severity(code) {
        Severity::Info => tracing::info!(
            service = method.service,
            method = method.method,
            code = %code_label,
            latency_ms,
            error = error.as_deref(),
            "rpc handled"
        ),
        Severity::Warn => tracing::warn!(
            service = method.service,
            method = method.method,
            code = %code_label,
            latency_ms,
            error = error.as_deref(),
            "rpc handled"
        ),
        Severity::Error => tracing::error!(
            service = method.service,
            method = method.method,
            code = %code_label,
            latency_ms,
            error = error.as_deref(),
            "rpc handled"
        ),
    }

    result
}
