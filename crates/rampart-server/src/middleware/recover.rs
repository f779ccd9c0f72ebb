//! Panic guard.
//!
//! Handlers run inside the guard's future, so a panic unwinds into it before
//! any response head exists. The guard logs the request, the panic message
//! and the panic-site backtrace, then replies 500 with the envelope.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once, OnceLock};

use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode, header::USER_AGENT},
    middleware::Next,
    response::Response,
};
use futures_util::FutureExt;
use rampart_core::{CoreError, REQUEST_ID_HEADER, RequestId};

use crate::error::envelope;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Record the backtrace of every panic on the panicking thread so the guard
/// can log where the panic happened rather than where it was caught.
///
/// Chains to the previously installed hook.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Set by the correlation middleware so the guard, which runs outside it,
/// can report the request ID.
#[derive(Clone, Default)]
pub struct RecoverySlot(Arc<OnceLock<RequestId>>);

impl RecoverySlot {
    pub fn fill(&self, id: RequestId) {
        let _ = self.0.set(id);
    }

    fn get(&self) -> Option<&RequestId> {
        self.0.get()
    }
}

/// A panic caught on another task, carried back with its message and
/// backtrace captured on the thread where it happened.
#[derive(Debug)]
pub struct CaughtPanic {
    pub message: String,
    pub backtrace: Option<String>,
}

impl CaughtPanic {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        Self {
            message: panic_message(&*payload),
            backtrace: take_backtrace(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(caught) = payload.downcast_ref::<CaughtPanic>() {
        caught.message.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

pub async fn panic_guard(mut req: Request<Body>, next: Next) -> Response {
    let slot = RecoverySlot::default();
    req.extensions_mut().insert(slot.clone());

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let client = super::client_addr(&req);
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let payload = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => return response,
        Err(payload) => payload,
    };

    let (message, backtrace) = match payload.downcast::<CaughtPanic>() {
        Ok(caught) => (caught.message, caught.backtrace),
        Err(payload) => (panic_message(&*payload), take_backtrace()),
    };
    let request_id = slot.get().cloned();

    crate::metrics::record_panic();
    tracing::error!(
        error = %message,
        %method,
        %path,
        %query,
        %client,
        %user_agent,
        request_id = request_id.as_ref().map(RequestId::as_str).unwrap_or_default(),
        backtrace = backtrace.as_deref().unwrap_or("unavailable"),
        "panic recovered"
    );

    let err = CoreError::internal(message);
    let mut response = envelope(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.envelope_code(),
        &err.public_message(),
        None,
    );
    if let Some(id) = request_id
        && let Ok(value) = HeaderValue::from_str(id.as_str())
    {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "handler panicked");
        let caught = CaughtPanic {
            message: "inner".into(),
            backtrace: None,
        };
        assert_eq!(panic_message(&caught), "inner");
    }

    #[test]
    fn test_hook_records_backtrace_on_panicking_thread() {
        install_panic_hook();
        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());
        let trace = take_backtrace();
        assert!(trace.is_some());
        assert!(take_backtrace().is_none());
    }
}
