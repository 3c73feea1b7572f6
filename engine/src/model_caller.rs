//! The core's only outward-facing capability for invoking a model. A
//! production HTTP client implementing this trait lives outside the core.

use async_trait::async_trait;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct ModelCallRequest {
    pub model: String,
    pub system_prompt: String,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ModelCallResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: f64,
}

/// Each call is independent; no conversation state is retained between
/// calls. Implementors own retries against the underlying transport, but
/// still surface a [`CoreError`] so the executor's own retry policy
/// applies uniformly.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(&self, request: ModelCallRequest) -> Result<ModelCallResponse, CoreError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct MockModelCaller {
        responses: Mutex<Vec<Result<ModelCallResponse, String>>>,
        call_count: AtomicUsize,
    }

    impl MockModelCaller {
        pub fn new(responses: Vec<Result<ModelCallResponse, String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelCaller for MockModelCaller {
        async fn call(&self, _request: ModelCallRequest) -> Result<ModelCallResponse, CoreError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(CoreError::Internal("mock exhausted".to_string()));
            }
            match responses.remove(0) {
                Ok(r) => Ok(r),
                Err(msg) => Err(CoreError::Provider(msg)),
            }
        }
    }
}
