// Job submission gateway
//
// Every submission, HTTP or socket, goes through the same steps in order:
// authorize scope → rate limit → validate → create job → dispatch.
// Authentication happened earlier, in the Caller extractor.
//
// Decision: Rate limiting counts before validation, so malformed floods are limited too

use std::sync::Arc;

use genrelay_core::{scopes, GatewayError, Job, Principal};
use serde_json::Value;

use crate::dispatch::{DeliveryMode, DispatchMode, Dispatched, Dispatcher};
use crate::metrics::GatewayMetrics;
use crate::rate_limit::RateLimiter;
use crate::validation::Validator;

/// Raw submission input, before validation
#[derive(Debug, Clone, Default)]
pub struct SubmitInput {
    pub request: Option<Value>,
    pub state: Option<Value>,
}

pub struct Gateway {
    rate_limiter: RateLimiter,
    validator: Validator,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Arc<GatewayMetrics>,
}

impl Gateway {
    pub fn new(
        rate_limiter: RateLimiter,
        validator: Validator,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            rate_limiter,
            validator,
            dispatcher,
            metrics,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    pub fn pending(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Admit a submission and hand it to the dispatcher
    ///
    /// `origin` keys the rate limit for anonymous callers.
    pub async fn submit(
        &self,
        principal: &Principal,
        origin: &str,
        input: SubmitInput,
        delivery: DeliveryMode,
    ) -> Result<Dispatched, GatewayError> {
        let delivery_label = delivery.label();
        let result = self.admit(principal, origin, input, delivery).await;

        match &result {
            Ok(dispatched) => {
                self.metrics.job_submitted(self.dispatcher.mode().as_str());
                tracing::info!(
                    job_id = %dispatched.job_id(),
                    principal = %principal.subject,
                    delivery = delivery_label,
                    "Job accepted"
                );
            }
            Err(e) => {
                self.metrics.job_rejected(e.code());
                tracing::debug!(
                    principal = %principal.subject,
                    origin,
                    error = %e,
                    "Job rejected"
                );
            }
        }
        result
    }

    async fn admit(
        &self,
        principal: &Principal,
        origin: &str,
        input: SubmitInput,
        delivery: DeliveryMode,
    ) -> Result<Dispatched, GatewayError> {
        if !principal.has_scope(scopes::GENERATE) {
            return Err(GatewayError::Forbidden(format!(
                "scope '{}' is required",
                scopes::GENERATE
            )));
        }

        self.rate_limiter.check(&rate_limit_key(principal, origin))?;

        let (request, state) = self.validator.validate(input.request, input.state)?;
        let job = Job::new(request, state, principal.subject.clone());

        self.dispatcher.dispatch(job, delivery).await
    }
}

fn rate_limit_key(principal: &Principal, origin: &str) -> String {
    if principal.is_anonymous() {
        format!("origin:{origin}")
    } else {
        format!("principal:{}", principal.subject)
    }
}
